//! CnC file layout and construction.
//!
//! The command-and-control file is the single artifact clients map to
//! discover the driver. Its layout is a fixed 128-byte meta-data header
//! followed by five regions, each starting on a 64-byte boundary:
//!
//! | region            | contents                               |
//! |-------------------|----------------------------------------|
//! | to-driver         | MPSC ring (clients -> Conductor)       |
//! | to-clients        | broadcast (Conductor -> clients)       |
//! | counters metadata | fixed-size counter descriptors         |
//! | counters values   | cache-line padded 64-bit counter slots |
//! | error log         | distinct error records                 |
//!
//! The `ready` word in the header is written last, with release semantics;
//! clients must acquire-load it and interpret nothing else until it reads 1.

use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use petrel_primitives::{MmapRegion, Region, align_up};
use petrel_primitives::ringbuffer::RING_HEADER_SIZE;
use petrel_primitives::broadcast::BROADCAST_HEADER_SIZE;
use petrel_primitives::counters::{METADATA_RECORD_SIZE, VALUE_SLOT_SIZE};

use crate::error::DriverError;

/// Name of the CnC file inside the driver directory. Part of the
/// compatibility contract with clients.
pub const CNC_FILE_NAME: &str = "cnc.dat";

/// CnC format version.
pub const CNC_VERSION: u32 = 1;

/// Size of the meta-data header in bytes.
pub const CNC_HEADER_SIZE: usize = 128;

/// `ready` values.
pub const CNC_INITIALIZING: u32 = 0;
pub const CNC_READY: u32 = 1;

/// Meta-data header at offset 0 of the CnC file.
///
/// Integers are little-endian on every supported target. All fields are
/// written by the driver during `conclude`; `ready` is the only one written
/// after the regions are initialized, and it is written last.
#[repr(C)]
pub struct CncHeader {
    /// CnC format version (1).
    pub version: u32,
    /// 0 while the driver is constructing the file, 1 once it is usable.
    pub ready: AtomicU32,
    /// Length of the to-driver region (ring header + data).
    pub to_driver_len: u32,
    /// Length of the to-clients region (broadcast header + data).
    pub to_clients_len: u32,
    /// Length of the counters metadata region.
    pub counters_metadata_len: u32,
    /// Length of the counters values region.
    pub counters_values_len: u32,
    /// Length of the error log region.
    pub error_log_len: u32,
    _pad: u32,
    /// Client liveness timeout in nanoseconds.
    pub client_liveness_timeout_ns: u64,
    /// Driver start timestamp, wall-clock milliseconds.
    pub start_timestamp_ms: u64,
    _reserved: [u8; 80],
}

const _: () = assert!(size_of::<CncHeader>() == CNC_HEADER_SIZE);

/// Region lengths used to size a CnC file.
///
/// `to_driver_len` / `to_clients_len` include their ring/broadcast headers;
/// the remaining data capacity of each must be a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CncLengths {
    pub to_driver_len: usize,
    pub to_clients_len: usize,
    pub counters_metadata_len: usize,
    pub counters_values_len: usize,
    pub error_log_len: usize,
}

impl CncLengths {
    /// Derive region lengths from configured data capacities.
    pub fn from_capacities(
        to_driver_capacity: usize,
        to_clients_capacity: usize,
        counters_values_len: usize,
        error_log_len: usize,
    ) -> Self {
        let max_counters = counters_values_len / VALUE_SLOT_SIZE;
        Self {
            to_driver_len: RING_HEADER_SIZE + to_driver_capacity,
            to_clients_len: BROADCAST_HEADER_SIZE + to_clients_capacity,
            counters_metadata_len: max_counters * METADATA_RECORD_SIZE,
            counters_values_len,
            error_log_len,
        }
    }

    /// Validate internal consistency of the lengths.
    pub fn validate(&self) -> Result<(), DriverError> {
        let to_driver_capacity = self
            .to_driver_len
            .checked_sub(RING_HEADER_SIZE)
            .unwrap_or(0);
        if !to_driver_capacity.is_power_of_two() {
            return Err(DriverError::Configuration(format!(
                "to-driver buffer capacity {to_driver_capacity} must be a power of 2"
            )));
        }

        let to_clients_capacity = self
            .to_clients_len
            .checked_sub(BROADCAST_HEADER_SIZE)
            .unwrap_or(0);
        if !to_clients_capacity.is_power_of_two() {
            return Err(DriverError::Configuration(format!(
                "to-clients buffer capacity {to_clients_capacity} must be a power of 2"
            )));
        }

        if !self.counters_values_len.is_multiple_of(VALUE_SLOT_SIZE) {
            return Err(DriverError::Configuration(format!(
                "counters values length {} must be a multiple of {VALUE_SLOT_SIZE}",
                self.counters_values_len
            )));
        }
        let max_counters = self.counters_values_len / VALUE_SLOT_SIZE;
        if max_counters == 0 {
            return Err(DriverError::Configuration(
                "counters values length allows zero counters".to_string(),
            ));
        }
        if self.counters_metadata_len != max_counters * METADATA_RECORD_SIZE {
            return Err(DriverError::Configuration(format!(
                "counters metadata length {} does not match {max_counters} counters",
                self.counters_metadata_len
            )));
        }

        if self.error_log_len < 1024 {
            return Err(DriverError::Configuration(format!(
                "error log length {} is too small",
                self.error_log_len
            )));
        }

        Ok(())
    }
}

/// Computed byte offsets of the CnC regions.
///
/// Every region start is aligned up to 64 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CncLayout {
    pub lengths: CncLengths,
    pub to_driver_offset: usize,
    pub to_clients_offset: usize,
    pub counters_metadata_offset: usize,
    pub counters_values_offset: usize,
    pub error_log_offset: usize,
    pub total_length: usize,
}

impl CncLayout {
    pub fn compute(lengths: CncLengths) -> Result<Self, DriverError> {
        lengths.validate()?;

        let to_driver_offset = align_up(CNC_HEADER_SIZE, 64);
        let to_clients_offset = align_up(to_driver_offset + lengths.to_driver_len, 64);
        let counters_metadata_offset =
            align_up(to_clients_offset + lengths.to_clients_len, 64);
        let counters_values_offset =
            align_up(counters_metadata_offset + lengths.counters_metadata_len, 64);
        let error_log_offset =
            align_up(counters_values_offset + lengths.counters_values_len, 64);
        let total_length = error_log_offset + lengths.error_log_len;

        Ok(Self {
            lengths,
            to_driver_offset,
            to_clients_offset,
            counters_metadata_offset,
            counters_values_offset,
            error_log_offset,
            total_length,
        })
    }
}

/// Parameters for creating a fresh CnC file.
#[derive(Debug, Clone, Copy)]
pub struct CncParams {
    pub lengths: CncLengths,
    pub client_liveness_timeout_ns: u64,
    pub start_timestamp_ms: u64,
}

/// A mapped CnC file with its computed layout.
pub struct CncFile {
    mmap: Arc<MmapRegion>,
    layout: CncLayout,
}

impl CncFile {
    /// Path of the CnC file within a driver directory.
    pub fn path_in(dir: &Path) -> PathBuf {
        dir.join(CNC_FILE_NAME)
    }

    /// Create, size, zero-fill, and map a fresh CnC file, writing every
    /// header field except `ready`, which stays 0 until `signal_ready`.
    pub fn create(dir: &Path, params: &CncParams) -> Result<Self, DriverError> {
        let layout = CncLayout::compute(params.lengths)?;
        let mmap = MmapRegion::create(&Self::path_in(dir), layout.total_length, false)?;
        let region = mmap.region();

        // Header fields are written in declaration order; the regions that
        // follow are still all-zero at this point.
        let header: &mut CncHeader = unsafe { region.get_mut(0) };
        header.version = CNC_VERSION;
        header.to_driver_len = layout.lengths.to_driver_len as u32;
        header.to_clients_len = layout.lengths.to_clients_len as u32;
        header.counters_metadata_len = layout.lengths.counters_metadata_len as u32;
        header.counters_values_len = layout.lengths.counters_values_len as u32;
        header.error_log_len = layout.lengths.error_log_len as u32;
        header.client_liveness_timeout_ns = params.client_liveness_timeout_ns;
        header.start_timestamp_ms = params.start_timestamp_ms;

        Ok(Self {
            mmap: Arc::new(mmap),
            layout,
        })
    }

    /// Map an existing CnC file and recover its layout from the header.
    ///
    /// A malformed or wrong-version file is rejected rather than trusted.
    pub fn map_existing(dir: &Path) -> Result<Self, DriverError> {
        let mmap = MmapRegion::attach(&Self::path_in(dir))?;
        if mmap.len() < CNC_HEADER_SIZE {
            return Err(malformed("file shorter than the meta-data header"));
        }

        let region = mmap.region();
        let header: &CncHeader = unsafe { region.get(0) };
        if header.version != CNC_VERSION {
            return Err(malformed(&format!(
                "version {} is not supported (expected {CNC_VERSION})",
                header.version
            )));
        }

        let lengths = CncLengths {
            to_driver_len: header.to_driver_len as usize,
            to_clients_len: header.to_clients_len as usize,
            counters_metadata_len: header.counters_metadata_len as usize,
            counters_values_len: header.counters_values_len as usize,
            error_log_len: header.error_log_len as usize,
        };
        let layout = CncLayout::compute(lengths)
            .map_err(|e| malformed(&format!("inconsistent region lengths: {e}")))?;
        if layout.total_length > mmap.len() {
            return Err(malformed("file shorter than its declared regions"));
        }

        Ok(Self {
            mmap: Arc::new(mmap),
            layout,
        })
    }

    #[inline]
    pub fn header(&self) -> &CncHeader {
        unsafe { &*(self.mmap.region().as_ptr() as *const CncHeader) }
    }

    #[inline]
    pub fn layout(&self) -> &CncLayout {
        &self.layout
    }

    /// The backing mapping, for structures that must keep it alive.
    #[inline]
    pub fn backing(&self) -> Arc<MmapRegion> {
        self.mmap.clone()
    }

    #[inline]
    pub fn path(&self) -> &Path {
        self.mmap.path()
    }

    /// Signal that every region is initialized and clients may proceed.
    pub fn signal_ready(&self) {
        self.header().ready.store(CNC_READY, Ordering::Release);
    }

    /// Acquire-load the ready word.
    pub fn is_ready(&self) -> bool {
        self.header().ready.load(Ordering::Acquire) == CNC_READY
    }

    pub fn to_driver_region(&self) -> Region {
        self.mmap
            .region()
            .sub_region(self.layout.to_driver_offset, self.layout.lengths.to_driver_len)
    }

    pub fn to_clients_region(&self) -> Region {
        self.mmap
            .region()
            .sub_region(self.layout.to_clients_offset, self.layout.lengths.to_clients_len)
    }

    pub fn counters_metadata_region(&self) -> Region {
        self.mmap.region().sub_region(
            self.layout.counters_metadata_offset,
            self.layout.lengths.counters_metadata_len,
        )
    }

    pub fn counters_values_region(&self) -> Region {
        self.mmap.region().sub_region(
            self.layout.counters_values_offset,
            self.layout.lengths.counters_values_len,
        )
    }

    pub fn error_log_region(&self) -> Region {
        self.mmap
            .region()
            .sub_region(self.layout.error_log_offset, self.layout.lengths.error_log_len)
    }
}

fn malformed(detail: &str) -> DriverError {
    DriverError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("malformed CnC file: {detail}"),
    ))
}
