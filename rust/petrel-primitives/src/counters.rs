//! Counters metadata and values buffers.
//!
//! Counters live in two parallel regions of the CnC file. The metadata
//! region holds fixed-size descriptor records (state, type id, key bytes,
//! label); the values region holds one cache-line-padded 64-bit slot per
//! counter. A counter's id is its record index, stable for the lifetime of
//! the file.
//!
//! Two manager flavors share the same layout: `CountersManager` assumes a
//! single registering thread (the Conductor); `ConcurrentCountersManager`
//! claims records with a CAS on the record state so any thread may register.

use core::mem::size_of;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::region::Region;

/// Metadata record size in bytes.
pub const METADATA_RECORD_SIZE: usize = 256;

/// Value slot size in bytes (one cache line).
pub const VALUE_SLOT_SIZE: usize = 64;

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 120;

/// Maximum label length in bytes (US-ASCII).
pub const MAX_LABEL_LENGTH: usize = 124;

/// Record has never been used.
pub const RECORD_UNUSED: u32 = 0;
/// Record describes a live counter.
pub const RECORD_ALLOCATED: u32 = 1;
/// Record was freed and may be reused.
pub const RECORD_RECLAIMED: u32 = 2;
/// Record is claimed but its metadata is still being written.
pub const RECORD_PENDING: u32 = 3;

/// Counter metadata record (256 bytes).
#[repr(C)]
pub struct CounterMetadata {
    /// Record state; readers only trust records in `RECORD_ALLOCATED`.
    pub state: AtomicU32,
    /// Application type id for the counter.
    pub type_id: u32,
    /// Opaque key bytes for correlating the counter with its owner.
    pub key: [u8; MAX_KEY_LENGTH],
    /// Length of the label in bytes.
    pub label_len: u32,
    /// US-ASCII label.
    pub label: [u8; MAX_LABEL_LENGTH],
}

const _: () = assert!(size_of::<CounterMetadata>() == METADATA_RECORD_SIZE);

/// Counter value slot (64 bytes).
#[repr(C)]
pub struct CounterValue {
    pub value: AtomicU64,
    _pad: [u8; 56],
}

const _: () = assert!(size_of::<CounterValue>() == VALUE_SLOT_SIZE);

/// Error from counter allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountersError {
    /// No free metadata record remains.
    Exhausted,
    /// Label longer than `MAX_LABEL_LENGTH` bytes.
    LabelTooLong,
    /// Key longer than `MAX_KEY_LENGTH` bytes.
    KeyTooLong,
    /// Labels must be US-ASCII.
    LabelNotAscii,
    /// The metadata and values regions disagree on capacity.
    LayoutMismatch,
    /// Counter id out of range.
    InvalidId(u32),
}

impl core::fmt::Display for CountersError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Exhausted => write!(f, "no free counter records"),
            Self::LabelTooLong => write!(f, "label exceeds {MAX_LABEL_LENGTH} bytes"),
            Self::KeyTooLong => write!(f, "key exceeds {MAX_KEY_LENGTH} bytes"),
            Self::LabelNotAscii => write!(f, "label must be US-ASCII"),
            Self::LayoutMismatch => write!(f, "metadata/values regions disagree on capacity"),
            Self::InvalidId(id) => write!(f, "counter id {id} out of range"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for CountersError {}

/// Hot-path handle to a single counter value slot.
///
/// Trivially copyable; updates are plain relaxed 64-bit atomics, so readers
/// in other processes see monotonic-ish snapshots with no further ordering.
#[derive(Clone, Copy)]
pub struct CounterHandle {
    values: Region,
    id: u32,
}

impl CounterHandle {
    #[inline]
    fn slot(&self) -> &AtomicU64 {
        let value: &CounterValue =
            unsafe { self.values.get(self.id as usize * VALUE_SLOT_SIZE) };
        &value.value
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.slot().load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set(&self, value: u64) {
        self.slot().store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment(&self) {
        self.slot().fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, delta: u64) {
        self.slot().fetch_add(delta, Ordering::Relaxed);
    }
}

fn shared_capacity(metadata: &Region, values: &Region) -> Result<usize, CountersError> {
    let by_metadata = metadata.len() / METADATA_RECORD_SIZE;
    let by_values = values.len() / VALUE_SLOT_SIZE;
    if by_metadata != by_values {
        return Err(CountersError::LayoutMismatch);
    }
    Ok(by_metadata)
}

fn validate(label: &str, key: &[u8]) -> Result<(), CountersError> {
    if !label.is_ascii() {
        return Err(CountersError::LabelNotAscii);
    }
    if label.len() > MAX_LABEL_LENGTH {
        return Err(CountersError::LabelTooLong);
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CountersError::KeyTooLong);
    }
    Ok(())
}

/// # Safety
///
/// The caller must have exclusive write access to the record.
unsafe fn fill_record(record: &mut CounterMetadata, label: &str, type_id: u32, key: &[u8]) {
    record.type_id = type_id;
    record.key = [0; MAX_KEY_LENGTH];
    record.key[..key.len()].copy_from_slice(key);
    record.label = [0; MAX_LABEL_LENGTH];
    record.label[..label.len()].copy_from_slice(label.as_bytes());
    record.label_len = label.len() as u32;
}

/// Single-writer counters manager: only the Conductor registers counters.
pub struct CountersManager {
    metadata: Region,
    values: Region,
    max_counters: usize,
}

impl CountersManager {
    pub fn new(metadata: Region, values: Region) -> Result<Self, CountersError> {
        let max_counters = shared_capacity(&metadata, &values)?;
        Ok(Self {
            metadata,
            values,
            max_counters,
        })
    }

    #[inline]
    pub fn max_counters(&self) -> usize {
        self.max_counters
    }

    /// Allocate a counter, returning its id.
    pub fn allocate(
        &mut self,
        label: &str,
        type_id: u32,
        key: &[u8],
    ) -> Result<u32, CountersError> {
        validate(label, key)?;

        for id in 0..self.max_counters as u32 {
            let record: &mut CounterMetadata =
                unsafe { self.metadata.get_mut(id as usize * METADATA_RECORD_SIZE) };
            let state = record.state.load(Ordering::Relaxed);
            if state == RECORD_ALLOCATED {
                continue;
            }

            unsafe { fill_record(record, label, type_id, key) };
            self.counter(id)?.set(0);
            record.state.store(RECORD_ALLOCATED, Ordering::Release);
            return Ok(id);
        }

        Err(CountersError::Exhausted)
    }

    /// Free a counter, allowing its record to be reused.
    pub fn free(&mut self, id: u32) -> Result<(), CountersError> {
        let record = self.record(id)?;
        self.counter(id)?.set(0);
        record.state.store(RECORD_RECLAIMED, Ordering::Release);
        Ok(())
    }

    /// Handle for updating a counter's value.
    pub fn counter(&self, id: u32) -> Result<CounterHandle, CountersError> {
        if id as usize >= self.max_counters {
            return Err(CountersError::InvalidId(id));
        }
        Ok(CounterHandle {
            values: self.values,
            id,
        })
    }

    fn record(&self, id: u32) -> Result<&CounterMetadata, CountersError> {
        if id as usize >= self.max_counters {
            return Err(CountersError::InvalidId(id));
        }
        Ok(unsafe { self.metadata.get(id as usize * METADATA_RECORD_SIZE) })
    }
}

/// Concurrent counters manager: any thread may register, claiming records
/// with a CAS on the record state.
pub struct ConcurrentCountersManager {
    metadata: Region,
    values: Region,
    max_counters: usize,
}

impl ConcurrentCountersManager {
    pub fn new(metadata: Region, values: Region) -> Result<Self, CountersError> {
        let max_counters = shared_capacity(&metadata, &values)?;
        Ok(Self {
            metadata,
            values,
            max_counters,
        })
    }

    #[inline]
    pub fn max_counters(&self) -> usize {
        self.max_counters
    }

    /// Allocate a counter, returning its id.
    pub fn allocate(&self, label: &str, type_id: u32, key: &[u8]) -> Result<u32, CountersError> {
        validate(label, key)?;

        for id in 0..self.max_counters as u32 {
            let record: &CounterMetadata =
                unsafe { self.metadata.get(id as usize * METADATA_RECORD_SIZE) };
            let state = record.state.load(Ordering::Acquire);
            if state == RECORD_ALLOCATED || state == RECORD_PENDING {
                continue;
            }

            if record
                .state
                .compare_exchange(state, RECORD_PENDING, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // Lost the race for this record; try the next one.
                continue;
            }

            let record: &mut CounterMetadata =
                unsafe { self.metadata.get_mut(id as usize * METADATA_RECORD_SIZE) };
            unsafe { fill_record(record, label, type_id, key) };
            self.counter(id)?.set(0);
            record.state.store(RECORD_ALLOCATED, Ordering::Release);
            return Ok(id);
        }

        Err(CountersError::Exhausted)
    }

    /// Free a counter, allowing its record to be reused.
    pub fn free(&self, id: u32) -> Result<(), CountersError> {
        if id as usize >= self.max_counters {
            return Err(CountersError::InvalidId(id));
        }
        let record: &CounterMetadata =
            unsafe { self.metadata.get(id as usize * METADATA_RECORD_SIZE) };
        self.counter(id)?.set(0);
        record.state.store(RECORD_RECLAIMED, Ordering::Release);
        Ok(())
    }

    /// Handle for updating a counter's value.
    pub fn counter(&self, id: u32) -> Result<CounterHandle, CountersError> {
        if id as usize >= self.max_counters {
            return Err(CountersError::InvalidId(id));
        }
        Ok(CounterHandle {
            values: self.values,
            id,
        })
    }
}

/// Read-only view over the counters buffers, usable by any process mapping
/// the CnC file.
pub struct CountersReader {
    metadata: Region,
    values: Region,
    max_counters: usize,
}

impl CountersReader {
    pub fn new(metadata: Region, values: Region) -> Result<Self, CountersError> {
        let max_counters = shared_capacity(&metadata, &values)?;
        Ok(Self {
            metadata,
            values,
            max_counters,
        })
    }

    /// Visit every allocated counter as `(id, type_id, label)`.
    pub fn for_each<F: FnMut(u32, u32, &str)>(&self, mut handler: F) {
        for id in 0..self.max_counters as u32 {
            let record: &CounterMetadata =
                unsafe { self.metadata.get(id as usize * METADATA_RECORD_SIZE) };
            if record.state.load(Ordering::Acquire) != RECORD_ALLOCATED {
                continue;
            }
            let label_len = (record.label_len as usize).min(MAX_LABEL_LENGTH);
            let label = core::str::from_utf8(&record.label[..label_len]).unwrap_or("");
            handler(id, record.type_id, label);
        }
    }

    /// Current value of a counter slot.
    pub fn counter_value(&self, id: u32) -> Result<u64, CountersError> {
        if id as usize >= self.max_counters {
            return Err(CountersError::InvalidId(id));
        }
        let value: &CounterValue = unsafe { self.values.get(id as usize * VALUE_SLOT_SIZE) };
        Ok(value.value.load(Ordering::Relaxed))
    }
}
