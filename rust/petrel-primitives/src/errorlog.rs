//! Distinct error log.
//!
//! An append-only log of error observations in the CnC file's error region.
//! Observations are deduplicated by description: re-recording a description
//! that is already present bumps its observation count and last-seen
//! timestamp atomically instead of consuming a new slot. Appends are
//! lock-free: writers claim space with a CAS on the append cursor and commit
//! by release-storing the record length, so readers never see a partially
//! written record.
//!
//! When the region is full `record` returns `false`; the caller decides what
//! to do with the overflow (the driver's default handler falls back to
//! stderr).

use core::mem::size_of;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::align_up;
use crate::region::Region;

/// Error record header size in bytes.
pub const ERROR_RECORD_HEADER_SIZE: usize = 32;

/// Records are aligned to this many bytes.
pub const ERROR_RECORD_ALIGNMENT: usize = 8;

/// Error record header, followed by the UTF-8 description.
#[repr(C)]
pub struct ErrorRecordHeader {
    /// Total record length including this header; 0 marks free space.
    pub length: AtomicU32,
    /// Number of times this description has been observed.
    pub observation_count: AtomicU32,
    /// Wall-clock ms of the most recent observation.
    pub last_observation_ms: AtomicU64,
    /// Wall-clock ms of the first observation.
    pub first_observation_ms: u64,
    /// FNV-1a hash of the description, for cheap dedup comparison.
    pub description_hash: u64,
}

const _: () = assert!(size_of::<ErrorRecordHeader>() == ERROR_RECORD_HEADER_SIZE);

/// FNV-1a 64-bit hash.
fn hash_description(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// Deduplicating append-only error log over a shared memory region.
pub struct DistinctErrorLog {
    region: Region,
    /// Append cursor; claimed with CAS so concurrent writers never collide.
    next_offset: AtomicUsize,
}

unsafe impl Send for DistinctErrorLog {}
unsafe impl Sync for DistinctErrorLog {}

impl DistinctErrorLog {
    /// Wrap a region as an error log.
    ///
    /// Existing records (from a prior mapping of the same region) are
    /// preserved: the append cursor starts past the last committed record.
    ///
    /// # Safety
    ///
    /// The region must be zeroed or contain only committed error records.
    pub unsafe fn new(region: Region) -> Self {
        let mut offset = 0;
        while offset + ERROR_RECORD_HEADER_SIZE <= region.len() {
            let header: &ErrorRecordHeader = unsafe { region.get(offset) };
            let length = header.length.load(Ordering::Acquire);
            if length == 0 {
                break;
            }
            offset += align_up(length as usize, ERROR_RECORD_ALIGNMENT);
        }

        Self {
            region,
            next_offset: AtomicUsize::new(offset),
        }
    }

    /// Record an observation of `description` at `now_ms`.
    ///
    /// Returns `false` if the region has no space for a new distinct record.
    pub fn record(&self, description: &str, now_ms: u64) -> bool {
        let bytes = description.as_bytes();
        let hash = hash_description(bytes);

        // Distinct-match scan: only committed records are visible.
        let mut offset = 0;
        loop {
            if offset + ERROR_RECORD_HEADER_SIZE > self.region.len() {
                break;
            }
            let header: &ErrorRecordHeader = unsafe { self.region.get(offset) };
            let length = header.length.load(Ordering::Acquire) as usize;
            if length == 0 {
                break;
            }

            if header.description_hash == hash {
                let existing = unsafe {
                    self.region
                        .bytes(offset + ERROR_RECORD_HEADER_SIZE, length - ERROR_RECORD_HEADER_SIZE)
                };
                if existing == bytes {
                    header.observation_count.fetch_add(1, Ordering::Relaxed);
                    header.last_observation_ms.store(now_ms, Ordering::Relaxed);
                    return true;
                }
            }

            offset += align_up(length, ERROR_RECORD_ALIGNMENT);
        }

        self.append(bytes, hash, now_ms)
    }

    fn append(&self, bytes: &[u8], hash: u64, now_ms: u64) -> bool {
        let length = ERROR_RECORD_HEADER_SIZE + bytes.len();
        let required = align_up(length, ERROR_RECORD_ALIGNMENT);

        let mut offset = self.next_offset.load(Ordering::Relaxed);
        loop {
            if offset + required > self.region.len() {
                return false;
            }
            match self.next_offset.compare_exchange_weak(
                offset,
                offset + required,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => offset = actual,
            }
        }

        unsafe {
            self.region
                .bytes_mut(offset + ERROR_RECORD_HEADER_SIZE, bytes.len())
                .copy_from_slice(bytes);

            let header: &mut ErrorRecordHeader = self.region.get_mut(offset);
            header.description_hash = hash;
            header.first_observation_ms = now_ms;
            header.last_observation_ms = AtomicU64::new(now_ms);
            header.observation_count = AtomicU32::new(1);
            // Commit: readers trust the record once the length is visible.
            header.length.store(length as u32, Ordering::Release);
        }

        true
    }
}

/// Read-only scan over an error log region.
pub struct ErrorLogReader;

impl ErrorLogReader {
    /// Visit every committed record as
    /// `(observation_count, first_ms, last_ms, description)`.
    ///
    /// Returns the number of distinct observations.
    pub fn read<F: FnMut(u32, u64, u64, &str)>(region: Region, mut handler: F) -> usize {
        let mut offset = 0;
        let mut observations = 0;

        while offset + ERROR_RECORD_HEADER_SIZE <= region.len() {
            let header: &ErrorRecordHeader = unsafe { region.get(offset) };
            let length = header.length.load(Ordering::Acquire) as usize;
            if length == 0 {
                break;
            }

            let description = unsafe {
                region.bytes(offset + ERROR_RECORD_HEADER_SIZE, length - ERROR_RECORD_HEADER_SIZE)
            };
            handler(
                header.observation_count.load(Ordering::Relaxed),
                header.first_observation_ms,
                header.last_observation_ms.load(Ordering::Relaxed),
                core::str::from_utf8(description).unwrap_or("<non-utf8 description>"),
            );
            observations += 1;

            offset += align_up(length, ERROR_RECORD_ALIGNMENT);
        }

        observations
    }
}
