//! Memory-mapped loss report.
//!
//! A separate file (`loss-report.dat`) of variable-length records describing
//! observed loss per stream. The Conductor is the single writer; anyone may
//! map the file read-only for live inspection, and it survives the driver
//! for post-mortems.
//!
//! Entries are committed by release-storing the observation count, so a
//! reader never sees a half-written record. Once created, an entry is only
//! ever updated through its atomic fields.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

use petrel_primitives::{Region, align_up};

/// Name of the loss report file inside the driver directory.
pub const LOSS_REPORT_FILE_NAME: &str = "loss-report.dat";

/// Entry alignment (one cache line).
pub const ENTRY_ALIGNMENT: usize = 64;

/// Fixed-size prefix of an entry, followed by channel and source strings.
#[repr(C)]
pub struct LossEntryHeader {
    /// Number of loss observations; 0 marks free space (commit marker).
    pub observation_count: AtomicU64,
    /// Total bytes lost across all observations.
    pub total_bytes_lost: AtomicU64,
    /// Wall-clock ms of the first observation.
    pub first_observation_ms: u64,
    /// Wall-clock ms of the latest observation.
    pub last_observation_ms: AtomicU64,
    pub session_id: i32,
    pub stream_id: i32,
    /// Length of the channel string.
    pub channel_len: u32,
    /// Length of the source string.
    pub source_len: u32,
}

const ENTRY_HEADER_SIZE: usize = 48;
const _: () = assert!(size_of::<LossEntryHeader>() == ENTRY_HEADER_SIZE);

/// Handle to a committed entry, for updating its observation atomics.
#[derive(Clone, Copy)]
pub struct LossEntryHandle {
    region: Region,
    offset: usize,
}

impl LossEntryHandle {
    #[inline]
    fn header(&self) -> &LossEntryHeader {
        unsafe { self.region.get(self.offset) }
    }

    /// Fold another observation into the entry.
    pub fn record_observation(&self, bytes_lost: u64, now_ms: u64) {
        let header = self.header();
        header
            .last_observation_ms
            .store(now_ms, Ordering::Relaxed);
        header.total_bytes_lost.fetch_add(bytes_lost, Ordering::Relaxed);
        header.observation_count.fetch_add(1, Ordering::Release);
    }

    pub fn observation_count(&self) -> u64 {
        self.header().observation_count.load(Ordering::Acquire)
    }

    pub fn total_bytes_lost(&self) -> u64 {
        self.header().total_bytes_lost.load(Ordering::Relaxed)
    }
}

/// Single-writer view over the loss report region.
pub struct LossReport {
    region: Region,
    next_offset: usize,
}

unsafe impl Send for LossReport {}

impl LossReport {
    /// Wrap a zeroed region as an empty loss report.
    ///
    /// # Safety
    ///
    /// The region must be zeroed and this must be the only writer.
    pub unsafe fn new(region: Region) -> Self {
        Self {
            region,
            next_offset: 0,
        }
    }

    /// Create a new entry for a stream that has started losing data.
    ///
    /// Returns `None` when the report is full; the caller keeps counting
    /// through whatever entries it already holds.
    #[allow(clippy::too_many_arguments)]
    pub fn create_entry(
        &mut self,
        initial_bytes_lost: u64,
        now_ms: u64,
        session_id: i32,
        stream_id: i32,
        channel: &str,
        source: &str,
    ) -> Option<LossEntryHandle> {
        let length =
            ENTRY_HEADER_SIZE + channel.len() + source.len();
        let required = align_up(length, ENTRY_ALIGNMENT);
        if self.next_offset + required > self.region.len() {
            return None;
        }

        let offset = self.next_offset;
        self.next_offset += required;

        unsafe {
            self.region
                .bytes_mut(offset + ENTRY_HEADER_SIZE, channel.len())
                .copy_from_slice(channel.as_bytes());
            self.region
                .bytes_mut(offset + ENTRY_HEADER_SIZE + channel.len(), source.len())
                .copy_from_slice(source.as_bytes());

            let header: &mut LossEntryHeader = self.region.get_mut(offset);
            header.total_bytes_lost = AtomicU64::new(initial_bytes_lost);
            header.first_observation_ms = now_ms;
            header.last_observation_ms = AtomicU64::new(now_ms);
            header.session_id = session_id;
            header.stream_id = stream_id;
            header.channel_len = channel.len() as u32;
            header.source_len = source.len() as u32;
            // Commit: a non-zero count makes the record visible to readers.
            header.observation_count.store(1, Ordering::Release);
        }

        Some(LossEntryHandle {
            region: self.region,
            offset,
        })
    }
}

/// One decoded entry, as seen by a reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LossEntry {
    pub observation_count: u64,
    pub total_bytes_lost: u64,
    pub first_observation_ms: u64,
    pub last_observation_ms: u64,
    pub session_id: i32,
    pub stream_id: i32,
    pub channel: String,
    pub source: String,
}

/// Scan the committed entries of a loss report region.
pub struct LossReportReader;

impl LossReportReader {
    pub fn read<F: FnMut(LossEntry)>(region: Region, mut handler: F) -> usize {
        let mut offset = 0;
        let mut entries = 0;

        while offset + ENTRY_HEADER_SIZE <= region.len() {
            let header: &LossEntryHeader = unsafe { region.get(offset) };
            let count = header.observation_count.load(Ordering::Acquire);
            if count == 0 {
                break;
            }

            let channel_len = header.channel_len as usize;
            let source_len = header.source_len as usize;
            let channel = unsafe { region.bytes(offset + ENTRY_HEADER_SIZE, channel_len) };
            let source =
                unsafe { region.bytes(offset + ENTRY_HEADER_SIZE + channel_len, source_len) };

            handler(LossEntry {
                observation_count: count,
                total_bytes_lost: header.total_bytes_lost.load(Ordering::Relaxed),
                first_observation_ms: header.first_observation_ms,
                last_observation_ms: header.last_observation_ms.load(Ordering::Relaxed),
                session_id: header.session_id,
                stream_id: header.stream_id,
                channel: String::from_utf8_lossy(channel).into_owned(),
                source: String::from_utf8_lossy(source).into_owned(),
            });
            entries += 1;

            offset += align_up(ENTRY_HEADER_SIZE + channel_len + source_len, ENTRY_ALIGNMENT);
        }

        entries
    }
}
