//! Shared-memory and concurrency primitives for the petrel media driver.
//!
//! This crate holds the layout-level building blocks the driver and its
//! clients both depend on: offset-addressed memory regions, file-backed
//! mappings, the record-framed rings that live inside the CnC file, the
//! counters buffers, and the distinct error log. Nothing in here knows about
//! driver lifecycle; that lives in `petrel-driver`.
//!
//! All multi-process structures are `#[repr(C)]` with compile-time size
//! asserts and cache-line padded atomic indices. Producers and consumers in
//! different processes coordinate exclusively through the atomics declared in
//! each structure's header.

#![no_std]

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod broadcast;
pub mod counters;
pub mod errorlog;
pub mod region;
pub mod ringbuffer;

#[cfg(any(test, feature = "alloc"))]
pub mod queue;

#[cfg(feature = "std")]
pub mod clock;
#[cfg(all(feature = "std", unix))]
pub mod mmap;

#[cfg(any(test, feature = "alloc"))]
pub use region::HeapRegion;
pub use region::Region;

pub use broadcast::{BroadcastHeader, BroadcastTransmitter, BROADCAST_HEADER_SIZE};
#[cfg(any(test, feature = "alloc"))]
pub use broadcast::BroadcastReceiver;
pub use counters::{
    ConcurrentCountersManager, CounterHandle, CountersError, CountersManager, CountersReader,
    MAX_KEY_LENGTH, MAX_LABEL_LENGTH, METADATA_RECORD_SIZE, VALUE_SLOT_SIZE,
};
pub use errorlog::{DistinctErrorLog, ErrorLogReader, ERROR_RECORD_HEADER_SIZE};
pub use ringbuffer::{
    MpscRingBuffer, RingBufferHeader, RingWriteError, PADDING_MSG_TYPE, RECORD_ALIGNMENT,
    RECORD_HEADER_SIZE, RING_HEADER_SIZE,
};

#[cfg(any(test, feature = "alloc"))]
pub use queue::{ArrayQueue, CachePadded, QueueFull};

#[cfg(feature = "std")]
pub use clock::{EpochClock, ManualClock, NanoClock, SystemEpochClock, SystemNanoClock};
#[cfg(all(feature = "std", unix))]
pub use mmap::MmapRegion;

#[cfg(all(test, loom))]
mod loom_tests;

/// Align `value` up to the next multiple of `align` (`align` a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + (align - 1)) & !(align - 1)
}
