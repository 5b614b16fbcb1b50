//! Many-producer single-consumer record ring buffer.
//!
//! This is the to-driver command channel inside the CnC file: any number of
//! client processes write record-framed messages; the driver's Conductor is
//! the single consumer. The protocol is claim/commit:
//!
//! - a producer claims space by CAS-advancing `producer_position`
//! - it stamps the record length negative while the payload is in flight
//! - it commits by release-storing the positive record length
//!
//! The consumer stops at the first record whose length is not yet positive,
//! zeroes everything it consumed, and release-advances `consumer_position`.
//! Records are 32-byte aligned; a padding record (`msg_type == -1`) covers
//! the tail of the buffer when a record would otherwise wrap.
//!
//! The header also carries the consumer heartbeat slot that clients read to
//! decide whether a driver is alive.

use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use crate::align_up;
use crate::region::Region;

/// Ring header size in bytes (cache-line padded fields).
pub const RING_HEADER_SIZE: usize = 256;

/// Record header: `length: i32` then `msg_type: i32`.
pub const RECORD_HEADER_SIZE: usize = 8;

/// Records are aligned to this many bytes.
pub const RECORD_ALIGNMENT: usize = 32;

/// Message type of padding records inserted at buffer wrap.
pub const PADDING_MSG_TYPE: i32 = -1;

/// MPSC ring header (256 bytes, cache-line aligned fields).
#[repr(C)]
pub struct RingBufferHeader {
    /// Claim position (CAS-advanced by producers).
    pub producer_position: AtomicU64,
    _pad0: [u8; 56],

    /// Consume position (written by the single consumer).
    pub consumer_position: AtomicU64,
    _pad1: [u8; 56],

    /// Wall-clock milliseconds stamped by the consumer each duty cycle.
    pub consumer_heartbeat_ms: AtomicU64,
    _pad2: [u8; 56],

    /// Data capacity in bytes (power of 2, immutable after init).
    pub capacity: u32,
    _pad3: [u8; 60],
}

const _: () = assert!(size_of::<RingBufferHeader>() == RING_HEADER_SIZE);

impl RingBufferHeader {
    /// Initialize a new ring header.
    pub fn init(&mut self, capacity: u32) {
        assert!(capacity.is_power_of_two(), "capacity must be power of 2");
        self.producer_position = AtomicU64::new(0);
        self._pad0 = [0; 56];
        self.consumer_position = AtomicU64::new(0);
        self._pad1 = [0; 56];
        self.consumer_heartbeat_ms = AtomicU64::new(0);
        self._pad2 = [0; 56];
        self.capacity = capacity;
        self._pad3 = [0; 60];
    }
}

/// Error from a ring write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingWriteError {
    /// Insufficient space; the producer must not block, so it fails fast.
    Full,
    /// Payload exceeds the maximum message length for this ring.
    MessageTooLong { length: usize, max: usize },
    /// Message type ids must be positive.
    InvalidMsgType(i32),
}

impl core::fmt::Display for RingWriteError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Full => write!(f, "ring buffer full"),
            Self::MessageTooLong { length, max } => {
                write!(f, "message length {length} exceeds max {max}")
            }
            Self::InvalidMsgType(t) => write!(f, "invalid message type id {t}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for RingWriteError {}

/// A many-producer single-consumer record ring in a shared memory region.
pub struct MpscRingBuffer {
    /// We hold the region to keep bounds checkable; the backing memory's
    /// lifetime is managed by whoever owns the mapping.
    #[allow(dead_code)]
    region: Region,
    header: *mut RingBufferHeader,
    data: *mut u8,
    capacity: u64,
}

unsafe impl Send for MpscRingBuffer {}
unsafe impl Sync for MpscRingBuffer {}

impl MpscRingBuffer {
    /// Total region length needed for a ring with the given data capacity.
    pub const fn required_region_length(data_capacity: usize) -> usize {
        RING_HEADER_SIZE + data_capacity
    }

    /// Initialize a new ring at `offset` within the region.
    ///
    /// # Safety
    ///
    /// The region must be writable, zeroed, and exclusively owned during
    /// initialization.
    pub unsafe fn init(region: Region, offset: usize, capacity: u32) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity as usize >= RECORD_ALIGNMENT * 2,
            "capacity must be a power of 2"
        );
        assert!(
            offset.is_multiple_of(64),
            "header offset must be 64-byte aligned"
        );
        let required = offset + RING_HEADER_SIZE + capacity as usize;
        assert!(required <= region.len(), "region too small for ring");

        let header = region.offset(offset) as *mut RingBufferHeader;
        unsafe { (*header).init(capacity) };

        Self {
            region,
            header,
            data: region.offset(offset + RING_HEADER_SIZE),
            capacity: capacity as u64,
        }
    }

    /// Attach to an existing ring at `offset` within the region.
    ///
    /// # Safety
    ///
    /// The region must contain an initialized ring header at `offset`.
    pub unsafe fn attach(region: Region, offset: usize) -> Result<Self, &'static str> {
        if !offset.is_multiple_of(64) {
            return Err("header offset must be 64-byte aligned");
        }
        if offset + RING_HEADER_SIZE > region.len() {
            return Err("region too small for ring header");
        }

        let header = region.offset(offset) as *mut RingBufferHeader;
        let capacity = unsafe { (*header).capacity };
        if !capacity.is_power_of_two() || (capacity as usize) < RECORD_ALIGNMENT * 2 {
            return Err("invalid ring capacity");
        }
        if offset + RING_HEADER_SIZE + capacity as usize > region.len() {
            return Err("region too small for ring data");
        }

        Ok(Self {
            region,
            header,
            data: region.offset(offset + RING_HEADER_SIZE),
            capacity: capacity as u64,
        })
    }

    #[inline]
    fn header(&self) -> &RingBufferHeader {
        unsafe { &*self.header }
    }

    #[inline]
    fn length_at(&self, index: usize) -> &AtomicI32 {
        unsafe { &*(self.data.add(index) as *const AtomicI32) }
    }

    /// Data capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Maximum payload length accepted by `write`.
    #[inline]
    pub fn max_payload_length(&self) -> usize {
        (self.capacity as usize / 8) - RECORD_HEADER_SIZE
    }

    /// Bytes currently enqueued (approximate under contention).
    pub fn size(&self) -> usize {
        let header = self.header();
        let consumer = header.consumer_position.load(Ordering::Acquire);
        let producer = header.producer_position.load(Ordering::Acquire);
        producer.wrapping_sub(consumer) as usize
    }

    /// Write one record. Wait-free for the producer on success; fails fast
    /// with `RingWriteError::Full` when space is exhausted.
    pub fn write(&self, msg_type: i32, payload: &[u8]) -> Result<(), RingWriteError> {
        if msg_type < 1 {
            return Err(RingWriteError::InvalidMsgType(msg_type));
        }
        if payload.len() > self.max_payload_length() {
            return Err(RingWriteError::MessageTooLong {
                length: payload.len(),
                max: self.max_payload_length(),
            });
        }

        let record_len = RECORD_HEADER_SIZE + payload.len();
        let required = align_up(record_len, RECORD_ALIGNMENT) as u64;
        let header = self.header();
        let mask = self.capacity - 1;

        loop {
            let consumer = header.consumer_position.load(Ordering::Acquire);
            let producer = header.producer_position.load(Ordering::Relaxed);
            let available = self.capacity - producer.wrapping_sub(consumer);

            let producer_index = producer & mask;
            let to_end = self.capacity - producer_index;
            let padding = if required > to_end { to_end } else { 0 };

            if required + padding > available {
                return Err(RingWriteError::Full);
            }

            let claimed = header.producer_position.compare_exchange_weak(
                producer,
                producer.wrapping_add(required + padding),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            if claimed.is_err() {
                continue;
            }

            unsafe {
                let record_index = if padding != 0 {
                    self.commit_padding(producer_index as usize, padding as usize);
                    0
                } else {
                    producer_index as usize
                };
                self.commit_record(record_index, msg_type, payload, record_len);
            }
            return Ok(());
        }
    }

    /// # Safety
    ///
    /// `index..index + align_up(record_len)` must be claimed by this caller.
    unsafe fn commit_record(&self, index: usize, msg_type: i32, payload: &[u8], record_len: usize) {
        let length = self.length_at(index);
        // Claim marker: consumers treat non-positive lengths as not-yet-committed.
        length.store(-(record_len as i32), Ordering::Relaxed);
        unsafe {
            (self.data.add(index + 4) as *mut i32).write(msg_type);
            ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.data.add(index + RECORD_HEADER_SIZE),
                payload.len(),
            );
        }
        length.store(record_len as i32, Ordering::Release);
    }

    /// # Safety
    ///
    /// `index..index + padding` must be claimed by this caller and reach the
    /// end of the data buffer.
    unsafe fn commit_padding(&self, index: usize, padding: usize) {
        unsafe {
            (self.data.add(index + 4) as *mut i32).write(PADDING_MSG_TYPE);
        }
        self.length_at(index).store(padding as i32, Ordering::Release);
    }

    /// Read up to `limit` records, invoking `handler(msg_type, payload)` for
    /// each. Consumed space is zeroed before the consumer position advances.
    ///
    /// Single consumer only.
    pub fn read<F: FnMut(i32, &[u8])>(&self, mut handler: F, limit: usize) -> usize {
        let header = self.header();
        let consumer = header.consumer_position.load(Ordering::Relaxed);
        let producer = header.producer_position.load(Ordering::Acquire);
        let mask = self.capacity - 1;

        let mut bytes_read: u64 = 0;
        let mut messages = 0;

        while consumer.wrapping_add(bytes_read) != producer && messages < limit {
            let index = ((consumer.wrapping_add(bytes_read)) & mask) as usize;
            let record_len = self.length_at(index).load(Ordering::Acquire);
            if record_len <= 0 {
                // Claimed but not yet committed; stop here this cycle.
                break;
            }

            let msg_type = unsafe { (self.data.add(index + 4) as *const i32).read() };
            if msg_type != PADDING_MSG_TYPE {
                let payload = unsafe {
                    core::slice::from_raw_parts(
                        self.data.add(index + RECORD_HEADER_SIZE),
                        record_len as usize - RECORD_HEADER_SIZE,
                    )
                };
                handler(msg_type, payload);
                messages += 1;
            }

            bytes_read += align_up(record_len as usize, RECORD_ALIGNMENT) as u64;
        }

        if bytes_read > 0 {
            unsafe { self.zero_range((consumer & mask) as usize, bytes_read as usize) };
            header
                .consumer_position
                .store(consumer.wrapping_add(bytes_read), Ordering::Release);
        }

        messages
    }

    /// # Safety
    ///
    /// The range must be fully consumed (no producer can hold a claim on it).
    unsafe fn zero_range(&self, index: usize, len: usize) {
        let cap = self.capacity as usize;
        let first = core::cmp::min(len, cap - index);
        unsafe {
            ptr::write_bytes(self.data.add(index), 0, first);
            if len > first {
                ptr::write_bytes(self.data, 0, len - first);
            }
        }
    }

    /// Read the consumer heartbeat timestamp (wall-clock ms).
    #[inline]
    pub fn consumer_heartbeat_ms(&self) -> u64 {
        self.header().consumer_heartbeat_ms.load(Ordering::Relaxed)
    }

    /// Stamp the consumer heartbeat timestamp (wall-clock ms).
    #[inline]
    pub fn set_consumer_heartbeat_ms(&self, now_ms: u64) {
        self.header()
            .consumer_heartbeat_ms
            .store(now_ms, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;
    use std::vec::Vec;

    const CAPACITY: u32 = 1024;

    fn new_ring() -> (HeapRegion, MpscRingBuffer) {
        let backing = HeapRegion::new_zeroed(MpscRingBuffer::required_region_length(
            CAPACITY as usize,
        ));
        let ring = unsafe { MpscRingBuffer::init(backing.region(), 0, CAPACITY) };
        (backing, ring)
    }

    #[test]
    fn write_then_read() {
        let (_backing, ring) = new_ring();

        ring.write(7, b"hello").unwrap();
        ring.write(9, b"world!").unwrap();

        let mut seen = Vec::new();
        let count = ring.read(|t, p| seen.push((t, p.to_vec())), 16);

        assert_eq!(count, 2);
        assert_eq!(seen[0], (7, b"hello".to_vec()));
        assert_eq!(seen[1], (9, b"world!".to_vec()));
        assert_eq!(ring.size(), 0);
    }

    #[test]
    fn read_limit_is_honored() {
        let (_backing, ring) = new_ring();
        for _ in 0..5 {
            ring.write(1, &[0u8; 8]).unwrap();
        }

        let count = ring.read(|_, _| {}, 3);
        assert_eq!(count, 3);
        let count = ring.read(|_, _| {}, 3);
        assert_eq!(count, 2);
    }

    #[test]
    fn fails_fast_when_full() {
        let (_backing, ring) = new_ring();

        // Each record occupies 32 bytes; fill the data region exactly.
        let records = CAPACITY as usize / RECORD_ALIGNMENT;
        for _ in 0..records {
            ring.write(1, &[0u8; 8]).unwrap();
        }
        assert_eq!(ring.write(1, &[0u8; 8]), Err(RingWriteError::Full));

        // Draining makes room again.
        ring.read(|_, _| {}, usize::MAX);
        ring.write(1, &[0u8; 8]).unwrap();
    }

    #[test]
    fn wraps_with_padding_record() {
        let (_backing, ring) = new_ring();
        let payload = [0xABu8; 150]; // 158-byte record, aligned to 160

        // 160 does not divide 1024, so a record periodically straddles the
        // end of the buffer and forces a padding record.
        for _ in 0..40 {
            ring.write(1, &payload).unwrap();
            assert_eq!(ring.read(|t, p| assert_eq!((t, p.len()), (1, 150)), 1), 1);
        }
        assert_eq!(ring.size(), 0);
    }

    #[test]
    fn rejects_bad_messages() {
        let (_backing, ring) = new_ring();

        assert_eq!(ring.write(0, b"x"), Err(RingWriteError::InvalidMsgType(0)));
        assert_eq!(
            ring.write(-3, b"x"),
            Err(RingWriteError::InvalidMsgType(-3))
        );

        let too_long = std::vec![0u8; ring.max_payload_length() + 1];
        assert!(matches!(
            ring.write(1, &too_long),
            Err(RingWriteError::MessageTooLong { .. })
        ));
    }

    #[test]
    fn heartbeat_roundtrip() {
        let (_backing, ring) = new_ring();
        assert_eq!(ring.consumer_heartbeat_ms(), 0);
        ring.set_consumer_heartbeat_ms(1_234_567);
        assert_eq!(ring.consumer_heartbeat_ms(), 1_234_567);
    }

    #[test]
    fn attach_sees_existing_records() {
        let (backing, ring) = new_ring();
        ring.write(3, b"persisted").unwrap();

        let attached = unsafe { MpscRingBuffer::attach(backing.region(), 0) }.unwrap();
        assert_eq!(attached.capacity(), CAPACITY as usize);

        let mut seen = Vec::new();
        attached.read(|t, p| seen.push((t, p.to_vec())), 16);
        assert_eq!(seen, std::vec![(3, b"persisted".to_vec())]);
    }

    #[test]
    fn concurrent_producers_preserve_records() {
        use std::sync::Arc;
        use std::thread;

        let backing = Arc::new(HeapRegion::new_zeroed(
            MpscRingBuffer::required_region_length(64 * 1024),
        ));
        let ring = Arc::new(unsafe { MpscRingBuffer::init(backing.region(), 0, 64 * 1024) });

        let mut producers = Vec::new();
        for p in 0..4u8 {
            let ring = ring.clone();
            let backing = backing.clone();
            producers.push(thread::spawn(move || {
                let _keep = backing;
                for i in 0..200u32 {
                    let mut payload = [0u8; 8];
                    payload[0] = p;
                    payload[4..].copy_from_slice(&i.to_le_bytes());
                    loop {
                        match ring.write(1, &payload) {
                            Ok(()) => break,
                            Err(RingWriteError::Full) => thread::yield_now(),
                            Err(e) => panic!("unexpected: {e}"),
                        }
                    }
                }
            }));
        }

        let mut per_producer = [0u32; 4];
        let mut total = 0;
        while total < 800 {
            total += ring.read(
                |t, payload| {
                    assert_eq!(t, 1);
                    assert_eq!(payload.len(), 8);
                    let p = payload[0] as usize;
                    let i = u32::from_le_bytes(payload[4..].try_into().unwrap());
                    assert_eq!(per_producer[p], i, "per-producer order broken");
                    per_producer[p] += 1;
                },
                64,
            );
        }

        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(per_producer, [200; 4]);
    }
}
