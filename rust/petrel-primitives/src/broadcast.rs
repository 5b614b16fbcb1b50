//! Single-producer broadcast channel.
//!
//! The driver-to-clients channel inside the CnC file. One transmitter (the
//! Conductor) writes record-framed events; any number of receivers follow
//! along, each with a private cursor. The transmitter never blocks and never
//! fails on a slow receiver: it simply laps them. Receivers detect the lap
//! via `tail_intent`, resynchronize to the latest committed record, and count
//! what they lost.
//!
//! Records share the framing of the MPSC ring: 32-byte aligned, `length` +
//! `msg_type` header, padding record (`msg_type == -1`) at wrap.

use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::align_up;
use crate::region::Region;
use crate::ringbuffer::{PADDING_MSG_TYPE, RECORD_ALIGNMENT, RECORD_HEADER_SIZE};

/// Broadcast header size in bytes (cache-line padded fields).
pub const BROADCAST_HEADER_SIZE: usize = 256;

/// Broadcast header (256 bytes, cache-line aligned fields).
#[repr(C)]
pub struct BroadcastHeader {
    /// Position the transmitter is about to write up to (pre-write).
    pub tail_intent: AtomicU64,
    _pad0: [u8; 56],

    /// Position of the end of the last committed record.
    pub tail: AtomicU64,
    _pad1: [u8; 56],

    /// Start position of the most recent committed record (lap resync point).
    pub latest: AtomicU64,
    _pad2: [u8; 56],

    /// Data capacity in bytes (power of 2, immutable after init).
    pub capacity: u32,
    _pad3: [u8; 60],
}

const _: () = assert!(size_of::<BroadcastHeader>() == BROADCAST_HEADER_SIZE);

impl BroadcastHeader {
    pub fn init(&mut self, capacity: u32) {
        assert!(capacity.is_power_of_two(), "capacity must be power of 2");
        self.tail_intent = AtomicU64::new(0);
        self._pad0 = [0; 56];
        self.tail = AtomicU64::new(0);
        self._pad1 = [0; 56];
        self.latest = AtomicU64::new(0);
        self._pad2 = [0; 56];
        self.capacity = capacity;
        self._pad3 = [0; 60];
    }
}

/// Error from a broadcast transmit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastError {
    /// Payload exceeds the maximum message length for this buffer.
    MessageTooLong { length: usize, max: usize },
    /// Message type ids must be positive.
    InvalidMsgType(i32),
}

impl core::fmt::Display for BroadcastError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::MessageTooLong { length, max } => {
                write!(f, "message length {length} exceeds max {max}")
            }
            Self::InvalidMsgType(t) => write!(f, "invalid message type id {t}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BroadcastError {}

/// The single producer end of a broadcast buffer.
pub struct BroadcastTransmitter {
    #[allow(dead_code)]
    region: Region,
    header: *mut BroadcastHeader,
    data: *mut u8,
    capacity: u64,
}

unsafe impl Send for BroadcastTransmitter {}

impl BroadcastTransmitter {
    /// Total region length needed for a buffer with the given data capacity.
    pub const fn required_region_length(data_capacity: usize) -> usize {
        BROADCAST_HEADER_SIZE + data_capacity
    }

    /// Initialize a new broadcast buffer at `offset` within the region.
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
        let required = offset + BROADCAST_HEADER_SIZE + capacity as usize;
        assert!(required <= region.len(), "region too small for broadcast");

        let header = region.offset(offset) as *mut BroadcastHeader;
        unsafe { (*header).init(capacity) };

        Self {
            region,
            header,
            data: region.offset(offset + BROADCAST_HEADER_SIZE),
            capacity: capacity as u64,
        }
    }

    #[inline]
    fn header(&self) -> &BroadcastHeader {
        unsafe { &*self.header }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    #[inline]
    pub fn max_payload_length(&self) -> usize {
        (self.capacity as usize / 8) - RECORD_HEADER_SIZE
    }

    /// Transmit one record. Never blocks; slow receivers are lapped.
    pub fn transmit(&self, msg_type: i32, payload: &[u8]) -> Result<(), BroadcastError> {
        if msg_type < 1 {
            return Err(BroadcastError::InvalidMsgType(msg_type));
        }
        if payload.len() > self.max_payload_length() {
            return Err(BroadcastError::MessageTooLong {
                length: payload.len(),
                max: self.max_payload_length(),
            });
        }

        let header = self.header();
        let mask = self.capacity - 1;
        let record_len = RECORD_HEADER_SIZE + payload.len();
        let aligned = align_up(record_len, RECORD_ALIGNMENT) as u64;

        let tail = header.tail.load(Ordering::Relaxed);
        let index = tail & mask;
        let to_end = self.capacity - index;

        if aligned > to_end {
            // Pad out the end of the buffer and place the record at the start.
            let new_tail = tail.wrapping_add(to_end).wrapping_add(aligned);
            header.tail_intent.store(new_tail, Ordering::Release);
            unsafe {
                self.write_record_header(index as usize, to_end as i32, PADDING_MSG_TYPE);
                self.write_record(0, msg_type, payload, record_len);
            }
            header
                .latest
                .store(tail.wrapping_add(to_end), Ordering::Relaxed);
            header.tail.store(new_tail, Ordering::Release);
        } else {
            let new_tail = tail.wrapping_add(aligned);
            header.tail_intent.store(new_tail, Ordering::Release);
            unsafe {
                self.write_record(index as usize, msg_type, payload, record_len);
            }
            header.latest.store(tail, Ordering::Relaxed);
            header.tail.store(new_tail, Ordering::Release);
        }

        Ok(())
    }

    /// # Safety
    ///
    /// Single producer; `index` must be in bounds for the record.
    unsafe fn write_record(&self, index: usize, msg_type: i32, payload: &[u8], record_len: usize) {
        unsafe {
            self.write_record_header(index, record_len as i32, msg_type);
            ptr::copy_nonoverlapping(
                payload.as_ptr(),
                self.data.add(index + RECORD_HEADER_SIZE),
                payload.len(),
            );
        }
    }

    /// # Safety
    ///
    /// Single producer; `index` must be in bounds for the record header.
    unsafe fn write_record_header(&self, index: usize, length: i32, msg_type: i32) {
        unsafe {
            (self.data.add(index) as *mut i32).write(length);
            (self.data.add(index + 4) as *mut i32).write(msg_type);
        }
    }
}

#[cfg(any(test, feature = "alloc"))]
mod receiver {
    use super::*;
    use alloc::vec::Vec;

    /// A receiver cursor over a broadcast buffer.
    ///
    /// Each receiver copies a record out, then re-validates that the
    /// transmitter did not overwrite it mid-copy. A lapped receiver jumps to
    /// the latest committed record and counts the loss.
    pub struct BroadcastReceiver {
        #[allow(dead_code)]
        region: Region,
        header: *const BroadcastHeader,
        data: *const u8,
        capacity: u64,
        cursor: u64,
        lapped_count: u64,
        scratch: Vec<u8>,
    }

    unsafe impl Send for BroadcastReceiver {}

    impl BroadcastReceiver {
        /// Attach to an existing broadcast buffer, joining at the live edge.
        ///
        /// # Safety
        ///
        /// The region must contain an initialized broadcast header at `offset`.
        pub unsafe fn attach(region: Region, offset: usize) -> Result<Self, &'static str> {
            if !offset.is_multiple_of(64) {
                return Err("header offset must be 64-byte aligned");
            }
            if offset + BROADCAST_HEADER_SIZE > region.len() {
                return Err("region too small for broadcast header");
            }

            let header = region.offset(offset) as *const BroadcastHeader;
            let capacity = unsafe { (*header).capacity };
            if !capacity.is_power_of_two() || (capacity as usize) < RECORD_ALIGNMENT * 2 {
                return Err("invalid broadcast capacity");
            }
            if offset + BROADCAST_HEADER_SIZE + capacity as usize > region.len() {
                return Err("region too small for broadcast data");
            }

            let cursor = unsafe { (*header).tail.load(Ordering::Acquire) };

            Ok(Self {
                region,
                header,
                data: region.offset(offset + BROADCAST_HEADER_SIZE),
                capacity: capacity as u64,
                cursor,
                lapped_count: 0,
                scratch: Vec::new(),
            })
        }

        #[inline]
        fn header(&self) -> &BroadcastHeader {
            unsafe { &*self.header }
        }

        /// Number of times this receiver has been lapped by the transmitter.
        #[inline]
        pub fn lapped_count(&self) -> u64 {
            self.lapped_count
        }

        /// Receive the next record, if any. Returns `true` when `handler` ran.
        pub fn receive<F: FnMut(i32, &[u8])>(&mut self, mut handler: F) -> bool {
            let mask = self.capacity - 1;

            loop {
                let tail = self.header().tail.load(Ordering::Acquire);
                if self.cursor == tail {
                    return false;
                }

                if self.resync_if_lapped() {
                    continue;
                }

                let index = (self.cursor & mask) as usize;
                let record_len = unsafe { (self.data.add(index) as *const i32).read() };
                let msg_type = unsafe { (self.data.add(index + 4) as *const i32).read() };

                if record_len < RECORD_HEADER_SIZE as i32 || record_len as u64 > self.capacity {
                    // Torn header: we were lapped mid-read.
                    self.lapped_count += 1;
                    self.cursor = self.header().latest.load(Ordering::Acquire);
                    continue;
                }

                let aligned = align_up(record_len as usize, RECORD_ALIGNMENT) as u64;

                if msg_type == PADDING_MSG_TYPE {
                    if self.resync_if_lapped() {
                        continue;
                    }
                    self.cursor = self.cursor.wrapping_add(aligned);
                    continue;
                }

                let payload_len = record_len as usize - RECORD_HEADER_SIZE;
                self.scratch.resize(payload_len, 0);
                unsafe {
                    ptr::copy_nonoverlapping(
                        self.data.add(index + RECORD_HEADER_SIZE),
                        self.scratch.as_mut_ptr(),
                        payload_len,
                    );
                }

                // The copy is only trustworthy if the transmitter has not
                // reused this span of the buffer in the meantime.
                if self.resync_if_lapped() {
                    continue;
                }

                self.cursor = self.cursor.wrapping_add(aligned);
                handler(msg_type, &self.scratch[..payload_len]);
                return true;
            }
        }

        fn resync_if_lapped(&mut self) -> bool {
            let intent = self.header().tail_intent.load(Ordering::Acquire);
            if intent.wrapping_sub(self.cursor) > self.capacity {
                self.lapped_count += 1;
                self.cursor = self.header().latest.load(Ordering::Acquire);
                true
            } else {
                false
            }
        }
    }
}

#[cfg(any(test, feature = "alloc"))]
pub use receiver::BroadcastReceiver;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::HeapRegion;
    use std::vec::Vec;

    const CAPACITY: u32 = 1024;

    fn new_pair() -> (HeapRegion, BroadcastTransmitter, BroadcastReceiver) {
        let backing = HeapRegion::new_zeroed(BroadcastTransmitter::required_region_length(
            CAPACITY as usize,
        ));
        let tx = unsafe { BroadcastTransmitter::init(backing.region(), 0, CAPACITY) };
        let rx = unsafe { BroadcastReceiver::attach(backing.region(), 0) }.unwrap();
        (backing, tx, rx)
    }

    #[test]
    fn transmit_receive_roundtrip() {
        let (_backing, tx, mut rx) = new_pair();

        tx.transmit(5, b"event-a").unwrap();
        tx.transmit(6, b"event-b").unwrap();

        let mut seen = Vec::new();
        while rx.receive(|t, p| seen.push((t, p.to_vec()))) {}

        assert_eq!(
            seen,
            std::vec![(5, b"event-a".to_vec()), (6, b"event-b".to_vec())]
        );
        assert_eq!(rx.lapped_count(), 0);
    }

    #[test]
    fn receiver_joins_at_live_edge() {
        let backing = HeapRegion::new_zeroed(BroadcastTransmitter::required_region_length(
            CAPACITY as usize,
        ));
        let tx = unsafe { BroadcastTransmitter::init(backing.region(), 0, CAPACITY) };

        tx.transmit(1, b"before-attach").unwrap();
        let mut rx = unsafe { BroadcastReceiver::attach(backing.region(), 0) }.unwrap();

        assert!(!rx.receive(|_, _| panic!("stale event delivered")));

        tx.transmit(2, b"after-attach").unwrap();
        assert!(rx.receive(|t, _| assert_eq!(t, 2)));
    }

    #[test]
    fn wraps_through_padding() {
        let (_backing, tx, mut rx) = new_pair();
        let payload = [7u8; 150]; // 158-byte record, aligned to 160

        for i in 0..40 {
            tx.transmit(1, &payload).unwrap();
            assert!(rx.receive(|t, p| {
                assert_eq!(t, 1);
                assert_eq!(p.len(), 150);
            }), "record {i} lost");
        }
        assert_eq!(rx.lapped_count(), 0);
    }

    #[test]
    fn slow_receiver_is_lapped_and_resyncs() {
        let (_backing, tx, mut rx) = new_pair();

        // Far more data than the buffer holds while the receiver sleeps.
        for i in 0..100u32 {
            tx.transmit(1, &i.to_le_bytes()).unwrap();
        }

        let mut seen = Vec::new();
        while rx.receive(|_, p| seen.push(u32::from_le_bytes(p.try_into().unwrap()))) {}

        assert!(rx.lapped_count() > 0);
        assert!(!seen.is_empty());
        // Whatever survived is the most recent tail of the stream, in order.
        assert_eq!(*seen.last().unwrap(), 99);
        assert!(seen.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn rejects_bad_messages() {
        let (_backing, tx, _rx) = new_pair();

        assert_eq!(
            tx.transmit(0, b"x"),
            Err(BroadcastError::InvalidMsgType(0))
        );
        let too_long = std::vec![0u8; tx.max_payload_length() + 1];
        assert!(matches!(
            tx.transmit(1, &too_long),
            Err(BroadcastError::MessageTooLong { .. })
        ));
    }
}
