//! Bounded lock-free command queue.
//!
//! The inter-agent command queues are bounded, power-of-two capacity, and
//! fail fast on full: a producer never blocks and never spins waiting for
//! the consumer. Slots carry sequence stamps so several producers can share
//! the enqueue side (the driver hands one proxy to two agents) while the
//! consumer side stays single-owner.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

// The queue is the one structure in this crate that loom can model (its
// atomics live in owned memory, not in a cast mapping), so its atomics are
// switchable.
#[cfg(not(loom))]
use core::sync::atomic::{AtomicU64, Ordering};
#[cfg(loom)]
use loom::sync::atomic::{AtomicU64, Ordering};

/// Cache-line aligned wrapper to prevent false sharing.
#[repr(align(64))]
pub struct CachePadded<T>(pub T);

impl<T> core::ops::Deref for CachePadded<T> {
    type Target = T;
    #[inline(always)]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> core::ops::DerefMut for CachePadded<T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Error returned when the queue is full; carries the rejected value back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull<T>(pub T);

struct Slot<T> {
    /// Sequence stamp: equals the slot index when free for a producer at that
    /// position, index + 1 once a value is committed.
    sequence: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded lock-free array queue: concurrent producers, single consumer.
pub struct ArrayQueue<T> {
    buffer: Box<[Slot<T>]>,
    mask: u64,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

unsafe impl<T: Send> Send for ArrayQueue<T> {}
unsafe impl<T: Send> Sync for ArrayQueue<T> {}

impl<T: Copy> ArrayQueue<T> {
    /// Create a queue with the given capacity (power of two, > 0).
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "capacity must be a power of two"
        );

        let buffer: Vec<Slot<T>> = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicU64::new(i as u64),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            mask: (capacity - 1) as u64,
            head: CachePadded(AtomicU64::new(0)),
            tail: CachePadded(AtomicU64::new(0)),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Try to enqueue a value. Fails fast with `QueueFull` when no slot is
    /// available; never blocks.
    pub fn try_push(&self, value: T) -> Result<(), QueueFull<T>> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.buffer[(head & self.mask) as usize];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let diff = sequence as i64 - head as i64;

            if diff == 0 {
                match self.head.compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence
                            .store(head.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => head = actual,
                }
            } else if diff < 0 {
                return Err(QueueFull(value));
            } else {
                head = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Try to dequeue a value.
    ///
    /// Single consumer only: the owning agent is the one caller.
    pub fn try_pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        let slot = &self.buffer[(tail & self.mask) as usize];
        let sequence = slot.sequence.load(Ordering::Acquire);
        let diff = sequence as i64 - tail.wrapping_add(1) as i64;

        if diff < 0 {
            return None;
        }

        self.tail.store(tail.wrapping_add(1), Ordering::Relaxed);
        let value = unsafe { (*slot.value.get()).assume_init() };
        slot.sequence
            .store(tail.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Drain up to `limit` values into `handler`, returning the count.
    pub fn drain<F: FnMut(T)>(&self, mut handler: F, limit: usize) -> usize {
        let mut count = 0;
        while count < limit {
            match self.try_pop() {
                Some(value) => {
                    handler(value);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    /// Approximate number of enqueued values.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
