//! Bounded wait-free MPSC ring buffer: the fifo's fast path.
//!
//! Vyukov-style bounded queue simplified for the single-consumer case:
//!
//! - Each slot has an atomic sequence number
//! - Producers claim exclusive write positions by CAS on the add cursor
//! - After writing, a producer publishes by setting `slot.seq = pos + 1`
//! - The consumer checks `slot.seq == tail + 1` before reading
//! - After reading, the consumer sets `slot.seq = tail + capacity` so the
//!   slot is recognized as free on the next lap
//!
//! The ring carries message handles; a message's carrier cell rides along
//! untouched, which is what lets the fifo hand the same message to either
//! structure.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::arena::{MsgIdx, NIL};
use crate::error::Error;
use crate::trace::fatal;

/// A ring slot: sequence number plus the carried message handle.
#[repr(align(64))] // Each slot on its own cache line to avoid false sharing between producers
struct Slot {
    /// Sequence number for synchronization.
    /// - Initial: slot index (0, 1, 2, ..., capacity-1)
    /// - After producer write: position + 1 (signals "message ready")
    /// - After consumer read: position + capacity (signals "slot free")
    seq: AtomicUsize,

    /// Handle of the message parked in this slot.
    msg: UnsafeCell<u32>,
}

// SAFETY: Slot is Sync because msg is protected by the sequence number
// protocol; seq itself is an atomic.
unsafe impl Sync for Slot {}
unsafe impl Send for Slot {}

/// Producer-side state: add cursor for slot reservation.
#[repr(align(64))]
struct ProducerState {
    /// Next position to reserve for writing.
    /// Multiple producers race to advance this via CAS.
    head: AtomicUsize,
}

/// Consumer-side state: remove cursor.
#[repr(align(64))]
struct ConsumerState {
    /// Next position to read from. Only the consumer modifies this.
    tail: AtomicUsize,
}

/// Bounded wait-free MPSC ring buffer of message handles.
pub(crate) struct RingBuffer {
    producer: ProducerState,
    consumer: ConsumerState,
    slots: Box<[Slot]>,
    mask: usize,
}

impl RingBuffer {
    /// Builds a ring with `capacity` slots.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityNotPowerOfTwo`] unless `capacity` is a power of two;
    /// [`Error::AllocFailed`] if slot storage cannot be reserved.
    pub(crate) fn with_capacity(capacity: usize) -> Result<Self, Error> {
        if !capacity.is_power_of_two() {
            return Err(Error::CapacityNotPowerOfTwo(capacity));
        }
        let mut slots: Vec<Slot> = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|_| Error::AllocFailed {
            bytes: capacity * size_of::<Slot>(),
        })?;
        for i in 0..capacity {
            slots.push(Slot {
                seq: AtomicUsize::new(i),
                msg: UnsafeCell::new(NIL),
            });
        }
        Ok(Self {
            producer: ProducerState {
                head: AtomicUsize::new(0),
            },
            consumer: ConsumerState {
                tail: AtomicUsize::new(0),
            },
            slots: slots.into_boxed_slice(),
            mask: capacity - 1,
        })
    }

    /// Attempts to park a message handle, wait-free.
    ///
    /// Safe for any number of concurrent producers.
    ///
    /// # Errors
    ///
    /// Returns `Err(msg)` if the ring is full, allowing the caller to spill.
    #[inline]
    pub(crate) fn push(&self, msg: MsgIdx) -> Result<(), MsgIdx> {
        loop {
            let pos = self.producer.head.load(Ordering::Relaxed);
            let slot = &self.slots[pos & self.mask];

            let seq = slot.seq.load(Ordering::Acquire);

            // Difference between sequence and position, wrap-correct.
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                // Slot is free at this position; try to reserve it.
                if self
                    .producer
                    .head
                    .compare_exchange_weak(
                        pos,
                        pos.wrapping_add(1),
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    // SAFETY: the CAS succeeded, so no other producer can
                    // claim this position, and seq == pos means the consumer
                    // has released the slot.
                    unsafe {
                        *slot.msg.get() = msg.0;
                    }
                    // Publish the write.
                    slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                    return Ok(());
                }
                // CAS failed: another producer won the position, retry.
            } else if diff < 0 {
                // seq < pos: the consumer has not released this slot yet.
                return Err(msg);
            }
            // diff > 0: another producer already claimed the position.
            // Retry with a fresh cursor value.
        }
    }

    /// Attempts to take the next message handle.
    ///
    /// Returns `None` if the expected write has not landed.
    ///
    /// # Safety
    ///
    /// Caller must be the single consumer.
    #[inline]
    pub(crate) unsafe fn pop(&self) -> Option<MsgIdx> {
        let tail = self.consumer.tail.load(Ordering::Relaxed);
        let slot = &self.slots[tail & self.mask];

        let seq = slot.seq.load(Ordering::Acquire);

        // Ready to read when seq == tail + 1.
        let expected = tail.wrapping_add(1);
        let diff = seq.wrapping_sub(expected) as isize;

        if diff < 0 {
            return None;
        }
        if diff > 0 {
            // A sequence ahead of the remove cursor cannot happen with a
            // single consumer; the state is corrupt.
            fatal!("ring slot sequence {seq} ahead of expected {expected}");
        }

        // SAFETY: the sequence check confirms the producer finished writing,
        // and the single-consumer contract gives us exclusive read access.
        let msg = unsafe { *slot.msg.get() };
        if msg == NIL {
            fatal!("ring slot published with no message at position {tail}");
        }
        // SAFETY: as above; clearing keeps the NIL check meaningful on
        // later laps.
        unsafe {
            *slot.msg.get() = NIL;
        }

        // Release the slot for position tail + capacity.
        slot.seq
            .store(tail.wrapping_add(self.mask).wrapping_add(1), Ordering::Release);

        self.consumer
            .tail
            .store(tail.wrapping_add(1), Ordering::Relaxed);

        Some(MsgIdx(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rejects_non_power_of_two_capacity() {
        assert_eq!(
            RingBuffer::with_capacity(3).err(),
            Some(Error::CapacityNotPowerOfTwo(3))
        );
        assert_eq!(
            RingBuffer::with_capacity(0).err(),
            Some(Error::CapacityNotPowerOfTwo(0))
        );
        assert!(RingBuffer::with_capacity(4).is_ok());
    }

    #[test]
    fn push_pop_preserves_order() {
        let ring = RingBuffer::with_capacity(8).unwrap();

        for i in 0..3 {
            ring.push(MsgIdx(i)).unwrap();
        }
        // SAFETY: this test thread is the only consumer.
        unsafe {
            assert_eq!(ring.pop(), Some(MsgIdx(0)));
            assert_eq!(ring.pop(), Some(MsgIdx(1)));
            assert_eq!(ring.pop(), Some(MsgIdx(2)));
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn full_ring_rejects_and_recovers() {
        let ring = RingBuffer::with_capacity(4).unwrap();

        for i in 0..4 {
            ring.push(MsgIdx(i)).unwrap();
        }
        assert_eq!(ring.push(MsgIdx(99)), Err(MsgIdx(99)));

        // SAFETY: single consumer.
        unsafe {
            assert_eq!(ring.pop(), Some(MsgIdx(0)));
        }
        ring.push(MsgIdx(4)).unwrap();
        assert_eq!(ring.push(MsgIdx(5)), Err(MsgIdx(5)));
    }

    #[test]
    fn wraps_across_many_laps() {
        let ring = RingBuffer::with_capacity(4).unwrap();

        for round in 0..5u32 {
            for i in 0..4 {
                ring.push(MsgIdx(round * 10 + i)).unwrap();
            }
            for i in 0..4 {
                // SAFETY: single consumer.
                assert_eq!(unsafe { ring.pop() }, Some(MsgIdx(round * 10 + i)));
            }
            assert_eq!(unsafe { ring.pop() }, None);
        }
    }

    #[test]
    fn concurrent_producers_lose_nothing() {
        let ring = Arc::new(RingBuffer::with_capacity(64).unwrap());
        let num_producers = 4u32;
        let per_producer = 10u32;

        let mut handles = vec![];
        for p in 0..num_producers {
            let ring = Arc::clone(&ring);
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    let mut msg = MsgIdx(p * 100 + i);
                    loop {
                        match ring.push(msg) {
                            Ok(()) => break,
                            Err(back) => msg = back,
                        }
                        // unreachable under capacity 64, but keep the retry
                        // shape honest
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let mut seen = vec![];
        // SAFETY: producers joined; this is the only consumer.
        while let Some(m) = unsafe { ring.pop() } {
            seen.push(m.0);
        }
        seen.sort_unstable();
        let mut expected: Vec<u32> = (0..num_producers)
            .flat_map(|p| (0..per_producer).map(move |i| p * 100 + i))
            .collect();
        expected.sort_unstable();
        assert_eq!(seen, expected);
    }
}
