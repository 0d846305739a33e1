//! Fixed-capacity message pool.
//!
//! A pool preallocates `count` envelope/cell pairs and threads them onto an
//! internal [fifo](crate::fifo) acting as the free list, so getting and
//! returning envelopes in the hot path never allocates. Exhaustion is
//! backpressure, not an error: `get_msg` reports empty and the caller
//! decides whether to retry.
//!
//! Any thread may return envelopes (returns are pushes); only the pool
//! handle's thread may get them (gets are pops, and pops are
//! single-consumer).

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::arena::{Arena, MsgIdx};
use crate::error::Error;
use crate::fifo::FifoCore;
use crate::msg::Msg;
use crate::spin::{SpinWait, yield_now};
use crate::trace::{debug, fatal, trace};

/// Shared pool state, reachable from every envelope the pool owns.
pub(crate) struct PoolCore {
    arena: Arc<Arena>,
    free: FifoCore,
    gets: AtomicU64,
    rets: AtomicU64,
    capacity: u32,
}

impl PoolCore {
    /// Puts an envelope back on the free list. Callable from any thread.
    pub(crate) fn ret_idx(&self, idx: MsgIdx) {
        self.free.push_idx(idx);
        self.rets.fetch_add(1, Ordering::Relaxed);
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Fixed set of preallocated message envelopes.
///
/// # Thread Safety
///
/// `MsgPool` is [`Send`] but **not** [`Sync`] and not cloneable: the handle's
/// thread is the free list's single consumer. Envelopes themselves may be
/// returned from any thread, explicitly or by dropping their [`Msg`] guard.
pub struct MsgPool {
    core: Arc<PoolCore>,
    _unsync: PhantomUnsync,
}

impl MsgPool {
    /// Preallocates `count` envelopes, each with a `data_size`-byte data
    /// region, all initially free.
    ///
    /// # Errors
    ///
    /// Fails explicitly — never partially — when the arena cannot supply the
    /// envelopes or the free list's storage.
    pub fn new(arena: &Arc<Arena>, count: u32, data_size: usize) -> Result<Self, Error> {
        // Free-list fast path sized to hold every envelope, so the pool
        // spills only under transient return bursts.
        let capacity = (count.max(1) as usize).next_power_of_two();
        let core = Arc::new(PoolCore {
            arena: Arc::clone(arena),
            free: FifoCore::new(arena, capacity, yield_now)?,
            gets: AtomicU64::new(0),
            rets: AtomicU64::new(0),
            capacity: count,
        });

        for _ in 0..count {
            let idx = arena.alloc_msg_raw(data_size)?;
            // SAFETY: the envelope was just carved and has not circulated.
            unsafe { arena.set_pool(idx, Arc::downgrade(&core)) };
            core.free.push_idx(idx);
        }

        debug!(count, data_size, "message pool ready");
        Ok(Self {
            core,
            _unsync: PhantomData,
        })
    }

    /// Takes a free envelope, with response reference and payload words
    /// cleared.
    ///
    /// Returns `None` when the pool is exhausted; treat it as backpressure.
    #[must_use]
    pub fn get_msg(&self) -> Option<Msg> {
        // SAFETY: MsgPool is neither Sync nor Clone, so this thread is the
        // free list's single consumer.
        let idx = unsafe { self.core.free.pop_idx() }?;
        // SAFETY: just popped, so exclusively owned here.
        unsafe { self.core.arena.reset_msg(idx) };
        self.core.gets.fetch_add(1, Ordering::Relaxed);
        Some(Msg::new(Arc::clone(&self.core.arena), idx))
    }

    /// Returns an envelope to this pool.
    ///
    /// Equivalent to dropping the guard, plus the check that the envelope
    /// actually belongs here.
    ///
    /// # Panics
    ///
    /// Fatal if `msg` is owned by a different pool (or none).
    pub fn ret_msg(&self, msg: Msg) {
        let (arena, idx) = msg.into_parts();
        match arena.pool_of(idx) {
            Some(owner) if Arc::ptr_eq(&owner, &self.core) => self.core.ret_idx(idx),
            _ => fatal!("envelope returned to a pool that does not own it"),
        }
    }

    /// Envelopes handed out so far.
    #[must_use]
    pub fn get_count(&self) -> u64 {
        self.core.gets.load(Ordering::Relaxed)
    }

    /// Envelopes returned so far.
    #[must_use]
    pub fn ret_count(&self) -> u64 {
        self.core.rets.load(Ordering::Relaxed)
    }

    /// Waits for all envelopes to come home, then tears the pool down and
    /// returns the number of messages ever processed through the free list.
    ///
    /// Busy-waits (yielding) for stragglers: safe only if every outstanding
    /// envelope is guaranteed to return eventually. An envelope that never
    /// returns parks this call forever.
    #[must_use]
    pub fn close(self) -> u64 {
        let mut drained = 0u32;
        let mut spin = SpinWait::new(yield_now);
        let mut waiting = false;
        while drained < self.core.capacity {
            // SAFETY: single consumer, as in get_msg.
            if unsafe { self.core.free.pop_idx() }.is_some() {
                drained += 1;
                continue;
            }
            if !waiting {
                waiting = true;
                trace!(
                    tick = self.core.arena.tick(),
                    drained,
                    "waiting for outstanding envelopes"
                );
            }
            spin.pause();
        }
        // The last returner's pending decrement can trail the insert we
        // already drained; let it land before tearing the free list down.
        while self.core.free.pending_admissions() != 0 {
            spin.pause();
        }
        // SAFETY: every envelope is drained and teardown is single-threaded.
        unsafe { self.core.free.close() }
    }
}
