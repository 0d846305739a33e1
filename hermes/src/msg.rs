//! Message envelopes.
//!
//! A [`Msg`] is a move-only guard: holding one *is* owning the envelope, the
//! way holding a popped value owns it in any queue. Envelopes are never
//! copied through the queues — only their handles move — so pushing a `Msg`
//! consumes the guard and popping mints a new one.
//!
//! Envelope shape: a fixed header (carrier cell handle, owning pool,
//! response queue, two `u64` payload words) plus an opaque trailing byte
//! region sized when the envelope is carved.

use std::mem::ManuallyDrop;
use std::sync::Arc;

use crate::arena::{Arena, MsgIdx};
use crate::error::Error;
use crate::fifo::Producer;
use crate::trace::fatal;

/// Exclusive owner of one message envelope.
///
/// Dropping a `Msg` returns it to its owning pool, if it has one; dropping
/// a free-standing envelope abandons it (its storage stays with the arena).
pub struct Msg {
    arena: ManuallyDrop<Arc<Arena>>,
    idx: MsgIdx,
}

impl Msg {
    pub(crate) fn new(arena: Arc<Arena>, idx: MsgIdx) -> Self {
        Self {
            arena: ManuallyDrop::new(arena),
            idx,
        }
    }

    /// Carves a free-standing envelope with a `data_size`-byte data region.
    ///
    /// Free-standing envelopes have no owning pool: they cannot be
    /// [`ret`](Msg::ret)urned, only pushed around and eventually dropped.
    ///
    /// # Errors
    ///
    /// Fails when the arena is out of envelopes, cells or data bytes.
    pub fn alloc(arena: &Arc<Arena>, data_size: usize) -> Result<Self, Error> {
        let idx = arena.alloc_msg_raw(data_size)?;
        Ok(Self::new(Arc::clone(arena), idx))
    }

    /// Dismantles the guard without running its destructor.
    pub(crate) fn into_parts(self) -> (Arc<Arena>, MsgIdx) {
        let mut this = ManuallyDrop::new(self);
        let idx = this.idx;
        // SAFETY: `self` is wrapped in ManuallyDrop, so Drop will not run
        // and the arena Arc is moved out exactly once.
        let arena = unsafe { ManuallyDrop::take(&mut this.arena) };
        (arena, idx)
    }

    #[must_use]
    pub fn arg1(&self) -> u64 {
        self.arena.arg1(self.idx)
    }

    pub fn set_arg1(&mut self, value: u64) {
        self.arena.set_arg1(self.idx, value);
    }

    #[must_use]
    pub fn arg2(&self) -> u64 {
        self.arena.arg2(self.idx)
    }

    pub fn set_arg2(&mut self, value: u64) {
        self.arena.set_arg2(self.idx, value);
    }

    /// The envelope's trailing data region.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        // SAFETY: the guard owns the message for its whole lifetime.
        unsafe { self.arena.data_ref(self.idx) }
    }

    /// Mutable access to the trailing data region.
    pub fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: as in data, with `&mut self` for exclusive access.
        unsafe { self.arena.data_mut(self.idx) }
    }

    /// Routes future [`respond_or_ret`](Msg::respond_or_ret) calls to
    /// `queue`.
    ///
    /// # Panics
    ///
    /// Fatal if `queue` belongs to a different arena than this message.
    pub fn set_rsp_queue(&mut self, queue: &Producer) {
        if !Arc::ptr_eq(&self.arena, &queue.core.arena) {
            fatal!("response queue belongs to a different arena");
        }
        // SAFETY: &mut self proves exclusive ownership.
        unsafe {
            self.arena
                .set_rsp(self.idx, Some(Arc::downgrade(&queue.core)));
        }
    }

    /// Clears the response-queue reference.
    pub fn clear_rsp_queue(&mut self) {
        // SAFETY: &mut self proves exclusive ownership.
        unsafe { self.arena.set_rsp(self.idx, None) }
    }

    #[must_use]
    pub fn has_rsp_queue(&self) -> bool {
        // SAFETY: the guard owns the message.
        unsafe { self.arena.has_rsp(self.idx) }
    }

    /// Returns the message to its owning pool.
    ///
    /// # Panics
    ///
    /// Fatal if the message has no owning pool: every message must have a
    /// defined home. (Plain `drop` is the lenient variant.)
    pub fn ret(self) {
        let (arena, idx) = self.into_parts();
        match arena.pool_of(idx) {
            Some(pool) => pool.ret_idx(idx),
            None => fatal!("message has no owning pool to return to"),
        }
    }

    /// Sends the message to its response queue carrying `result` in the
    /// first payload word, or recycles it to its pool if no response queue
    /// is set (or the queue no longer exists).
    ///
    /// The response-queue reference is cleared either way, so the receiver
    /// can apply the same call to hand the envelope home.
    ///
    /// # Panics
    ///
    /// Fatal if the message ends up with neither destination.
    pub fn respond_or_ret(self, result: u64) {
        let (arena, idx) = self.into_parts();
        // SAFETY: the guard owned `idx` until this call.
        let rsp = unsafe { arena.take_rsp(idx) };
        if let Some(queue) = rsp.and_then(|weak| weak.upgrade()) {
            arena.set_arg1(idx, result);
            queue.push_idx(idx);
            return;
        }
        match arena.pool_of(idx) {
            Some(pool) => pool.ret_idx(idx),
            None => fatal!("message has neither a response queue nor an owning pool"),
        }
    }
}

impl Drop for Msg {
    fn drop(&mut self) {
        // SAFETY: Drop runs at most once; the arena Arc is taken exactly
        // once.
        let arena = unsafe { ManuallyDrop::take(&mut self.arena) };
        if let Some(pool) = arena.pool_of(self.idx) {
            pool.ret_idx(self.idx);
        }
    }
}
