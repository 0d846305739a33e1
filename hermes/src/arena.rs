//! Fixed-capacity storage shared by the queues and pools of one domain.
//!
//! Every linkage cell and message envelope lives in an [`Arena`] and is
//! addressed by a `u32` handle. Handles are what travel through the queues:
//! a producer publishes a cell handle with one atomic store, and "rebinding"
//! a message to a different cell is a plain handle reassignment. Storage is
//! carved once, up front, by lock-free cursors; nothing in the hot path
//! allocates.
//!
//! # Safety
//!
//! Message envelope fields are owner-exclusive: exactly one structure or
//! guard holds a given message at any time, and ownership transfers through
//! a queue's release/acquire publication. The `UnsafeCell` accessors below
//! state that contract per method.

use std::cell::UnsafeCell;
use std::mem::size_of;
use std::sync::Weak;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::error::Error;
use crate::fifo::FifoCore;
use crate::pool::PoolCore;

/// Reserved handle value meaning "no cell" / "no message".
pub(crate) const NIL: u32 = u32::MAX;

/// Handle of a [`LinkCell`] in an arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct CellIdx(pub(crate) u32);

/// Handle of a message envelope in an arena.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct MsgIdx(pub(crate) u32);

/// Intrusive linked-list node.
///
/// Lives on its own cache line so producers publishing different cells do
/// not contend.
#[repr(align(64))]
pub(crate) struct LinkCell {
    /// Successor handle, `NIL` while unlinked or at the list head.
    pub(crate) next: AtomicU32,
    /// Handle of the message this cell currently carries, `NIL` for a stub.
    pub(crate) msg: AtomicU32,
}

impl LinkCell {
    const fn new() -> Self {
        Self {
            next: AtomicU32::new(NIL),
            msg: AtomicU32::new(NIL),
        }
    }
}

/// Envelope storage: fixed header plus the handle of a trailing data region.
///
/// `cell`, `arg1` and `arg2` are atomics only so the slot can be reached
/// through `&Arena`; all accesses are `Relaxed` because each field is read
/// and written by the message's current owner alone, with ordering provided
/// by whichever queue transferred the ownership.
pub(crate) struct MsgSlot {
    cell: AtomicU32,
    arg1: AtomicU64,
    arg2: AtomicU64,
    pool: UnsafeCell<Option<Weak<PoolCore>>>,
    rsp: UnsafeCell<Option<Weak<FifoCore>>>,
    data_off: UnsafeCell<usize>,
    data_len: UnsafeCell<usize>,
}

impl MsgSlot {
    const fn new() -> Self {
        Self {
            cell: AtomicU32::new(NIL),
            arg1: AtomicU64::new(0),
            arg2: AtomicU64::new(0),
            pool: UnsafeCell::new(None),
            rsp: UnsafeCell::new(None),
            data_off: UnsafeCell::new(0),
            data_len: UnsafeCell::new(0),
        }
    }
}

/// Capacity plan for an [`Arena`].
///
/// One cell is carved per message and two per fifo (the stub cells of the
/// overflow generations), so `cells = msgs + 2 * fifos`. Pools count toward
/// `fifos` too: each pool's free list is a fifo.
#[derive(Debug, Copy, Clone)]
pub struct ArenaConfig {
    /// Message envelopes the arena can hand out, pooled or free-standing.
    pub msgs: u32,
    /// Fifos (queues plus pools) that will be built over this arena.
    pub fifos: u32,
    /// Total bytes available for trailing message data regions.
    pub data_bytes: usize,
}

/// Shared storage domain for queues, pools and the messages between them.
///
/// Create one `Arena`, wrap it in an [`Arc`](std::sync::Arc), and build
/// every fifo and pool that exchanges messages from that same arena. The
/// arena also owns the diagnostic tick counter stamped into trace events.
pub struct Arena {
    cells: Box<[LinkCell]>,
    msgs: Box<[MsgSlot]>,
    data: Box<[UnsafeCell<u8>]>,
    cells_used: AtomicU32,
    msgs_used: AtomicU32,
    data_used: AtomicUsize,
    tick: AtomicU64,
}

// SAFETY: Arena is Send and Sync because:
// - cells hold only atomics
// - every UnsafeCell field of a MsgSlot (and the data region it addresses)
//   is accessed only by the message's current exclusive owner, and ownership
//   moves between threads through the queues' release/acquire publication
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

fn alloc_slice<T>(n: usize, fill: impl Fn() -> T) -> Result<Box<[T]>, Error> {
    let mut v: Vec<T> = Vec::new();
    v.try_reserve_exact(n).map_err(|_| Error::AllocFailed {
        bytes: n * size_of::<T>(),
    })?;
    v.resize_with(n, fill);
    Ok(v.into_boxed_slice())
}

impl Arena {
    /// Reserves all storage for `config` up front.
    ///
    /// # Errors
    ///
    /// [`Error::AllocFailed`] if any region cannot be reserved. Failure is
    /// total: no partially usable arena is ever returned.
    pub fn with_capacity(config: ArenaConfig) -> Result<Self, Error> {
        let cell_count = config.msgs as usize + 2 * config.fifos as usize;
        Ok(Self {
            cells: alloc_slice(cell_count, LinkCell::new)?,
            msgs: alloc_slice(config.msgs as usize, MsgSlot::new)?,
            data: alloc_slice(config.data_bytes, || UnsafeCell::new(0))?,
            cells_used: AtomicU32::new(0),
            msgs_used: AtomicU32::new(0),
            data_used: AtomicUsize::new(0),
            tick: AtomicU64::new(0),
        })
    }

    /// Next diagnostic tick. Stamped into trace events only.
    pub(crate) fn tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Carves one fresh cell, for list stubs.
    pub(crate) fn alloc_cell(&self) -> Result<CellIdx, Error> {
        let limit = self.cells.len() as u32;
        self.cells_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                (used < limit).then_some(used + 1)
            })
            .map(CellIdx)
            .map_err(|used| Error::ArenaExhausted {
                region: "cells",
                requested: 1,
                available: (limit - used) as usize,
            })
    }

    /// Carves one envelope with a paired cell and a `data_size`-byte region.
    pub(crate) fn alloc_msg_raw(&self, data_size: usize) -> Result<MsgIdx, Error> {
        let msg_limit = self.msgs.len() as u32;
        let idx = self
            .msgs_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                (used < msg_limit).then_some(used + 1)
            })
            .map(MsgIdx)
            .map_err(|used| Error::ArenaExhausted {
                region: "msgs",
                requested: 1,
                available: (msg_limit - used) as usize,
            })?;
        let cell = self.alloc_cell()?;
        let data_limit = self.data.len();
        let off = self
            .data_used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                (data_limit - used >= data_size).then_some(used + data_size)
            })
            .map_err(|used| Error::ArenaExhausted {
                region: "data",
                requested: data_size,
                available: data_limit - used,
            })?;

        let slot = &self.msgs[idx.0 as usize];
        slot.cell.store(cell.0, Ordering::Relaxed);
        // SAFETY: the cursor hands each slot to exactly one carver and the
        // slot has never been published, so this thread has exclusive access.
        unsafe {
            *slot.data_off.get() = off;
            *slot.data_len.get() = data_size;
        }
        Ok(idx)
    }

    pub(crate) fn cell(&self, idx: CellIdx) -> &LinkCell {
        &self.cells[idx.0 as usize]
    }

    /// Handle of the cell currently carrying `msg`.
    pub(crate) fn msg_cell(&self, msg: MsgIdx) -> CellIdx {
        CellIdx(self.msgs[msg.0 as usize].cell.load(Ordering::Relaxed))
    }

    /// Rebinds `msg` to a different carrier cell.
    pub(crate) fn set_msg_cell(&self, msg: MsgIdx, cell: CellIdx) {
        self.msgs[msg.0 as usize].cell.store(cell.0, Ordering::Relaxed);
    }

    pub(crate) fn arg1(&self, msg: MsgIdx) -> u64 {
        self.msgs[msg.0 as usize].arg1.load(Ordering::Relaxed)
    }

    pub(crate) fn set_arg1(&self, msg: MsgIdx, value: u64) {
        self.msgs[msg.0 as usize].arg1.store(value, Ordering::Relaxed);
    }

    pub(crate) fn arg2(&self, msg: MsgIdx) -> u64 {
        self.msgs[msg.0 as usize].arg2.load(Ordering::Relaxed)
    }

    pub(crate) fn set_arg2(&self, msg: MsgIdx, value: u64) {
        self.msgs[msg.0 as usize].arg2.store(value, Ordering::Relaxed);
    }

    /// Binds `msg` to its owning pool.
    ///
    /// # Safety
    ///
    /// Caller must be the carver of `msg`, before the message first enters
    /// circulation. The field is immutable afterwards.
    pub(crate) unsafe fn set_pool(&self, msg: MsgIdx, pool: Weak<PoolCore>) {
        unsafe { *self.msgs[msg.0 as usize].pool.get() = Some(pool) }
    }

    /// The owning pool of `msg`, if it has one that is still alive.
    pub(crate) fn pool_of(&self, msg: MsgIdx) -> Option<std::sync::Arc<PoolCore>> {
        // SAFETY: the pool binding is written once at carve time and never
        // again, so a shared read cannot race a write.
        unsafe { (*self.msgs[msg.0 as usize].pool.get()).as_ref() }.and_then(Weak::upgrade)
    }

    /// Stores or clears the response-queue reference of `msg`.
    ///
    /// # Safety
    ///
    /// Caller must exclusively own `msg`.
    pub(crate) unsafe fn set_rsp(&self, msg: MsgIdx, rsp: Option<Weak<FifoCore>>) {
        unsafe { *self.msgs[msg.0 as usize].rsp.get() = rsp }
    }

    /// Takes the response-queue reference of `msg`, leaving it cleared.
    ///
    /// # Safety
    ///
    /// Caller must exclusively own `msg`.
    pub(crate) unsafe fn take_rsp(&self, msg: MsgIdx) -> Option<Weak<FifoCore>> {
        unsafe { (*self.msgs[msg.0 as usize].rsp.get()).take() }
    }

    /// Whether `msg` currently carries a response-queue reference.
    ///
    /// # Safety
    ///
    /// Caller must exclusively own `msg`.
    pub(crate) unsafe fn has_rsp(&self, msg: MsgIdx) -> bool {
        unsafe { (*self.msgs[msg.0 as usize].rsp.get()).is_some() }
    }

    /// Clears the per-lease fields before an envelope is handed out again.
    ///
    /// # Safety
    ///
    /// Caller must exclusively own `msg`.
    pub(crate) unsafe fn reset_msg(&self, msg: MsgIdx) {
        let slot = &self.msgs[msg.0 as usize];
        slot.arg1.store(0, Ordering::Relaxed);
        slot.arg2.store(0, Ordering::Relaxed);
        unsafe { *slot.rsp.get() = None }
    }

    /// Trailing data region of `msg`.
    ///
    /// # Safety
    ///
    /// Caller must exclusively own `msg` and drop the slice before the
    /// message changes hands.
    pub(crate) unsafe fn data_ref(&self, msg: MsgIdx) -> &[u8] {
        let slot = &self.msgs[msg.0 as usize];
        // SAFETY: data_off/data_len are immutable after carve (see set_pool).
        let (off, len) = unsafe { (*slot.data_off.get(), *slot.data_len.get()) };
        if len == 0 {
            return &[];
        }
        // SAFETY: regions of distinct messages are disjoint and the caller
        // owns this message, so no other thread touches these bytes.
        unsafe { std::slice::from_raw_parts(self.data[off].get(), len) }
    }

    /// Mutable trailing data region of `msg`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Arena::data_ref`].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn data_mut(&self, msg: MsgIdx) -> &mut [u8] {
        let slot = &self.msgs[msg.0 as usize];
        // SAFETY: as in data_ref.
        let (off, len) = unsafe { (*slot.data_off.get(), *slot.data_len.get()) };
        if len == 0 {
            return &mut [];
        }
        // SAFETY: as in data_ref, and exclusive ownership makes the region
        // writable.
        unsafe { std::slice::from_raw_parts_mut(self.data[off].get(), len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arena {
        Arena::with_capacity(ArenaConfig {
            msgs: 4,
            fifos: 1,
            data_bytes: 32,
        })
        .unwrap()
    }

    #[test]
    fn carve_cursors_respect_capacity() {
        let a = arena();

        for _ in 0..4 {
            a.alloc_msg_raw(8).unwrap();
        }
        assert!(matches!(
            a.alloc_msg_raw(0),
            Err(Error::ArenaExhausted { region: "msgs", .. })
        ));

        // Two stub cells remain after four msg/cell pairs.
        a.alloc_cell().unwrap();
        a.alloc_cell().unwrap();
        assert!(matches!(
            a.alloc_cell(),
            Err(Error::ArenaExhausted { region: "cells", .. })
        ));
    }

    #[test]
    fn data_region_is_exhaustible_and_disjoint() {
        let a = arena();
        let m1 = a.alloc_msg_raw(16).unwrap();
        let m2 = a.alloc_msg_raw(16).unwrap();
        assert!(matches!(
            a.alloc_msg_raw(1),
            Err(Error::ArenaExhausted { region: "data", .. })
        ));

        // SAFETY: both messages were just carved and are owned here.
        unsafe {
            a.data_mut(m1).fill(0xAA);
            a.data_mut(m2).fill(0x55);
            assert!(a.data_ref(m1).iter().all(|&b| b == 0xAA));
            assert!(a.data_ref(m2).iter().all(|&b| b == 0x55));
        }
    }

    #[test]
    fn payload_words_round_trip() {
        let a = arena();
        let m = a.alloc_msg_raw(0).unwrap();
        a.set_arg1(m, 7);
        a.set_arg2(m, u64::MAX);
        assert_eq!(a.arg1(m), 7);
        assert_eq!(a.arg2(m), u64::MAX);
    }
}
