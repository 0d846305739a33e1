//! Unbounded MPSC intrusive list: the fifo's overflow path.
//!
//! Vyukov's non-intrusive MPSC queue expressed over arena cells. Messages
//! are added at the head and removed at the tail, and a permanent stub cell
//! means the list is never nodeless, so one atomic swap both publishes a new
//! cell and retires the previous head.
//!
//! A consequence of the stub scheme: the cell returned with a popped message
//! is not the cell it was pushed with — the retired tail takes over as the
//! message's carrier. Cells are conserved, identities rotate.
//!
//! The producer side is wait-free. A producer preempted between swapping the
//! head and storing the forward link leaves the list momentarily
//! unlinked; a consumer arriving in that window observes [`ListPop::Blocked`]
//! and decides whether to spin or bail (the fifo offers both).

use std::sync::atomic::{AtomicU32, Ordering};

use crate::arena::{Arena, CellIdx, MsgIdx, NIL};
use crate::trace::fatal;

/// Outcome of a non-stalling pop attempt.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ListPop {
    /// A message was removed.
    Popped(MsgIdx),
    /// The list holds nothing.
    Empty,
    /// A producer has published a cell but not yet linked it; retrying
    /// after it is scheduled again will succeed.
    Blocked,
}

/// MPSC linked list over arena cells with a floating stub.
pub(crate) struct LinkList {
    /// Most recently added cell; producers swap themselves in here.
    head: AtomicU32,
    /// Oldest cell, always a stub whose successor is the next message's
    /// carrier. Consumer-only.
    tail: AtomicU32,
}

impl LinkList {
    /// Builds an empty list around a dedicated stub cell.
    pub(crate) fn new(arena: &Arena, stub: CellIdx) -> Self {
        let cell = arena.cell(stub);
        cell.next.store(NIL, Ordering::Relaxed);
        cell.msg.store(NIL, Ordering::Relaxed);
        Self {
            head: AtomicU32::new(stub.0),
            tail: AtomicU32::new(stub.0),
        }
    }

    /// Adds a message, wait-free, using the message's own carrier cell.
    pub(crate) fn push(&self, arena: &Arena, msg: MsgIdx) {
        let cell_idx = arena.msg_cell(msg);
        let cell = arena.cell(cell_idx);
        cell.next.store(NIL, Ordering::Relaxed);
        cell.msg.store(msg.0, Ordering::Relaxed);

        let prev = self.head.swap(cell_idx.0, Ordering::AcqRel);
        // A pop reaching `prev` before this store observes Blocked and spins.
        arena.cell(CellIdx(prev)).next.store(cell_idx.0, Ordering::Release);
    }

    /// Removes the oldest message without ever waiting.
    ///
    /// Single-consumer. The retired tail cell becomes the returned message's
    /// new carrier.
    pub(crate) fn pop(&self, arena: &Arena) -> ListPop {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = arena.cell(CellIdx(tail)).next.load(Ordering::Acquire);

        if next == NIL {
            if tail == self.head.load(Ordering::Acquire) {
                return ListPop::Empty;
            }
            // Head moved past the tail but the link is not published yet.
            return ListPop::Blocked;
        }

        // The Acquire on the link load makes the producer's msg store
        // visible.
        let msg = arena.cell(CellIdx(next)).msg.load(Ordering::Relaxed);
        if msg == NIL {
            fatal!("linked cell {next} carries no message");
        }
        arena.set_msg_cell(MsgIdx(msg), CellIdx(tail));
        self.tail.store(next, Ordering::Relaxed);
        ListPop::Popped(MsgIdx(msg))
    }

    /// True when the tail has caught up with the head.
    ///
    /// Meaningful only to the consumer while producers are quiescent.
    pub(crate) fn is_drained(&self) -> bool {
        self.tail.load(Ordering::Relaxed) == self.head.load(Ordering::Acquire)
    }
}
