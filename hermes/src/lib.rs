//! Wait-free MPSC message-passing primitives for cross-thread communication
//! without locks, plus a fixed-capacity pool for allocation-free message
//! reuse.
//!
//! # Overview
//!
//! - [`Arena`] - fixed storage domain; every envelope and linkage cell lives
//!   here and travels through the queues as a `u32` handle
//! - [`fifo`] - hybrid MPSC queue: a bounded wait-free ring buffer that
//!   degrades to an unbounded linked-list generation when full, and recovers
//!   once drained — pushes never block and never drop
//! - [`MsgPool`] - preallocated envelopes recycled through the same queue
//!   machinery
//! - [`Msg`] - move-only envelope guard: two `u64` payload words, an opaque
//!   data region, and a respond-or-return protocol for request/response
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use hermes::{Arena, ArenaConfig, MsgPool, fifo};
//!
//! let arena = Arc::new(Arena::with_capacity(ArenaConfig {
//!     msgs: 8,
//!     fifos: 2, // the queue below plus the pool's free list
//!     data_bytes: 0,
//! })?);
//! let pool = MsgPool::new(&arena, 8, 0)?;
//! let (tx, rx) = fifo::channel(&arena, 4)?;
//!
//! let mut msg = pool.get_msg().expect("pool has envelopes");
//! msg.set_arg1(7);
//! tx.push(msg);
//!
//! let got = rx.pop().expect("just pushed");
//! assert_eq!(got.arg1(), 7);
//! got.ret(); // back to the pool
//! # Ok::<(), hermes::Error>(())
//! ```
//!
//! # Concurrency contract
//!
//! Any number of producer threads push concurrently, lock-free; exactly one
//! thread pops (the [`fifo::Consumer`] and [`MsgPool`] handles are `!Sync`
//! and not cloneable, which pins that contract into the type system).
//! Dequeue order follows each structure's single linearization point — slot
//! claim in the ring, head swap in the list — so it is FIFO per structure
//! and loss-free and duplicate-free overall, but not a global order across
//! racing producers.
//!
//! The only waits anywhere are cooperative spin-yields across another
//! thread's preemption window; there are no mutexes, condition variables,
//! timeouts or cancellation. Callers poll: an empty pop is a normal outcome.
//!
//! # Failure model
//!
//! Setup and resource problems come back as [`Error`] values. Violated
//! queue invariants are memory-safety-class bugs: the process fails fast
//! (panic) rather than continue on possibly corrupted state.

mod arena;
mod error;
mod list;
mod msg;
mod pool;
mod ring;
mod spin;

pub mod fifo;
pub mod trace;

pub use arena::{Arena, ArenaConfig};
pub use error::Error;
pub use msg::Msg;
pub use pool::MsgPool;
pub use spin::{YieldFn, yield_now};
