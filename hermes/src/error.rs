//! Setup-time failure values.
//!
//! Only resource and configuration failures are represented here; violated
//! runtime invariants never produce an [`Error`], they terminate the process
//! (see the crate-level discussion of fail-fast handling).

use thiserror::Error;

/// Errors reported by constructors and arena carving.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Ring buffer capacities must be a power of two so a slot index is a
    /// single mask operation and slot sequences advance by exactly one lap.
    #[error("ring capacity {0} is not a power of two")]
    CapacityNotPowerOfTwo(usize),

    /// A fixed arena region has no room left for the requested carve.
    #[error("arena out of {region}: requested {requested}, available {available}")]
    ArenaExhausted {
        /// Which region ran out: `"cells"`, `"msgs"` or `"data"`.
        region: &'static str,
        requested: usize,
        available: usize,
    },

    /// The underlying storage reservation failed.
    #[error("allocation of {bytes} bytes failed")]
    AllocFailed { bytes: usize },
}
