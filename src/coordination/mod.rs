//! Coordination subsystem.
//!
//! # Data Flow
//! ```text
//! Foreground operation (bind, unbind, fan-out, ip bookkeeping)
//!     → lock_manager.rs (try once, lease with deadline)
//!     → Some(lease): mutate, lease released on drop
//!     → None: caller treats the resource as momentarily unavailable
//!
//! Maintenance:
//!     → reap_expired() force-frees leases past their deadline
//! ```
//!
//! # Design Decisions
//! - Advisory only: the tables themselves are memory-safe without it
//! - Never blocks, never queues: contention is reported, not waited out
//! - Leases expire on a monotonic clock so a lost holder cannot wedge a key

pub mod lock_manager;

pub use lock_manager::{LockLease, LockManager, ResourceKey};
