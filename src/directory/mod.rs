//! Client directory subsystem.
//!
//! # Data Flow
//! ```text
//! register → ClientDirectory::bind → IpConnectionTracker::track
//! route    → ClientDirectory::handles (snapshot) → ConnectionHandle::emit
//! close    → ClientDirectory::unbind → IpConnectionTracker::untrack
//! ```

pub mod client_directory;
pub mod handle;

pub use client_directory::{ClientDirectory, ConnectionStats, DirectoryError};
pub use handle::{ConnectionHandle, EmitError};
