//! Fleetsim State - Crash-safe persistence of the fleet snapshot
//!
//! This crate provides:
//! - SnapshotStore trait for persistence abstraction
//! - File-backed implementation with atomic replace and a `.bak` generation
//! - Corruption detection that refuses to hand back an empty fleet

pub mod error;
pub mod file_store;
pub mod store;

// Re-export commonly used types
pub use error::{Result, StateError};
pub use file_store::FileStateStore;
pub use store::SnapshotStore;
