//! Fleetsim Tunnel - Outbound multiplexed tunnel sessions to the controller
//!
//! This crate provides:
//! - The binary frame codec spoken over the websocket transport
//! - Dial policies bounding which local endpoints a session may reach
//! - A per-(cluster, kind) reconnect throttle with exponential backoff
//! - Session supervision with keepalive, cancellation and credential rotation
//! - `TunnelManager`, the registry that owns every live session

// Allow unused assignments for diagnostic fields - they're used by the thiserror/miette macros
#![allow(unused_assignments)]

pub mod dial;
pub mod error;
pub mod frame;
pub mod manager;
pub mod session;
pub mod throttle;

// Re-export primary types
pub use dial::DialPolicy;
pub use error::{Result, TunnelError};
pub use frame::{Frame, FrameKind};
pub use manager::{TunnelConfig, TunnelManager};
pub use session::{SessionHandle, SessionPhase, SessionState};
pub use throttle::{Backoff, ReconnectThrottle};
