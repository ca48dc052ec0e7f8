//! Fleetsim API Server - HTTP control surface of the fleet
//!
//! This crate provides:
//! - Axum-based HTTP server
//! - Cluster endpoints (list, get, create, delete)
//! - A liveness endpoint, also the health target of steve-proxy tunnels

pub mod error;
pub mod handlers;
pub mod response;
pub mod server;
pub mod state;

// Re-export commonly used types
pub use error::{ApiError, Result};
pub use server::{ApiServer, Config};
pub use state::AppState;
