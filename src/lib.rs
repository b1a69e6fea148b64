//! # Clawbridge
//!
//! An HTTP/SSE bridge for the OpenClaw agent gateway, built with Rust.
//!
//! ## Features
//!
//! - **Single multiplexed session:** one WebSocket connection to the gateway
//!   shared by every HTTP client
//! - **Challenge/connect handshake:** operator-role auth with a negotiated
//!   session key
//! - **Streaming re-exposure:** `POST /message` replays a run's incremental
//!   output as Server-Sent Events
//! - **Bounded reconnect:** exponential backoff with a finite retry budget

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::Config;
pub use error::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const NAME: &str = env!("CARGO_PKG_NAME");
