//! Connection Handler Module
//!
//! This module manages individual client connections to FlashCache.
//! Connections do not own a thread or a task: the worker that accepted a
//! client owns its `Connection` and calls `process` whenever the poller
//! reports readiness for the socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Worker                               │
//! │                 (network::worker)                           │
//! └──────────────────────┬──────────────────────────────────────┘
//!                        │
//!                        │ readiness event
//!                        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Connection::process                       │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │ ReadCommand │───>│ ExtractArgs │───>│ SendAnswer  │     │
//! │  └─────────────┘    └─────────────┘    └─────────────┘     │
//! │         ▲                                     │             │
//! │         └─────────────────────────────────────┘             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Non-blocking I/O**: Suspends on would-block instead of waiting
//! - **Buffer Management**: Fixed read buffer compacted to offset 0
//! - **Pipelining**: Supports multiple commands in a single TCP packet
//! - **Statistics**: Tracks connection and command metrics

pub mod handler;

// Re-export commonly used types
pub use handler::{Connection, ConnectionError, ConnectionStats, State, BUFFER_CAPACITY};
