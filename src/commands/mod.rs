//! Command Handler Module
//!
//! This module implements the command execution layer for FlashCache.
//! It receives parsed commands together with their data block, executes
//! them against the storage engine, and returns the textual reply.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │  Text Parser    │  (protocol module)
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │ CommandHandler  │  (this module)
//! │                 │
//! │  - Dispatch     │
//! │  - Execute      │
//! │  - Reply        │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │  dyn Storage    │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - `get`, `gets`
//! - `set`, `add`, `replace`, `append`, `prepend`
//! - `delete`, `incr`, `decr`
//! - `stats`, `version`, `quit`

pub mod handler;

// Re-export the main command handler
pub use handler::{CommandError, CommandHandler};
