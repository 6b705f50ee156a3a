//! # FlashCache - A memcached-compatible In-Memory Cache Server
//!
//! FlashCache speaks the memcached text protocol over TCP. A small, fixed
//! number of worker threads serve every client: each worker runs its own
//! epoll event loop and drives its connections through a non-blocking
//! read/parse/execute/write state machine.
//!
//! ## Features
//!
//! - **memcached-Compatible**: `get`, `set`, `add`, `delete`, `incr` and friends
//! - **Event-Driven**: One epoll loop per worker, no thread per client
//! - **Pipelining**: Commands on one connection are answered strictly in order
//! - **Bounded Memory**: LRU eviction keeps the cache within its byte budget
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             FlashCache                                  │
//! │                                                                         │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐                  │
//! │  │   Server    │───>│   Worker    │───>│ Connection  │                  │
//! │  │ (Listener)  │    │ (epoll loop)│    │(state mach.)│                  │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘                  │
//! │                                               │                         │
//! │                                               ▼                         │
//! │  ┌─────────────┐                       ┌─────────────┐                  │
//! │  │    Text     │                       │  Command    │                  │
//! │  │   Parser    │                       │  Handler    │                  │
//! │  └─────────────┘                       └──────┬──────┘                  │
//! │                                               │                         │
//! │                     ┌─────────────────────────▼────────────────────┐   │
//! │                     │                 LruStorage                   │   │
//! │                     │  ┌────────┐ ┌────────┐ ┌────────┐ ┌────────┐ │   │
//! │                     │  │Shard 0 │ │Shard 1 │ │Shard 2 │ │...N    │ │   │
//! │                     │  │ Mutex  │ │ Mutex  │ │ Mutex  │ │shards  │ │   │
//! │                     │  └────────┘ └────────┘ └────────┘ └────────┘ │   │
//! │                     └──────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use flashcache::network::{Server, ServerConfig};
//! use flashcache::storage::LruStorage;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(LruStorage::new(64 * 1024 * 1024));
//! let mut server = Server::new(storage);
//!
//! let addr = server.start(&ServerConfig::default()).unwrap();
//! println!("listening on {}", addr);
//!
//! // ... later
//! server.stop();
//! server.join().unwrap();
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: memcached text protocol parser and types
//! - [`storage`]: Thread-safe LRU storage with a byte budget
//! - [`commands`]: Command execution and replies
//! - [`connection`]: The per-client protocol state machine
//! - [`network`]: epoll poller, workers and the server
//!
//! ## Design Highlights
//!
//! ### Edge-Triggered Connections
//!
//! Clients are registered edge-triggered. A connection therefore keeps
//! reading, executing and writing until the socket would block, and only
//! then hands control back to its worker.
//!
//! ### Shutdown
//!
//! Workers wait on epoll without a timeout. Stopping clears a flag and
//! shuts the listening socket down, which wakes every worker at once.

#[cfg(not(target_os = "linux"))]
compile_error!("flashcache requires Linux (epoll)");

pub mod commands;
pub mod connection;
pub mod network;
pub mod protocol;
pub mod storage;

// Re-export commonly used types for convenience
pub use commands::{CommandError, CommandHandler};
pub use connection::{Connection, ConnectionStats};
pub use network::{Server, ServerConfig, ServerError, Worker, WorkerError};
pub use protocol::{Command, ParseError, Parser};
pub use storage::{LruStorage, Storage, StorageStats};

/// The default port FlashCache listens on (same as memcached)
pub const DEFAULT_PORT: u16 = 11211;

/// The default host FlashCache binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of FlashCache
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
