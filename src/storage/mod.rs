//! Storage Engine Module
//!
//! This module provides the storage capability used by command execution.
//! It includes the [`Storage`] trait the rest of the server programs
//! against and [`LruStorage`], a sharded, memory-bounded LRU cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       LruStorage                            │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │...16    │           │
//! │  │ Mutex   │ │ Mutex   │ │ Mutex   │ │ shards  │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//!                            ▲
//!                            │  get / put / put_if_absent / set / delete
//!              ┌─────────────┴─────────────┐
//!              │   Workers (one thread     │
//!              │   per event loop)         │
//!              └───────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Sharded Storage**: independent shards reduce lock contention
//! - **Byte Budget**: entries cost `key + value` bytes against a fixed budget
//! - **LRU Eviction**: the least recently used entries make room for new ones
//!
//! ## Example
//!
//! ```
//! use flashcache::storage::{LruStorage, Storage};
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! let storage: Arc<dyn Storage> = Arc::new(LruStorage::new(1024 * 1024));
//!
//! storage.put(Bytes::from("name"), Bytes::from("Ariz"));
//! assert_eq!(storage.get(&Bytes::from("name")), Some(Bytes::from("Ariz")));
//! ```

pub mod engine;

// Re-export commonly used types
pub use engine::{LruStorage, Storage, StorageStats, DEFAULT_CAPACITY};
