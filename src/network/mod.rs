//! Network Module
//!
//! The event-driven networking layer of FlashCache.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Server                            │
//! │   binds the listener, owns the workers                   │
//! └───────┬──────────────────┬───────────────────┬───────────┘
//!         │ Arc<TcpListener> │                   │
//!         ▼                  ▼                   ▼
//!   ┌───────────┐      ┌───────────┐       ┌───────────┐
//!   │ Worker 0  │      │ Worker 1  │  ...  │ Worker N  │
//!   │  epoll    │      │  epoll    │       │  epoll    │
//!   │  thread   │      │  thread   │       │  thread   │
//!   └─────┬─────┘      └───────────┘       └───────────┘
//!         │ owns
//!         ▼
//!   Connection, Connection, ...
//! ```
//!
//! ## Modules
//!
//! - `poller`: Safe wrapper over epoll
//! - `worker`: One event loop thread
//! - `server`: Listener setup and the worker pool

pub mod poller;
pub mod server;
pub mod worker;

pub use poller::{Events, Interest, Poller, Readiness, Token};
pub use server::{Server, ServerConfig, ServerError};
pub use worker::{Worker, WorkerError};
