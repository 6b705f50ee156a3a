//! Command Handler Module
//!
//! This module executes parsed memcached commands against the storage
//! engine and renders the textual reply.
//!
//! ## Supported Commands
//!
//! ### Retrieval
//! - `get <key>*` - Get one or more values
//! - `gets <key>*` - Same as get, with a (constant) CAS column
//!
//! ### Storage
//! - `set <key> [<flags> <exptime>] <bytes>` - Store unconditionally
//! - `add ...` - Store if the key does not exist
//! - `replace ...` - Store if the key exists
//! - `append ...` / `prepend ...` - Extend an existing value
//!
//! ### Others
//! - `delete <key>` - Remove a key
//! - `incr <key> <delta>` / `decr <key> <delta>` - Arithmetic on decimal values
//! - `stats` - Server and storage counters
//! - `version` - Server version
//!
//! ## Replies
//!
//! Replies are returned without the final CRLF; the connection appends the
//! terminator when it queues the answer. Commands sent with `noreply`
//! produce no reply at all.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     CommandHandler                          │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │
//! │  │  Command +  │───>│  dispatch() │───>│   reply     │     │
//! │  │  data block │    └──────┬──────┘    └─────────────┘     │
//! │  └─────────────┘           │                                │
//! │                            ▼                                │
//! │                      dyn Storage                            │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::connection::ConnectionStats;
use crate::protocol::types::reply;
use crate::protocol::{Command, StoreMode, CRLF};
use crate::storage::Storage;
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors raised while executing a command.
///
/// The connection turns every one of these into a `SERVER_ERROR` reply and
/// keeps serving the client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The data block was not followed by CRLF
    #[error("bad data chunk")]
    BadDataChunk,

    /// The entry does not fit into the storage at all
    #[error("object too large for cache")]
    ObjectTooLarge,

    /// incr/decr on a value that is not a decimal number
    #[error("cannot increment or decrement non-numeric value")]
    NonNumericValue,
}

/// Executes commands against the shared storage.
#[derive(Clone)]
pub struct CommandHandler {
    /// The storage engine
    storage: Arc<dyn Storage>,
    /// Connection statistics, reported by `stats`
    stats: Arc<ConnectionStats>,
    /// Server start time for `stats`
    start_time: Instant,
}

impl CommandHandler {
    /// Creates a new command handler.
    pub fn new(storage: Arc<dyn Storage>, stats: Arc<ConnectionStats>) -> Self {
        Self {
            storage,
            stats,
            start_time: Instant::now(),
        }
    }

    /// Executes a command and returns the reply.
    ///
    /// # Arguments
    ///
    /// * `command` - The parsed command line
    /// * `body` - The data block without its terminator (empty for commands
    ///   that carry none)
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the client asked for `noreply`, otherwise the reply
    /// without its trailing CRLF.
    pub fn execute(&self, command: Command, body: &[u8]) -> Result<Option<Vec<u8>>, CommandError> {
        let noreply = command.is_noreply();
        let response = self.dispatch(command, body)?;

        if noreply {
            Ok(None)
        } else {
            Ok(response)
        }
    }

    /// Dispatches a command to its handler.
    fn dispatch(&self, command: Command, body: &[u8]) -> Result<Option<Vec<u8>>, CommandError> {
        let response = match command {
            Command::Get { keys } => self.cmd_get(&keys, false),
            Command::Gets { keys } => self.cmd_get(&keys, true),
            Command::Store { mode, key, .. } => self.cmd_store(mode, key, body)?,
            Command::Delete { key, .. } => self.cmd_delete(&key),
            Command::Incr { key, delta, .. } => self.cmd_arithmetic(&key, |v| v.wrapping_add(delta))?,
            Command::Decr { key, delta, .. } => {
                self.cmd_arithmetic(&key, |v| v.saturating_sub(delta))?
            }
            Command::Stats => self.cmd_stats(),
            Command::Version => format!("VERSION {}", crate::VERSION).into_bytes(),
            Command::Quit => return Ok(None),
        };
        Ok(Some(response))
    }

    fn cmd_get(&self, keys: &[Bytes], with_cas: bool) -> Vec<u8> {
        let mut response = Vec::new();

        for key in keys {
            if let Some(value) = self.storage.get(key) {
                response.extend_from_slice(b"VALUE ");
                response.extend_from_slice(key);
                // Flags are not kept by the storage and always read back as 0
                response.extend_from_slice(format!(" 0 {}", value.len()).as_bytes());
                if with_cas {
                    response.extend_from_slice(b" 0");
                }
                response.extend_from_slice(CRLF);
                response.extend_from_slice(&value);
                response.extend_from_slice(CRLF);
            }
        }

        response.extend_from_slice(reply::END);
        response
    }

    fn cmd_store(&self, mode: StoreMode, key: Bytes, body: &[u8]) -> Result<Vec<u8>, CommandError> {
        let value = Bytes::copy_from_slice(body);

        let stored = match mode {
            StoreMode::Set => {
                if !self.storage.put(key, value) {
                    return Err(CommandError::ObjectTooLarge);
                }
                true
            }
            StoreMode::Add => self.storage.put_if_absent(key, value),
            StoreMode::Replace => self.storage.set(key, value),
            StoreMode::Append | StoreMode::Prepend => match self.storage.get(&key) {
                Some(existing) => {
                    let mut combined = Vec::with_capacity(existing.len() + value.len());
                    if mode == StoreMode::Append {
                        combined.extend_from_slice(&existing);
                        combined.extend_from_slice(&value);
                    } else {
                        combined.extend_from_slice(&value);
                        combined.extend_from_slice(&existing);
                    }
                    self.storage.set(key, Bytes::from(combined))
                }
                None => false,
            },
        };

        Ok(if stored {
            reply::STORED.to_vec()
        } else {
            reply::NOT_STORED.to_vec()
        })
    }

    fn cmd_delete(&self, key: &Bytes) -> Vec<u8> {
        if self.storage.delete(key) {
            reply::DELETED.to_vec()
        } else {
            reply::NOT_FOUND.to_vec()
        }
    }

    fn cmd_arithmetic(&self, key: &Bytes, apply: impl Fn(u64) -> u64) -> Result<Vec<u8>, CommandError> {
        let current = match self.storage.get(key) {
            Some(value) => value,
            None => return Ok(reply::NOT_FOUND.to_vec()),
        };

        let number: u64 = std::str::from_utf8(&current)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or(CommandError::NonNumericValue)?;

        let updated = apply(number).to_string();
        if !self.storage.set(key.clone(), Bytes::from(updated.clone())) {
            // Deleted (or evicted) between the read and the write
            return Ok(reply::NOT_FOUND.to_vec());
        }

        Ok(updated.into_bytes())
    }

    fn cmd_stats(&self) -> Vec<u8> {
        let storage = self.storage.stats();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let lines: Vec<(&str, String)> = vec![
            ("pid", std::process::id().to_string()),
            ("uptime", self.start_time.elapsed().as_secs().to_string()),
            ("time", now.to_string()),
            ("version", crate::VERSION.to_string()),
            (
                "curr_connections",
                self.stats.active_connections.load(Ordering::Relaxed).to_string(),
            ),
            (
                "total_connections",
                self.stats.connections_accepted.load(Ordering::Relaxed).to_string(),
            ),
            (
                "cmd_processed",
                self.stats.commands_processed.load(Ordering::Relaxed).to_string(),
            ),
            ("cmd_get", storage.get_ops.to_string()),
            ("cmd_set", storage.set_ops.to_string()),
            ("cmd_delete", storage.del_ops.to_string()),
            ("get_hits", storage.get_hits.to_string()),
            ("get_misses", storage.get_misses.to_string()),
            ("curr_items", storage.keys.to_string()),
            ("bytes", storage.bytes.to_string()),
            ("limit_maxbytes", storage.capacity.to_string()),
            ("evictions", storage.evictions.to_string()),
            (
                "bytes_read",
                self.stats.bytes_read.load(Ordering::Relaxed).to_string(),
            ),
            (
                "bytes_written",
                self.stats.bytes_written.load(Ordering::Relaxed).to_string(),
            ),
        ];

        let mut response = Vec::new();
        for (name, value) in lines {
            response.extend_from_slice(format!("STAT {} {}", name, value).as_bytes());
            response.extend_from_slice(CRLF);
        }
        response.extend_from_slice(reply::END);
        response
    }
}
