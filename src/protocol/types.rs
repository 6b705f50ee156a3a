//! Memcached Text Protocol Types
//!
//! This module defines the commands understood by FlashCache and the
//! fixed reply lines of the memcached text protocol.
//!
//! ## Protocol Format
//!
//! Every command is a single text line terminated by CRLF (`\r\n`).
//! Storage commands announce the size of a data block that follows the
//! command line and is itself terminated by CRLF:
//!
//! ```text
//! set <key> <flags> <exptime> <bytes> [noreply]\r\n
//! <data block>\r\n
//! ```
//!
//! ## Examples
//!
//! Retrieval: `get user:1 user:2\r\n`
//! Storage: `set user:1 0 0 4\r\nAriz\r\n`
//! Short storage form: `set user:1 4\r\nAriz\r\n`
//! Deletion: `delete user:1\r\n`

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used by the text protocol.
pub const CRLF: &[u8] = b"\r\n";

/// Length of the terminator that follows every line and data block.
pub const TERMINATOR_LEN: usize = CRLF.len();

/// Fixed reply lines (without the trailing CRLF).
pub mod reply {
    pub const STORED: &[u8] = b"STORED";
    pub const NOT_STORED: &[u8] = b"NOT_STORED";
    pub const DELETED: &[u8] = b"DELETED";
    pub const NOT_FOUND: &[u8] = b"NOT_FOUND";
    pub const END: &[u8] = b"END";
    pub const SERVER_ERROR: &[u8] = b"SERVER_ERROR";
}

/// How a storage command treats an existing (or missing) key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Store unconditionally.
    Set,
    /// Store only if the key does not exist yet.
    Add,
    /// Store only if the key already exists.
    Replace,
    /// Add the data after the existing value.
    Append,
    /// Add the data before the existing value.
    Prepend,
}

impl StoreMode {
    /// Returns the command name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            StoreMode::Set => "set",
            StoreMode::Add => "add",
            StoreMode::Replace => "replace",
            StoreMode::Append => "append",
            StoreMode::Prepend => "prepend",
        }
    }
}

/// A parsed command line.
///
/// The data block of a storage command is not part of the command itself:
/// the connection collects `bytes` bytes (plus the terminator) after the
/// command line and hands them to the executor separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `get <key>*`
    Get { keys: Vec<Bytes> },

    /// `gets <key>*`
    Gets { keys: Vec<Bytes> },

    /// `set|add|replace|append|prepend <key> [<flags> <exptime>] <bytes> [noreply]`
    Store {
        mode: StoreMode,
        key: Bytes,
        flags: u32,
        exptime: i64,
        bytes: usize,
        noreply: bool,
    },

    /// `delete <key> [noreply]`
    Delete { key: Bytes, noreply: bool },

    /// `incr <key> <delta> [noreply]`
    Incr { key: Bytes, delta: u64, noreply: bool },

    /// `decr <key> <delta> [noreply]`
    Decr { key: Bytes, delta: u64, noreply: bool },

    /// `stats`
    Stats,

    /// `version`
    Version,

    /// `quit`
    Quit,
}

impl Command {
    /// Number of data bytes the client declared after the command line.
    ///
    /// Zero for every command that carries no data block, and for storage
    /// commands with an empty value.
    pub fn body_len(&self) -> usize {
        match self {
            Command::Store { bytes, .. } => *bytes,
            _ => 0,
        }
    }

    /// Returns true if the client asked not to receive a reply.
    pub fn is_noreply(&self) -> bool {
        match self {
            Command::Store { noreply, .. }
            | Command::Delete { noreply, .. }
            | Command::Incr { noreply, .. }
            | Command::Decr { noreply, .. } => *noreply,
            _ => false,
        }
    }

    /// Returns the command name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Get { .. } => "get",
            Command::Gets { .. } => "gets",
            Command::Store { mode, .. } => mode.name(),
            Command::Delete { .. } => "delete",
            Command::Incr { .. } => "incr",
            Command::Decr { .. } => "decr",
            Command::Stats => "stats",
            Command::Version => "version",
            Command::Quit => "quit",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Get { keys } | Command::Gets { keys } => {
                write!(f, "{}", self.name())?;
                for key in keys {
                    write!(f, " {}", String::from_utf8_lossy(key))?;
                }
                Ok(())
            }
            Command::Store { key, bytes, .. } => {
                write!(f, "{} {} {}", self.name(), String::from_utf8_lossy(key), bytes)
            }
            Command::Delete { key, .. } => {
                write!(f, "delete {}", String::from_utf8_lossy(key))
            }
            Command::Incr { key, delta, .. } | Command::Decr { key, delta, .. } => {
                write!(f, "{} {} {}", self.name(), String::from_utf8_lossy(key), delta)
            }
            _ => write!(f, "{}", self.name()),
        }
    }
}
