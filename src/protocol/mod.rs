//! Memcached Text Protocol Implementation
//!
//! This module provides the command-line side of the memcached text protocol.
//!
//! ## Overview
//!
//! Clients send one command per line. Storage commands are followed by a
//! data block of an announced length. Replies are text lines as well.
//!
//! ## Modules
//!
//! - `types`: Defines the `Command` enum and the reply lines
//! - `parser`: Incremental parser for command lines
//!
//! ## Example
//!
//! ```
//! use flashcache::protocol::{parse_command, Command};
//!
//! let data = b"set greeting 5\r\nhello\r\n";
//! let (command, consumed) = parse_command(data).unwrap().unwrap();
//!
//! assert_eq!(command.body_len(), 5);
//! assert_eq!(&data[consumed..], b"hello\r\n");
//! ```

pub mod parser;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{blank_prefix_len, discard_len, parse_command, ParseError, ParseResult, Parser};
pub use types::{Command, StoreMode, CRLF, TERMINATOR_LEN};
