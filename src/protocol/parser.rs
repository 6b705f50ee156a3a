//! Incremental Memcached Text Protocol Parser
//!
//! This module turns raw bytes received from a client into [`Command`]s.
//! The parser never blocks and never buffers on its own: the caller owns
//! the byte buffer and calls [`Parser::parse`] every time new bytes arrive.
//!
//! ## How the Parser Works
//!
//! The parser looks at the buffered bytes and returns either:
//! - `Ok(Some((command, consumed)))` - A complete command line was parsed,
//!   `consumed` bytes (including the line terminator) were used
//! - `Ok(None)` - The command line is incomplete, more bytes are needed
//! - `Err(ParseError)` - The command line is invalid
//!
//! Only the command line is parsed here. The data block of a storage
//! command is announced by [`Command::body_len`] and collected by the
//! connection, which knows how many bytes are still in flight.
//!
//! Empty lines before a command are skipped and counted as consumed. This
//! makes the terminator following an empty data block (`set k 0\r\n\r\n`)
//! harmless.

use crate::protocol::types::{Command, StoreMode};
use bytes::Bytes;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while parsing a command line.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// The line contained nothing but whitespace
    #[error("empty command line")]
    EmptyCommand,

    /// The command name is not supported
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// The command got too few or too many arguments
    #[error("wrong number of arguments for '{0}'")]
    WrongArgumentCount(&'static str),

    /// A numeric argument could not be parsed
    #[error("invalid number: {0}")]
    InvalidNumber(String),

    /// A key is empty, too long or contains control characters
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The command line is not valid UTF-8
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// No line terminator was found within the allowed line length
    #[error("line too long (max: {max} bytes)")]
    LineTooLong { max: usize },

    /// The announced data block exceeds the maximum allowed size
    #[error("data block too large: {size} bytes (max: {max})")]
    BodyTooLarge { size: usize, max: usize },

    /// A storage command line announced a data block but was rejected
    #[error("{source}")]
    DataBlockRejected {
        declared: usize,
        source: Box<ParseError>,
    },
}

impl ParseError {
    /// Size of the data block announced by the rejected line.
    ///
    /// The client sends that block anyway, so the caller must skip it
    /// before reading the next command.
    pub fn data_block_len(&self) -> Option<usize> {
        match self {
            ParseError::BodyTooLarge { size, .. } => Some(*size),
            ParseError::DataBlockRejected { declared, .. } => Some(*declared),
            _ => None,
        }
    }
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum length of a single command line, terminator excluded.
pub const MAX_LINE_LEN: usize = 2048;

/// Maximum size of a data block (1 MB, same as memcached's default item size)
pub const MAX_BODY_LEN: usize = 1024 * 1024;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 250;

/// Characters of an unknown command name echoed back in the error.
const MAX_ECHOED_NAME: usize = 32;

/// An incremental parser for memcached text commands.
///
/// # Example
///
/// ```
/// use flashcache::protocol::{Command, Parser};
///
/// let mut parser = Parser::new();
/// let (command, consumed) = parser.parse(b"get foo\r\n").unwrap().unwrap();
///
/// assert_eq!(consumed, 9);
/// assert!(matches!(command, Command::Get { .. }));
/// ```
#[derive(Debug, Clone)]
pub struct Parser {
    max_line_len: usize,
    max_body_len: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    /// Creates a parser with the default limits.
    pub fn new() -> Self {
        Self {
            max_line_len: MAX_LINE_LEN,
            max_body_len: MAX_BODY_LEN,
        }
    }

    /// Creates a parser with custom limits.
    pub fn with_limits(max_line_len: usize, max_body_len: usize) -> Self {
        Self {
            max_line_len,
            max_body_len,
        }
    }

    /// Attempts to parse one command line from the buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((command, consumed)))` - Successfully parsed a command
    /// - `Ok(None)` - Incomplete line, need more bytes
    /// - `Err(e)` - Invalid command line; see [`discard_len`] to skip it
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
        let offset = blank_prefix_len(buf);
        let rest = &buf[offset..];

        let (line_len, terminated_len) = match find_line_end(rest) {
            Some(end) => end,
            None if rest.len() > self.max_line_len => {
                return Err(ParseError::LineTooLong {
                    max: self.max_line_len,
                })
            }
            None => return Ok(None),
        };

        if line_len > self.max_line_len {
            return Err(ParseError::LineTooLong {
                max: self.max_line_len,
            });
        }

        let line = std::str::from_utf8(&rest[..line_len])
            .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

        let command = self.parse_line(line)?;
        Ok(Some((command, offset + terminated_len)))
    }

    /// Parses a single command line without its terminator.
    fn parse_line(&self, line: &str) -> ParseResult<Command> {
        let mut tokens = line.split_ascii_whitespace();
        let name = tokens.next().ok_or(ParseError::EmptyCommand)?;
        let args: Vec<&str> = tokens.collect();

        match name.to_ascii_lowercase().as_str() {
            "get" => Ok(Command::Get {
                keys: parse_keys("get", &args)?,
            }),
            "gets" => Ok(Command::Gets {
                keys: parse_keys("gets", &args)?,
            }),
            "set" => self.parse_store(StoreMode::Set, &args),
            "add" => self.parse_store(StoreMode::Add, &args),
            "replace" => self.parse_store(StoreMode::Replace, &args),
            "append" => self.parse_store(StoreMode::Append, &args),
            "prepend" => self.parse_store(StoreMode::Prepend, &args),
            "delete" => {
                let (args, noreply) = split_noreply(&args);
                match args {
                    [key] => Ok(Command::Delete {
                        key: parse_key(key)?,
                        noreply,
                    }),
                    _ => Err(ParseError::WrongArgumentCount("delete")),
                }
            }
            "incr" | "decr" => {
                let (args, noreply) = split_noreply(&args);
                let (key, delta) = match args {
                    [key, delta] => (parse_key(key)?, parse_number::<u64>(delta)?),
                    _ if name.eq_ignore_ascii_case("incr") => {
                        return Err(ParseError::WrongArgumentCount("incr"))
                    }
                    _ => return Err(ParseError::WrongArgumentCount("decr")),
                };
                if name.eq_ignore_ascii_case("incr") {
                    Ok(Command::Incr { key, delta, noreply })
                } else {
                    Ok(Command::Decr { key, delta, noreply })
                }
            }
            "stats" => Ok(Command::Stats),
            "version" => no_arguments("version", &args, Command::Version),
            "quit" => no_arguments("quit", &args, Command::Quit),
            _ => Err(ParseError::UnknownCommand(
                name.chars().take(MAX_ECHOED_NAME).collect(),
            )),
        }
    }

    /// Parses the arguments of a storage command.
    ///
    /// Accepts both `<key> <flags> <exptime> <bytes>` and the short
    /// `<key> <bytes>` form, each optionally followed by `noreply`.
    fn parse_store(&self, mode: StoreMode, args: &[&str]) -> ParseResult<Command> {
        let (args, noreply) = split_noreply(args);

        let (key, flags, exptime, bytes) = match args {
            [key, bytes] => (key, None, None, bytes),
            [key, flags, exptime, bytes] => (key, Some(flags), Some(exptime), bytes),
            _ => return Err(ParseError::WrongArgumentCount(mode.name())),
        };

        // Once the size is known, every later failure must carry it
        let bytes = parse_number::<usize>(bytes)?;
        if bytes > self.max_body_len {
            return Err(ParseError::BodyTooLarge {
                size: bytes,
                max: self.max_body_len,
            });
        }
        let rejected = move |source: ParseError| ParseError::DataBlockRejected {
            declared: bytes,
            source: Box::new(source),
        };

        let key = parse_key(key).map_err(rejected)?;
        let flags = match flags {
            Some(flags) => parse_number::<u32>(flags).map_err(rejected)?,
            None => 0,
        };
        let exptime = match exptime {
            Some(exptime) => parse_number::<i64>(exptime).map_err(rejected)?,
            None => 0,
        };

        Ok(Command::Store {
            mode,
            key,
            flags,
            exptime,
            bytes,
            noreply,
        })
    }
}

/// Returns how many bytes to drop after [`Parser::parse`] failed.
///
/// This covers any leading empty lines plus the offending line itself, so
/// that commands pipelined behind a bad line are still parsed. If the line
/// is not terminated, the whole buffer is discarded.
pub fn discard_len(buf: &[u8]) -> usize {
    let offset = blank_prefix_len(buf);
    match find_line_end(&buf[offset..]) {
        Some((_, terminated_len)) => offset + terminated_len,
        None => buf.len(),
    }
}

/// Counts the bytes taken by empty lines at the start of the buffer.
pub fn blank_prefix_len(buf: &[u8]) -> usize {
    let mut offset = 0;
    loop {
        match &buf[offset..] {
            [b'\r', b'\n', ..] => offset += 2,
            [b'\n', ..] => offset += 1,
            _ => return offset,
        }
    }
}

/// Finds the end of the first line.
///
/// Returns the line length without terminator and the length including
/// it. Lines end with CRLF; a bare LF is tolerated for telnet-style clients.
#[inline]
fn find_line_end(buf: &[u8]) -> Option<(usize, usize)> {
    let newline = buf.iter().position(|&b| b == b'\n')?;
    if newline > 0 && buf[newline - 1] == b'\r' {
        Some((newline - 1, newline + 1))
    } else {
        Some((newline, newline + 1))
    }
}

fn split_noreply<'a, 'b>(args: &'a [&'b str]) -> (&'a [&'b str], bool) {
    match args.split_last() {
        Some((last, rest)) if *last == "noreply" => (rest, true),
        _ => (args, false),
    }
}

fn no_arguments(name: &'static str, args: &[&str], command: Command) -> ParseResult<Command> {
    if args.is_empty() {
        Ok(command)
    } else {
        Err(ParseError::WrongArgumentCount(name))
    }
}

fn parse_keys(name: &'static str, args: &[&str]) -> ParseResult<Vec<Bytes>> {
    if args.is_empty() {
        return Err(ParseError::WrongArgumentCount(name));
    }
    args.iter().map(|key| parse_key(key)).collect()
}

fn parse_key(key: &str) -> ParseResult<Bytes> {
    if key.len() > MAX_KEY_LEN {
        return Err(ParseError::InvalidKey(format!(
            "longer than {} bytes",
            MAX_KEY_LEN
        )));
    }
    if key.bytes().any(|b| b.is_ascii_control()) {
        return Err(ParseError::InvalidKey(
            "contains control characters".to_string(),
        ));
    }
    Ok(Bytes::copy_from_slice(key.as_bytes()))
}

fn parse_number<T: FromStr>(token: &str) -> ParseResult<T> {
    token
        .parse()
        .map_err(|_| ParseError::InvalidNumber(token.to_string()))
}

/// Helper function to parse a single command from bytes.
pub fn parse_command(buf: &[u8]) -> ParseResult<Option<(Command, usize)>> {
    Parser::new().parse(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_get() {
        let (command, consumed) = parse_command(b"get foo\r\n").unwrap().unwrap();
        assert_eq!(
            command,
            Command::Get {
                keys: vec![Bytes::from("foo")]
            }
        );
        assert_eq!(consumed, 9);
    }

    #[test]
    fn test_parse_get_multiple_keys() {
        let (command, _) = parse_command(b"gets a b c\r\n").unwrap().unwrap();
        assert_eq!(
            command,
            Command::Gets {
                keys: vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]
            }
        );
    }

    #[test]
    fn test_parse_incomplete_line() {
        assert!(parse_command(b"get fo").unwrap().is_none());
        assert!(parse_command(b"").unwrap().is_none());
        assert!(parse_command(b"get foo\r").unwrap().is_none());
    }

    #[test]
    fn test_parse_set_short_form() {
        let (command, consumed) = parse_command(b"set foo 4\r\nbar1\r\n").unwrap().unwrap();
        assert_eq!(
            command,
            Command::Store {
                mode: StoreMode::Set,
                key: Bytes::from("foo"),
                flags: 0,
                exptime: 0,
                bytes: 4,
                noreply: false,
            }
        );
        // Only the command line is consumed, the data block stays buffered
        assert_eq!(consumed, 11);
        assert_eq!(command.body_len(), 4);
    }

    #[test]
    fn test_parse_set_full_form_noreply() {
        let (command, _) = parse_command(b"add user:1 42 3600 10 noreply\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(
            command,
            Command::Store {
                mode: StoreMode::Add,
                key: Bytes::from("user:1"),
                flags: 42,
                exptime: 3600,
                bytes: 10,
                noreply: true,
            }
        );
    }

    #[test]
    fn test_parse_storage_variants() {
        for (line, mode) in [
            (&b"replace k 1\r\n"[..], StoreMode::Replace),
            (&b"append k 1\r\n"[..], StoreMode::Append),
            (&b"prepend k 1\r\n"[..], StoreMode::Prepend),
        ] {
            let (command, _) = parse_command(line).unwrap().unwrap();
            assert!(matches!(command, Command::Store { mode: m, .. } if m == mode));
        }
    }

    #[test]
    fn test_parse_delete_and_counters() {
        let (command, _) = parse_command(b"delete foo noreply\r\n").unwrap().unwrap();
        assert_eq!(
            command,
            Command::Delete {
                key: Bytes::from("foo"),
                noreply: true
            }
        );

        let (command, _) = parse_command(b"incr hits 5\r\n").unwrap().unwrap();
        assert_eq!(
            command,
            Command::Incr {
                key: Bytes::from("hits"),
                delta: 5,
                noreply: false
            }
        );

        let (command, _) = parse_command(b"decr hits 2\r\n").unwrap().unwrap();
        assert!(matches!(command, Command::Decr { delta: 2, .. }));
    }

    #[test]
    fn test_parse_case_insensitive_name() {
        let (command, _) = parse_command(b"GET foo\r\n").unwrap().unwrap();
        assert!(matches!(command, Command::Get { .. }));
    }

    #[test]
    fn test_parse_bare_newline() {
        let (command, consumed) = parse_command(b"version\n").unwrap().unwrap();
        assert_eq!(command, Command::Version);
        assert_eq!(consumed, 8);
    }

    #[test]
    fn test_skips_empty_lines() {
        let (command, consumed) = parse_command(b"\r\n\r\nstats\r\n").unwrap().unwrap();
        assert_eq!(command, Command::Stats);
        assert_eq!(consumed, 11);

        // Empty lines alone are not a command
        assert!(parse_command(b"\r\n").unwrap().is_none());
    }

    #[test]
    fn test_unknown_command() {
        let result = parse_command(b"bogus foo\r\n");
        assert_eq!(
            result,
            Err(ParseError::UnknownCommand("bogus".to_string()))
        );
    }

    #[test]
    fn test_wrong_argument_count() {
        assert_eq!(
            parse_command(b"get\r\n"),
            Err(ParseError::WrongArgumentCount("get"))
        );
        assert_eq!(
            parse_command(b"set foo 0 0\r\n"),
            Err(ParseError::WrongArgumentCount("set"))
        );
        assert_eq!(
            parse_command(b"version now\r\n"),
            Err(ParseError::WrongArgumentCount("version"))
        );
    }

    #[test]
    fn test_invalid_number() {
        assert_eq!(
            parse_command(b"set foo abc\r\n"),
            Err(ParseError::InvalidNumber("abc".to_string()))
        );
        assert!(matches!(
            parse_command(b"incr foo -1\r\n"),
            Err(ParseError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_invalid_key() {
        let long_key = "k".repeat(MAX_KEY_LEN + 1);
        let line = format!("get {}\r\n", long_key);
        assert!(matches!(
            parse_command(line.as_bytes()),
            Err(ParseError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_line_too_long() {
        let mut parser = Parser::with_limits(16, MAX_BODY_LEN);
        let result = parser.parse(b"get aaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(result, Err(ParseError::LineTooLong { max: 16 }));
    }

    #[test]
    fn test_body_too_large() {
        let mut parser = Parser::with_limits(MAX_LINE_LEN, 8);
        let result = parser.parse(b"set foo 9\r\n");
        assert_eq!(result, Err(ParseError::BodyTooLarge { size: 9, max: 8 }));
    }

    #[test]
    fn test_rejected_store_reports_data_block() {
        let long_key = "k".repeat(MAX_KEY_LEN + 1);
        let line = format!("set {} 0 0 10\r\n", long_key);
        let error = parse_command(line.as_bytes()).unwrap_err();
        assert!(matches!(
            &error,
            ParseError::DataBlockRejected { declared: 10, source }
                if matches!(**source, ParseError::InvalidKey(_))
        ));
        assert_eq!(error.data_block_len(), Some(10));
        assert_eq!(error.to_string(), "invalid key: longer than 250 bytes");

        let error = parse_command(b"add foo x 0 3\r\n").unwrap_err();
        assert_eq!(error.data_block_len(), Some(3));

        let error = Parser::with_limits(MAX_LINE_LEN, 8)
            .parse(b"set foo 9\r\n")
            .unwrap_err();
        assert_eq!(error.data_block_len(), Some(9));

        // Without a readable size there is nothing to skip
        assert_eq!(parse_command(b"set foo abc\r\n").unwrap_err().data_block_len(), None);
        assert_eq!(parse_command(b"bogus\r\n").unwrap_err().data_block_len(), None);
    }

    #[test]
    fn test_unknown_command_name_is_truncated() {
        let name = "x".repeat(MAX_LINE_LEN - 10);
        let line = format!("{}\r\n", name);
        assert_eq!(
            parse_command(line.as_bytes()),
            Err(ParseError::UnknownCommand("x".repeat(MAX_ECHOED_NAME)))
        );
    }

    #[test]
    fn test_blank_prefix_len() {
        assert_eq!(blank_prefix_len(b"\r\n\n\r\nget"), 5);
        assert_eq!(blank_prefix_len(b"get\r\n"), 0);
        assert_eq!(blank_prefix_len(b"\r"), 0);
    }

    #[test]
    fn test_invalid_utf8() {
        let result = parse_command(b"get \xff\xfe\r\n");
        assert!(matches!(result, Err(ParseError::InvalidUtf8(_))));
    }

    #[test]
    fn test_discard_len() {
        assert_eq!(discard_len(b"bogus\r\nget foo\r\n"), 7);
        assert_eq!(discard_len(b"\r\nbogus\r\nget foo\r\n"), 9);
        assert_eq!(discard_len(b"unterminated"), 12);
    }

    #[test]
    fn test_pipelined_commands() {
        let input = b"get a\r\nget b\r\n";
        let mut parser = Parser::new();

        let (first, consumed) = parser.parse(input).unwrap().unwrap();
        assert_eq!(
            first,
            Command::Get {
                keys: vec![Bytes::from("a")]
            }
        );

        let (second, rest) = parser.parse(&input[consumed..]).unwrap().unwrap();
        assert_eq!(
            second,
            Command::Get {
                keys: vec![Bytes::from("b")]
            }
        );
        assert_eq!(consumed + rest, input.len());
    }
}
