//! Connection Handler Module
//!
//! This module drives a single client connection through the protocol
//! state machine. A connection never blocks: every read and write is
//! non-blocking, and a would-block result suspends the connection until the
//! worker sees the next readiness event for its socket.
//!
//! ## Connection Lifecycle
//!
//! ```text
//!            ┌──────────────────────────┐
//!            │       ReadCommand        │<──────────────┐
//!            │  parse buffered bytes,   │               │
//!            │  read more if incomplete │               │
//!            └────────────┬─────────────┘               │
//!                         │ command line parsed         │
//!                         ▼                             │
//!            ┌──────────────────────────┐   noreply     │
//!            │     ExtractArguments     │───────────────┤
//!            │  collect <bytes>+CRLF,   │               │
//!            │  execute the command     │               │
//!            └────────────┬─────────────┘               │
//!                         │ reply queued                │
//!                         ▼                             │
//!            ┌──────────────────────────┐  fully sent   │
//!            │        SendAnswer        │───────────────┘
//!            │  write the unsent suffix │
//!            └──────────────────────────┘
//! ```
//!
//! Any state may suspend on would-block. Protocol and execution errors
//! become a `SERVER_ERROR` reply and the connection keeps going; peer
//! close, I/O errors and `quit` end it. A rejected storage command still
//! has its data block skipped, and the unread tail of an over-long line is
//! dropped, so neither is ever parsed as a command.
//!
//! ## Buffer Management
//!
//! Incoming bytes land in a fixed 4 KiB buffer. Consumed bytes are always
//! compacted away so unconsumed data starts at offset 0. Data blocks are
//! copied out of the buffer into a separate accumulator, so values may be
//! far larger than the buffer itself.

use crate::commands::{CommandError, CommandHandler};
use crate::network::Readiness;
use crate::protocol::types::reply;
use crate::protocol::{
    blank_prefix_len, discard_len, Command, ParseError, Parser, CRLF, TERMINATOR_LEN,
};
use std::fmt;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Capacity of the per-connection read buffer
pub const BUFFER_CAPACITY: usize = 4096;

/// Statistics for connection handling
#[derive(Debug, Default)]
pub struct ConnectionStats {
    /// Total number of connections accepted
    pub connections_accepted: AtomicU64,
    /// Currently active connections
    pub active_connections: AtomicU64,
    /// Total commands processed
    pub commands_processed: AtomicU64,
    /// Total bytes read
    pub bytes_read: AtomicU64,
    /// Total bytes written
    pub bytes_written: AtomicU64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn command_processed(&self) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_read(&self, count: usize) {
        self.bytes_read.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn bytes_written(&self, count: usize) {
        self.bytes_written
            .fetch_add(count as u64, Ordering::Relaxed);
    }
}

/// Phase of the protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for a complete command line
    ReadCommand,
    /// Collecting the data block of the pending command
    ExtractArguments,
    /// Writing the reply back to the client
    SendAnswer,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::ReadCommand => write!(f, "read-command"),
            State::ExtractArguments => write!(f, "extract-arguments"),
            State::SendAnswer => write!(f, "send-answer"),
        }
    }
}

/// Reasons a connection ends.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Client disconnected normally
    #[error("Client disconnected")]
    ClientDisconnected,

    /// Client sent `quit`
    #[error("Client quit")]
    Quit,

    /// Socket would block after the worker was stopped
    #[error("Server shutting down")]
    Shutdown,

    /// Hangup or error reported by the poller
    #[error("Socket hangup")]
    Hangup,

    /// Event carried neither readable nor writable readiness
    #[error("Unexpected readiness: {0:?}")]
    UnexpectedReadiness(Readiness),
}

/// Outcome of one step of the state machine.
enum Step {
    /// State advanced, keep going
    Continue,
    /// Socket would block, wait for the next event
    Suspend,
}

/// A single client connection and its protocol state.
///
/// Generic over the stream so the state machine can run on anything
/// non-blocking that implements `Read + Write`.
pub struct Connection<S> {
    /// The client socket, closed when the connection is dropped
    stream: S,

    /// Client's address (for logging)
    addr: SocketAddr,

    /// Current phase
    state: State,

    /// Buffer for incoming data; valid bytes are `buffer[..buffered]`
    buffer: Box<[u8; BUFFER_CAPACITY]>,
    buffered: usize,

    /// Command line parser
    parser: Parser,

    /// Command waiting for its data block or being answered
    command: Option<Command>,

    /// Data block bytes (terminator included) still to be read
    body_remaining: usize,
    body: Vec<u8>,

    /// Error reported once the data block of a rejected line is skipped
    rejected: Option<ParseError>,

    /// Dropping the rest of an over-long line
    skip_line: bool,

    /// Reply being sent and how much of it already went out
    answer: Vec<u8>,
    sent: usize,

    /// The command handler (shared across connections)
    command_handler: CommandHandler,

    /// Connection statistics (shared)
    stats: Arc<ConnectionStats>,
}

impl<S: Read + Write> Connection<S> {
    /// Creates a new connection.
    ///
    /// # Arguments
    ///
    /// * `stream` - The client socket, already in non-blocking mode
    /// * `addr` - The client's socket address
    /// * `command_handler` - The command handler for executing commands
    /// * `stats` - Shared connection statistics
    pub fn new(
        stream: S,
        addr: SocketAddr,
        command_handler: CommandHandler,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        stats.connection_opened();

        Self {
            stream,
            addr,
            state: State::ReadCommand,
            buffer: Box::new([0; BUFFER_CAPACITY]),
            buffered: 0,
            parser: Parser::new(),
            command: None,
            body_remaining: 0,
            body: Vec::new(),
            rejected: None,
            skip_line: false,
            answer: Vec::new(),
            sent: 0,
            command_handler,
            stats,
        }
    }

    /// Returns the client's address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the current phase.
    pub fn state(&self) -> State {
        self.state
    }

    /// Returns a reference to the underlying stream.
    pub fn stream(&self) -> &S {
        &self.stream
    }

    /// Advances the state machine as far as the socket allows.
    ///
    /// Runs until a read or write would block, which is required for
    /// edge-triggered notification.
    ///
    /// # Arguments
    ///
    /// * `readiness` - The readiness reported for this socket
    /// * `running` - The worker's running flag
    ///
    /// # Returns
    ///
    /// `true` if the connection should stay registered, `false` if it must
    /// be removed and closed.
    pub fn process(&mut self, readiness: Readiness, running: &AtomicBool) -> bool {
        match self.drive(readiness, running) {
            Ok(()) => true,
            Err(e) => {
                match &e {
                    ConnectionError::ClientDisconnected | ConnectionError::Quit => {
                        debug!(client = %self.addr, reason = %e, "Client disconnected")
                    }
                    ConnectionError::Shutdown | ConnectionError::Hangup => {
                        debug!(client = %self.addr, reason = %e, "Closing connection")
                    }
                    ConnectionError::IoError(io_err)
                        if io_err.kind() == ErrorKind::ConnectionReset =>
                    {
                        debug!(client = %self.addr, "Connection reset by client")
                    }
                    _ => warn!(client = %self.addr, error = %e, state = %self.state, "Connection error"),
                }
                false
            }
        }
    }

    fn drive(&mut self, readiness: Readiness, running: &AtomicBool) -> Result<(), ConnectionError> {
        if readiness.hangup || readiness.error {
            return Err(ConnectionError::Hangup);
        }
        if !readiness.readable && !readiness.writable {
            return Err(ConnectionError::UnexpectedReadiness(readiness));
        }

        loop {
            let step = match self.state {
                State::ReadCommand => self.read_command(running)?,
                State::ExtractArguments => self.extract_arguments(running)?,
                State::SendAnswer => self.send_answer(readiness.writable, running)?,
            };

            if let Step::Suspend = step {
                trace!(client = %self.addr, state = %self.state, "Suspended");
                return Ok(());
            }
        }
    }

    /// ReadCommand: parse a command line, reading more bytes as needed.
    fn read_command(&mut self, running: &AtomicBool) -> Result<Step, ConnectionError> {
        loop {
            if self.skip_line {
                match self.buffer[..self.buffered].iter().position(|&b| b == b'\n') {
                    Some(end) => {
                        self.consume(end + 1);
                        self.skip_line = false;
                    }
                    None => {
                        self.consume(self.buffered);
                        if let Step::Suspend = self.fill(running)? {
                            return Ok(Step::Suspend);
                        }
                        continue;
                    }
                }
            }

            match self.parser.parse(&self.buffer[..self.buffered]) {
                Ok(Some((command, consumed))) => {
                    self.consume(consumed);
                    trace!(client = %self.addr, command = %command, "Parsed command");

                    if let Command::Quit = command {
                        return Err(ConnectionError::Quit);
                    }

                    self.expect_data_block(command.body_len());
                    self.body.reserve(self.body_remaining);
                    self.command = Some(command);
                    return Ok(Step::Continue);
                }
                Ok(None) => {
                    let blanks = blank_prefix_len(&self.buffer[..self.buffered]);
                    if blanks > 0 {
                        self.consume(blanks);
                    }

                    if self.buffered == BUFFER_CAPACITY {
                        self.consume(self.buffered);
                        self.skip_line = true;
                        self.fail(ParseError::LineTooLong {
                            max: BUFFER_CAPACITY,
                        });
                        return Ok(Step::Continue);
                    }

                    if let Step::Suspend = self.fill(running)? {
                        return Ok(Step::Suspend);
                    }
                }
                Err(e) => {
                    warn!(client = %self.addr, error = %e, "Parse error");

                    let skip = discard_len(&self.buffer[..self.buffered]);
                    if skip == 0 || self.buffer[skip - 1] != b'\n' {
                        self.skip_line = true;
                    }
                    self.consume(skip);

                    match e.data_block_len() {
                        Some(declared) => {
                            self.expect_data_block(declared);
                            self.rejected = Some(e);
                        }
                        None => self.fail(e),
                    }
                    return Ok(Step::Continue);
                }
            }
        }
    }

    /// ExtractArguments: collect the data block, then execute.
    ///
    /// The block of a rejected line is read and dropped before its error
    /// is reported.
    fn extract_arguments(&mut self, running: &AtomicBool) -> Result<Step, ConnectionError> {
        loop {
            if self.body_remaining > 0 && self.buffered > 0 {
                let take = self.body_remaining.min(self.buffered);
                if self.rejected.is_none() {
                    self.body.extend_from_slice(&self.buffer[..take]);
                }
                self.consume(take);
                self.body_remaining -= take;
            }

            if self.body_remaining == 0 {
                match self.rejected.take() {
                    Some(e) => self.fail(e),
                    None => self.execute(),
                }
                return Ok(Step::Continue);
            }

            if let Step::Suspend = self.fill(running)? {
                return Ok(Step::Suspend);
            }
        }
    }

    /// Enters ExtractArguments for a block of `declared` data bytes.
    fn expect_data_block(&mut self, declared: usize) {
        self.body_remaining = if declared > 0 {
            declared.saturating_add(TERMINATOR_LEN)
        } else {
            0
        };
        self.body.clear();
        self.state = State::ExtractArguments;
    }

    /// Runs the pending command and queues its reply.
    fn execute(&mut self) {
        let command = match self.command.take() {
            Some(command) => command,
            None => {
                self.state = State::ReadCommand;
                return;
            }
        };

        if !self.body.is_empty() {
            if !self.body.ends_with(CRLF) {
                warn!(client = %self.addr, command = command.name(), "Data block not terminated by CRLF");
                self.fail(CommandError::BadDataChunk);
                return;
            }
            self.body.truncate(self.body.len() - TERMINATOR_LEN);
        }

        let result = self.command_handler.execute(command, &self.body);
        self.stats.command_processed();
        self.body.clear();

        match result {
            Ok(Some(mut response)) => {
                response.extend_from_slice(CRLF);
                self.answer = response;
                self.sent = 0;
                self.state = State::SendAnswer;
            }
            Ok(None) => self.state = State::ReadCommand,
            Err(e) => {
                debug!(client = %self.addr, error = %e, "Command failed");
                self.fail(e);
            }
        }
    }

    /// SendAnswer: write the unsent part of the reply.
    fn send_answer(&mut self, writable: bool, running: &AtomicBool) -> Result<Step, ConnectionError> {
        if !writable {
            return Ok(Step::Suspend);
        }

        while self.sent < self.answer.len() {
            match self.stream.write(&self.answer[self.sent..]) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.sent += n;
                    self.stats.bytes_written(n);
                    trace!(client = %self.addr, bytes = n, "Sent response");
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return would_block(running),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        self.answer.clear();
        self.sent = 0;
        self.state = State::ReadCommand;
        Ok(Step::Continue)
    }

    /// Reads once into the free tail of the buffer.
    ///
    /// Callers guarantee the buffer is not full.
    fn fill(&mut self, running: &AtomicBool) -> Result<Step, ConnectionError> {
        loop {
            match self.stream.read(&mut self.buffer[self.buffered..]) {
                Ok(0) => return Err(ConnectionError::ClientDisconnected),
                Ok(n) => {
                    self.buffered += n;
                    self.stats.bytes_read(n);
                    trace!(client = %self.addr, bytes = n, "Read data");
                    return Ok(Step::Continue);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return would_block(running),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drops `count` bytes from the front of the buffer.
    fn consume(&mut self, count: usize) {
        self.buffer.copy_within(count..self.buffered, 0);
        self.buffered -= count;
    }

    /// Replaces the pending command with a `SERVER_ERROR` reply.
    fn fail(&mut self, error: impl fmt::Display) {
        self.command = None;
        self.body_remaining = 0;
        self.body.clear();

        self.answer.clear();
        self.answer.extend_from_slice(reply::SERVER_ERROR);
        self.answer.push(b' ');
        self.answer.extend_from_slice(error.to_string().as_bytes());
        self.answer.extend_from_slice(CRLF);
        self.sent = 0;
        self.state = State::SendAnswer;
    }
}

impl<S> Drop for Connection<S> {
    fn drop(&mut self) {
        self.stats.connection_closed();
    }
}

fn would_block(running: &AtomicBool) -> Result<Step, ConnectionError> {
    if running.load(Ordering::Acquire) {
        Ok(Step::Suspend)
    } else {
        Err(ConnectionError::Shutdown)
    }
}
