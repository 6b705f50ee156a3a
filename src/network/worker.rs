//! Worker Event Loop
//!
//! A worker owns one epoll instance and one background thread. It shares
//! the listening socket with the other workers, accepts clients from it and
//! drives every connection it accepted until the connection ends.
//!
//! ## Event Loop
//!
//! ```text
//!   ┌──────────────┐
//!   │ epoll_wait() │<────────────────────────────────┐
//!   └──────┬───────┘                                 │
//!          │                                         │
//!          ├── listener ──> accept until would-block ┤
//!          │                register each client     │
//!          │                                         │
//!          └── client ────> Connection::process ─────┘
//!                           false => deregister, drop
//! ```
//!
//! ## Shutdown
//!
//! `stop()` only clears the running flag. `join()` then shuts the listening
//! socket down, which reports a hangup to every epoll instance waiting on
//! it, so a worker blocked in an indefinite wait wakes up, sees the flag
//! and exits. A listener hangup while still running is fatal.

use crate::commands::CommandHandler;
use crate::connection::{Connection, ConnectionStats};
use crate::network::poller::{Events, Interest, Poller, Readiness, Token};
use slab::Slab;
use socket2::SockRef;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Token of the listening socket
const LISTENER: Token = Token(u64::MAX);

/// Default number of events handled per wait
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Errors that stop a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to create poller: {0}")]
    Poll(#[source] io::Error),

    #[error("failed to register listener: {0}")]
    Register(#[source] io::Error),

    #[error("failed to wait for events: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to configure listener: {0}")]
    Listener(#[source] io::Error),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("listening socket closed while running")]
    ListenerClosed,

    #[error("worker already started")]
    AlreadyStarted,

    #[error("worker thread panicked")]
    Panicked,
}

/// Handle to one event-loop thread.
pub struct Worker {
    id: usize,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    events_capacity: usize,
    running: Arc<AtomicBool>,
    listener: Option<Arc<TcpListener>>,
    thread: Option<JoinHandle<Result<(), WorkerError>>>,
}

impl Worker {
    /// Creates an idle worker.
    ///
    /// # Arguments
    ///
    /// * `id` - Worker number, used for the thread name and logs
    /// * `command_handler` - Executes commands against the shared storage
    /// * `stats` - Shared connection statistics
    pub fn new(id: usize, command_handler: CommandHandler, stats: Arc<ConnectionStats>) -> Self {
        Self {
            id,
            command_handler,
            stats,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            running: Arc::new(AtomicBool::new(false)),
            listener: None,
            thread: None,
        }
    }

    /// Sets how many events one wait may return.
    ///
    /// More ready sockets than this are simply picked up by the next wait.
    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity.max(1);
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts serving `listener` on a background thread.
    ///
    /// The epoll instance is created before the thread is spawned, so its
    /// failure is reported here rather than from `join()`.
    pub fn start(&mut self, listener: Arc<TcpListener>) -> Result<(), WorkerError> {
        if self.thread.is_some() {
            return Err(WorkerError::AlreadyStarted);
        }

        listener.set_nonblocking(true).map_err(WorkerError::Listener)?;
        let poller = Poller::new().map_err(WorkerError::Poll)?;

        self.running.store(true, Ordering::Release);

        let event_loop = EventLoop {
            id: self.id,
            poller,
            listener: listener.clone(),
            running: self.running.clone(),
            command_handler: self.command_handler.clone(),
            stats: self.stats.clone(),
            events_capacity: self.events_capacity,
            connections: Slab::new(),
            generation: 0,
        };

        let thread = thread::Builder::new()
            .name(format!("worker-{}", self.id))
            .spawn(move || event_loop.run())
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                WorkerError::Spawn(e)
            })?;

        self.listener = Some(listener);
        self.thread = Some(thread);
        Ok(())
    }

    /// Asks the event loop to exit. Does not wait.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Wakes the event loop and waits for its thread to exit.
    ///
    /// Shuts the listening socket down, which also ends the other workers
    /// serving it.
    pub fn join(&mut self) -> Result<(), WorkerError> {
        if let Some(listener) = self.listener.take() {
            // Fails with ENOTCONN once another worker already shut it down
            let _ = SockRef::from(&*listener).shutdown(Shutdown::Both);
        }

        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| WorkerError::Panicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
            if let Err(e) = self.join() {
                error!(worker = self.id, error = %e, "Worker failed");
            }
        }
    }
}

/// A registered connection and the generation of its token.
struct Entry {
    generation: u32,
    connection: Connection<TcpStream>,
}

/// State owned by the worker thread.
struct EventLoop {
    id: usize,
    poller: Poller,
    listener: Arc<TcpListener>,
    running: Arc<AtomicBool>,
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    events_capacity: usize,
    connections: Slab<Entry>,
    generation: u32,
}

impl EventLoop {
    fn run(mut self) -> Result<(), WorkerError> {
        info!(worker = self.id, "Worker started");

        let result = self.serve();
        self.close_all();

        match &result {
            Ok(()) => info!(worker = self.id, "Worker stopped"),
            Err(e) => error!(worker = self.id, error = %e, "Worker failed"),
        }
        result
    }

    fn serve(&mut self) -> Result<(), WorkerError> {
        self.poller
            .add(self.listener.as_raw_fd(), LISTENER, Interest::Listener)
            .map_err(WorkerError::Register)?;

        let mut events = Events::with_capacity(self.events_capacity);

        while self.running.load(Ordering::Acquire) {
            self.poller
                .wait(&mut events, None)
                .map_err(WorkerError::Wait)?;

            for (token, readiness) in events.iter() {
                if token != LISTENER {
                    self.dispatch(token, readiness);
                    continue;
                }

                if readiness.hangup || readiness.error {
                    if self.running.load(Ordering::Acquire) {
                        return Err(WorkerError::ListenerClosed);
                    }
                    debug!(worker = self.id, "Listener shut down");
                    return Ok(());
                }

                self.accept()?;
            }
        }

        Ok(())
    }

    /// Accepts every pending client.
    fn accept(&mut self) -> Result<(), WorkerError> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => self.admit(stream, addr),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                    debug!(worker = self.id, "Client aborted before accept");
                }
                Err(_) if !self.running.load(Ordering::Acquire) => return Ok(()),
                Err(e) => return Err(WorkerError::Accept(e)),
            }
        }
    }

    /// Registers a freshly accepted client.
    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(worker = self.id, client = %addr, error = %e, "Failed to make client non-blocking");
            return;
        }

        let entry = self.connections.vacant_entry();
        let generation = self.generation;
        let token = token_for(entry.key(), generation);

        if let Err(e) = self.poller.add(stream.as_raw_fd(), token, Interest::Client) {
            warn!(worker = self.id, client = %addr, error = %e, "Failed to register client");
            return;
        }

        let connection = Connection::new(stream, addr, self.command_handler.clone(), self.stats.clone());
        entry.insert(Entry {
            generation,
            connection,
        });
        self.generation = self.generation.wrapping_add(1);

        debug!(worker = self.id, client = %addr, "Client connected");
    }

    /// Hands a client event to its connection.
    fn dispatch(&mut self, token: Token, readiness: Readiness) {
        let (index, generation) = split_token(token);

        let keep = match self.connections.get_mut(index) {
            Some(entry) if entry.generation == generation => {
                entry.connection.process(readiness, &self.running)
            }
            _ => {
                trace!(worker = self.id, token = token.0, "Event for a closed connection");
                return;
            }
        };

        if !keep {
            self.remove(index);
        }
    }

    fn remove(&mut self, index: usize) {
        if let Some(entry) = self.connections.try_remove(index) {
            let connection = entry.connection;
            if let Err(e) = self.poller.delete(connection.stream().as_raw_fd()) {
                debug!(worker = self.id, client = %connection.addr(), error = %e, "Failed to deregister client");
            }
        }
    }

    /// Deregisters and drops everything the loop still holds.
    fn close_all(&mut self) {
        let open = self.connections.len();
        for entry in self.connections.drain() {
            let _ = self.poller.delete(entry.connection.stream().as_raw_fd());
        }
        let _ = self.poller.delete(self.listener.as_raw_fd());

        if open > 0 {
            debug!(worker = self.id, connections = open, "Closed remaining connections");
        }
    }
}

fn token_for(index: usize, generation: u32) -> Token {
    Token((u64::from(generation) << 32) | index as u64)
}

fn split_token(token: Token) -> (usize, u32) {
    ((token.0 & 0xFFFF_FFFF) as usize, (token.0 >> 32) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LruStorage;
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    fn create_worker(id: usize) -> (Worker, Arc<ConnectionStats>) {
        let storage = Arc::new(LruStorage::new(1024 * 1024));
        let stats = Arc::new(ConnectionStats::new());
        let handler = CommandHandler::new(storage, stats.clone());
        (Worker::new(id, handler, stats.clone()), stats)
    }

    fn create_listener() -> (Arc<TcpListener>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (Arc::new(listener), addr)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    #[test]
    fn test_token_round_trip() {
        let token = token_for(17, 3);
        assert_eq!(split_token(token), (17, 3));
        assert_ne!(token, LISTENER);
    }

    #[test]
    fn test_serves_and_stops_promptly() {
        let (mut worker, _) = create_worker(0);
        let (listener, addr) = create_listener();
        worker.start(listener).unwrap();
        assert!(worker.is_running());

        let mut client = connect(addr);
        client.write_all(b"set k 2\r\nhi\r\nget k\r\n").unwrap();

        let expected = b"STORED\r\nVALUE k 0 2\r\nhi\r\nEND\r\n";
        let mut buf = vec![0u8; expected.len()];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &expected[..]);

        let started = Instant::now();
        worker.stop();
        worker.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));

        // The connection was closed when the worker exited
        let mut rest = [0u8; 8];
        assert_eq!(client.read(&mut rest).unwrap_or(0), 0);
    }

    #[test]
    fn test_listener_shutdown_while_running_is_fatal() {
        let (mut worker, _) = create_worker(1);
        let (listener, _) = create_listener();
        worker.start(listener).unwrap();

        let result = worker.join();
        assert!(matches!(result, Err(WorkerError::ListenerClosed)));
    }

    #[test]
    fn test_start_twice() {
        let (mut worker, _) = create_worker(2);
        let (listener, _) = create_listener();
        worker.start(listener.clone()).unwrap();

        assert!(matches!(
            worker.start(listener),
            Err(WorkerError::AlreadyStarted)
        ));

        worker.stop();
        worker.join().unwrap();
    }

    #[test]
    fn test_closed_clients_are_removed() {
        let (mut worker, stats) = create_worker(3);
        let (listener, addr) = create_listener();
        worker.start(listener).unwrap();

        for _ in 0..5 {
            let mut client = connect(addr);
            client.write_all(b"version\r\n").unwrap();
            let mut buf = [0u8; 64];
            assert!(client.read(&mut buf).unwrap() > 0);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while stats.active_connections.load(Ordering::Relaxed) > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(stats.active_connections.load(Ordering::Relaxed), 0);
        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 5);

        worker.stop();
        worker.join().unwrap();
    }

    #[test]
    fn test_more_clients_than_events_per_wait() {
        let (worker, stats) = create_worker(5);
        let mut worker = worker.with_events_capacity(4);
        let (listener, addr) = create_listener();
        worker.start(listener).unwrap();

        let mut clients: Vec<TcpStream> = (0..20).map(|_| connect(addr)).collect();

        // Every client has a request in flight before any reply is read
        for (i, client) in clients.iter_mut().enumerate() {
            client
                .write_all(format!("set c{} 1\r\n{}\r\nget c{}\r\n", i, i % 10, i).as_bytes())
                .unwrap();
        }

        for (i, client) in clients.iter_mut().enumerate() {
            let expected = format!("STORED\r\nVALUE c{} 0 1\r\n{}\r\nEND\r\n", i, i % 10);
            let mut buf = vec![0u8; expected.len()];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(String::from_utf8(buf).unwrap(), expected);
        }

        assert_eq!(stats.connections_accepted.load(Ordering::Relaxed), 20);

        drop(clients);
        worker.stop();
        worker.join().unwrap();
    }

    #[test]
    fn test_join_without_start() {
        let (mut worker, _) = create_worker(4);
        assert!(worker.join().is_ok());
    }
}
