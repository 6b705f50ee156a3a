//! Server
//!
//! Binds the listening socket and runs a fixed number of workers on it.
//! All workers share the listener, the storage engine and the connection
//! statistics.

use crate::commands::CommandHandler;
use crate::connection::ConnectionStats;
use crate::network::worker::{Worker, WorkerError};
use crate::storage::Storage;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Listen backlog used by default
pub const DEFAULT_BACKLOG: i32 = 128;

/// Number of workers used by default
pub const DEFAULT_WORKERS: usize = 4;

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind to (IPv4 address or name resolving to one)
    pub host: String,
    /// Port to listen on, 0 picks a free port
    pub port: u16,
    /// Number of worker threads
    pub workers: usize,
    /// Listen backlog
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: crate::DEFAULT_HOST.to_string(),
            port: crate::DEFAULT_PORT,
            workers: DEFAULT_WORKERS,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

/// Errors from starting or joining the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to resolve '{host}': {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no IPv4 address found for '{0}'")]
    NoIpv4Address(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// The cache server: a listener served by a pool of workers.
pub struct Server {
    command_handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    workers: Vec<Worker>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Creates a stopped server on top of `storage`.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        let stats = Arc::new(ConnectionStats::new());
        Self {
            command_handler: CommandHandler::new(storage, stats.clone()),
            stats,
            workers: Vec::new(),
            local_addr: None,
        }
    }

    /// Binds the listener and starts the workers.
    ///
    /// # Returns
    ///
    /// The address actually bound, which differs from the configured one
    /// when port 0 was requested.
    pub fn start(&mut self, config: &ServerConfig) -> Result<SocketAddr, ServerError> {
        if !self.workers.is_empty() {
            return Err(ServerError::AlreadyStarted);
        }

        let addr = resolve(&config.host, config.port)?;
        let listener = bind(addr, config.backlog).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        let listener = Arc::new(listener);

        for id in 0..config.workers.max(1) {
            let mut worker = Worker::new(id, self.command_handler.clone(), self.stats.clone());
            if let Err(e) = worker.start(listener.clone()) {
                error!(worker = id, error = %e, "Failed to start worker");
                self.workers.push(worker);
                self.stop();
                let _ = self.join();
                return Err(e.into());
            }
            self.workers.push(worker);
        }

        info!(addr = %local_addr, workers = self.workers.len(), "Server listening");
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Asks every worker to stop. Does not wait.
    pub fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }

    /// Waits for every worker to exit.
    ///
    /// Returns the first worker failure; the remaining workers are still
    /// joined.
    pub fn join(&mut self) -> Result<(), ServerError> {
        let mut first_error = None;

        for mut worker in self.workers.drain(..) {
            if let Err(e) = worker.join() {
                error!(worker = worker.id(), error = %e, "Worker exited with error");
                first_error.get_or_insert(e);
            }
        }

        self.local_addr = None;
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Address the server is listening on, if started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Connection statistics shared by all workers.
    pub fn stats(&self) -> &Arc<ConnectionStats> {
        &self.stats
    }
}

/// Resolves `host:port` to its first IPv4 address.
fn resolve(host: &str, port: u16) -> Result<SocketAddr, ServerError> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| ServerError::Resolve {
            host: host.to_string(),
            source,
        })?;

    addrs
        .into_iter()
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| ServerError::NoIpv4Address(host.to_string()))
}

/// Creates a non-blocking IPv4 listener with `SO_REUSEADDR`.
fn bind(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}
