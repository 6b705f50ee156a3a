//! FlashCache - A memcached-compatible In-Memory Cache Server
//!
//! This is the main entry point for the FlashCache server.
//! It sets up logging, the storage engine and the worker pool, then waits
//! for Ctrl+C.

use flashcache::network::{Server, ServerConfig};
use flashcache::storage::{LruStorage, DEFAULT_CAPACITY};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Server configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Number of worker threads
    workers: usize,
    /// Cache size in bytes
    memory: usize,
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            host: server.host,
            port: server.port,
            workers: server.workers,
            memory: DEFAULT_CAPACITY,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value_of(&args, i, "--host").to_string();
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = value_of(&args, i, "--port").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--workers" | "-w" => {
                    config.workers = match value_of(&args, i, "--workers").parse() {
                        Ok(n) if n > 0 => n,
                        _ => {
                            eprintln!("Error: --workers must be a positive number");
                            std::process::exit(1);
                        }
                    };
                    i += 2;
                }
                "--memory" | "-m" => {
                    let megabytes: usize = value_of(&args, i, "--memory").parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid memory size");
                        std::process::exit(1);
                    });
                    config.memory = megabytes * 1024 * 1024;
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("FlashCache version {}", flashcache::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    /// Returns the bind address as a string
    fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            workers: self.workers,
            ..ServerConfig::default()
        }
    }
}

/// Returns the value following the flag at `i`, or exits.
fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"
FlashCache - A memcached-compatible In-Memory Cache Server

USAGE:
    flashcache [OPTIONS]

OPTIONS:
    -h, --host <HOST>        Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>        Port to listen on (default: 11211)
    -w, --workers <N>        Number of worker threads (default: 4)
    -m, --memory <MB>        Cache size in megabytes (default: 64)
    -v, --version            Print version information
        --help               Print this help message

ENVIRONMENT:
    RUST_LOG                 Log filter (default: info)

EXAMPLES:
    flashcache                         # Start on 127.0.0.1:11211
    flashcache --port 11212            # Start on port 11212
    flashcache --host 0.0.0.0 -w 8     # All interfaces, 8 workers

CONNECTING:
    Any memcached client works, or plain telnet:
    $ telnet 127.0.0.1 11211
    set name 4
    Ariz
    STORED
    get name
    VALUE name 0 4
    Ariz
    END
"#
    );
}

fn print_banner(config: &Config, addr: std::net::SocketAddr) {
    println!(
        r#"
FlashCache v{} - memcached-compatible In-Memory Cache
──────────────────────────────────────────────────────────────
Server started on {} ({} workers, {} MB)
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        flashcache::VERSION,
        addr,
        config.workers,
        config.memory / (1024 * 1024)
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_names(true)
        .init();

    // Create the storage engine (shared across all workers)
    let storage = Arc::new(LruStorage::new(config.memory));
    info!(capacity = config.memory, "Storage engine initialized");

    // Bind the listener and start the workers
    let mut server = Server::new(storage);
    let addr = server.start(&config.server_config())?;
    info!("Listening on {}", config.bind_address());

    print_banner(&config, addr);

    signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping server...");

    server.stop();
    tokio::task::spawn_blocking(move || server.join()).await??;

    info!("Server shutdown complete");
    Ok(())
}
