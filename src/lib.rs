#![allow(clippy::return_self_not_must_use)]
#![doc = include_str!("../README.md")]

//! # Sparrow
//!
//! A small non-blocking HTTP server core: a single `mio` reactor thread
//! backed by a fixed pool of worker threads.
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use sparrow::{MemoryBackend, Server, ServerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig::new()?;
//!     let users = Arc::new(MemoryBackend::new().pool(4, Duration::from_secs(1)));
//!     Server::new(&config, users)?.run()?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//! - `Server`: owns the listener and the poller, accepts clients, evicts idle
//!   ones through a `HeapTimer` and re-arms readiness after each task
//! - `Connection`: buffers, parser and response of one client, moved into a
//!   worker task for every read or write
//! - `ThreadPool`: fixed workers draining a FIFO task queue
//! - `HttpRequest` / `HttpResponse`: restartable line parser and static-file
//!   response builder
//! - `ConnPool`: bounded pool of credential store connections
//! - `FileLogger`: file sink for the `log` facade
//!
//! ## Configuration
//! Server settings can be configured via:
//! - Environment variables (prefixed with `SPARROW_`)
//! - Configuration file (`config.toml`)

pub use crate::buffer::Buffer;
pub use crate::config::ServerConfig;
pub use crate::conn::{ConnContext, ConnState, Connection, Next};
pub use crate::db::{verify_user, ConnPool, MemoryBackend, PooledConn, UserBackend, UserVerifier};
pub use crate::error::{ExecutorError, LoggerError, ParseError, PoolError, ReactorError};
pub use crate::executor::ThreadPool;
pub use crate::http::{content_type, parse_urlencoded, HttpRequest, HttpResponse, ParseState};
pub use crate::logger::FileLogger;
pub use crate::net::{bind_listener, ListenOptions, TriggerMode};
pub use crate::server::{Server, ShutdownHandle};
pub use crate::timer::HeapTimer;

mod buffer;
mod config;
mod conn;
mod db;
mod error;
mod executor;
mod http;
mod logger;
mod net;
mod server;
mod timer;

// Re-export common types
pub use hyper::{Method, StatusCode};
