use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Represents errors that can occur in the worker thread pool.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// Error when spawning a new thread fails
    #[error("thread spawn failed: {0}")]
    ThreadSpawn(io::Error),

    /// The pool has been shut down and no longer accepts tasks
    #[error("thread pool is closed")]
    Closed,

    /// A pool was requested with zero worker threads
    #[error("thread pool needs at least one worker")]
    NoWorkers,
}

/// Represents errors that can occur in the reactor responsible for I/O events.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Error during reactor initialization
    #[error("reactor initialization failed: {0}")]
    Init(io::Error),

    /// The listening socket could not be bound or put into listening state
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The configured host/port pair is not a valid socket address
    #[error("invalid listen address: {0}")]
    Address(String),

    /// Error when registering resources with the reactor
    #[error("registration failed: {0}")]
    Registration(io::Error),

    /// Error during event polling operations
    #[error("polling failed: {0}")]
    Polling(io::Error),

    /// The worker pool could not be started
    #[error("worker pool: {0}")]
    Executor(#[from] ExecutorError),

    /// Wrapper for standard I/O errors
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while parsing an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// The request line did not look like `METHOD PATH HTTP/VERSION`
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    /// The method token is not a valid HTTP method
    #[error("invalid method: {0:?}")]
    InvalidMethod(String),

    /// A request line or header grew past the line limit without a CRLF
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
}

/// Errors of the credential connection pool and its backends.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection was returned to the pool within the wait bound
    #[error("timed out waiting for a pooled connection")]
    Timeout,

    /// The pool was closed
    #[error("connection pool is closed")]
    Closed,

    /// Error when a mutex lock becomes poisoned due to a panic in another thread
    #[error("mutex lock poisoned")]
    LockPoisoned,

    /// The backend rejected a query
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors raised while installing the file log sink.
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("a global logger is already installed")]
    AlreadyInstalled(#[from] log::SetLoggerError),
}

/// Type alias for Results using ExecutorError as the error type
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Type alias for Results using ReactorError as the error type
pub type ReactorResult<T> = std::result::Result<T, ReactorError>;

/// Type alias for Results using PoolError as the error type
pub type PoolResult<T> = std::result::Result<T, PoolError>;
