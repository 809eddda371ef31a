//! Listening socket setup and readiness trigger modes.
//!
//! `mio` registers every source edge-triggered. Level-triggered behavior is
//! emulated by handling a single accept or read per event and re-registering
//! the source afterwards, which makes the poller report any readiness that is
//! still pending.

use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use mio::net::TcpListener;
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{ReactorError, ReactorResult};

/// How readiness is consumed on the listening socket and on connections.
///
/// Configured as an integer: 0 = both level-triggered, 1 = connections
/// edge-triggered, 2 = listener edge-triggered, 3 = both edge-triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum TriggerMode {
    Level,
    ConnEdge,
    ListenEdge,
    Edge,
}

impl TriggerMode {
    /// Whether the accept loop drains the whole backlog per event.
    pub fn listener_edge(self) -> bool {
        matches!(self, TriggerMode::ListenEdge | TriggerMode::Edge)
    }

    /// Whether connection reads and writes loop until `WouldBlock`.
    pub fn conn_edge(self) -> bool {
        matches!(self, TriggerMode::ConnEdge | TriggerMode::Edge)
    }
}

impl Default for TriggerMode {
    fn default() -> Self {
        TriggerMode::Edge
    }
}

impl TryFrom<u8> for TriggerMode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TriggerMode::Level),
            1 => Ok(TriggerMode::ConnEdge),
            2 => Ok(TriggerMode::ListenEdge),
            3 => Ok(TriggerMode::Edge),
            other => Err(format!("trigger mode must be 0-3, got {}", other)),
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = |edge: bool| if edge { "ET" } else { "LT" };
        write!(
            f,
            "listen: {}, conn: {}",
            mode(self.listener_edge()),
            mode(self.conn_edge())
        )
    }
}

/// Options applied to the listening socket before it starts listening.
#[derive(Debug, Clone, Copy)]
pub struct ListenOptions {
    pub backlog: i32,
    /// Linger on close until queued data is sent or one second passes.
    pub linger: bool,
}

/// Binds a non-blocking listener with `SO_REUSEADDR`.
///
/// # Errors
/// Returns `ReactorError::Bind` if the socket cannot be created, bound or put
/// into listening state.
pub fn bind_listener(addr: SocketAddr, opts: ListenOptions) -> ReactorResult<TcpListener> {
    let bind_err = |source: io::Error| ReactorError::Bind { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    if opts.linger {
        socket
            .set_linger(Some(Duration::from_secs(1)))
            .map_err(bind_err)?;
    }
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(opts.backlog).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    Ok(TcpListener::from_std(socket.into()))
}
