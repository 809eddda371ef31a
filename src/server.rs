//! The readiness reactor.
//!
//! One thread owns the `mio::Poll`, every (re)registration and the timeout
//! heap. Read and write work is handed to the worker pool together with the
//! connection itself; the slot stays marked in flight until the worker sends
//! the connection back, so events arriving meanwhile are ignored and each
//! connection has at most one task at a time.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::ServerConfig;
use crate::conn::{ConnContext, Connection, Next};
use crate::db::UserVerifier;
use crate::error::{ReactorError, ReactorResult};
use crate::executor::ThreadPool;
use crate::net::{self, TriggerMode};
use crate::timer::HeapTimer;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CLIENT: usize = 2;

const MAX_EVENTS: usize = 1024;

/// A connection table entry.
enum Slot {
    Idle(Box<Connection>),
    /// The connection is owned by a worker task. `evict` records a timeout
    /// that fired meanwhile.
    InFlight { evict: bool },
}

/// A worker handing a connection back to the reactor.
enum Completion {
    Done {
        token: Token,
        conn: Box<Connection>,
        next: Next,
    },
    /// The task was dropped or panicked and took the connection with it.
    Aborted(Token),
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Read,
    Write,
}

/// Return path for one task. Reports `Aborted` if dropped unsent.
struct Reply {
    token: Token,
    tx: Sender<Completion>,
    waker: Arc<Waker>,
    sent: bool,
}

impl Reply {
    fn send(mut self, conn: Box<Connection>, next: Next) {
        self.sent = true;
        let _ = self.tx.send(Completion::Done {
            token: self.token,
            conn,
            next,
        });
        let _ = self.waker.wake();
    }
}

impl Drop for Reply {
    fn drop(&mut self) {
        if !self.sent {
            let _ = self.tx.send(Completion::Aborted(self.token));
            let _ = self.waker.wake();
        }
    }
}

/// Stops a running server from another thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    running: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::error!("Failed to wake reactor for shutdown: {}", e);
        }
    }
}

impl fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

pub struct Server {
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    timer: HeapTimer<Token>,
    pool: ThreadPool,
    slots: HashMap<Token, Slot>,
    next_token: usize,
    done_tx: Sender<Completion>,
    done_rx: Receiver<Completion>,
    expired_tx: Sender<Token>,
    expired_rx: Receiver<Token>,
    trig_mode: TriggerMode,
    timeout: Option<Duration>,
    max_connections: usize,
    ctx: Arc<ConnContext>,
    running: Arc<AtomicBool>,
}

impl Server {
    /// Binds the listening socket and starts the worker pool.
    ///
    /// # Errors
    /// Fails if the address does not resolve, the socket cannot be bound or
    /// the poller or workers cannot be started.
    pub fn new(config: &ServerConfig, users: Arc<dyn UserVerifier>) -> ReactorResult<Self> {
        let addr = config.addr()?;
        let mut listener = net::bind_listener(addr, config.listen_options())?;

        let poll = Poll::new().map_err(ReactorError::Init)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ReactorError::Registration)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(ReactorError::Init)?);

        let pool = ThreadPool::new(config.threads.max(1))?;

        let (done_tx, done_rx) = mpsc::channel();
        let (expired_tx, expired_rx) = mpsc::channel();

        log::info!("========== Server init ==========");
        log::info!("Port: {}, OpenLinger: {}", config.port, config.opt_linger);
        log::info!("Listen Mode: {}", config.trig_mode);
        log::info!("srcDir: {}", config.src_dir.display());
        log::info!(
            "Worker threads: {}, timeout: {:?}",
            config.threads.max(1),
            config.timeout()
        );

        Ok(Self {
            poll,
            listener,
            waker,
            timer: HeapTimer::new(),
            pool,
            slots: HashMap::new(),
            next_token: FIRST_CLIENT,
            done_tx,
            done_rx,
            expired_tx,
            expired_rx,
            trig_mode: config.trig_mode,
            timeout: config.timeout(),
            max_connections: config.max_connections,
            ctx: Arc::new(ConnContext {
                src_dir: config.src_dir.clone(),
                users,
                edge_triggered: config.trig_mode.conn_edge(),
            }),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            running: Arc::clone(&self.running),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Connections currently open.
    pub fn user_count(&self) -> usize {
        self.slots.len()
    }

    /// Runs the event loop until a `ShutdownHandle` stops it.
    ///
    /// # Errors
    /// Returns `ReactorError::Polling` if waiting for events fails.
    pub fn run(&mut self) -> ReactorResult<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        log::info!("========== Server start ==========");

        while self.running.load(Ordering::Acquire) {
            let wait = match self.timeout {
                Some(_) => self.timer.next_tick(),
                None => None,
            };
            self.evict_expired();

            if let Err(e) = self.poll.poll(&mut events, wait) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("Polling error: {}", e);
                return Err(ReactorError::Polling(e));
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept(),
                    WAKER => {}
                    token => self.dispatch(token, event),
                }
            }
            self.drain_completions();
        }

        self.stop();
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("Accept error: {}", e);
                    break;
                }
            };

            if self.user_count() >= self.max_connections {
                send_error(stream, "Server busy!");
                log::warn!("Clients is full!");
            } else {
                self.add_client(stream, addr);
            }

            if !self.trig_mode.listener_edge() {
                // Re-registering makes the poller report a remaining backlog again.
                if let Err(e) =
                    self.poll
                        .registry()
                        .reregister(&mut self.listener, LISTENER, Interest::READABLE)
                {
                    log::error!("Failed to re-arm listener: {}", e);
                }
                break;
            }
        }
    }

    fn add_client(&mut self, stream: TcpStream, addr: SocketAddr) {
        let token = Token(self.next_token);
        self.next_token += 1;

        let mut conn = Box::new(Connection::new(stream, addr, Arc::clone(&self.ctx)));
        if let Err(e) = self
            .poll
            .registry()
            .register(conn.stream_mut(), token, Interest::READABLE)
        {
            log::error!("Failed to register client {}: {}", addr, e);
            return;
        }

        if let Some(timeout) = self.timeout {
            let expired = self.expired_tx.clone();
            self.timer.add(token, timeout, move || {
                let _ = expired.send(token);
            });
        }
        self.slots.insert(token, Slot::Idle(conn));
        log::info!("Client[{}]({}) in! userCount: {}", token.0, addr, self.user_count());
    }

    fn dispatch(&mut self, token: Token, event: &Event) {
        match self.slots.get(&token) {
            Some(Slot::Idle(_)) => {}
            Some(Slot::InFlight { .. }) | None => return,
        }

        if event.is_error() || event.is_read_closed() || event.is_write_closed() {
            self.close_conn(token, None);
        } else if event.is_readable() {
            self.extend_time(token);
            self.spawn(token, Op::Read);
        } else if event.is_writable() {
            self.extend_time(token);
            self.spawn(token, Op::Write);
        } else {
            log::error!("Unexpected event for client[{}]: {:?}", token.0, event);
        }
    }

    fn extend_time(&mut self, token: Token) {
        if let Some(timeout) = self.timeout {
            self.timer.adjust(token, timeout);
        }
    }

    /// Moves the connection into a worker task.
    fn spawn(&mut self, token: Token, op: Op) {
        let conn = match self.slots.insert(token, Slot::InFlight { evict: false }) {
            Some(Slot::Idle(conn)) => conn,
            Some(busy) => {
                self.slots.insert(token, busy);
                return;
            }
            None => {
                self.slots.remove(&token);
                return;
            }
        };

        let reply = Reply {
            token,
            tx: self.done_tx.clone(),
            waker: Arc::clone(&self.waker),
            sent: false,
        };
        let queued = self.pool.execute(move || {
            let mut conn = conn;
            let next = match op {
                Op::Read => conn.handle_read(),
                Op::Write => conn.handle_write(),
            };
            reply.send(conn, next);
        });
        // A rejected task is dropped, so its reply reports the abort.
        if let Err(e) = queued {
            log::error!("Failed to queue {:?} for client[{}]: {}", op, token.0, e);
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.done_rx.try_recv() {
            match completion {
                Completion::Done { token, conn, next } => self.complete(token, conn, next),
                Completion::Aborted(token) => {
                    log::warn!("Task for client[{}] aborted", token.0);
                    self.close_conn(token, None);
                }
            }
        }
    }

    /// Takes a connection back from a worker and re-arms it.
    fn complete(&mut self, token: Token, mut conn: Box<Connection>, next: Next) {
        let evict = match self.slots.get(&token) {
            Some(Slot::InFlight { evict }) => *evict,
            _ => {
                log::error!("Completion for unknown client[{}]", token.0);
                conn.close();
                return;
            }
        };
        if evict {
            log::info!("Client[{}] timed out", token.0);
        }

        let interest = match next {
            _ if evict => None,
            Next::Read => Some(Interest::READABLE),
            Next::Write => Some(Interest::WRITABLE),
            Next::Close => None,
        };
        let Some(interest) = interest else {
            self.close_conn(token, Some(conn));
            return;
        };

        if let Err(e) = self
            .poll
            .registry()
            .reregister(conn.stream_mut(), token, interest)
        {
            log::error!("Failed to re-arm client[{}]: {}", token.0, e);
            self.close_conn(token, Some(conn));
            return;
        }
        self.slots.insert(token, Slot::Idle(conn));
    }

    /// Closes idle connections whose timer fired; in-flight ones are marked
    /// and closed when their task returns.
    fn evict_expired(&mut self) {
        while let Ok(token) = self.expired_rx.try_recv() {
            match self.slots.get_mut(&token) {
                Some(Slot::InFlight { evict }) => *evict = true,
                Some(Slot::Idle(_)) => {
                    log::info!("Client[{}] timed out", token.0);
                    self.close_conn(token, None);
                }
                None => {}
            }
        }
    }

    /// Removes the slot, which happens exactly once per connection, then
    /// releases everything the connection holds.
    fn close_conn(&mut self, token: Token, returned: Option<Box<Connection>>) {
        let conn = match self.slots.remove(&token) {
            Some(Slot::Idle(conn)) => Some(conn),
            Some(Slot::InFlight { .. }) => returned,
            None => return,
        };
        self.timer.cancel(token);

        match conn {
            Some(mut conn) => {
                if let Err(e) = self.poll.registry().deregister(conn.stream_mut()) {
                    log::debug!("Deregister client[{}] failed: {}", token.0, e);
                }
                conn.close();
                log::info!(
                    "Client[{}]({}) quit, userCount: {}",
                    token.0,
                    conn.addr(),
                    self.user_count()
                );
            }
            None => log::info!("Client[{}] quit, userCount: {}", token.0, self.user_count()),
        }
    }

    /// Waits for running tasks, then closes every connection.
    fn stop(&mut self) {
        self.pool.shutdown();
        while let Ok(completion) = self.done_rx.try_recv() {
            match completion {
                Completion::Done { token, conn, .. } => self.close_conn(token, Some(conn)),
                Completion::Aborted(token) => self.close_conn(token, None),
            }
        }

        let tokens: Vec<Token> = self.slots.keys().copied().collect();
        for token in tokens {
            self.close_conn(token, None);
        }
        self.timer.clear();
        log::info!("========== Server stop ==========");
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.listener.local_addr().ok())
            .field("trig_mode", &self.trig_mode)
            .field("timeout", &self.timeout)
            .field("connections", &self.slots.len())
            .finish()
    }
}

/// Best-effort notice to a client that is turned away.
fn send_error(mut stream: TcpStream, message: &str) {
    if let Err(e) = stream.write(message.as_bytes()) {
        log::warn!("send error to client failed: {}", e);
    }
}
