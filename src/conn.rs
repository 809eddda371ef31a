//! Per-socket connection state.
//!
//! A `Connection` is owned by exactly one party at a time: the reactor's
//! connection table while it waits for readiness, or a worker task while it
//! performs I/O. The `handle_*` methods run on workers and report which
//! interest the reactor should re-arm next.

use std::fmt;
use std::io::{self, IoSlice, Write};
use std::net::{Shutdown, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use hyper::StatusCode;
use mio::net::TcpStream;

use crate::buffer::Buffer;
use crate::db::UserVerifier;
use crate::http::{HttpRequest, HttpResponse};

/// Level-triggered writes keep going while more than this much is pending.
const WRITE_CONTINUE_THRESHOLD: usize = 10_240;

/// Settings and services shared by every connection of a server.
pub struct ConnContext {
    pub src_dir: PathBuf,
    pub users: Arc<dyn UserVerifier>,
    /// Read and write until `WouldBlock` instead of once per event.
    pub edge_triggered: bool,
}

impl fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnContext")
            .field("src_dir", &self.src_dir)
            .field("edge_triggered", &self.edge_triggered)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Accepted,
    Reading,
    Processing,
    Writing,
    Closed,
}

/// What the reactor does with a connection after a task returns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    /// Re-arm read interest.
    Read,
    /// Re-arm write interest.
    Write,
    Close,
}

pub struct Connection {
    stream: TcpStream,
    addr: SocketAddr,
    read_buf: Buffer,
    write_buf: Buffer,
    request: HttpRequest,
    response: HttpResponse,
    /// How much of the response payload has been sent.
    file_pos: usize,
    keep_alive: bool,
    state: ConnState,
    ctx: Arc<ConnContext>,
}

impl Connection {
    pub fn new(stream: TcpStream, addr: SocketAddr, ctx: Arc<ConnContext>) -> Self {
        Self {
            stream,
            addr,
            read_buf: Buffer::default(),
            write_buf: Buffer::default(),
            request: HttpRequest::new(),
            response: HttpResponse::new(),
            file_pos: 0,
            keep_alive: false,
            state: ConnState::Accepted,
            ctx,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The socket, for (re)registration with the poller.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    /// Bytes of the current response not yet written.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes() + self.response.file_len() - self.file_pos
    }

    /// Reads what the socket has into the read buffer.
    ///
    /// Returns the number of bytes read, 0 meaning the peer closed without
    /// sending anything more. `WouldBlock` is only returned when nothing was
    /// read.
    pub fn read(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_from(&mut self.stream) {
                Ok(0) => return Ok(total),
                Ok(n) => {
                    total += n;
                    if !self.ctx.edge_triggered {
                        return Ok(total);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock && total > 0 => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }

    /// Sends the header buffer and payload with vectored writes.
    pub fn write(&mut self) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let header = self.write_buf.peek();
            let payload = &self.response.file()[self.file_pos..];
            if header.is_empty() && payload.is_empty() {
                break;
            }
            let header_len = header.len();

            let n = match self
                .stream
                .write_vectored(&[IoSlice::new(header), IoSlice::new(payload)])
            {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };

            if n > header_len {
                self.file_pos += n - header_len;
                self.write_buf.retrieve_all();
            } else {
                self.write_buf.retrieve(n);
            }
            total += n;

            if !self.ctx.edge_triggered && self.to_write_bytes() <= WRITE_CONTINUE_THRESHOLD {
                break;
            }
        }
        Ok(total)
    }

    /// Advances the parser over buffered bytes. Once a request is complete
    /// (or rejected) the response is staged and `true` is returned.
    pub fn process(&mut self) -> bool {
        if self.read_buf.readable_bytes() == 0 {
            return false;
        }
        self.state = ConnState::Processing;

        let src_dir = &self.ctx.src_dir;
        match self.request.parse(&mut self.read_buf, &*self.ctx.users) {
            Ok(false) => return false,
            Ok(true) => {
                log::debug!("{} {}", self.request.method(), self.request.path());
                self.response.init(
                    src_dir,
                    self.request.path(),
                    self.request.is_keep_alive(),
                    Some(StatusCode::OK),
                );
            }
            Err(e) => {
                log::debug!("bad request from {}: {}", self.addr, e);
                self.read_buf.retrieve_all();
                self.response
                    .init(src_dir, self.request.path(), false, Some(StatusCode::BAD_REQUEST));
            }
        }

        self.keep_alive = self.response.keep_alive();
        self.response.make_response(&mut self.write_buf);
        self.file_pos = 0;
        self.request.init();
        self.state = ConnState::Writing;

        log::debug!(
            "response staged for {}: {} bytes pending",
            self.addr,
            self.to_write_bytes()
        );
        true
    }

    /// Read task body.
    pub fn handle_read(&mut self) -> Next {
        self.state = ConnState::Reading;
        match self.read() {
            Ok(0) => Next::Close,
            Ok(_) => self.on_process(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Next::Read,
            Err(e) => {
                log::debug!("read from {} failed: {}", self.addr, e);
                Next::Close
            }
        }
    }

    /// Write task body.
    pub fn handle_write(&mut self) -> Next {
        self.state = ConnState::Writing;
        let result = self.write();

        if self.to_write_bytes() == 0 {
            self.response.release_file();
            if self.keep_alive {
                return self.on_process();
            }
            return Next::Close;
        }

        match result {
            Ok(_) => Next::Write,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Next::Write,
            Err(e) => {
                log::debug!("write to {} failed: {}", self.addr, e);
                Next::Close
            }
        }
    }

    fn on_process(&mut self) -> Next {
        if self.process() {
            Next::Write
        } else {
            self.state = ConnState::Reading;
            Next::Read
        }
    }

    /// Releases the payload and shuts the socket down. Idempotent.
    pub fn close(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        self.state = ConnState::Closed;
        self.response.release_file();
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("keep_alive", &self.keep_alive)
            .field("pending", &self.to_write_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryBackend;
    use std::fs;
    use std::io::Read;
    use std::net::TcpListener;
    use std::thread;
    use std::time::{Duration, Instant};

    fn site(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sparrow-conn-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let index = dir.join("index.html");
        fs::write(&index, "<p>index</p>").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&index, fs::Permissions::from_mode(0o644)).unwrap();
        }
        dir
    }

    /// A connected pair: the server side wrapped in a `Connection`.
    fn pair(src_dir: PathBuf, edge_triggered: bool) -> (Connection, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let (server, addr) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();

        let ctx = Arc::new(ConnContext {
            src_dir,
            users: Arc::new(MemoryBackend::new().pool(1, Duration::from_millis(50))),
            edge_triggered,
        });
        (Connection::new(TcpStream::from_std(server), addr, ctx), client)
    }

    /// Retries the read task until the sent bytes have arrived.
    fn read_until_ready(conn: &mut Connection) -> Next {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let next = conn.handle_read();
            if next != Next::Read || Instant::now() > deadline {
                return next;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Reads from the client until the response ends with `tail`.
    fn read_response(client: &mut std::net::TcpStream, tail: &str) -> String {
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        while !out.ends_with(tail.as_bytes()) {
            let n = client.read(&mut chunk).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_keep_alive_request_returns_to_reading() {
        let (mut conn, mut client) = pair(site("keepalive"), true);
        client
            .write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();

        assert_eq!(read_until_ready(&mut conn), Next::Write);
        assert_eq!(conn.state(), ConnState::Writing);
        assert!(conn.is_keep_alive());
        assert!(conn.to_write_bytes() > 12);

        assert_eq!(conn.handle_write(), Next::Read);
        assert_eq!(conn.to_write_bytes(), 0);
        assert_eq!(conn.state(), ConnState::Reading);

        let response = read_response(&mut client, "<p>index</p>");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Connection: keep-alive\r\n"));
        assert!(response.contains("Content-length: 12\r\n"));
    }

    #[test]
    fn test_malformed_request_gets_400_and_closes() {
        let (mut conn, mut client) = pair(site("malformed"), false);
        client.write_all(b"NONSENSE\r\n\r\n").unwrap();

        assert_eq!(read_until_ready(&mut conn), Next::Write);
        assert!(!conn.is_keep_alive());
        assert_eq!(conn.handle_write(), Next::Close);
        conn.close();

        let mut response = String::new();
        client.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(response.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_partial_request_waits_for_more() {
        let (mut conn, mut client) = pair(site("partial"), true);
        client.write_all(b"GET /index HTTP/1.1\r\nHo").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(conn.handle_read(), Next::Read);
        assert_eq!(conn.state(), ConnState::Reading);

        client.write_all(b"st: x\r\n\r\n").unwrap();
        assert_eq!(read_until_ready(&mut conn), Next::Write);
    }

    #[test]
    fn test_peer_close_is_reported() {
        let (mut conn, client) = pair(site("eof"), true);
        drop(client);
        assert_eq!(read_until_ready(&mut conn), Next::Close);

        conn.close();
        conn.close();
        assert_eq!(conn.state(), ConnState::Closed);
    }
}
