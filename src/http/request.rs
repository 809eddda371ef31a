use std::collections::HashMap;
use std::fmt;

use hyper::Method;

use crate::buffer::Buffer;
use crate::db::UserVerifier;
use crate::error::ParseError;

/// Bare resource names that are served as `<name>.html`.
const DEFAULT_HTML: [&str; 6] = ["/index", "/register", "/login", "/welcome", "/video", "/picture"];

/// Longest request line or header accepted, CRLF excluded.
pub const MAX_LINE_LEN: usize = 8192;

/// Where a request stands in the line-oriented parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// Form targets that go through credential verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormAction {
    Register,
    Login,
}

impl FormAction {
    fn for_path(path: &str) -> Option<Self> {
        match path {
            "/register.html" => Some(Self::Register),
            "/login.html" => Some(Self::Login),
            _ => None,
        }
    }
}

/// An incrementally parsed HTTP request.
///
/// `parse` can be called repeatedly as bytes arrive on the connection; it
/// picks up from the stored state. `init` clears everything for the next
/// request on the same connection.
pub struct HttpRequest {
    method: Method,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: String,
    post: HashMap<String, String>,
    state: ParseState,
    /// Unread bytes already searched for a CRLF.
    scanned: usize,
}

impl HttpRequest {
    pub fn new() -> Self {
        Self {
            method: Method::GET,
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: String::new(),
            post: HashMap::new(),
            state: ParseState::RequestLine,
            scanned: 0,
        }
    }

    /// Resets the parser between requests.
    pub fn init(&mut self) {
        self.method = Method::GET;
        self.path.clear();
        self.version.clear();
        self.body.clear();
        self.headers.clear();
        self.post.clear();
        self.state = ParseState::RequestLine;
        self.scanned = 0;
    }

    /// Consumes complete lines from `buf` and advances the state machine.
    ///
    /// Returns `Ok(true)` once the request is complete. `Ok(false)` means more
    /// bytes are needed: an unterminated request line or header stays in the
    /// buffer, while an unterminated body line is taken as the whole body.
    ///
    /// # Errors
    /// `LineTooLong` once a request line or header passes `MAX_LINE_LEN`,
    /// terminated or not.
    pub fn parse(&mut self, buf: &mut Buffer, users: &dyn UserVerifier) -> Result<bool, ParseError> {
        while buf.readable_bytes() > 0 && self.state != ParseState::Finish {
            let data = buf.peek();
            let in_body = self.state == ParseState::Body;
            let (line, consumed) = match find_crlf(data, self.scanned) {
                Some(end) if !in_body && end > MAX_LINE_LEN => {
                    return Err(ParseError::LineTooLong(MAX_LINE_LEN))
                }
                Some(end) => (String::from_utf8_lossy(&data[..end]).into_owned(), end + 2),
                None if in_body => (String::from_utf8_lossy(data).into_owned(), data.len()),
                None if data.len() > MAX_LINE_LEN + 1 => {
                    return Err(ParseError::LineTooLong(MAX_LINE_LEN))
                }
                None => {
                    // A trailing CR may still be completed by the next read.
                    self.scanned = data.len() - 1;
                    break;
                }
            };
            buf.retrieve_until(consumed);
            self.scanned = 0;

            match self.state {
                ParseState::RequestLine => {
                    self.parse_request_line(&line)?;
                    self.parse_path();
                }
                ParseState::Headers => self.parse_header(&line),
                ParseState::Body => self.parse_body(line, users),
                ParseState::Finish => unreachable!("loop exits on Finish"),
            }
        }

        log::debug!("[{}], [{}], [{}]", self.method, self.path, self.version);
        Ok(self.state == ParseState::Finish)
    }

    fn parse_request_line(&mut self, line: &str) -> Result<(), ParseError> {
        log::debug!("request line: [{}]", line);
        let malformed = || ParseError::MalformedRequestLine(line.to_owned());

        let (method, rest) = line.split_once(' ').ok_or_else(malformed)?;
        let (path, protocol) = rest.split_once(' ').ok_or_else(malformed)?;
        let version = protocol.strip_prefix("HTTP/").ok_or_else(malformed)?;
        if path.contains(' ') || version.contains(' ') {
            return Err(malformed());
        }

        self.method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ParseError::InvalidMethod(method.to_owned()))?;
        self.path = path.to_owned();
        self.version = version.to_owned();
        self.state = ParseState::Headers;
        Ok(())
    }

    fn parse_path(&mut self) {
        if self.path == "/" {
            self.path = "/index.html".to_owned();
        } else if DEFAULT_HTML.contains(&self.path.as_str()) {
            self.path.push_str(".html");
        }
    }

    /// A `Name: value` line is stored; anything else ends the header block.
    fn parse_header(&mut self, line: &str) {
        match line.split_once(':') {
            Some((name, value)) => {
                let value = value.strip_prefix(' ').unwrap_or(value);
                self.headers.insert(name.to_owned(), value.to_owned());
            }
            None if self.method == Method::POST => self.state = ParseState::Body,
            None => self.state = ParseState::Finish,
        }
    }

    /// The body is a single line; declared lengths are not honored.
    fn parse_body(&mut self, line: String, users: &dyn UserVerifier) {
        if self.method == Method::POST {
            log::debug!("body: [{}], len: {}", line, line.len());
            self.body = line;
            self.parse_post(users);
        }
        self.state = ParseState::Finish;
    }

    fn parse_post(&mut self, users: &dyn UserVerifier) {
        parse_urlencoded(&self.body, &mut self.post);

        if let Some(action) = FormAction::for_path(&self.path) {
            let is_login = action == FormAction::Login;
            let name = self.post.get("username").map(String::as_str).unwrap_or("");
            let password = self.post.get("password").map(String::as_str).unwrap_or("");

            self.path = if users.verify(name, password, is_login) {
                "/welcome.html".to_owned()
            } else {
                "/error.html".to_owned()
            };
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn post(&self, key: &str) -> Option<&str> {
        self.post.get(key).map(String::as_str)
    }

    /// Keep-alive is honored only for HTTP/1.1 with an explicit header.
    pub fn is_keep_alive(&self) -> bool {
        self.header("Connection") == Some("keep-alive") && self.version == "1.1"
    }
}

impl Default for HttpRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("version", &self.version)
            .field("state", &self.state)
            .finish()
    }
}

/// Offset of the first CRLF in `data`, searching from `from`.
fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    data.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| i + from)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decodes an `application/x-www-form-urlencoded` body into `out`.
///
/// Pairs closed by `&` overwrite earlier values; a trailing pair is only
/// added when its key is not present yet.
pub fn parse_urlencoded(body: &str, out: &mut HashMap<String, String>) {
    let bytes = body.as_bytes();
    let mut key: Option<Vec<u8>> = None;
    let mut current = Vec::new();

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'=' if key.is_none() => key = Some(std::mem::take(&mut current)),
            b'+' => current.push(b' '),
            b'%' => {
                let decoded = bytes
                    .get(i + 1)
                    .zip(bytes.get(i + 2))
                    .and_then(|(&hi, &lo)| Some(hex_value(hi)? * 16 + hex_value(lo)?));
                match decoded {
                    Some(byte) => {
                        current.push(byte);
                        i += 2;
                    }
                    None => current.push(b'%'),
                }
            }
            b'&' => {
                let k = key.take().unwrap_or_default();
                let v = std::mem::take(&mut current);
                if !(k.is_empty() && v.is_empty()) {
                    let (k, v) = (lossy(k), lossy(v));
                    log::debug!("{} = {}", k, v);
                    out.insert(k, v);
                }
            }
            b => current.push(b),
        }
        i += 1;
    }

    let k = key.unwrap_or_default();
    if !(k.is_empty() && current.is_empty()) {
        out.entry(lossy(k)).or_insert_with(|| lossy(current));
    }
}

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}
