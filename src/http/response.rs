use std::fs::{self, Metadata};
use std::path::{Component, Path, PathBuf};

use hyper::StatusCode;

use crate::buffer::Buffer;

/// Builds the status line, headers and payload for one response.
///
/// Headers go into the connection's write buffer; the file payload is kept
/// separately so both can be sent with a single vectored write.
#[derive(Debug, Default)]
pub struct HttpResponse {
    code: Option<StatusCode>,
    keep_alive: bool,
    path: String,
    src_dir: PathBuf,
    file: Option<Vec<u8>>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepares a response for `path` under `src_dir`. A preset client error
    /// (400 after a parse failure) is sent as is; otherwise the status comes
    /// from resolving the file.
    pub fn init(&mut self, src_dir: &Path, path: &str, keep_alive: bool, code: Option<StatusCode>) {
        self.release_file();
        self.code = code;
        self.keep_alive = keep_alive;
        self.path = path.to_owned();
        self.src_dir = src_dir.to_path_buf();
    }

    pub fn make_response(&mut self, buf: &mut Buffer) {
        self.code = Some(match self.code {
            Some(code) if code.is_client_error() => code,
            preset => match self.full_path().map(fs::metadata) {
                None | Some(Err(_)) => StatusCode::NOT_FOUND,
                Some(Ok(meta)) if meta.is_dir() => StatusCode::NOT_FOUND,
                Some(Ok(meta)) if !is_world_readable(&meta) => StatusCode::FORBIDDEN,
                Some(Ok(_)) => preset.unwrap_or(StatusCode::OK),
            },
        });
        self.error_html();
        self.add_state_line(buf);
        self.add_header(buf);
        self.add_content(buf);
    }

    pub fn code(&self) -> Option<StatusCode> {
        self.code
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The loaded payload, if any.
    pub fn file(&self) -> &[u8] {
        self.file.as_deref().unwrap_or(&[])
    }

    pub fn file_len(&self) -> usize {
        self.file().len()
    }

    pub fn release_file(&mut self) {
        self.file = None;
    }

    /// Appends a generated HTML page describing the error as the body.
    pub fn error_content(&self, buf: &mut Buffer, message: &str) {
        let code = self.code.unwrap_or(StatusCode::BAD_REQUEST);
        let body = format!(
            "<html><title>Error</title><body bgcolor=\"ffffff\">{} : {}\n<p>{}</p><hr><em>sparrow</em></body></html>",
            code.as_u16(),
            code.canonical_reason().unwrap_or("Bad Request"),
            message
        );
        buf.append_str(&format!("Content-length: {}\r\n\r\n", body.len()));
        buf.append_str(&body);
    }

    /// The file under `src_dir` named by the path. `None` when the path has
    /// anything but plain names in it (`..`, `.`, a root or a prefix), so no
    /// request can leave the document root.
    fn full_path(&self) -> Option<PathBuf> {
        let relative = Path::new(self.path.trim_start_matches('/'));
        if relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            Some(self.src_dir.join(relative))
        } else {
            None
        }
    }

    /// Error statuses serve their own page when the site provides one.
    fn error_html(&mut self) {
        if let Some(code) = self.code {
            if matches!(
                code,
                StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
            ) {
                self.path = format!("/{}.html", code.as_u16());
            }
        }
    }

    fn add_state_line(&mut self, buf: &mut Buffer) {
        let code = match self.code {
            Some(code) if code.canonical_reason().is_some() => code,
            _ => StatusCode::BAD_REQUEST,
        };
        self.code = Some(code);
        buf.append_str(&format!(
            "HTTP/1.1 {} {}\r\n",
            code.as_u16(),
            code.canonical_reason().unwrap_or("Bad Request")
        ));
    }

    fn add_header(&self, buf: &mut Buffer) {
        if self.keep_alive {
            buf.append_str("Connection: keep-alive\r\n");
            buf.append_str("keep-alive: max=6, timeout=120\r\n");
        } else {
            buf.append_str("Connection: close\r\n");
        }
        buf.append_str(&format!("Content-type: {}\r\n", content_type(&self.path)));
    }

    fn add_content(&mut self, buf: &mut Buffer) {
        let Some(path) = self.full_path() else {
            self.error_content(buf, "File NotFound!");
            return;
        };
        match fs::read(&path) {
            Ok(data) => {
                log::debug!("file path {}", path.display());
                buf.append_str(&format!("Content-length: {}\r\n\r\n", data.len()));
                self.file = Some(data);
            }
            Err(e) => {
                log::debug!("cannot open {}: {}", path.display(), e);
                self.error_content(buf, "File NotFound!");
            }
        }
    }
}

/// MIME type by file suffix.
pub fn content_type(path: &str) -> &'static str {
    let suffix = match path.rfind('.') {
        Some(idx) => &path[idx..],
        None => return "text/plain",
    };
    match suffix {
        ".html" => "text/html",
        ".xml" => "text/xml",
        ".xhtml" => "application/xhtml+xml",
        ".txt" => "text/plain",
        ".rtf" => "application/rtf",
        ".pdf" => "application/pdf",
        ".word" => "application/nsword",
        ".png" => "image/png",
        ".gif" => "image/gif",
        ".jpg" | ".jpeg" => "image/jpeg",
        ".au" => "audio/basic",
        ".mpeg" | ".mpg" => "video/mpeg",
        ".avi" => "video/x-msvideo",
        ".gz" => "application/x-gzip",
        ".tar" => "application/x-tar",
        ".css" => "text/css",
        ".js" => "text/javascript",
        _ => "text/plain",
    }
}

#[cfg(unix)]
fn is_world_readable(meta: &Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o004 != 0
}

#[cfg(not(unix))]
fn is_world_readable(_meta: &Metadata) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    /// Creates a fresh resource directory under the system temp dir.
    fn site(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("sparrow-response-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Writes a world-readable file regardless of the process umask.
    fn publish(path: PathBuf, contents: &str) {
        fs::write(&path, contents).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        }
    }

    fn render(dir: &Path, path: &str, keep_alive: bool, code: Option<StatusCode>) -> (HttpResponse, String) {
        let mut resp = HttpResponse::new();
        let mut buf = Buffer::default();
        resp.init(dir, path, keep_alive, code);
        resp.make_response(&mut buf);
        (resp, buf.retrieve_all_to_string())
    }

    #[test]
    fn test_serves_existing_file() {
        let dir = site("ok");
        publish(dir.join("index.html"), "<h1>hi</h1>");

        let (resp, head) = render(&dir, "/index.html", true, Some(StatusCode::OK));
        assert_eq!(resp.code(), Some(StatusCode::OK));
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Connection: keep-alive\r\n"));
        assert!(head.contains("Content-type: text/html\r\n"));
        assert!(head.ends_with("Content-length: 11\r\n\r\n"));
        assert_eq!(resp.file(), b"<h1>hi</h1>");
    }

    #[test]
    fn test_missing_file_uses_404_page() {
        let dir = site("missing");
        publish(dir.join("404.html"), "gone");

        let (resp, head) = render(&dir, "/nope.png", false, Some(StatusCode::OK));
        assert_eq!(resp.code(), Some(StatusCode::NOT_FOUND));
        assert_eq!(resp.path(), "/404.html");
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains("Connection: close\r\n"));
        assert_eq!(resp.file(), b"gone");
    }

    #[test]
    fn test_generated_error_page_without_site_page() {
        let dir = site("generated");
        let (resp, head) = render(&dir, "/", false, Some(StatusCode::OK));

        assert_eq!(resp.file_len(), 0);
        assert!(head.contains("404 : Not Found"));
        assert!(head.contains("<p>File NotFound!</p>"));
    }

    #[test]
    fn test_preset_bad_request_is_kept() {
        let dir = site("bad");
        publish(dir.join("index.html"), "x");
        publish(dir.join("400.html"), "bad");

        let (resp, head) = render(&dir, "/index.html", false, Some(StatusCode::BAD_REQUEST));
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_eq!(resp.file(), b"bad");

        // An unparsed request has no path; the status must not fall back to 404.
        let (resp, head) = render(&dir, "", false, Some(StatusCode::BAD_REQUEST));
        assert_eq!(resp.code(), Some(StatusCode::BAD_REQUEST));
        assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_forbidden() {
        use std::os::unix::fs::PermissionsExt;

        let dir = site("forbidden");
        let secret = dir.join("secret.txt");
        fs::write(&secret, "nope").unwrap();
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();

        let (resp, head) = render(&dir, "/secret.txt", false, None);
        assert_eq!(resp.code(), Some(StatusCode::FORBIDDEN));
        assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    }

    /// Paths with `..` must not reach files outside the document root.
    #[test]
    fn test_parent_components_cannot_escape_root() {
        let base = site("escape");
        let root = base.join("site");
        fs::create_dir_all(&root).unwrap();
        publish(base.join("secret.txt"), "TOP-SECRET");
        publish(root.join("404.html"), "gone");

        for path in ["/../secret.txt", "/./../secret.txt", "/a/../../secret.txt", "//../secret.txt"] {
            let (resp, head) = render(&root, path, false, Some(StatusCode::OK));
            assert_eq!(resp.code(), Some(StatusCode::NOT_FOUND), "{}", path);
            assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
            assert_eq!(resp.file(), b"gone");
        }
    }

    #[test]
    fn test_content_type_by_suffix() {
        assert_eq!(content_type("/a/b.css"), "text/css");
        assert_eq!(content_type("/photo.JPG"), "text/plain");
        assert_eq!(content_type("/video.mpg"), "video/mpeg");
        assert_eq!(content_type("/README"), "text/plain");
    }
}
