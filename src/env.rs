//! The request environment: the gateway-contract mapping passed to the
//! application callable, plus `wsgi.input`/`wsgi.errors`, the two objects
//! backed by the connection's buffered socket file.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::io::BufferedIo;
use crate::method::Method;
use crate::version::HttpVersion;

/// `wsgi.input`: a readable stream over the request body, backed by the
/// same buffered socket file the worker reads requests off of. Shared
/// ownership (`Rc<RefCell<_>>`) lets one socket object do double duty as
/// both the request-line reader and the body stream — there is exactly
/// one task per connection, so no concurrent borrow can occur except the
/// deliberate HEAD-mode drain task, which only ever touches this object,
/// never the socket directly.
pub struct WsgiInput<T> {
    io: Rc<RefCell<BufferedIo<T>>>,
}

impl<T> Clone for WsgiInput<T> {
    fn clone(&self) -> Self {
        WsgiInput {
            io: Rc::clone(&self.io),
        }
    }
}

impl<T> WsgiInput<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(io: Rc<RefCell<BufferedIo<T>>>) -> WsgiInput<T> {
        WsgiInput { io }
    }

    pub async fn read(&self, n: Option<usize>) -> std::io::Result<Bytes> {
        self.io.borrow_mut().read(n).await
    }

    pub async fn read_line(&self) -> std::io::Result<Bytes> {
        self.io.borrow_mut().read_line().await
    }

    /// Repeatedly calls `read_line` until it returns empty, per the
    /// resolution of the readline-vs-readlines open question.
    pub async fn read_lines(&self) -> std::io::Result<Vec<Bytes>> {
        let mut out = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(out);
            }
            out.push(line);
        }
    }

    /// Pull-based line iteration (the gateway contract's `__iter__`/`next`
    /// over `wsgi.input`), exposed as an explicit async method rather than
    /// the synchronous `Iterator` trait since each step may suspend on I/O.
    /// Returns `None` once `read_line` yields an empty chunk.
    pub async fn next_line(&self) -> std::io::Result<Option<Bytes>> {
        let line = self.read_line().await?;
        Ok(if line.is_empty() { None } else { Some(line) })
    }

    pub async fn discard_to_read_limit(&self) -> std::io::Result<()> {
        self.io.borrow_mut().discard_to_read_limit().await
    }
}

/// `wsgi.errors`: a write-only sink for application-level error output,
/// routed through the structured logging facade at debug level.
#[derive(Clone, Copy, Default)]
pub struct WsgiErrors {
    _private: (),
}

impl WsgiErrors {
    pub fn write(&self, data: &[u8]) {
        match std::str::from_utf8(data) {
            Ok(s) => tracing::debug!(target: "wsgi.errors", "{}", s),
            Err(_) => tracing::debug!(target: "wsgi.errors", bytes = data.len(), "non-utf8 error output"),
        }
    }

    pub fn writelines(&self, lines: &[&[u8]]) {
        for line in lines {
            self.write(line);
        }
    }

    /// No-op: output goes straight through the logging facade, which has
    /// no separate buffer to flush.
    pub fn flush(&self) {}
}

/// The gateway-version tuple advertised as `wsgi.version`.
pub const WSGI_VERSION: (u32, u32) = (1, 0);

/// Fields shared by every request on every connection: everything the
/// accept dispatcher knows before any byte of any individual request has
/// been read.
#[derive(Clone, Debug)]
pub struct DefaultEnv {
    pub server_port: u16,
    pub server_addr: String,
    pub server_name: String,
    pub server_software: String,
    pub url_scheme: &'static str,
    pub https: bool,
}

/// The full per-request environment. Fully owned (no borrowed lifetimes):
/// every request gets a fresh value built from the cloned `DefaultEnv`.
pub struct Env<T> {
    pub request_method: Method,
    pub server_protocol: HttpVersion,
    pub script_name: &'static str,
    pub path_info: String,
    pub query_string: String,

    pub server_port: u16,
    pub server_addr: String,
    pub server_name: String,
    pub server_software: String,

    pub remote_addr: String,
    pub remote_host: String,
    pub remote_port: u16,

    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub https: bool,

    /// Remaining headers as `(HTTP_<NAME>, value)` pairs.
    pub extra_headers: Vec<(String, String)>,

    pub wsgi_version: (u32, u32),
    pub wsgi_multithread: bool,
    pub wsgi_multiprocess: bool,
    pub wsgi_run_once: bool,
    pub wsgi_url_scheme: &'static str,
    pub wsgi_errors: WsgiErrors,
    pub wsgi_input: WsgiInput<T>,
}

impl<T> Env<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn header(&self, name_upper_with_underscores: &str) -> Option<&str> {
        self.extra_headers
            .iter()
            .find(|(k, _)| k == name_upper_with_underscores)
            .map(|(_, v)| v.as_str())
    }
}
