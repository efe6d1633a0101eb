//! The response writer: the application contract (`Application`, `Body`,
//! `StartResponse`) and the three-phase state machine (`Buffering` ->
//! `HeadersSent` -> `Closed`) that delays header emission until the first
//! non-empty body byte.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

use bytes::Bytes;
use futures_core::stream::Stream;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};
use crate::header::capitalize_header;
use crate::io::BufferedIo;
use crate::parse::RequestHead;
use crate::version::HttpVersion;

pub type BoxFuture<'a, O> = Pin<Box<dyn Future<Output = O> + 'a>>;
pub type BoxBodyStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>>>>;

/// The lazily-produced response body. `Buffered` is the fast path: the
/// application returned its whole body as one buffer, already in memory.
/// `Stream` is the general iterable path.
pub enum Body {
    Buffered(Bytes),
    Stream(BoxBodyStream),
}

impl Body {
    pub fn empty() -> Body {
        Body::Buffered(Bytes::new())
    }

    pub fn from_static(data: &'static [u8]) -> Body {
        Body::Buffered(Bytes::from_static(data))
    }
}

/// The application's handle onto `start_response`, bound to one request's
/// response writer. Calling it is synchronous and idempotent-safe: a
/// second call (an error handler overriding an earlier one) discards
/// whatever header bytes are already buffered.
pub struct StartResponse<T> {
    writer: Rc<RefCell<ResponseWriter<T>>>,
}

impl<T> Clone for StartResponse<T> {
    fn clone(&self) -> Self {
        StartResponse {
            writer: Rc::clone(&self.writer),
        }
    }
}

impl<T> StartResponse<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(writer: Rc<RefCell<ResponseWriter<T>>>) -> StartResponse<T> {
        StartResponse { writer }
    }

    pub async fn start_response(
        &self,
        status: impl Into<String>,
        headers: Vec<(String, String)>,
    ) -> Result<()> {
        self.writer.borrow_mut().begin(status.into(), headers).await
    }
}

/// The gateway contract: an application callable takes the request
/// environment and a bound `start_response` handle, and produces a body.
/// `T` is the connection's underlying I/O type, threaded through so the
/// application can observe `env.wsgi_input` without a lifetime.
pub trait Application<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn call(
        &self,
        env: crate::env::Env<T>,
        start_response: StartResponse<T>,
    ) -> BoxFuture<'static, Result<Body>>;
}

impl<T, F, Fut> Application<T> for F
where
    T: AsyncRead + AsyncWrite + Unpin,
    F: Fn(crate::env::Env<T>, StartResponse<T>) -> Fut,
    Fut: Future<Output = Result<Body>> + 'static,
{
    fn call(
        &self,
        env: crate::env::Env<T>,
        start_response: StartResponse<T>,
    ) -> BoxFuture<'static, Result<Body>> {
        Box::pin((self)(env, start_response))
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum State {
    Buffering,
    HeadersSent,
    Closed,
}

const RESERVED_HEADERS: &[&str] = &["STATUS", "SERVER", "DATE", "CONNECTION"];

/// Per-request response state, driven by the worker through `begin`,
/// `first_chunk`, `write_chunk`, and `fast_path`.
pub struct ResponseWriter<T> {
    io: Rc<RefCell<BufferedIo<T>>>,
    state: State,
    declared_content_length: Option<u64>,
    is_head: bool,
    version: HttpVersion,
    request_keep_alive: bool,
    server_software: String,
    date: String,
}

impl<T> ResponseWriter<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        io: Rc<RefCell<BufferedIo<T>>>,
        request: &RequestHead,
        server_software: String,
        date: String,
    ) -> ResponseWriter<T> {
        ResponseWriter {
            io,
            state: State::Buffering,
            declared_content_length: None,
            is_head: request.method.is_head(),
            version: request.version,
            request_keep_alive: request.keep_alive,
            server_software,
            date,
        }
    }

    pub(crate) fn state_is_buffering(&self) -> bool {
        self.state == State::Buffering
    }

    /// `start_response(status, headers)`: buffers the status line, the
    /// mandatory `Server`/`Date` lines, and the application's headers.
    /// Never flushes.
    async fn begin(&mut self, status: String, headers: Vec<(String, String)>) -> Result<()> {
        let already_began = {
            let io = self.io.borrow();
            io.write_buffer_len() > 0
        };
        if already_began {
            self.io.borrow_mut().discard_write_buffer();
            self.declared_content_length = None;
        }

        let status_line = format!("{} {}\r\n", self.version.as_str(), status);
        let server_line = format!("Server: {}\r\n", self.server_software);
        let date_line = format!("Date: {}\r\n", self.date);
        let mut io = self.io.borrow_mut();
        io.write(status_line.as_bytes()).await.map_err(Error::from)?;
        io.write(server_line.as_bytes()).await.map_err(Error::from)?;
        io.write(date_line.as_bytes()).await.map_err(Error::from)?;
        drop(io);

        for (key, value) in headers {
            let key_upper = key.to_ascii_uppercase();
            if key_upper == "CONTENT-LENGTH" {
                if let Ok(n) = value.parse::<u64>() {
                    self.declared_content_length = Some(n);
                }
            }

            let drop_for_head = self.is_head
                && (key_upper == "CONTENT-LENGTH" || key_upper == "CONTENT-TRANSFER-ENCODING");
            let reserved = RESERVED_HEADERS.contains(&key_upper.as_str())
                || key_upper.starts_with("PROXY-");
            if reserved || drop_for_head {
                continue;
            }

            let line = format!("{}: {}\r\n", capitalize_header(&key), value);
            self.io
                .borrow_mut()
                .write(line.as_bytes())
                .await
                .map_err(Error::from)?;
        }
        Ok(())
    }

    /// The keep-alive decision for the general (non-fast-path) iterable
    /// route. A `HEAD` response never writes body bytes regardless of what
    /// the application streams back, so it always keeps alive per the
    /// request's preference, same as the fully-buffered fast path; a
    /// non-`HEAD` streamed response additionally requires a declared
    /// `Content-Length`, since only then is the body's end unambiguous to
    /// the client.
    fn keep_alive_decision(&self) -> bool {
        if self.is_head {
            self.request_keep_alive
        } else {
            self.request_keep_alive && self.declared_content_length.is_some()
        }
    }

    /// Drives the transition on the first non-empty body chunk (or an
    /// explicit `write()` call): closes out the header block, drains any
    /// unread request body, flushes, switches to unbuffered, and writes
    /// the first chunk. Returns the keep-alive decision.
    pub async fn first_chunk(&mut self, chunk: &[u8]) -> Result<bool> {
        debug_assert_eq!(self.state, State::Buffering);
        let keep_alive = self.keep_alive_decision();
        self.finish_headers(keep_alive).await?;
        if !self.is_head && !chunk.is_empty() {
            self.io.borrow_mut().write(chunk).await.map_err(Error::from)?;
        }
        self.state = State::HeadersSent;
        Ok(keep_alive)
    }

    async fn finish_headers(&mut self, keep_alive: bool) -> Result<()> {
        let connection_line = format!(
            "Connection: {}\r\n\r\n",
            if keep_alive { "Keep-Alive" } else { "close" }
        );
        let mut io = self.io.borrow_mut();
        io.write(connection_line.as_bytes())
            .await
            .map_err(Error::from)?;
        io.discard_to_read_limit().await.map_err(Error::from)?;
        io.flush().await.map_err(Error::from)?;
        io.set_write_mode(crate::io::WriteMode::Unbuffered)
            .await
            .map_err(Error::from)?;
        Ok(())
    }

    /// A subsequent body chunk, after headers have already been sent.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        debug_assert_eq!(self.state, State::HeadersSent);
        if self.is_head || chunk.is_empty() {
            return Ok(());
        }
        self.io.borrow_mut().write(chunk).await.map_err(Error::from)
    }

    /// The fast path: the application returned its entire body as one
    /// buffer. Synthesizes `Content-Length` if the application didn't
    /// declare one; if it did, the declared value must match the buffered
    /// length exactly (an app error, not a panic, on mismatch — see
    /// DESIGN.md).
    pub async fn fast_path(&mut self, body: &Bytes) -> Result<bool> {
        debug_assert_eq!(self.state, State::Buffering);
        if let Some(declared) = self.declared_content_length {
            if declared != body.len() as u64 {
                return Err(Error::new_app(format!(
                    "application declared Content-Length: {} but returned {} bytes",
                    declared,
                    body.len()
                )));
            }
        } else {
            let line = format!("Content-Length: {}\r\n", body.len());
            self.io
                .borrow_mut()
                .write(line.as_bytes())
                .await
                .map_err(Error::from)?;
            self.declared_content_length = Some(body.len() as u64);
        }

        let keep_alive = self.request_keep_alive;
        self.finish_headers(keep_alive).await?;
        if !self.is_head {
            self.io.borrow_mut().write(body).await.map_err(Error::from)?;
        }
        self.io.borrow_mut().flush().await.map_err(Error::from)?;
        self.state = State::HeadersSent;
        Ok(keep_alive)
    }

    pub fn close(&mut self) {
        self.state = State::Closed;
    }
}

/// Writes the fixed bad-request/error template directly, bypassing the
/// application contract entirely. Used for protocol-level 400s and the
/// pre-header 500.
pub async fn respond_bad<T>(
    io: &Rc<RefCell<BufferedIo<T>>>,
    version: HttpVersion,
    server_software: &str,
    date: &str,
    code: u16,
    short: &str,
    reason: &str,
) -> std::io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let body = format!("{}: {}\n", short, reason);
    let head = format!(
        "{} {} {}\r\nServer: {}\r\nDate: {}\r\nConnection: close\r\n\
         Content-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
        version.as_str(),
        code,
        short,
        server_software,
        date,
        body.len(),
    );
    let mut io = io.borrow_mut();
    io.write(head.as_bytes()).await?;
    io.write(body.as_bytes()).await?;
    io.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::Method;
    use tokio::io::duplex;

    fn head(keep_alive: bool, version: HttpVersion) -> RequestHead {
        request(Method::Get, keep_alive, version)
    }

    fn request(method: Method, keep_alive: bool, version: HttpVersion) -> RequestHead {
        RequestHead {
            method,
            version,
            path_info: "/".to_string(),
            query_string: String::new(),
            keep_alive,
            content_length: None,
            content_type: None,
            extra_headers: Vec::new(),
        }
    }

    #[tokio::test]
    async fn buffers_until_first_chunk() {
        let (client, _server_end) = duplex(4096);
        let io = Rc::new(RefCell::new(BufferedIo::new(client)));
        io.borrow_mut()
            .set_write_mode(crate::io::WriteMode::Unbounded)
            .await
            .unwrap();
        let req = head(false, HttpVersion::Http10);
        let writer = ResponseWriter::new(io.clone(), &req, "test/1.0".to_string(), "DATE".to_string());
        let sr = StartResponse::new(Rc::new(RefCell::new(writer)));
        sr.start_response(
            "200 OK",
            vec![("Content-Type".to_string(), "text/plain".to_string())],
        )
        .await
        .unwrap();
        assert!(io.borrow().write_buffer_len() > 0);
    }

    #[tokio::test]
    async fn fast_path_synthesizes_content_length() {
        let (client, mut server_end) = duplex(4096);
        let io = Rc::new(RefCell::new(BufferedIo::new(client)));
        io.borrow_mut()
            .set_write_mode(crate::io::WriteMode::Unbounded)
            .await
            .unwrap();
        let req = head(true, HttpVersion::Http11);
        let writer = Rc::new(RefCell::new(ResponseWriter::new(
            io.clone(),
            &req,
            "test/1.0".to_string(),
            "DATE".to_string(),
        )));
        let sr = StartResponse::new(writer.clone());
        sr.start_response("200 OK", vec![]).await.unwrap();
        let keep_alive = writer
            .borrow_mut()
            .fast_path(&Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert!(keep_alive);

        let mut buf = vec![0u8; 4096];
        let n = tokio::io::AsyncReadExt::read(&mut server_end, &mut buf)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.contains("Content-Length: 2"));
        assert!(text.contains("Connection: Keep-Alive"));
        assert!(text.ends_with("hi"));
    }

    #[tokio::test]
    async fn fast_path_rejects_mismatched_declared_length() {
        let (client, _server_end) = duplex(4096);
        let io = Rc::new(RefCell::new(BufferedIo::new(client)));
        io.borrow_mut()
            .set_write_mode(crate::io::WriteMode::Unbounded)
            .await
            .unwrap();
        let req = head(true, HttpVersion::Http11);
        let writer = Rc::new(RefCell::new(ResponseWriter::new(
            io.clone(),
            &req,
            "test/1.0".to_string(),
            "DATE".to_string(),
        )));
        let sr = StartResponse::new(writer.clone());
        sr.start_response(
            "200 OK",
            vec![("Content-Length".to_string(), "10".to_string())],
        )
        .await
        .unwrap();
        let err = writer
            .borrow_mut()
            .fast_path(&Bytes::from_static(b"hi"))
            .await
            .unwrap_err();
        assert!(err.is_app());
    }

    #[tokio::test]
    async fn head_streamed_response_keeps_alive_without_declared_length() {
        let (client, _server_end) = duplex(4096);
        let io = Rc::new(RefCell::new(BufferedIo::new(client)));
        io.borrow_mut()
            .set_write_mode(crate::io::WriteMode::Unbounded)
            .await
            .unwrap();
        let req = request(Method::Head, true, HttpVersion::Http11);
        let writer = Rc::new(RefCell::new(ResponseWriter::new(
            io.clone(),
            &req,
            "test/1.0".to_string(),
            "DATE".to_string(),
        )));
        let sr = StartResponse::new(writer.clone());
        sr.start_response("200 OK", vec![]).await.unwrap();
        let keep_alive = writer.borrow_mut().first_chunk(&[]).await.unwrap();
        assert!(keep_alive);
    }
}
