//! The per-connection worker loop: read a request, build its environment,
//! dispatch to the application, emit the response, and decide whether to
//! keep the connection alive for another request.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::date::CachedDate;
use crate::env::{DefaultEnv, Env, WsgiErrors, WsgiInput, WSGI_VERSION};
use crate::error::Error;
use crate::io::BufferedIo;
use crate::parse::{self, ParseOutcome, RequestHead};
use crate::response::{respond_bad, Application, Body, ResponseWriter, StartResponse};
use crate::rt::{yield_now, Scheduler};
use crate::version::HttpVersion;

/// Drives one accepted connection to completion, looping over keep-alive
/// requests until the peer closes, a protocol error ends the connection,
/// or an I/O fault occurs. Always leaves the socket dropped (and thus
/// closed) on return.
pub async fn serve_connection<T, A, S>(
    socket: T,
    peer_addr: SocketAddr,
    app: Rc<A>,
    default_env: DefaultEnv,
    server_software: Rc<str>,
    max_header_bytes: usize,
    scheduler: S,
) where
    T: AsyncRead + AsyncWrite + Unpin + 'static,
    A: Application<T> + 'static,
    S: Scheduler + Clone + 'static,
{
    let io = Rc::new(RefCell::new(BufferedIo::new(socket)));
    let date_cache = CachedDate::new();
    let remote_addr = peer_addr.ip().to_string();
    let remote_port = peer_addr.port();

    let mut keep_alive = true;
    let mut first_iteration = true;
    let mut request_ordinal: u64 = 0;

    while keep_alive {
        if let Err(err) = io
            .borrow_mut()
            .set_write_mode(crate::io::WriteMode::Unbounded)
            .await
        {
            tracing::debug!(remote.addr = %remote_addr, error = %err, "write-mode reset failed, closing");
            return;
        }
        if !first_iteration {
            yield_now().await;
        }
        first_iteration = false;

        let date = date_cache.get();
        let outcome = {
            let mut guard = io.borrow_mut();
            parse::read_request_head(&mut guard, max_header_bytes).await
        };

        let head = match outcome {
            Err(err) => {
                tracing::debug!(remote.addr = %remote_addr, error = %err, "socket read failed, closing");
                return;
            }
            Ok(ParseOutcome::PeerClosed) | Ok(ParseOutcome::SilentClose) => {
                tracing::trace!(remote.addr = %remote_addr, "connection closed");
                return;
            }
            Ok(ParseOutcome::BadRequest(reason)) => {
                tracing::warn!(remote.addr = %remote_addr, reason, "bad request");
                let _ = respond_bad(
                    &io,
                    HttpVersion::Http10,
                    &server_software,
                    &date,
                    400,
                    "Bad Request",
                    reason,
                )
                .await;
                return;
            }
            Ok(ParseOutcome::Request(head)) => head,
        };

        request_ordinal += 1;
        tracing::debug!(
            remote.addr = %remote_addr,
            request.method = %head.method,
            request.ordinal = request_ordinal,
            "request parsed"
        );

        let env = build_env(&head, &default_env, &io, &remote_addr, remote_port);
        let writer = Rc::new(RefCell::new(ResponseWriter::new(
            Rc::clone(&io),
            &head,
            server_software.to_string(),
            date.clone(),
        )));
        let start_response = StartResponse::new(Rc::clone(&writer));

        let result = app.call(env, start_response).await;

        match result {
            Err(err) => {
                handle_app_error(&io, &writer, &head, &server_software, &date, &remote_addr, err)
                    .await;
                return;
            }
            Ok(body) => {
                match dispatch_body(body, &writer, head.method.is_head(), scheduler.clone()).await
                {
                    Ok(next_keep_alive) => {
                        tracing::debug!(
                            remote.addr = %remote_addr,
                            request.ordinal = request_ordinal,
                            status = "ok",
                            keep_alive = next_keep_alive,
                            "response dispatched"
                        );
                        keep_alive = next_keep_alive;
                    }
                    Err(err) => {
                        tracing::debug!(remote.addr = %remote_addr, error = %err, "response write failed, closing");
                        return;
                    }
                }
            }
        }
    }
}

fn build_env<T>(
    head: &RequestHead,
    default_env: &DefaultEnv,
    io: &Rc<RefCell<BufferedIo<T>>>,
    remote_addr: &str,
    remote_port: u16,
) -> Env<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    Env {
        request_method: head.method,
        server_protocol: head.version,
        script_name: "",
        path_info: head.path_info.clone(),
        query_string: head.query_string.clone(),

        server_port: default_env.server_port,
        server_addr: default_env.server_addr.clone(),
        server_name: default_env.server_name.clone(),
        server_software: default_env.server_software.clone(),

        remote_addr: remote_addr.to_string(),
        remote_host: remote_addr.to_string(),
        remote_port,

        content_length: head.content_length,
        content_type: head.content_type.clone(),
        https: default_env.https,

        extra_headers: head.extra_headers.clone(),

        wsgi_version: WSGI_VERSION,
        wsgi_multithread: true,
        wsgi_multiprocess: false,
        wsgi_run_once: false,
        wsgi_url_scheme: default_env.url_scheme,
        wsgi_errors: WsgiErrors::default(),
        wsgi_input: WsgiInput::new(Rc::clone(io)),
    }
}

async fn handle_app_error<T>(
    io: &Rc<RefCell<BufferedIo<T>>>,
    writer: &Rc<RefCell<ResponseWriter<T>>>,
    head: &RequestHead,
    server_software: &str,
    date: &str,
    remote_addr: &str,
    err: Error,
) where
    T: AsyncRead + AsyncWrite + Unpin,
{
    tracing::debug!(remote.addr = %remote_addr, error = ?err, "application error (debug detail)");
    tracing::error!(remote.addr = %remote_addr, "error calling WSGI application: {}", err);

    if writer.borrow().state_is_buffering() {
        io.borrow_mut().discard_write_buffer();
        let _ = respond_bad(
            io,
            head.version,
            server_software,
            date,
            500,
            "Internal Server Error",
            "application error",
        )
        .await;
    }
}

/// Iterates the application's body, applying the buffer-until-first-byte
/// rule, and for `HEAD` requests, draining the remainder of a streamed
/// body in a background task so the application's side effects still run
/// without writing body bytes to the wire.
async fn dispatch_body<T, S>(
    body: Body,
    writer: &Rc<RefCell<ResponseWriter<T>>>,
    is_head: bool,
    scheduler: S,
) -> crate::error::Result<bool>
where
    T: AsyncRead + AsyncWrite + Unpin + 'static,
    S: Scheduler,
{
    match body {
        Body::Buffered(bytes) => writer.borrow_mut().fast_path(&bytes).await,
        Body::Stream(mut stream) => {
            if is_head {
                let keep_alive = writer.borrow_mut().first_chunk(&[]).await?;
                scheduler.spawn(Box::pin(async move {
                    while let Some(item) = stream.next().await {
                        if item.is_err() {
                            break;
                        }
                    }
                }));
                Ok(keep_alive)
            } else {
                let mut sent_first = false;
                let mut keep_alive = false;
                while let Some(item) = stream.next().await {
                    let chunk = item.map_err(Error::from)?;
                    if chunk.is_empty() {
                        continue;
                    }
                    if !sent_first {
                        keep_alive = writer.borrow_mut().first_chunk(&chunk).await?;
                        sent_first = true;
                    } else {
                        writer.borrow_mut().write_chunk(&chunk).await?;
                    }
                }
                if !sent_first {
                    keep_alive = writer.borrow_mut().first_chunk(&[]).await?;
                }
                Ok(keep_alive)
            }
        }
    }
}
