//! The accept dispatcher: binds a listening socket, spawns one worker task
//! per accepted connection, and the `ServerConfig`/builder pair describing
//! how it does so.

use std::net::SocketAddr;
use std::rc::Rc;

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;

use crate::env::DefaultEnv;
use crate::error::{Error, Result};
use crate::response::Application;
use crate::rt::{LocalScheduler, Scheduler};
use crate::worker::serve_connection;

/// Default size of the header block the parser accepts before closing the
/// connection; see [`crate::parse::MAX_HEADER_BYTES`].
pub const DEFAULT_MAX_HEADER_BYTES: usize = crate::parse::MAX_HEADER_BYTES;

/// Immutable listener configuration, constructed once at process bootstrap
/// and shared across every accepted connection.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    addr: SocketAddr,
    backlog: u32,
    server_software: String,
    max_header_bytes: usize,
}

impl ServerConfig {
    pub fn builder(addr: SocketAddr) -> ServerConfigBuilder {
        ServerConfigBuilder {
            inner: ServerConfig {
                addr,
                backlog: 100,
                server_software: format!("coro-wsgi/{}", env!("CARGO_PKG_VERSION")),
                max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            },
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn server_software(&self) -> &str {
        &self.server_software
    }
}

/// Builds a [`ServerConfig`] from a handful of listener knobs.
pub struct ServerConfigBuilder {
    inner: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.inner.backlog = backlog;
        self
    }

    pub fn server_software(mut self, software: impl Into<String>) -> Self {
        self.inner.server_software = software.into();
        self
    }

    pub fn max_header_bytes(mut self, n: usize) -> Self {
        self.inner.max_header_bytes = n;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.inner
    }
}

/// Binds `config.addr` with `SO_REUSEADDR` and the configured backlog.
fn bind_std(config: &ServerConfig) -> Result<std::net::TcpListener> {
    let domain = if config.addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, None).map_err(Error::new_listen)?;
    socket.set_reuse_address(true).map_err(Error::new_listen)?;
    socket
        .bind(&config.addr.into())
        .map_err(Error::new_listen)?;
    socket
        .listen(config.backlog as i32)
        .map_err(Error::new_listen)?;
    socket.set_nonblocking(true).map_err(Error::new_listen)?;
    Ok(socket.into())
}

/// A bound, not-yet-serving listener. Splitting bind from the accept loop
/// lets a caller (or a test) observe the actual local address — useful
/// when `config`'s port is `0` and the OS assigns an ephemeral one.
pub struct Listener {
    listener: TcpListener,
    config: ServerConfig,
}

impl Listener {
    pub fn bind(config: ServerConfig) -> Result<Listener> {
        let std_listener = bind_std(&config)?;
        let listener = TcpListener::from_std(std_listener).map_err(Error::new_listen)?;
        Ok(Listener { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::new_listen)
    }

    /// Accepts connections forever, spawning one worker task per accepted
    /// socket via [`LocalScheduler`]. Returns only on a fatal accept
    /// error, at which point the listener is dropped and no further
    /// connections are served. Must run inside a `tokio::task::LocalSet`.
    pub async fn serve<A>(self, app: A) -> Result<()>
    where
        A: Application<tokio::net::TcpStream> + 'static,
    {
        let local_addr = self.local_addr()?;
        let default_env = DefaultEnv {
            server_port: local_addr.port(),
            server_addr: local_addr.ip().to_string(),
            server_name: local_addr.ip().to_string(),
            server_software: self.config.server_software().to_string(),
            url_scheme: "http",
            https: false,
        };
        let server_software: Rc<str> = Rc::from(self.config.server_software());
        let app = Rc::new(app);
        let scheduler = LocalScheduler;
        let max_header_bytes = self.config.max_header_bytes;

        loop {
            let (socket, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(error = %err, "accept failed, listener exiting");
                    return Err(Error::new_listen(err));
                }
            };
            tracing::trace!(remote.addr = %peer_addr, "connection accepted");

            let app = Rc::clone(&app);
            let default_env = default_env.clone();
            let server_software = Rc::clone(&server_software);
            let scheduler_for_conn = scheduler;

            scheduler.spawn(Box::pin(async move {
                serve_connection(
                    socket,
                    peer_addr,
                    app,
                    default_env,
                    server_software,
                    max_header_bytes,
                    scheduler_for_conn,
                )
                .await;
            }));
        }
    }
}

/// Binds `config.addr` and serves `app` forever. Equivalent to
/// `Listener::bind(config)?.serve(app)`.
pub async fn serve<A>(config: ServerConfig, app: A) -> Result<()>
where
    A: Application<tokio::net::TcpStream> + 'static,
{
    Listener::bind(config)?.serve(app).await
}
