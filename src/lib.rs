//! coro-wsgi is a single-threaded, cooperatively scheduled HTTP/1.x server
//! that drives application callables through a WSGI-style gateway
//! contract: a request environment in, a status line plus headers via a
//! `start_response` callback, and a lazily-produced body out.
//!
//! The crate assumes a single-threaded cooperative runtime ([`rt`]) and
//! does not lock per-connection state: each accepted connection is owned
//! by exactly one worker task for its whole lifetime.
//!
//! # Example
//!
//! ```no_run
//! use std::net::SocketAddr;
//! use coro_wsgi::{Body, Env, ServerConfig, StartResponse};
//!
//! async fn hello(
//!     _env: Env<tokio::net::TcpStream>,
//!     start_response: StartResponse<tokio::net::TcpStream>,
//! ) -> coro_wsgi::Result<Body> {
//!     start_response
//!         .start_response("200 OK", vec![("Content-Type".into(), "text/plain".into())])
//!         .await?;
//!     Ok(Body::from_static(b"hello"))
//! }
//!
//! # async fn run() -> coro_wsgi::Result<()> {
//! let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
//! let config = ServerConfig::builder(addr).build();
//! coro_wsgi::serve(config, hello).await
//! # }
//! ```

mod date;
mod env;
mod error;
mod header;
mod io;
mod method;
mod parse;
mod response;
pub mod rt;
mod server;
mod version;
mod worker;

pub use crate::env::{DefaultEnv, Env, WsgiErrors, WsgiInput};
pub use crate::error::{Error, Result};
pub use crate::io::{BufferedIo, ReadLimit, WriteMode};
pub use crate::method::Method;
pub use crate::response::{Application, Body, BoxFuture, ResponseWriter, StartResponse};
pub use crate::rt::{run_local, LocalScheduler, Scheduler};
pub use crate::server::{serve, Listener, ServerConfig, ServerConfigBuilder};
pub use crate::version::HttpVersion;
