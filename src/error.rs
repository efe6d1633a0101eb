//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Result type often returned from methods in this crate.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + 'static>;

/// Represents errors that can occur while driving a connection or the
/// accept loop.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// A request was malformed, forbidden pipelining was attempted, or a
    /// declared `Content-Length` could not be parsed. Always already
    /// answered with a 400 response before this error surfaces.
    Protocol,
    /// A read or write to the socket failed, or the peer closed before a
    /// declared body was fully drained.
    Io,
    /// The application callable returned an error or panicked.
    App,
    /// Binding or accepting on the listening socket failed.
    Listen,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    pub(crate) fn with(mut self, cause: impl Into<Cause>) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn new_protocol(reason: &'static str) -> Error {
        Error::new(Kind::Protocol).with(io::Error::new(io::ErrorKind::InvalidData, reason))
    }

    pub(crate) fn new_io(cause: io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_app(cause: impl Into<Cause>) -> Error {
        Error::new(Kind::App).with(cause)
    }

    pub(crate) fn new_listen(cause: io::Error) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    /// Returns true if this error was caused by a malformed request and a
    /// 400 response has already been written to the connection.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if this error originated from the application callable.
    pub fn is_app(&self) -> bool {
        matches!(self.inner.kind, Kind::App)
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("coro_wsgi::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.kind {
            Kind::Protocol => f.write_str("malformed request")?,
            Kind::Io => f.write_str("connection i/o error")?,
            Kind::App => f.write_str("error calling WSGI application")?,
            Kind::Listen => f.write_str("error accepting connection")?,
        }
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|c| &**c as _)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::new_io(err)
    }
}
