//! The HTTP version token, restricted to what this gateway serves.

use std::fmt;

/// `SERVER_PROTOCOL`, either HTTP/1.0 or HTTP/1.1. HTTP/0.9 and HTTP/2 are
/// out of scope and are rejected by the parser with a 400.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn parse(token: &str) -> Option<HttpVersion> {
        match token {
            "HTTP/1.0" => Some(HttpVersion::Http10),
            "HTTP/1.1" => Some(HttpVersion::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
        }
    }

    /// The default keep-alive preference before the `Connection:` header is
    /// examined: true for HTTP/1.1, false for HTTP/1.0.
    pub fn default_keep_alive(&self) -> bool {
        matches!(self, HttpVersion::Http11)
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
