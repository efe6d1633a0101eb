//! The HTTP request method, restricted to the set this gateway accepts.

use std::fmt;

/// The request method (`REQUEST_METHOD`), one of the eight tokens the
/// request parser recognizes. Anything else is rejected with a 400 before
/// a `Method` is ever constructed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
}

impl Method {
    /// Parses a request-line method token, returning `None` for anything
    /// outside the fixed set this gateway supports.
    pub fn parse(token: &str) -> Option<Method> {
        Some(match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match *self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }

    /// Whether a missing `Content-Length` on this method is itself a 400
    /// ("missing content"). Only `POST`/`PUT` are held to this; see
    /// DESIGN.md for why `OPTIONS`/`TRACE` are deliberately excluded.
    pub fn requires_content_length(&self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }

    pub fn is_head(&self) -> bool {
        matches!(self, Method::Head)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_methods() {
        for m in [
            "GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "TRACE", "CONNECT",
        ] {
            assert!(Method::parse(m).is_some(), "{} should parse", m);
        }
    }

    #[test]
    fn rejects_unknown_method() {
        assert!(Method::parse("BREW").is_none());
        assert!(Method::parse("get").is_none());
    }
}
