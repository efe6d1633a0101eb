//! The request parser: header-block accumulation, request-line and field
//! validation.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::header::is_comma_joined;
use crate::io::BufferedIo;
use crate::method::Method;
use crate::version::HttpVersion;

/// Hard close if the header block exceeds this many bytes without a
/// terminator.
pub const MAX_HEADER_BYTES: usize = 32767;

/// Upper bound on a single accumulation-step read while searching for the
/// header terminator; a short read returns immediately with whatever
/// arrived rather than waiting for this many bytes.
const READ_STEP: usize = 4096;

/// A parsed, validated request line plus headers, ready to become a
/// request environment.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub version: HttpVersion,
    pub path_info: String,
    pub query_string: String,
    /// Request's `Connection:` preference, defaulted by HTTP version and
    /// then overridden by an explicit header.
    pub keep_alive: bool,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    /// Remaining headers as `(HTTP_<NAME>, value)` pairs, comma-joined
    /// where the name is in [`crate::header::COMMA_JOINED_HEADERS`].
    pub extra_headers: Vec<(String, String)>,
}

/// Why a connection ends before (or instead of) a well-formed request.
#[derive(Debug)]
pub enum ParseOutcome {
    Request(RequestHead),
    /// The peer closed before sending anything parseable; exit without
    /// responding.
    PeerClosed,
    /// Header block exceeded [`MAX_HEADER_BYTES`] without a terminator, or
    /// the first byte wasn't an uppercase ASCII letter. Close silently, no
    /// response (suppresses TLS/garbage hitting a plaintext port).
    SilentClose,
    /// A 400 should be sent with this reason before closing.
    BadRequest(&'static str),
}

/// Reads and validates one request head off `io`, reusing whatever carry-
/// over bytes are already sitting in its read buffer (from `unread` on a
/// previous iteration, e.g. a pipelined request prefix).
pub async fn read_request_head<T>(
    io: &mut BufferedIo<T>,
    max_header_bytes: usize,
) -> io::Result<ParseOutcome>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut acc = BytesMut::new();
    let boundary = loop {
        if let Some(b) = find_header_boundary(&acc) {
            break b;
        }
        if acc.len() > max_header_bytes {
            return Ok(ParseOutcome::SilentClose);
        }
        let chunk = io.read_once(READ_STEP).await?;
        if chunk.is_empty() {
            return Ok(if acc.is_empty() {
                ParseOutcome::PeerClosed
            } else {
                ParseOutcome::SilentClose
            });
        }
        if acc.is_empty() && !chunk[0].is_ascii_uppercase() {
            return Ok(ParseOutcome::SilentClose);
        }
        acc.extend_from_slice(&chunk);
    };

    let head_bytes = acc.split_to(boundary.head_end).freeze();
    acc.advance_past(boundary.marker_len);
    let carry = acc.freeze();

    let head_text = match std::str::from_utf8(&head_bytes) {
        Ok(s) => s,
        Err(_) => return Ok(ParseOutcome::BadRequest("bad header line")),
    };

    match parse_head_text(head_text) {
        Ok(mut head) => {
            if let Err(reason) = apply_body_policy(&mut head, &carry, io) {
                return Ok(ParseOutcome::BadRequest(reason));
            }
            Ok(ParseOutcome::Request(head))
        }
        Err(reason) => Ok(ParseOutcome::BadRequest(reason)),
    }
}

struct Boundary {
    head_end: usize,
    marker_len: usize,
}

/// Finds the earlier of `"\n\n"` and `"\n\r\n"` in `buf`, per the "earlier-
/// occurring marker terminates the header block" rule.
fn find_header_boundary(buf: &[u8]) -> Option<Boundary> {
    let lf_lf = find(buf, b"\n\n");
    let lf_cr_lf = find(buf, b"\n\r\n");
    match (lf_lf, lf_cr_lf) {
        (Some(i), Some(j)) if i < j => Some(Boundary {
            head_end: i,
            marker_len: 2,
        }),
        (_, Some(j)) => Some(Boundary {
            head_end: j,
            marker_len: 3,
        }),
        (Some(i), None) => Some(Boundary {
            head_end: i,
            marker_len: 2,
        }),
        (None, None) => None,
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

trait AdvancePast {
    fn advance_past(&mut self, n: usize);
}

impl AdvancePast for BytesMut {
    fn advance_past(&mut self, n: usize) {
        let _ = self.split_to(n.min(self.len()));
    }
}

const METHODS: [&str; 8] = [
    "GET", "HEAD", "POST", "PUT", "DELETE", "OPTIONS", "TRACE", "CONNECT",
];

fn parse_head_text(head_text: &str) -> Result<RequestHead, &'static str> {
    let collapsed = collapse_continuations(&head_text.replace("\r\n", "\n"));
    let mut lines = collapsed.split('\n');

    let line1 = lines.next().unwrap_or("");
    let mut parts = line1.splitn(3, ' ');
    let (method_tok, suburl, version_tok) = match (parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(u), Some(v)) if parts.next().is_none() => (m, u, v),
        _ => return Err("bad line1"),
    };

    if !METHODS.contains(&method_tok) {
        return Err("bad method");
    }
    let method = Method::parse(method_tok).expect("checked above");

    let version = HttpVersion::parse(version_tok).ok_or("bad HTTP version")?;

    if !is_valid_suburl(suburl) {
        return Err("bad suburl");
    }
    let (path_info, query_string) = match suburl.find('?') {
        Some(i) => (suburl[..i].to_string(), suburl[i + 1..].to_string()),
        None => (suburl.to_string(), String::new()),
    };

    let mut keep_alive = version.default_keep_alive();
    let mut content_length = None;
    let mut content_type = None;
    let mut extra_headers: Vec<(String, String)> = Vec::new();

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let colon = line.find(':').ok_or("bad header line")?;
        let value = if line.as_bytes().get(colon + 1) == Some(&b' ') {
            &line[colon + 2..]
        } else {
            &line[colon + 1..]
        };
        let name = line[..colon].to_ascii_lowercase();

        match name.as_str() {
            "connection" => keep_alive = value.eq_ignore_ascii_case("keep-alive"),
            "keep-alive" => {}
            "content-length" => {
                content_length = Some(value.parse::<u64>().map_err(|_| "bad content-length")?);
            }
            "content-type" => content_type = Some(value.to_string()),
            _ if name.starts_with("proxy-") => {}
            _ => {
                let name_upper = name.to_ascii_uppercase();
                let key = format!("HTTP_{}", name_upper.replace('-', "_"));
                if is_comma_joined(&name_upper) {
                    if let Some(existing) = extra_headers.iter_mut().find(|(k, _)| *k == key) {
                        existing.1.push_str(", ");
                        existing.1.push_str(value);
                        continue;
                    }
                }
                extra_headers.push((key, value.to_string()));
            }
        }
    }

    Ok(RequestHead {
        method,
        version,
        path_info,
        query_string,
        keep_alive,
        content_length,
        content_type,
        extra_headers,
    })
}

/// Collapses a LF followed by leading whitespace (header-line
/// continuation) into `", "`.
fn collapse_continuations(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\n' && i + 1 < bytes.len() && matches!(bytes[i + 1], b' ' | b'\t') {
            out.push_str(", ");
            i += 1;
            while i < bytes.len() && matches!(bytes[i], b' ' | b'\t') {
                i += 1;
            }
        } else {
            let ch = s[i..].chars().next().unwrap();
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    out
}

/// `^/[-A-Za-z0-9_./,~!@$*()\[\]';:?&%+=]*$`
fn is_valid_suburl(s: &str) -> bool {
    if !s.starts_with('/') {
        return false;
    }
    s.bytes().all(|b| {
        b.is_ascii_alphanumeric()
            || matches!(
                b,
                b'-' | b'_' | b'.' | b'/' | b',' | b'~' | b'!' | b'@' | b'$' | b'*' | b'(' | b')'
                    | b'[' | b']' | b'\'' | b';' | b':' | b'?' | b'&' | b'%' | b'+' | b'='
            )
    })
}

/// Applies the per-method `Content-Length` body policy, and — when a body
/// is declared — unreads the already-buffered carry-over back into `io`
/// and sets its read cap.
fn apply_body_policy<T>(
    head: &mut RequestHead,
    carry: &Bytes,
    io: &mut BufferedIo<T>,
) -> Result<(), &'static str>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    use crate::io::ReadLimit;

    match head.content_length {
        None => {
            if head.method.requires_content_length() {
                return Err("missing content");
            }
            io.unread(carry.clone());
            Ok(())
        }
        Some(0) => {
            // A declared-but-empty body is never "unexpected content".
            io.unread(carry.clone());
            Ok(())
        }
        Some(len) => {
            if !head.method.requires_content_length() {
                return Err("unexpected content");
            }
            if carry.len() as u64 > len {
                return Err("next request too early");
            }
            io.unread(carry.clone());
            io.set_read_limit(ReadLimit::Remaining((len - carry.len() as u64) as usize));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::BufferedIo;
    use tokio::io::duplex;

    async fn parse(bytes: &[u8]) -> ParseOutcome {
        let (mut client, mut server_end) = duplex(4096);
        tokio::io::AsyncWriteExt::write_all(&mut server_end, bytes)
            .await
            .unwrap();
        drop(server_end);
        let mut io = BufferedIo::new(&mut client);
        read_request_head(&mut io, MAX_HEADER_BYTES).await.unwrap()
    }

    #[tokio::test]
    async fn simple_get() {
        match parse(b"GET / HTTP/1.0\r\n\r\n").await {
            ParseOutcome::Request(head) => {
                assert!(matches!(head.method, Method::Get));
                assert_eq!(head.path_info, "/");
                assert!(!head.keep_alive);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn http11_defaults_keep_alive() {
        match parse(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await {
            ParseOutcome::Request(head) => assert!(head.keep_alive),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_method() {
        match parse(b"BREW / HTTP/1.1\r\n\r\n").await {
            ParseOutcome::BadRequest(reason) => assert_eq!(reason, "bad method"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_version() {
        match parse(b"GET /? HTTP/2.0\r\n\r\n").await {
            ParseOutcome::BadRequest(reason) => assert_eq!(reason, "bad HTTP version"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn bad_suburl_rejects_percent_escapes() {
        match parse(b"GET /%20 HTTP/1.0\r\n\r\n").await {
            ParseOutcome::BadRequest(reason) => assert_eq!(reason, "bad suburl"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn post_without_content_length_is_missing_content() {
        match parse(b"POST /p HTTP/1.1\r\n\r\n").await {
            ParseOutcome::BadRequest(reason) => assert_eq!(reason, "missing content"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn get_with_body_is_unexpected_content() {
        match parse(b"GET / HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc").await {
            ParseOutcome::BadRequest(reason) => assert_eq!(reason, "unexpected content"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn first_byte_not_uppercase_closes_silently() {
        match parse(b"\x80GET\r\n\r\n").await {
            ParseOutcome::SilentClose => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn comma_joins_repeated_headers() {
        match parse(b"GET / HTTP/1.1\r\nAccept: a\r\nAccept: b\r\n\r\n").await {
            ParseOutcome::Request(head) => {
                assert_eq!(
                    head.extra_headers,
                    vec![("HTTP_ACCEPT".to_string(), "a, b".to_string())]
                );
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn header_block_over_cap_without_terminator_closes_silently() {
        let (mut client, mut server_end) = duplex(8192);
        let mut line = b"GET / HTTP/1.1\r\n".to_vec();
        line.extend(std::iter::repeat(b'x').take(200));
        tokio::io::AsyncWriteExt::write_all(&mut server_end, &line)
            .await
            .unwrap();
        drop(server_end);
        let mut io = BufferedIo::new(&mut client);
        match read_request_head(&mut io, 64).await.unwrap() {
            ParseOutcome::SilentClose => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn pipelined_carry_over_within_content_length_is_preserved() {
        let (mut client, mut server_end) = duplex(8192);
        tokio::io::AsyncWriteExt::write_all(
            &mut server_end,
            b"POST /p HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc",
        )
        .await
        .unwrap();
        drop(server_end);
        let mut io = BufferedIo::new(&mut client);
        match read_request_head(&mut io, MAX_HEADER_BYTES).await.unwrap() {
            ParseOutcome::Request(head) => {
                assert_eq!(head.content_length, Some(3));
                let body = io.read(Some(3)).await.unwrap();
                assert_eq!(&body[..], b"abc");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn carry_over_exceeding_content_length_is_rejected() {
        let (mut client, mut server_end) = duplex(8192);
        tokio::io::AsyncWriteExt::write_all(
            &mut server_end,
            b"POST /p HTTP/1.1\r\nContent-Length: 1\r\n\r\nabc",
        )
        .await
        .unwrap();
        drop(server_end);
        let mut io = BufferedIo::new(&mut client);
        match read_request_head(&mut io, MAX_HEADER_BYTES).await.unwrap() {
            ParseOutcome::BadRequest(reason) => assert_eq!(reason, "next request too early"),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
