//! Header name canonicalization and the comma-joined-header table.

/// Lower-cases `name`, then upper-cases the first letter of each
/// hyphen-separated word: `content-type` -> `Content-Type`.
///
/// Pure function; `capitalize_header(capitalize_header(x).to_lowercase())`
/// is idempotent for any input already in canonical form.
pub fn capitalize_header(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut at_word_start = true;
    for ch in name.chars() {
        let lower = ch.to_ascii_lowercase();
        if at_word_start {
            out.extend(lower.to_uppercase());
        } else {
            out.push(lower);
        }
        at_word_start = ch == '-';
    }
    out
}

/// Request headers whose repeated occurrences are joined with `", "` rather
/// than overwritten by the last value seen.
pub const COMMA_JOINED_HEADERS: &[&str] = &[
    "ACCEPT",
    "ACCEPT-CHARSET",
    "ACCEPT-ENCODING",
    "ACCEPT-LANGUAGE",
    "ACCEPT-RANGES",
    "ALLOW",
    "CACHE-CONTROL",
    "CONNECTION",
    "CONTENT-ENCODING",
    "CONTENT-LANGUAGE",
    "EXPECT",
    "IF-MATCH",
    "IF-NONE-MATCH",
    "PRAGMA",
    "PROXY-AUTHENTICATE",
    "TE",
    "TRAILER",
    "TRANSFER-ENCODING",
    "UPGRADE",
    "VARY",
    "VIA",
    "WARNING",
    "WWW-AUTHENTICATE",
];

pub(crate) fn is_comma_joined(name_upper: &str) -> bool {
    COMMA_JOINED_HEADERS.contains(&name_upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capitalizes_words() {
        assert_eq!(capitalize_header("content-type"), "Content-Type");
        assert_eq!(capitalize_header("CONTENT-TYPE"), "Content-Type");
        assert_eq!(capitalize_header("x-forwarded-for"), "X-Forwarded-For");
        assert_eq!(capitalize_header("host"), "Host");
        assert_eq!(capitalize_header("ETag"), "Etag");
    }

    #[test]
    fn idempotent_round_trip() {
        for name in ["content-type", "X-Request-Id", "WWW-Authenticate"] {
            let once = capitalize_header(name);
            let twice = capitalize_header(&once.to_lowercase());
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn comma_joined_lookup() {
        assert!(is_comma_joined("ACCEPT"));
        assert!(is_comma_joined("VIA"));
        assert!(!is_comma_joined("CONTENT-TYPE"));
        assert!(!is_comma_joined("HOST"));
    }
}
