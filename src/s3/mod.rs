//! S3 protocol plumbing shared by the authenticator and the handlers:
//! URI percent encoding/decoding, request identifiers and wire date formats.

pub mod acl;
pub mod auth;
pub mod handlers;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rand::RngCore;

/// Percent-encode with the S3 rule set: unreserved `[A-Za-z0-9\-._~]` passes
/// through, `/` passes through only when `encode_slash` is false, everything
/// else becomes `%XX` with uppercase hex.
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(input.len());
    for &byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => {
                out.push('%');
                out.push(HEX[usize::from(byte >> 4)] as char);
                out.push(HEX[usize::from(byte & 15)] as char);
            }
        }
    }
    out
}

/// Decode one round of percent-encoding. `+` is left alone (S3 query values
/// use `%20` for spaces). Returns `None` for truncated or non-hex escapes
/// and for byte sequences that are not valid UTF-8.
pub fn uri_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = hex_val(*bytes.get(i + 1)?)?;
            let lo = hex_val(*bytes.get(i + 2)?)?;
            out.push(hi << 4 | lo);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Generate a request id: 16 uppercase hex characters from the CSPRNG.
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode_upper(bytes)
}

/// Generate the `x-amz-id-2` value: base64 of 24 random bytes.
pub fn generate_amz_id2() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    BASE64.encode(bytes)
}

/// ISO 8601 with milliseconds, as used inside XML bodies:
/// `2026-02-22T12:00:00.000Z`.
pub fn iso8601_millis(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// RFC 1123, as used in `Date` and `Last-Modified` headers:
/// `Sun, 22 Feb 2026 12:00:00 GMT`.
pub fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse an ISO 8601 timestamp as stored in metadata rows.
pub fn parse_iso8601(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Parse an RFC 1123 date as sent in conditional request headers.
pub fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%a, %d %b %Y %H:%M:%S GMT")
        .ok()
        .map(|t| Utc.from_utc_datetime(&t))
}

/// Parse an `x-amz-date` timestamp (`YYYYMMDD'T'HHMMSS'Z'`).
pub fn parse_amz_date(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%SZ")
        .ok()
        .map(|t| Utc.from_utc_datetime(&t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_encode_rule_set() {
        assert_eq!(uri_encode("AZaz09-._~", true), "AZaz09-._~");
        assert_eq!(uri_encode("a/b", false), "a/b");
        assert_eq!(uri_encode("a/b", true), "a%2Fb");
        assert_eq!(uri_encode("a b+c", true), "a%20b%2Bc");
        assert_eq!(uri_encode("€", true), "%E2%82%AC");
    }

    #[test]
    fn test_uri_decode() {
        assert_eq!(uri_decode("a%20b").as_deref(), Some("a b"));
        assert_eq!(uri_decode("a+b").as_deref(), Some("a+b"));
        assert_eq!(uri_decode("%E2%82%AC").as_deref(), Some("€"));
        assert_eq!(uri_decode("%2"), None);
        assert_eq!(uri_decode("%zz"), None);
    }

    #[test]
    fn test_decode_then_encode_defeats_double_encoding() {
        // A path delivered already-encoded must canonicalize to itself,
        // not to a doubly-encoded form.
        let raw = "/b/hello%20world";
        let decoded = uri_decode(raw).unwrap();
        assert_eq!(uri_encode(&decoded, false), "/b/hello%20world");
        assert_ne!(uri_encode(raw, false), raw);
    }

    #[test]
    fn test_request_id_shape() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_uppercase());
    }

    #[test]
    fn test_date_formats() {
        let t = Utc.with_ymd_and_hms(2026, 2, 22, 12, 0, 0).unwrap();
        assert_eq!(iso8601_millis(t), "2026-02-22T12:00:00.000Z");
        assert_eq!(http_date(t), "Sun, 22 Feb 2026 12:00:00 GMT");
        assert_eq!(parse_http_date("Sun, 22 Feb 2026 12:00:00 GMT"), Some(t));
        assert_eq!(parse_amz_date("20260222T120000Z"), Some(t));
        assert_eq!(parse_iso8601("2026-02-22T12:00:00.000Z"), Some(t));
    }
}
