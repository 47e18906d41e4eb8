//! Client request parsing
//!
//! Works on whatever has been buffered so far. `Incomplete` asks the caller
//! to read more; every other error is final for the connection.

use crate::http::chunked::{self, ChunkedError};
use crate::http::headers::HeaderMap;
use crate::http::request::{Method, Request};

/// Largest request body accepted from a client
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    InvalidHeader,
    InvalidContentLength,
    InvalidChunk,
    BodyTooLarge,
    Incomplete,
}

/// Parse one request from the front of `buf`.
///
/// Returns the request and how many bytes of `buf` it occupied, so
/// pipelined requests can follow.
pub fn parse_http_request(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let head_len = find_headers_end(buf).ok_or(ParseError::Incomplete)?;
    let head = std::str::from_utf8(&buf[..head_len]).map_err(|_| ParseError::InvalidRequest)?;
    let rest = &buf[head_len + 4..];

    let mut lines = head.split("\r\n");
    let (method, target, version) = request_line(lines.next().unwrap_or_default())?;
    let headers = parse_header_lines(lines)?;

    let (body, body_len) = read_body(rest, &headers)?;

    let request = Request {
        method,
        path: target.to_string(),
        version: version.to_string(),
        headers,
        body,
    };
    Ok((request, head_len + 4 + body_len))
}

/// `METHOD target HTTP/x.y`
fn request_line(line: &str) -> Result<(Method, &str, &str), ParseError> {
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::InvalidRequest);
    };

    let method = Method::from_str(method).ok_or(ParseError::InvalidMethod)?;
    Ok((method, target, version))
}

/// Body bytes per the framing headers, plus how many input bytes they used
fn read_body(rest: &[u8], headers: &HeaderMap) -> Result<(Vec<u8>, usize), ParseError> {
    if is_chunked(headers) {
        return chunked::decode_with_limit(rest, MAX_BODY_BYTES).map_err(|e| match e {
            ChunkedError::Incomplete => ParseError::Incomplete,
            ChunkedError::Invalid => ParseError::InvalidChunk,
            ChunkedError::TooLarge => ParseError::BodyTooLarge,
        });
    }

    let length = match headers.get("Content-Length") {
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| ParseError::InvalidContentLength)?,
        None => 0,
    };
    if length > MAX_BODY_BYTES {
        return Err(ParseError::BodyTooLarge);
    }

    let body = rest.get(..length).ok_or(ParseError::Incomplete)?;
    Ok((body.to_vec(), length))
}

/// True once a complete header block in `buf` carries
/// `Expect: 100-continue`, i.e. the client is holding its body back.
pub fn wants_continue(buf: &[u8]) -> bool {
    let Some(head_len) = find_headers_end(buf) else {
        return false;
    };
    let Ok(head) = std::str::from_utf8(&buf[..head_len]) else {
        return false;
    };

    let mut lines = head.split("\r\n");
    let is_http11 = lines
        .next()
        .is_some_and(|line| line.ends_with("HTTP/1.1"));
    is_http11
        && parse_header_lines(lines).is_ok_and(|headers| {
            headers
                .get_all("Expect")
                .any(|v| v.trim().eq_ignore_ascii_case("100-continue"))
        })
}

/// Parse `Name: value` lines into a header map, stopping at the first empty line.
pub fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::new();

    for line in lines {
        if line.is_empty() {
            break;
        }

        let (key, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(ParseError::InvalidHeader);
        }

        headers.append(key, value.trim());
    }

    Ok(headers)
}

/// True if the message body uses chunked transfer coding
pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all("Transfer-Encoding")
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
}

pub fn find_headers_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
