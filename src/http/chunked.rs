//! `Transfer-Encoding: chunked` body decoding
//!
//! Works on whatever has been buffered so far and reports `Incomplete`
//! until the terminating chunk and trailer section are present.

#[derive(Debug, PartialEq, Eq)]
pub enum ChunkedError {
    /// More bytes are needed
    Incomplete,
    /// Malformed chunk size line or missing CRLF after chunk data
    Invalid,
    /// Decoded payload would exceed the caller's limit
    TooLarge,
}

/// Decode a complete chunked body from the start of `buf`.
///
/// Returns the payload and the number of bytes consumed, trailers included.
pub fn decode(buf: &[u8]) -> Result<(Vec<u8>, usize), ChunkedError> {
    decode_with_limit(buf, usize::MAX)
}

/// Like [`decode`], but fails with `TooLarge` as soon as a chunk header
/// announces more than `limit` payload bytes in total.
pub fn decode_with_limit(buf: &[u8], limit: usize) -> Result<(Vec<u8>, usize), ChunkedError> {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let line_end = find_crlf(&buf[pos..]).ok_or(ChunkedError::Incomplete)? + pos;
        let size = parse_size(&buf[pos..line_end])?;
        pos = line_end + 2;

        if size == 0 {
            // Trailer section: header lines until an empty one
            loop {
                let end = find_crlf(&buf[pos..]).ok_or(ChunkedError::Incomplete)? + pos;
                let empty = end == pos;
                pos = end + 2;
                if empty {
                    return Ok((body, pos));
                }
            }
        }

        if body.len().checked_add(size).is_none_or(|total| total > limit) {
            return Err(ChunkedError::TooLarge);
        }
        let data_end = pos.checked_add(size).ok_or(ChunkedError::Invalid)?;
        let chunk_end = data_end.checked_add(2).ok_or(ChunkedError::Invalid)?;

        if buf.len() < chunk_end {
            return Err(ChunkedError::Incomplete);
        }
        body.extend_from_slice(&buf[pos..data_end]);

        if &buf[data_end..chunk_end] != b"\r\n" {
            return Err(ChunkedError::Invalid);
        }
        pos = chunk_end;
    }
}

fn parse_size(line: &[u8]) -> Result<usize, ChunkedError> {
    let line = std::str::from_utf8(line).map_err(|_| ChunkedError::Invalid)?;
    // Chunk extensions are ignored
    let hex = line.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(hex, 16).map_err(|_| ChunkedError::Invalid)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
