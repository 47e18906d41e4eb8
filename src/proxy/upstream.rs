//! Upstream request forwarding
//!
//! Sends one request to a fixed backend address over a stream obtained
//! from the transport, and captures the complete response in memory so it
//! can be rewritten before anything reaches the client.

use crate::error::{GatewayError, Result};
use crate::http::chunked::{self, ChunkedError};
use crate::http::headers::HeaderMap;
use crate::http::parser::{find_headers_end, is_chunked, parse_header_lines};
use crate::http::request::{Method, Request};
use crate::http::response::StatusCode;
use crate::proxy::transport::{BoxedStream, Transport};
use anyhow::Context;
use bytes::{Buf, BytesMut};
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

/// Default buffer size for streaming
const BUFFER_SIZE: usize = 8192;

/// Largest response header block accepted from a backend
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: [&str; 7] = [
    "Connection",
    "Keep-Alive",
    "Proxy-Connection",
    "Transfer-Encoding",
    "Upgrade",
    "TE",
    "Trailer",
];

/// Backend response as received, body fully buffered and de-chunked
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

/// Forwards requests to one backend address
pub struct ReverseProxy<'a> {
    /// Backend `host:port`
    address: String,

    /// Where streams come from
    transport: &'a Transport,
}

impl<'a> ReverseProxy<'a> {
    pub fn new(address: impl Into<String>, transport: &'a Transport) -> Self {
        Self {
            address: address.into(),
            transport,
        }
    }

    /// Forward `request` with its path replaced by `/<residual>`.
    ///
    /// Failures are not retried.
    pub async fn forward(
        &self,
        request: &Request,
        residual: &str,
        client_ip: Option<IpAddr>,
    ) -> Result<CapturedResponse> {
        let mut stream = self.transport.connect(&self.address).await?;

        tracing::debug!(
            address = %self.address,
            method = request.method.as_str(),
            residual,
            tunneled = self.transport.is_tunneled(),
            "Forwarding request to backend"
        );

        self.exchange(&mut stream, request, residual, client_ip)
            .await
            .map_err(|e| GatewayError::forward(&self.address, format!("{:#}", e)))
    }

    async fn exchange(
        &self,
        stream: &mut BoxedStream,
        request: &Request,
        residual: &str,
        client_ip: Option<IpAddr>,
    ) -> anyhow::Result<CapturedResponse> {
        let settings = self.transport.settings();
        let idle = settings.idle_timeout();
        let head_only = request.method == Method::HEAD;

        let head = self.build_request_head(request, residual, client_ip);
        let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

        with_idle(idle, stream.write_all(&head)).await?;

        if request.expects_continue() && !request.body.is_empty() {
            stream.flush().await?;
            // A final status here means the backend doesn't want the body
            match timeout(
                settings.expect_continue_timeout(),
                read_head(stream, &mut buffer, idle),
            )
            .await
            {
                Ok(Ok((status, _))) if status == StatusCode::CONTINUE => {}
                Ok(Ok((status, headers))) => {
                    let body = read_body(stream, &mut buffer, status, &headers, head_only, idle)
                        .await?;
                    return Ok(CapturedResponse {
                        status,
                        headers,
                        body,
                    });
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    tracing::trace!(address = %self.address, "No 100 Continue, sending body");
                }
            }
        }

        if !request.body.is_empty() {
            with_idle(idle, stream.write_all(&request.body)).await?;
        }
        stream.flush().await?;

        tracing::trace!("Request sent to backend");

        read_response(stream, &mut buffer, head_only, idle).await
    }

    /// Serialize request line and headers for the backend.
    ///
    /// `Host` becomes the backend address, the path becomes `/<residual>`
    /// (query string kept), hop-by-hop headers are dropped and the client
    /// address is appended to `X-Forwarded-For`.
    pub fn build_request_head(
        &self,
        request: &Request,
        residual: &str,
        client_ip: Option<IpAddr>,
    ) -> Vec<u8> {
        let mut target = format!("/{}", residual);
        if let Some(query) = request.query() {
            target.push('?');
            target.push_str(query);
        }

        let mut headers = request.headers.clone();
        headers.insert("Host", self.address.clone());

        for name in HOP_BY_HOP {
            headers.remove(name);
        }

        if !request.body.is_empty() || request.header("Content-Length").is_some() {
            headers.insert("Content-Length", request.body.len().to_string());
        }
        if request.body.is_empty() {
            headers.remove("Expect");
        }

        if let Some(ip) = client_ip {
            let forwarded = match request.header("X-Forwarded-For") {
                Some(prior) => format!("{}, {}", prior, ip),
                None => ip.to_string(),
            };
            headers.insert("X-Forwarded-For", forwarded);
        }

        // One exchange per connection
        headers.insert("Connection", "close");

        let mut buffer = Vec::new();
        buffer.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", request.method.as_str(), target).as_bytes(),
        );
        for (key, value) in headers.iter() {
            buffer.extend_from_slice(format!("{}: {}\r\n", key, value).as_bytes());
        }
        buffer.extend_from_slice(b"\r\n");
        buffer
    }
}

async fn with_idle<T>(
    idle: Duration,
    fut: impl std::future::Future<Output = std::io::Result<T>>,
) -> anyhow::Result<T> {
    timeout(idle, fut)
        .await
        .context("idle timeout talking to backend")?
        .map_err(Into::into)
}

/// Read more bytes into `buffer`; returns 0 at end of stream
async fn fill(stream: &mut BoxedStream, buffer: &mut BytesMut, idle: Duration) -> anyhow::Result<usize> {
    buffer.reserve(BUFFER_SIZE);
    with_idle(idle, stream.read_buf(buffer)).await
}

/// Read a final response, skipping interim 1xx responses
pub async fn read_response(
    stream: &mut BoxedStream,
    buffer: &mut BytesMut,
    head_only: bool,
    idle: Duration,
) -> anyhow::Result<CapturedResponse> {
    loop {
        let (status, headers) = read_head(stream, buffer, idle).await?;
        if status.is_informational() && status.as_u16() != 101 {
            continue;
        }

        let body = read_body(stream, buffer, status, &headers, head_only, idle).await?;
        return Ok(CapturedResponse {
            status,
            headers,
            body,
        });
    }
}

/// Read and split off one status line plus header block
async fn read_head(
    stream: &mut BoxedStream,
    buffer: &mut BytesMut,
    idle: Duration,
) -> anyhow::Result<(StatusCode, HeaderMap)> {
    loop {
        if let Some(headers_end) = find_headers_end(buffer) {
            let head = buffer.split_to(headers_end + 4);
            return parse_response_head(&head);
        }

        // Prevent unbounded header growth
        if buffer.len() > MAX_HEADER_BYTES {
            anyhow::bail!("Response headers too large");
        }

        if fill(stream, buffer, idle).await? == 0 {
            anyhow::bail!("Connection closed before complete response received");
        }
    }
}

/// Parse status line and headers
pub fn parse_response_head(head: &[u8]) -> anyhow::Result<(StatusCode, HeaderMap)> {
    let head = std::str::from_utf8(head).context("Invalid UTF-8 in response headers")?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().context("Empty response")?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();

    if parts.len() < 2 || !parts[0].starts_with("HTTP/") {
        anyhow::bail!("Invalid status line: {}", status_line);
    }

    let status = parts[1]
        .parse::<u16>()
        .ok()
        .and_then(StatusCode::from_u16)
        .with_context(|| format!("Invalid status code in: {}", status_line))?;

    let headers = parse_header_lines(lines)
        .map_err(|e| anyhow::anyhow!("Invalid response header: {:?}", e))?;

    Ok((status, headers))
}

/// Read the body framed by chunked coding, Content-Length, or end of stream
async fn read_body(
    stream: &mut BoxedStream,
    buffer: &mut BytesMut,
    status: StatusCode,
    headers: &HeaderMap,
    head_only: bool,
    idle: Duration,
) -> anyhow::Result<Vec<u8>> {
    if head_only || !status.allows_body() {
        return Ok(Vec::new());
    }

    if is_chunked(headers) {
        loop {
            match chunked::decode(buffer) {
                Ok((body, consumed)) => {
                    buffer.advance(consumed);
                    return Ok(body);
                }
                Err(ChunkedError::Invalid | ChunkedError::TooLarge) => {
                    anyhow::bail!("Malformed chunked body")
                }
                Err(ChunkedError::Incomplete) => {
                    if fill(stream, buffer, idle).await? == 0 {
                        anyhow::bail!("Connection closed before complete body received");
                    }
                }
            }
        }
    }

    if let Some(length) = headers.get("Content-Length") {
        let content_length: usize = length
            .trim()
            .parse()
            .with_context(|| format!("Invalid Content-Length: {}", length))?;

        while buffer.len() < content_length {
            if fill(stream, buffer, idle).await? == 0 {
                anyhow::bail!("Connection closed before complete body received");
            }
        }
        return Ok(buffer.split_to(content_length).to_vec());
    }

    // No framing: the body runs until the backend closes
    while fill(stream, buffer, idle).await? != 0 {}
    Ok(buffer.split().to_vec())
}
