use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::http::parser::{
    MAX_BODY_BYTES, ParseError, find_headers_end, parse_http_request, wants_continue,
};
use crate::http::request::{Method, Request};
use crate::http::response::{Response, StatusCode};
use crate::http::writer::ResponseWriter;
use crate::proxy::gateway::Gateway;

/// Largest header block accepted from a client
const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Interim answer to `Expect: 100-continue`
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// One client connection, served until either side closes it
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    gateway: Arc<Gateway>,
    inbound: BytesMut,
    /// `100 Continue` already sent for the request being read
    continued: bool,
    state: ConnectionState,
}

pub enum ConnectionState {
    /// Waiting for a complete request
    Reading,
    /// Request handed to the gateway
    Proxying(Request),
    /// Response queued for the client
    Responding {
        writer: ResponseWriter,
        keep_alive: bool,
    },
    Closed,
}

/// Why no request could be taken off the wire
#[derive(Debug)]
enum ReadFailure {
    Malformed(ParseError),
    HeadersTooLarge,
    BodyTooLarge,
}

impl std::fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadFailure::Malformed(e) => write!(f, "malformed request: {:?}", e),
            ReadFailure::HeadersTooLarge => f.write_str("request headers too large"),
            ReadFailure::BodyTooLarge => f.write_str("request body too large"),
        }
    }
}

impl ReadFailure {
    fn response(&self) -> Response {
        let status = match self {
            ReadFailure::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        };
        Response::error(status, status.reason_phrase())
    }
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, gateway: Arc<Gateway>) -> Self {
        Self {
            stream,
            peer,
            gateway,
            inbound: BytesMut::with_capacity(4096),
            continued: false,
            state: ConnectionState::Reading,
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.state = match std::mem::replace(&mut self.state, ConnectionState::Closed) {
                ConnectionState::Reading => match self.next_request().await? {
                    Ok(Some(request)) => ConnectionState::Proxying(request),
                    Ok(None) => ConnectionState::Closed,
                    Err(failure) => {
                        tracing::warn!(peer = %self.peer, %failure, "Rejecting request");
                        let mut response = failure.response();
                        response.headers.insert("Connection", "close");
                        ConnectionState::Responding {
                            writer: ResponseWriter::new(&response),
                            keep_alive: false,
                        }
                    }
                },

                ConnectionState::Proxying(request) => {
                    let keep_alive = request.keep_alive();
                    let response = self.respond(request, keep_alive).await;
                    ConnectionState::Responding {
                        writer: ResponseWriter::new(&response),
                        keep_alive,
                    }
                }

                ConnectionState::Responding {
                    mut writer,
                    keep_alive,
                } => {
                    writer.send(&mut self.stream).await?;
                    if keep_alive {
                        ConnectionState::Reading
                    } else {
                        ConnectionState::Closed
                    }
                }

                ConnectionState::Closed => return Ok(()),
            };
        }
    }

    /// Run the request through the gateway and adapt the result to this
    /// connection.
    async fn respond(&self, request: Request, keep_alive: bool) -> Response {
        let head_only = request.method == Method::HEAD;

        let mut response = self.gateway.handle(request, Some(self.peer)).await;
        if head_only {
            response.body.clear();
        }
        if !keep_alive {
            response.headers.insert("Connection", "close");
        }
        response
    }

    /// Take the next request off the connection.
    ///
    /// `Ok(None)` means the client went away cleanly.
    async fn next_request(&mut self) -> anyhow::Result<Result<Option<Request>, ReadFailure>> {
        loop {
            match parse_http_request(&self.inbound) {
                Ok((request, consumed)) => {
                    self.inbound.advance(consumed);
                    self.continued = false;
                    return Ok(Ok(Some(request)));
                }
                Err(ParseError::Incomplete) => {
                    let head_done = find_headers_end(&self.inbound).is_some();
                    if !head_done && self.inbound.len() > MAX_HEADER_BYTES {
                        return Ok(Err(ReadFailure::HeadersTooLarge));
                    }
                    // Chunk framing can pad the body, but not without bound
                    if self.inbound.len() > MAX_HEADER_BYTES + 2 * MAX_BODY_BYTES {
                        return Ok(Err(ReadFailure::BodyTooLarge));
                    }
                    if head_done && !self.continued && wants_continue(&self.inbound) {
                        self.stream.write_all(CONTINUE).await?;
                        self.stream.flush().await?;
                        self.continued = true;
                    }
                }
                Err(ParseError::BodyTooLarge) => return Ok(Err(ReadFailure::BodyTooLarge)),
                Err(e) => return Ok(Err(ReadFailure::Malformed(e))),
            }

            self.inbound.reserve(4096);
            if self.stream.read_buf(&mut self.inbound).await? == 0 {
                return Ok(Ok(None));
            }
        }
    }
}
