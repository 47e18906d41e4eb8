//! Response serialization

use std::io::Write;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::http::response::Response;

/// Encode status line, headers and body exactly as they go on the wire
pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut wire = Vec::with_capacity(256 + resp.body.len());

    // Writing into a Vec cannot fail
    let _ = write!(
        wire,
        "HTTP/1.1 {} {}\r\n",
        resp.status.as_u16(),
        resp.status.reason_phrase()
    );
    for (name, value) in resp.headers.iter() {
        let _ = write!(wire, "{}: {}\r\n", name, value);
    }
    wire.extend_from_slice(b"\r\n");
    wire.extend_from_slice(&resp.body);

    wire
}

/// A serialized response and how much of it the client has taken
pub struct ResponseWriter {
    pending: Vec<u8>,
    offset: usize,
}

impl ResponseWriter {
    pub fn new(response: &Response) -> Self {
        Self {
            pending: serialize_response(response),
            offset: 0,
        }
    }

    /// Push the remaining bytes to `stream` and flush.
    pub async fn send<S>(&mut self, stream: &mut S) -> anyhow::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        while let Some(rest) = self.pending.get(self.offset..).filter(|r| !r.is_empty()) {
            match stream.write(rest).await? {
                0 => anyhow::bail!("client closed the connection mid-response"),
                n => self.offset += n,
            }
        }

        stream.flush().await?;
        Ok(())
    }
}
