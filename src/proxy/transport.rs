//! Upstream transports
//!
//! A transport knows how to open byte streams towards a backend: either a
//! plain TCP dial, or a channel through an SSH session that was established
//! when the transport was built.

use crate::config::TransportSettings;
use crate::error::{GatewayError, Result};
use crate::proxy::backend::Backend;
use crate::proxy::tunnel::Tunnel;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;

/// Anything an HTTP exchange can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send {}

impl<T: AsyncRead + AsyncWrite + Send> AsyncStream for T {}

pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Dial capability handed to the reverse proxy
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a new stream to `address` (`host:port`). Only `tcp` is supported.
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedStream>;

    /// True when streams travel through an SSH session
    fn is_tunneled(&self) -> bool {
        false
    }

    /// Release whatever session backs the dialer
    async fn shutdown(&self) {}
}

/// Plain TCP dialer
pub struct DirectDialer {
    connect_timeout: Duration,
}

impl DirectDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedStream> {
        ensure_tcp(network)?;

        let stream = timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| GatewayError::forward(address, "connection timeout"))?
            .map_err(|e| GatewayError::forward(address, format!("failed to connect: {}", e)))?;

        stream.set_nodelay(true).ok();
        tracing::trace!(address, "Connected to backend");

        Ok(Box::pin(stream))
    }
}

pub(crate) fn ensure_tcp(network: &str) -> Result<()> {
    if network != "tcp" {
        return Err(GatewayError::Config(format!(
            "unsupported network '{}', only tcp can be dialed",
            network
        )));
    }
    Ok(())
}

/// A dialer plus the limits every stream it opens is subject to
pub struct Transport {
    dialer: Box<dyn Dialer>,
    streams: Arc<Semaphore>,
    settings: TransportSettings,
}

impl Transport {
    pub fn new(dialer: Box<dyn Dialer>, settings: TransportSettings) -> Self {
        Self {
            dialer,
            streams: Arc::new(Semaphore::new(settings.max_idle_conns.max(1))),
            settings,
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn is_tunneled(&self) -> bool {
        self.dialer.is_tunneled()
    }

    /// Open a TCP stream to `address`.
    ///
    /// At most `max_idle_conns` streams are open at once; further callers
    /// wait up to the handshake timeout for one to close.
    pub async fn connect(&self, address: &str) -> Result<BoxedStream> {
        let permit = timeout(
            self.settings.handshake_timeout(),
            Arc::clone(&self.streams).acquire_owned(),
        )
        .await
        .map_err(|_| GatewayError::forward(address, "too many open upstream connections"))?
        .map_err(|_| GatewayError::forward(address, "transport closed"))?;

        let inner = self.dialer.dial("tcp", address).await?;
        Ok(Box::pin(LimitedStream {
            inner,
            _permit: permit,
        }))
    }

    /// Tear down the backing session, if any
    pub async fn shutdown(&self) {
        self.streams.close();
        self.dialer.shutdown().await;
    }
}

/// Build the transport for one backend.
///
/// Forwarded backends get their SSH session established here, so an
/// unreachable jump server fails the request before anything is sent.
pub async fn build_transport(backend: &Backend, settings: &TransportSettings) -> Result<Transport> {
    let dialer: Box<dyn Dialer> = match &backend.forwarding {
        None => Box::new(DirectDialer::new(settings.handshake_timeout())),
        Some(forwarding) => {
            let tunnel = Tunnel::from_forwarding(forwarding, &backend.address)?;
            Box::new(tunnel.open(settings).await?)
        }
    };

    Ok(Transport::new(dialer, settings.clone()))
}

/// Stream holding one slot of the transport's connection budget
struct LimitedStream {
    inner: BoxedStream,
    _permit: OwnedSemaphorePermit,
}

impl AsyncRead for LimitedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().inner.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for LimitedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().inner.as_mut().poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().inner.as_mut().poll_shutdown(cx)
    }
}
