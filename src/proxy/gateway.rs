//! Gateway request handling
//!
//! Every request walks the same stages:
//!
//! ```text
//! ROUTING → BACKEND_LOOKUP → TRANSPORT_READY → FORWARDED → REWRITTEN → WRITTEN
//!    └──────────────┴──────────────┴──────────────┴────────────┴──→ FAILED
//! ```
//!
//! Each stage returns a `Result`; [`Gateway::handle`] is the single place
//! where failures become HTTP responses. The pipeline runs in its own task
//! so a panic in one request ends up as a 500 for that request only.

use crate::config::{Config, TransportSettings};
use crate::error::{GatewayError, Result};
use crate::http::request::Request;
use crate::http::response::{Response, StatusCode};
use crate::proxy::backend::BackendSet;
use crate::proxy::rewrite::{self, RewriteContext};
use crate::proxy::router;
use crate::proxy::transport;
use crate::proxy::upstream::ReverseProxy;
use std::net::SocketAddr;
use std::sync::Arc;

/// Request handler built from the configuration snapshot
pub struct Gateway {
    start_page: String,
    backends: BackendSet,
    settings: TransportSettings,
    /// Used as the public host when a client sends no `Host` header
    default_host: String,
}

impl Gateway {
    pub fn new(config: &Config) -> Self {
        Self {
            start_page: config.start_page.clone(),
            backends: BackendSet::from_config(config),
            settings: config.transport.clone(),
            default_host: config.listen_addr(),
        }
    }

    /// Handle one request. Always produces a complete response.
    pub async fn handle(self: &Arc<Self>, request: Request, peer: Option<SocketAddr>) -> Response {
        let method = request.method.as_str().to_string();
        let uri = request.path.clone();

        let gateway = Arc::clone(self);
        recover(async move { gateway.proxy(request, peer).await }, &method, &uri).await
    }

    /// Run the request pipeline
    pub async fn proxy(&self, request: Request, peer: Option<SocketAddr>) -> Result<Response> {
        // ROUTING
        let path = request.path_only();
        let route = router::route(&path, &self.backends, &self.start_page);

        // BACKEND_LOOKUP
        let backend = self
            .backends
            .get(&route.backend)
            .ok_or_else(|| GatewayError::NotFound(route.backend.clone()))?;

        // TRANSPORT_READY
        let transport = transport::build_transport(backend, &self.settings).await?;

        // FORWARDED
        let original_host = request
            .host()
            .map(str::to_string)
            .unwrap_or_else(|| self.default_host.clone());

        let proxy = ReverseProxy::new(backend.address.as_str(), &transport);
        let captured = proxy
            .forward(&request, &route.residual, peer.map(|p| p.ip()))
            .await;
        transport.shutdown().await;
        let captured = captured?;

        // REWRITTEN
        let ctx = RewriteContext::new(&original_host, backend, &self.backends);
        let response = rewrite::rewrite(captured, &ctx)?;

        match &backend.forwarding {
            Some(forwarding) => tracing::info!(
                backend = %backend.name,
                address = %backend.address,
                server = %forwarding.server,
                status = response.status.as_u16(),
                tunneled = true,
                "Request to {} was successfully proxied using ssh through {}",
                backend.address,
                forwarding.server
            ),
            None => tracing::info!(
                backend = %backend.name,
                address = %backend.address,
                status = response.status.as_u16(),
                tunneled = false,
                "Request to {} was successfully performed",
                backend.address
            ),
        }

        Ok(response)
    }
}

/// Run a request pipeline in its own task and turn every way it can end
/// into a response. Panics become `UnknownFault`.
pub(crate) async fn recover<F>(pipeline: F, method: &str, uri: &str) -> Response
where
    F: Future<Output = Result<Response>> + Send + 'static,
{
    let error = match tokio::spawn(pipeline).await {
        Ok(Ok(response)) => return response,
        Ok(Err(error)) => {
            tracing::warn!(
                status = error.status_code(),
                method,
                uri,
                "An error handled {}",
                error
            );
            error
        }
        Err(join_error) => {
            let fault = GatewayError::UnknownFault(panic_message(join_error));
            tracing::error!(method, uri, "An unknown error was handled: {}", fault);
            fault
        }
    };

    error_response(&error)
}

/// Map a failure to the response the client sees
pub fn error_response(error: &GatewayError) -> Response {
    let status = StatusCode::from_u16(error.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let message = match error {
        GatewayError::UnknownFault(_) => {
            format!("{}: {}", status.reason_phrase(), error)
        }
        _ => error.to_string(),
    };

    Response::error(status, &message)
}

fn panic_message(join_error: tokio::task::JoinError) -> String {
    if !join_error.is_panic() {
        return join_error.to_string();
    }

    let payload = join_error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "request handler panicked".to_string()
    }
}

/// Log panics with a backtrace captured where they happen.
///
/// The request still gets its 500 from [`Gateway::handle`]; this only adds
/// the trace for operators.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!("Panic in request handling: {}\nStack trace:\n{}", info, backtrace);
    }));
}
