use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::config::Config;
use crate::http::connection::Connection;
use crate::proxy::gateway::Gateway;

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let listen_addr = cfg.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!(
        backends = cfg.hosts.len(),
        start_page = %cfg.start_page,
        "Listening on {}",
        listen_addr
    );

    serve(listener, Arc::new(Gateway::new(cfg))).await
}

/// Accept connections forever, one task per connection
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        tracing::debug!("Accepted connection from {}", peer);

        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            let mut conn = Connection::new(socket, peer, gateway);
            if let Err(e) = conn.run().await {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}
