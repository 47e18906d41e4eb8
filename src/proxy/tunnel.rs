//! SSH tunnels
//!
//! A tunnel is one SSH session to a jump server. Each dial opens a
//! `direct-tcpip` channel through it to the backend.

use crate::config::{Forwarding, TransportSettings};
use crate::error::{GatewayError, Result};
use crate::proxy::transport::{BoxedStream, Dialer, ensure_tcp};
use async_trait::async_trait;
use russh::client;
use russh_keys::key;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::timeout;

/// How the tunnel authenticates against the jump server
#[derive(Debug, Clone)]
pub enum Credential {
    PrivateKey(PathBuf),
    Password(String),
}

/// SSH tunnel description: jump server, backend behind it, and credentials
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub server: String,
    pub remote: String,
    pub user: String,
    pub credential: Credential,
    pub insecure_ignore_host_key: bool,
}

impl Tunnel {
    /// Build a tunnel description from a backend's forwarding block.
    ///
    /// A private key takes precedence over a password.
    pub fn from_forwarding(forwarding: &Forwarding, remote: &str) -> Result<Self> {
        let credential = match (&forwarding.private_key, &forwarding.password) {
            (Some(path), _) => Credential::PrivateKey(path.clone()),
            (None, Some(password)) => Credential::Password(password.clone()),
            (None, None) => {
                return Err(GatewayError::Config("no forwarding credential".to_string()));
            }
        };

        Ok(Self {
            server: forwarding.server.clone(),
            remote: remote.to_string(),
            user: forwarding.user.clone(),
            credential,
            insecure_ignore_host_key: forwarding.insecure_ignore_host_key,
        })
    }

    /// Establish the SSH session and authenticate.
    ///
    /// Handshake and authentication together are bounded by the handshake
    /// timeout. There is no fallback to a direct connection.
    pub async fn open(&self, settings: &TransportSettings) -> Result<SshDialer> {
        // Key problems are reported before touching the network
        let auth = match &self.credential {
            Credential::PrivateKey(path) => {
                let pair = russh_keys::load_secret_key(path, None)
                    .map_err(|e| GatewayError::Auth(format!("{}: {}", path.display(), e)))?;
                PreparedAuth::Key(Arc::new(pair))
            }
            Credential::Password(password) => PreparedAuth::Password(password.clone()),
        };

        if self.insecure_ignore_host_key {
            tracing::warn!(
                server = %self.server,
                "Host key verification disabled for ssh tunnel"
            );
        }

        let (host, port) = split_host_port(&self.server)
            .ok_or_else(|| GatewayError::Tunnel(format!("invalid server address '{}'", self.server)))?;

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(settings.idle_timeout()),
            ..Default::default()
        });
        let handler = TunnelClient {
            host: host.clone(),
            port,
            insecure_ignore_host_key: self.insecure_ignore_host_key,
        };

        let establish = async {
            let mut handle = client::connect(config, (host.as_str(), port), handler)
                .await
                .map_err(|e| GatewayError::Tunnel(format!("Server dial error: {}", e)))?;

            let accepted = match auth {
                PreparedAuth::Key(pair) => handle.authenticate_publickey(&self.user, pair).await,
                PreparedAuth::Password(password) => {
                    handle.authenticate_password(&self.user, password).await
                }
            }
            .map_err(|e| GatewayError::Tunnel(format!("authentication error: {}", e)))?;

            if !accepted {
                return Err(GatewayError::Tunnel(format!(
                    "authentication rejected for user '{}'",
                    self.user
                )));
            }
            Ok::<_, GatewayError>(handle)
        };

        let handle = timeout(settings.handshake_timeout(), establish)
            .await
            .map_err(|_| {
                GatewayError::Tunnel(format!("handshake with {} timed out", self.server))
            })??;

        tracing::debug!(server = %self.server, remote = %self.remote, "SSH session established");

        Ok(SshDialer {
            handle,
            server: self.server.clone(),
        })
    }
}

enum PreparedAuth {
    Key(Arc<key::KeyPair>),
    Password(String),
}

/// Session event handler; only host-key checking is customised
struct TunnelClient {
    host: String,
    port: u16,
    insecure_ignore_host_key: bool,
}

#[async_trait]
impl client::Handler for TunnelClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        if self.insecure_ignore_host_key {
            return Ok(true);
        }

        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(known) => {
                if !known {
                    tracing::warn!(host = %self.host, port = self.port, "Unknown ssh host key");
                }
                Ok(known)
            }
            Err(e) => {
                tracing::warn!(host = %self.host, port = self.port, error = %e, "Ssh host key rejected");
                Ok(false)
            }
        }
    }
}

/// Dialer backed by a live SSH session
pub struct SshDialer {
    handle: client::Handle<TunnelClient>,
    server: String,
}

#[async_trait]
impl Dialer for SshDialer {
    async fn dial(&self, network: &str, address: &str) -> Result<BoxedStream> {
        ensure_tcp(network)?;

        let (host, port) = split_host_port(address)
            .ok_or_else(|| GatewayError::Tunnel(format!("invalid remote address '{}'", address)))?;

        let channel = self
            .handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| GatewayError::Tunnel(format!("Remote dial error: {}", e)))?;

        tracing::trace!(server = %self.server, address, "Opened ssh channel");
        Ok(Box::pin(channel.into_stream()))
    }

    fn is_tunneled(&self) -> bool {
        true
    }

    async fn shutdown(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!(server = %self.server, error = %e, "SSH disconnect failed");
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts
pub(crate) fn split_host_port(address: &str) -> Option<(String, u16)> {
    let (host, port) = address.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarding(key: Option<&str>, password: Option<&str>) -> Forwarding {
        Forwarding {
            server: "3.3.3.3:22".to_string(),
            user: "ssh-user".to_string(),
            private_key: key.map(PathBuf::from),
            password: password.map(str::to_string),
            insecure_ignore_host_key: true,
        }
    }

    #[test]
    fn key_wins_over_password() {
        let tunnel =
            Tunnel::from_forwarding(&forwarding(Some("/k.pem"), Some("pw")), "2.2.2.2:8081")
                .unwrap();
        assert!(matches!(tunnel.credential, Credential::PrivateKey(_)));
        assert_eq!(tunnel.remote, "2.2.2.2:8081");
    }

    #[test]
    fn missing_credential_is_a_config_error() {
        let err = Tunnel::from_forwarding(&forwarding(None, None), "2.2.2.2:8081").unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn splits_host_and_port() {
        assert_eq!(split_host_port("10.0.0.1:22"), Some(("10.0.0.1".to_string(), 22)));
        assert_eq!(split_host_port("[::1]:2222"), Some(("::1".to_string(), 2222)));
        assert_eq!(split_host_port("nohost"), None);
        assert_eq!(split_host_port(":80"), None);
    }

    #[tokio::test]
    async fn unreadable_key_is_an_auth_error() {
        let tunnel = Tunnel::from_forwarding(
            &forwarding(Some("/nonexistent/key.pem"), None),
            "2.2.2.2:8081",
        )
        .unwrap();
        let err = tunnel.open(&TransportSettings::default()).await.err().unwrap();
        assert!(matches!(err, GatewayError::Auth(_)));
    }
}
