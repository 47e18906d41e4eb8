//! Gateway configuration
//!
//! The configuration is a YAML document loaded once at startup and shared
//! read-only by every request afterwards.

use crate::error::{GatewayError, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

/// Top-level gateway configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Port the gateway listens on
    #[serde(default = "default_app_port")]
    pub app_port: u16,

    /// Interface the gateway binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Backend that serves `/` and every path whose first segment is unknown
    #[serde(default)]
    pub start_page: String,

    /// Backend name -> backend definition
    #[serde(default)]
    pub hosts: BTreeMap<String, Host>,

    /// Upstream transport knobs
    #[serde(default)]
    pub transport: TransportSettings,
}

/// A named backend
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Host {
    /// `host:port` of the backend as seen from the gateway (or the jump server)
    pub address: String,

    /// Present when the backend is only reachable through an SSH jump server
    #[serde(default)]
    pub forwarding: Option<Forwarding>,
}

/// SSH reachability of a backend
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Forwarding {
    /// Jump server `host:port`
    pub server: String,

    /// SSH user on the jump server
    pub user: String,

    /// Path to a private key file
    #[serde(default)]
    pub private_key: Option<PathBuf>,

    /// Password for the SSH user
    #[serde(default)]
    pub password: Option<String>,

    /// Accept any host key presented by the jump server.
    ///
    /// INSECURE: defaults to `true` to stay compatible with existing
    /// deployments. Set to `false` to check the key against `known_hosts`.
    #[serde(default = "default_insecure_ignore_host_key")]
    pub insecure_ignore_host_key: bool,
}

/// Timeouts and limits applied to every upstream exchange
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TransportSettings {
    pub idle_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub expect_continue_timeout_ms: u64,
    pub max_idle_conns: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 90,
            handshake_timeout_secs: 10,
            expect_continue_timeout_ms: 1000,
            max_idle_conns: 100,
        }
    }
}

impl TransportSettings {
    /// Longest silence tolerated on an upstream stream
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Bound on TCP connect and SSH handshake plus authentication
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// How long to wait for `100 Continue` before sending a request body anyway
    pub fn expect_continue_timeout(&self) -> Duration {
        Duration::from_millis(self.expect_continue_timeout_ms)
    }
}

fn default_app_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_insecure_ignore_host_key() -> bool {
    true
}

impl Config {
    /// Load the configuration named by `GATEWAY_CONFIG` (or `config.yml`).
    ///
    /// `LISTEN` overrides the bind address, the same way it overrides the
    /// listen address of a plain proxy.
    pub fn load() -> Result<Self> {
        let path = std::env::var("GATEWAY_CONFIG")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg = Self::from_file(&path)?;

        if let Ok(bind) = std::env::var("LISTEN") {
            cfg.bind_address = bind;
        }

        Ok(cfg)
    }

    /// Read and parse a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("can't read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse a YAML document. An empty document is a valid, empty config.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self {
                app_port: default_app_port(),
                bind_address: default_bind_address(),
                ..Self::default()
            });
        }

        let cfg: Self = serde_yaml::from_str(raw)
            .map_err(|e| GatewayError::Config(format!("invalid config: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject forwarding blocks the transport could never use.
    pub fn validate(&self) -> Result<()> {
        for (name, host) in &self.hosts {
            let Some(fwd) = &host.forwarding else {
                continue;
            };

            match (&fwd.private_key, &fwd.password) {
                (None, None) => {
                    return Err(GatewayError::Config(format!(
                        "host '{}': forwarding needs a private-key or a password",
                        name
                    )));
                }
                (Some(_), Some(_)) => {
                    tracing::warn!(
                        host = %name,
                        "Both private-key and password set for forwarding, private-key wins"
                    );
                }
                _ => {}
            }
        }

        if !self.start_page.is_empty() && !self.hosts.contains_key(&self.start_page) {
            tracing::warn!(
                start_page = %self.start_page,
                "Start page is not a configured host, unmatched paths will fail with 404"
            );
        }

        Ok(())
    }

    /// `bind_address:app_port`
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.app_port)
    }
}
