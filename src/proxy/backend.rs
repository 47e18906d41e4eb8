//! Backend set
//!
//! The named backends from the configuration, frozen at startup and shared
//! by every request without locking.

use crate::config::{Config, Forwarding};
use crate::proxy::rewrite::Replacement;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A named upstream service
#[derive(Debug, Clone)]
pub struct Backend {
    /// Name used as the first path segment
    pub name: String,

    /// `host:port` as seen from the gateway or the jump server
    pub address: String,

    /// SSH reachability, if the backend is not directly reachable
    pub forwarding: Option<Forwarding>,
}

/// Immutable name -> backend map
#[derive(Debug, Clone, Default)]
pub struct BackendSet {
    backends: Arc<BTreeMap<String, Backend>>,
}

impl BackendSet {
    /// Build the set from the configured hosts
    pub fn from_config(config: &Config) -> Self {
        let backends = config
            .hosts
            .iter()
            .map(|(name, host)| {
                (
                    name.clone(),
                    Backend {
                        name: name.clone(),
                        address: host.address.clone(),
                        forwarding: host.forwarding.clone(),
                    },
                )
            })
            .collect();

        Self {
            backends: Arc::new(backends),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Backend> {
        self.backends.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Address -> gateway prefix pairs for every backend, in name order.
    ///
    /// Used to point links at other backends back through the gateway.
    pub fn link_replacements(&self, original_host: &str) -> Vec<Replacement> {
        self.backends
            .values()
            .map(|b| Replacement {
                from: b.address.clone(),
                to: format!("{}/{}", original_host, b.name),
            })
            .collect()
    }
}
