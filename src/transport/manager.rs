//! Named registry of round trippers with config-diffing updates.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{create_round_tripper, RoundTripper, DEFAULT_TRANSPORT};
use crate::config::model::ServersTransportConfig;
use crate::error::GatewayError;

#[derive(Default)]
struct Registry {
    configs: HashMap<String, ServersTransportConfig>,
    round_trippers: HashMap<String, Arc<RoundTripper>>,
}

/// Owns every backend transport, keyed by transport name.
///
/// `update` replaces the registry in one swap, so readers observe either
/// the complete old set or the complete new set. Transports whose config
/// did not change are carried over as the same instance, keeping their
/// connection pools warm.
pub struct RoundTripperManager {
    registry: RwLock<Registry>,
    updating: Mutex<()>,
}

impl Default for RoundTripperManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundTripperManager {
    /// A manager holding only the default transport.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::default();
        registry.configs.insert(
            DEFAULT_TRANSPORT.to_string(),
            ServersTransportConfig::default(),
        );
        registry.round_trippers.insert(
            DEFAULT_TRANSPORT.to_string(),
            Arc::new(RoundTripper::unconfigured()),
        );
        Self {
            registry: RwLock::new(registry),
            updating: Mutex::new(()),
        }
    }

    /// Apply a complete set of transport configs. Returns how many
    /// transports had to be (re)built.
    ///
    /// A transport that fails to build is logged and served by an
    /// unconfigured transport under the same name.
    pub fn update(&self, configs: HashMap<String, ServersTransportConfig>) -> usize {
        let _serial = self.updating.lock();
        let (old_configs, old_round_trippers) = {
            let registry = self.registry.read();
            (registry.configs.clone(), registry.round_trippers.clone())
        };

        let mut round_trippers = HashMap::with_capacity(configs.len());
        let mut built = 0;
        for (name, cfg) in &configs {
            if let (Some(old), Some(rt)) = (old_configs.get(name), old_round_trippers.get(name)) {
                if old == cfg {
                    round_trippers.insert(name.clone(), Arc::clone(rt));
                    continue;
                }
            }

            built += 1;
            let rt = create_round_tripper(cfg).unwrap_or_else(|e| {
                tracing::error!(
                    transport = %name,
                    error = %e,
                    "failed to build servers transport, using the default one"
                );
                RoundTripper::unconfigured()
            });
            tracing::debug!(transport = %name, "servers transport built");
            round_trippers.insert(name.clone(), Arc::new(rt));
        }

        for name in old_configs.keys().filter(|n| !configs.contains_key(*n)) {
            tracing::debug!(transport = %name, "servers transport removed");
        }

        *self.registry.write() = Registry {
            configs,
            round_trippers,
        };
        built
    }

    /// Look up a transport. An empty name selects the default one.
    pub fn get(&self, name: &str) -> Result<Arc<RoundTripper>, GatewayError> {
        let name = if name.is_empty() {
            DEFAULT_TRANSPORT
        } else {
            name
        };
        self.registry
            .read()
            .round_trippers
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(name.to_string()))
    }
}
