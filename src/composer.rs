use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::ComposerError;
use crate::gateway::Gateway;
use crate::kit::Kit;
use crate::registry::Registry;

/// Kit name to gateway. Built once at startup; only the registry's flags
/// change afterwards.
pub struct Composer {
    registry: Arc<Registry>,
    gateways: BTreeMap<String, Arc<Gateway>>,
    watchers: Vec<JoinHandle<()>>,
}

impl Composer {
    pub async fn build(registry: Arc<Registry>, kits: Vec<Kit>) -> Result<Self, ComposerError> {
        let mut gateways = BTreeMap::new();

        for kit in kits {
            if gateways.contains_key(&kit.name) {
                return Err(ComposerError::DuplicateKit(kit.name));
            }
            let gateway = Gateway::bind(kit, Arc::clone(&registry)).await?;
            gateways.insert(gateway.name().to_string(), gateway);
        }

        let watchers = gateways
            .values()
            .map(|gateway| gateway.watch_catalog(registry.subscribe()))
            .collect();

        info!(
            "Composer serving kits: {:?}",
            gateways.keys().collect::<Vec<_>>()
        );
        Ok(Self {
            registry,
            gateways,
            watchers,
        })
    }

    pub fn resolve(&self, kit: &str) -> Result<Arc<Gateway>, ComposerError> {
        self.gateways
            .get(kit)
            .cloned()
            .ok_or_else(|| ComposerError::KitNotFound(kit.to_string()))
    }

    pub fn gateways(&self) -> impl Iterator<Item = &Arc<Gateway>> {
        self.gateways.values()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub async fn close_sessions(&self) {
        for gateway in self.gateways.values() {
            gateway.close_all_sessions().await;
        }
    }

    /// Stops change notifications, then closes every downstream connection.
    pub async fn shutdown(&self, grace: Duration) {
        for watcher in &self.watchers {
            watcher.abort();
        }
        self.registry.shutdown(grace).await;
    }
}
