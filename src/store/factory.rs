//! Hands out store clients for the transport the probe currently selects.

use std::sync::Arc;

use tracing::debug;

use super::{
    BinaryStoreClient, HttpStoreClient, MemoryStore, OfflineStore, SharedStore, StoreError,
    TransportMode,
};
use crate::config::{ProbeSettings, StoreBackend, StoreSettings};
use crate::core::probe::{LiveChecks, ProbeTarget, TransportDecision, TransportProbe};

enum Routing {
    /// One store regardless of network state (memory backend, tests)
    Fixed(SharedStore),
    /// One client per transport, chosen by the probe
    Probed {
        probe: Arc<TransportProbe>,
        binary: Option<SharedStore>,
        text: Option<SharedStore>,
        offline: SharedStore,
    },
}

/// Produces a [`SharedStore`] bound to the selected transport.
///
/// Clients are built once per mode and shared; transport switches happen
/// between calls, never in the middle of one.
pub struct StoreClientFactory {
    routing: Routing,
}

impl StoreClientFactory {
    /// Build clients and the probe from configuration
    pub fn from_settings(store: &StoreSettings, probe: &ProbeSettings) -> Result<Self, StoreError> {
        if store.backend == StoreBackend::Memory {
            return Ok(Self::fixed(Arc::new(MemoryStore::new())));
        }

        let binary: Option<SharedStore> = store.binary_endpoint.as_ref().map(|endpoint| {
            Arc::new(BinaryStoreClient::new(
                endpoint.clone(),
                store.connect_timeout(),
                store.request_timeout(),
            )) as SharedStore
        });

        let text: Option<SharedStore> = match &store.text_endpoint {
            Some(url) => Some(Arc::new(HttpStoreClient::new(
                url.clone(),
                store.connect_timeout(),
                store.request_timeout(),
            )?)),
            None => None,
        };

        let checks = Arc::new(LiveChecks::new(binary.clone(), text.clone()));
        let probe = Arc::new(TransportProbe::new(
            ProbeTarget::from_settings(store),
            probe.clone(),
            checks,
        ));

        Ok(Self::probed(probe, binary, text))
    }

    /// Route through `probe` using the given per-transport clients
    pub fn probed(
        probe: Arc<TransportProbe>,
        binary: Option<SharedStore>,
        text: Option<SharedStore>,
    ) -> Self {
        Self {
            routing: Routing::Probed {
                probe,
                binary,
                text,
                offline: Arc::new(OfflineStore),
            },
        }
    }

    /// Always use `store`
    pub fn fixed(store: SharedStore) -> Self {
        Self {
            routing: Routing::Fixed(store),
        }
    }

    pub fn probe(&self) -> Option<&Arc<TransportProbe>> {
        match &self.routing {
            Routing::Fixed(_) => None,
            Routing::Probed { probe, .. } => Some(probe),
        }
    }

    /// Client for a specific transport; unconfigured transports are offline
    pub fn get_client(&self, mode: TransportMode) -> SharedStore {
        match &self.routing {
            Routing::Fixed(store) => Arc::clone(store),
            Routing::Probed {
                binary,
                text,
                offline,
                ..
            } => {
                let client = match mode {
                    TransportMode::Binary => binary.as_ref(),
                    TransportMode::Text => text.as_ref(),
                    TransportMode::Degraded => None,
                };
                Arc::clone(client.unwrap_or(offline))
            }
        }
    }

    /// Client for whatever transport is currently selected
    pub async fn current(&self) -> SharedStore {
        match &self.routing {
            Routing::Fixed(store) => Arc::clone(store),
            Routing::Probed { probe, .. } => {
                let decision = probe.decide_transport().await;
                debug!(transport = %decision.mode, "store client selected");
                self.get_client(decision.mode)
            }
        }
    }

    /// Current decision, or `None` when routing is fixed
    pub async fn decision(&self) -> Option<TransportDecision> {
        match self.probe() {
            Some(probe) => Some(probe.decide_transport().await),
            None => None,
        }
    }

    pub fn report_failure(&self, mode: TransportMode) {
        if let Some(probe) = self.probe() {
            probe.record_failure(mode);
        }
    }

    pub fn report_success(&self, mode: TransportMode) {
        if let Some(probe) = self.probe() {
            probe.record_success(mode);
        }
    }
}
