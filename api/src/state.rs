use ringkeeper_core::{Registry, RegistryConfig};
use std::sync::Arc;

/// Shared by every handler. Cloned per request; the registry sits behind an Arc.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    /// Application every record created over HTTP belongs to
    pub application: String,
    /// Datacenter of the nodes this surface serves
    pub datacenter: String,
}

impl AppState {
    pub fn new(registry: Arc<Registry>, config: &RegistryConfig) -> Self {
        Self {
            registry,
            application: config.application.clone(),
            datacenter: config.datacenter.clone(),
        }
    }
}
