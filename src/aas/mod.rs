//! AAS-side providers: the in-process Memory provider and the HTTP/MQTT
//! provider backed by a real AAS repository.

pub mod events;
pub mod http;
pub mod memory;
pub mod model;

use crate::config::AasProviderConfig;
use crate::errors::{BridgeError, BridgeResult};
use crate::mapping::{MappingEngine, ResolvedMapping};
use crate::sync::control::WriteRequest;
use crate::types::AasValue;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use http::HttpAasProvider;
pub use memory::MemoryAasProvider;

/// Common surface both AAS-side providers implement. The Sync Orchestrator
/// and the monitoring/control pipelines depend only on this trait, never on
/// a concrete provider type.
#[async_trait]
pub trait AasProvider: Send + Sync {
    /// Whether this provider produces AAS->OPCUA write requests at all
    /// (`write_requests` yields nothing when this is `false`).
    fn enable_events(&self) -> bool;

    async fn start(&self) -> BridgeResult<()>;
    async fn stop(&self) -> BridgeResult<()>;

    /// Ensures the submodels/elements the given mappings target exist, and
    /// rebuilds whatever index the provider uses to resolve an inbound
    /// idShort back to an OPC UA node id.
    async fn register_mappings(&self, engine: &MappingEngine, mappings: &[&ResolvedMapping]) -> BridgeResult<()>;

    /// Pushes an OPC UA-sourced value into the AAS side.
    async fn update_property(&self, mapping: &ResolvedMapping, value: AasValue) -> BridgeResult<()>;

    /// Registers mappings and, where the provider supports it, creates
    /// missing submodels/elements on the remote side.
    async fn provision(&self, engine: &MappingEngine, mappings: &[&ResolvedMapping]) -> BridgeResult<()>;

    /// A lazy, shutdown-terminable sequence of AAS->OPCUA write requests.
    fn write_requests(&self, shutdown: CancellationToken) -> BoxStream<'static, WriteRequest>;
}

/// Builds the configured provider from `aas.type`.
pub fn build_aas_provider(
    config: &AasProviderConfig,
    submodels: crate::mapping::engine::SubmodelStore,
) -> BridgeResult<Arc<dyn AasProvider>> {
    match config.r#type.as_str() {
        "memory" => Ok(Arc::new(MemoryAasProvider::new(config.clone(), submodels))),
        "basyx" | "aasx-server" | "http" => Ok(Arc::new(HttpAasProvider::new(config.clone())?)),
        other => Err(BridgeError::Configuration(format!(
            "AAS provider type '{other}' is not implemented"
        ))),
    }
}
