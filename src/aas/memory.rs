//! In-process Memory AAS provider: the submodel/element table lives only in
//! this process, and AAS->OPCUA write requests are submitted directly by a
//! caller (typically a test, or an operator-facing surface this crate does
//! not itself provide) via `submit_write` rather than discovered by polling
//! or MQTT.

use crate::config::AasProviderConfig;
use crate::errors::BridgeResult;
use crate::mapping::engine::SubmodelStore;
use crate::mapping::{MappingEngine, ResolvedMapping};
use crate::queue::{BoundedDropQueue, OverflowPolicy, PushOutcome};
use crate::sync::control::WriteRequest;
use crate::types::AasValue;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::AasProvider;

const WRITE_QUEUE_CAPACITY: usize = 1_000;

pub struct MemoryAasProvider {
    config: AasProviderConfig,
    submodels: SubmodelStore,
    writes: BoundedDropQueue<WriteRequest>,
}

impl MemoryAasProvider {
    pub fn new(config: AasProviderConfig, submodels: SubmodelStore) -> Self {
        Self {
            config,
            submodels,
            writes: BoundedDropQueue::new(WRITE_QUEUE_CAPACITY, OverflowPolicy::DropNewest),
        }
    }

    /// Submits an AAS-originated write for eventual delivery to OPC UA.
    /// Returns `false` when the write queue is full (drop-newest).
    pub async fn submit_write(
        &self,
        id_short: impl Into<String>,
        value: AasValue,
        submodel_id: Option<String>,
        user_id: Option<String>,
    ) -> bool {
        if !self.config.enable_events {
            return false;
        }
        let request = WriteRequest {
            id_short: id_short.into(),
            submodel_id,
            value,
            user_id,
            correlation_id: None,
        };
        match self.writes.push(request).await {
            PushOutcome::Accepted | PushOutcome::AcceptedDroppedOldest => true,
            PushOutcome::RejectedFull => {
                warn!("memory provider write queue full, submission rejected");
                false
            }
        }
    }

    /// Direct read used by tests and any in-process caller that wants the
    /// current value without going through the OPC UA side at all.
    pub async fn read_property(&self, submodel_id: &str, id_short: &str) -> Option<AasValue> {
        let store = self.submodels.lock().await;
        store.get(submodel_id)?.find_element(id_short)?.value.clone()
    }
}

#[async_trait]
impl AasProvider for MemoryAasProvider {
    fn enable_events(&self) -> bool {
        self.config.enable_events
    }

    async fn start(&self) -> BridgeResult<()> {
        Ok(())
    }

    async fn stop(&self) -> BridgeResult<()> {
        Ok(())
    }

    async fn register_mappings(&self, engine: &MappingEngine, mappings: &[&ResolvedMapping]) -> BridgeResult<()> {
        let mut submodel_ids: Vec<&str> = mappings.iter().map(|m| m.rule.submodel_id.as_str()).collect();
        submodel_ids.sort_unstable();
        submodel_ids.dedup();
        for submodel_id in submodel_ids {
            engine.register_submodel(submodel_id).await;
        }
        Ok(())
    }

    async fn update_property(&self, mapping: &ResolvedMapping, value: AasValue) -> BridgeResult<()> {
        let mut store = self.submodels.lock().await;
        let submodel = store
            .entry(mapping.rule.submodel_id.clone())
            .or_insert_with(|| crate::aas::model::Submodel::new(mapping.rule.submodel_id.clone()));
        match submodel.find_element_mut(&mapping.rule.aas_id_short) {
            Some(element) => element.value = Some(value),
            None => {
                let mut element = crate::aas::model::Property::new(
                    mapping.rule.aas_id_short.clone(),
                    mapping.rule.value_type.clone(),
                );
                element.value = Some(value);
                submodel.elements.push(element);
            }
        }
        Ok(())
    }

    async fn provision(&self, engine: &MappingEngine, mappings: &[&ResolvedMapping]) -> BridgeResult<()> {
        self.register_mappings(engine, mappings).await
    }

    fn write_requests(&self, shutdown: CancellationToken) -> BoxStream<'static, WriteRequest> {
        let writes = self.writes.clone();
        let enabled = self.config.enable_events;
        Box::pin(async_stream::stream! {
            if !enabled {
                return;
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    item = writes.pop_timeout(Duration::from_secs(1)) => {
                        if let Some(request) = item {
                            yield request;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MappingRule, SyncDirection};
    use futures::StreamExt;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn provider() -> MemoryAasProvider {
        let mut config = AasProviderConfig::default();
        config.r#type = "memory".to_string();
        MemoryAasProvider::new(config, Arc::new(Mutex::new(std::collections::HashMap::new())))
    }

    fn rule() -> MappingRule {
        MappingRule {
            opcua_node_id: "ns=2;s=Temperature".to_string(),
            aas_id_short: "Temperature".to_string(),
            submodel_id: "urn:test".to_string(),
            endpoint: None,
            semantic_id: None,
            direction: SyncDirection::Bidirectional,
            value_type: "xs:double".to_string(),
            range_constraint: None,
            transform_expression: None,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn update_property_creates_the_submodel_and_element_on_first_write() {
        let provider = provider();
        let engine = MappingEngine::new(vec![rule()]).unwrap();
        let mapping = engine.get_mapping_for_node("ns=2;s=Temperature").unwrap();
        provider.update_property(mapping, AasValue::Float(42.0)).await.unwrap();
        assert_eq!(
            provider.read_property("urn:test", "Temperature").await,
            Some(AasValue::Float(42.0))
        );
    }

    #[tokio::test]
    async fn submit_write_is_observable_on_the_write_requests_stream() {
        let provider = provider();
        assert!(provider
            .submit_write("Speed", AasValue::Float(55.0), Some("urn:test".to_string()), Some("tester".to_string()))
            .await);

        let shutdown = CancellationToken::new();
        let mut stream = provider.write_requests(shutdown.clone());
        let request = stream.next().await.expect("a queued write request");
        assert_eq!(request.id_short, "Speed");
        shutdown.cancel();
    }

    #[tokio::test]
    async fn submit_write_returns_false_when_events_disabled() {
        let mut config = AasProviderConfig::default();
        config.enable_events = false;
        let provider = MemoryAasProvider::new(config, Arc::new(Mutex::new(std::collections::HashMap::new())));
        assert!(!provider.submit_write("Speed", AasValue::Float(1.0), None, None).await);
    }
}
