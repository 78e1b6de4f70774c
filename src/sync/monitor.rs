//! Monitoring Manager: opens one OPC UA subscription per endpoint across all
//! resolved mappings, queues data-change notifications from the
//! subscription's (synchronous) callback, and dispatches them to the AAS
//! side on a dedicated processing loop.

use crate::aas::AasProvider;
use crate::connection::pool::OpcUaConnectionPool;
use crate::mapping::{MappingEngine, ResolvedMapping};
use crate::metrics::BridgeMetrics;
use crate::queue::{BoundedDropQueue, OverflowPolicy, PushOutcome};
use chrono::{DateTime, Utc};
use opcua::client::prelude::{DataChangeCallback, MonitoredItem, MonitoredItemCreateRequest};
use opcua::types::{NodeId, TimestampsToReturn, Variant, VariantTypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// A data-change notification queued by a subscription callback, still
/// tagged with its raw OPC UA node id string (the mapping engine's own key)
/// so the processing loop can resolve it back to a `ResolvedMapping`.
#[derive(Debug, Clone)]
pub struct DataChangeEvent {
    pub node_id: String,
    pub value: Variant,
    pub variant_type: VariantTypeId,
    pub source_timestamp: DateTime<Utc>,
}

pub struct MonitoringManager {
    queue: BoundedDropQueue<DataChangeEvent>,
    pool: Arc<OpcUaConnectionPool>,
    engine: Arc<MappingEngine>,
    aas: Arc<dyn AasProvider>,
    metrics: Arc<BridgeMetrics>,
    subscription_interval_ms: f64,
}

impl MonitoringManager {
    pub fn new(
        pool: Arc<OpcUaConnectionPool>,
        engine: Arc<MappingEngine>,
        aas: Arc<dyn AasProvider>,
        metrics: Arc<BridgeMetrics>,
        subscription_interval_ms: f64,
    ) -> Self {
        Self {
            queue: BoundedDropQueue::new(DEFAULT_QUEUE_CAPACITY, OverflowPolicy::DropOldest),
            pool,
            engine,
            aas,
            metrics,
            subscription_interval_ms,
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        if let Err(e) = self.subscribe_all().await {
            warn!(error = %e, "failed to open one or more subscriptions");
        }
        self.process_loop(shutdown).await;
    }

    pub async fn stop(&self) {
        info!("monitoring_manager_stopped");
    }

    /// Groups resolved mappings by target endpoint URL and opens one
    /// subscription per group. A mapping with no explicit endpoint targets
    /// the single configured endpoint, or every endpoint when more than one
    /// is configured (the target server is ambiguous otherwise).
    async fn subscribe_all(&self) -> crate::errors::BridgeResult<()> {
        let mut groups: HashMap<String, Vec<&ResolvedMapping>> = HashMap::new();
        for mapping in self.engine.resolved_mappings() {
            for url in self.endpoint_urls_for(mapping) {
                groups.entry(url).or_default().push(mapping);
            }
        }

        for (endpoint_url, mappings) in groups {
            if let Err(e) = self.open_subscription(&endpoint_url, mappings).await {
                warn!(endpoint = %endpoint_url, error = %e, "subscription setup failed");
            }
        }
        Ok(())
    }

    fn endpoint_urls_for(&self, mapping: &ResolvedMapping) -> Vec<String> {
        if let Some(reference) = &mapping.rule.endpoint {
            return match self.pool.resolve_endpoint_url(Some(reference)) {
                Ok(url) => vec![url],
                Err(e) => {
                    warn!(reference, error = %e, "unresolvable endpoint reference on mapping");
                    Vec::new()
                }
            };
        }

        let endpoints = self.pool.endpoints();
        if endpoints.len() <= 1 {
            endpoints.first().map(|e| vec![e.url.clone()]).unwrap_or_default()
        } else {
            endpoints.iter().map(|e| e.url.clone()).collect()
        }
    }

    async fn open_subscription(
        &self,
        endpoint_url: &str,
        mappings: Vec<&ResolvedMapping>,
    ) -> crate::errors::BridgeResult<()> {
        let handle = self.pool.get_connection(endpoint_url).await?;

        let mut node_keys: HashMap<NodeId, String> = HashMap::new();
        let mut node_ids = Vec::new();
        for mapping in &mappings {
            node_keys.insert(mapping.node_id.clone(), mapping.rule.opcua_node_id.clone());
            node_ids.push(mapping.node_id.clone());
        }
        if node_ids.is_empty() {
            return Ok(());
        }

        let queue = self.queue.clone();
        let interval = self.subscription_interval_ms;
        let session = handle.session.clone();
        let subscription_id = tokio::task::spawn_blocking(move || {
            let guard = session.blocking_read();
            guard.create_subscription(
                interval,
                10,
                30,
                0,
                0,
                true,
                DataChangeCallback::new(move |changed_monitored_items: Vec<MonitoredItem>| {
                    for item in changed_monitored_items {
                        let node_id = item.item_to_monitor().node_id.clone();
                        let Some(key) = node_keys.get(&node_id) else { continue };
                        for data_value in item.values() {
                            let Some(value) = data_value.value.clone() else { continue };
                            let variant_type = resolve_variant_type(&value);
                            let source_timestamp = data_value
                                .source_timestamp
                                .map(|t| t.as_chrono())
                                .unwrap_or_else(Utc::now);
                            let event = DataChangeEvent {
                                node_id: key.clone(),
                                value,
                                variant_type,
                                source_timestamp,
                            };
                            match queue.try_push(event) {
                                PushOutcome::Accepted => {}
                                PushOutcome::AcceptedDroppedOldest => {
                                    warn!("monitor queue full, dropped oldest event");
                                }
                                PushOutcome::RejectedFull => {
                                    warn!("monitor queue rejected event");
                                }
                            }
                        }
                    }
                }),
            )
        })
        .await
        .map_err(|_| crate::errors::BridgeError::Connection("subscription task panicked".to_string()))?
        .map_err(|status| {
            crate::errors::BridgeError::Connection(format!("create_subscription failed: {status}"))
        })?;

        let items: Vec<MonitoredItemCreateRequest> = node_ids.iter().cloned().map(Into::into).collect();
        let session = handle.session.clone();
        tokio::task::spawn_blocking(move || {
            let guard = session.blocking_read();
            guard.create_monitored_items(subscription_id, TimestampsToReturn::Both, &items)
        })
        .await
        .map_err(|_| crate::errors::BridgeError::Connection("monitored item task panicked".to_string()))?
        .map_err(|status| {
            crate::errors::BridgeError::Connection(format!("create_monitored_items failed: {status}"))
        })?;

        handle.subscriptions.lock().await.push(subscription_id);
        self.metrics
            .active_subscriptions
            .with_label_values(&[endpoint_url])
            .set(mappings.len() as f64);
        info!(endpoint = %endpoint_url, nodes = mappings.len(), "subscription opened");
        Ok(())
    }

    async fn process_loop(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.queue.pop_timeout(Duration::from_secs(1)).await {
                None => continue,
                Some(event) => self.process_event(event).await,
            }
        }
    }

    async fn process_event(&self, event: DataChangeEvent) {
        match self
            .engine
            .transform_to_aas(&event.node_id, &event.value, event.variant_type)
        {
            Ok((aas_value, _xsd)) => {
                let Some(mapping) = self.engine.get_mapping_for_node(&event.node_id) else {
                    return;
                };
                match self.aas.update_property(mapping, aas_value).await {
                    Ok(()) => {
                        self.metrics
                            .sync_events_total
                            .with_label_values(&["opcua_to_aas", "success"])
                            .inc();
                    }
                    Err(e) => {
                        warn!(node_id = %event.node_id, error = %e, "update_property failed");
                        self.metrics
                            .sync_events_total
                            .with_label_values(&["opcua_to_aas", "failure"])
                            .inc();
                    }
                }
            }
            Err(e) => {
                warn!(node_id = %event.node_id, error = %e, "transform_to_aas failed");
                self.metrics
                    .sync_events_total
                    .with_label_values(&["opcua_to_aas", "failure"])
                    .inc();
            }
        }
    }
}

/// Resolves the variant's own type tag, falling back to inference from the
/// converted `AasValue` only for the degenerate case of an empty variant.
fn resolve_variant_type(variant: &Variant) -> VariantTypeId {
    let declared = variant.type_id();
    if declared != VariantTypeId::Empty {
        return declared;
    }
    let value = crate::types::opcua_to_aas_value(variant);
    MappingEngine::infer_variant_type(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AasValue;

    #[test]
    fn resolve_variant_type_prefers_declared_tag() {
        assert_eq!(resolve_variant_type(&Variant::Double(1.0)), VariantTypeId::Double);
    }

    #[test]
    fn resolve_variant_type_infers_from_empty_variant() {
        assert_eq!(resolve_variant_type(&Variant::Empty), VariantTypeId::String);
    }

    #[test]
    fn infer_variant_type_matches_spec_table() {
        assert_eq!(MappingEngine::infer_variant_type(&AasValue::Bool(true)), VariantTypeId::Boolean);
        assert_eq!(MappingEngine::infer_variant_type(&AasValue::Integer(1)), VariantTypeId::Int64);
        assert_eq!(MappingEngine::infer_variant_type(&AasValue::Float(1.0)), VariantTypeId::Double);
    }
}
