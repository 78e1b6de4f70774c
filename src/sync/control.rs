//! Control Manager: dequeues AAS->OPCUA write requests, coerces them to a
//! `Variant` via the Mapping Engine, writes through the Connection Pool, and
//! audits every successful write.

use crate::connection::pool::OpcUaConnectionPool;
use crate::errors::BridgeError;
use crate::mapping::MappingEngine;
use crate::metrics::BridgeMetrics;
use crate::queue::{BoundedDropQueue, OverflowPolicy, PushOutcome};
use crate::security::AuditLogger;
use crate::types::AasValue;
use opcua::types::{AttributeId, DataValue, ReadValueId, StatusCode, UAString, WriteValue};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// An in-flight AAS->OPCUA write, as handed to the Control Manager by the
/// Sync Orchestrator's write-request pump.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub id_short: String,
    pub submodel_id: Option<String>,
    pub value: AasValue,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
}

const DEFAULT_QUEUE_CAPACITY: usize = 1_000;
const DEFAULT_CONCURRENCY: usize = 10;

pub struct ControlManager {
    queue: BoundedDropQueue<WriteRequest>,
    pool: Arc<OpcUaConnectionPool>,
    engine: Arc<MappingEngine>,
    audit: Arc<AuditLogger>,
    metrics: Arc<BridgeMetrics>,
    concurrency: Arc<Semaphore>,
}

impl ControlManager {
    pub fn new(
        pool: Arc<OpcUaConnectionPool>,
        engine: Arc<MappingEngine>,
        audit: Arc<AuditLogger>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        Self {
            queue: BoundedDropQueue::new(DEFAULT_QUEUE_CAPACITY, OverflowPolicy::DropNewest),
            pool,
            engine,
            audit,
            metrics,
            concurrency: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
        }
    }

    /// Submits a request for processing; `false` means the queue was full
    /// and the request was dropped (drop-newest: the submission itself, not
    /// whatever was already queued, reports the failure).
    pub async fn enqueue(&self, request: WriteRequest) -> bool {
        match self.queue.push(request).await {
            PushOutcome::Accepted => true,
            PushOutcome::AcceptedDroppedOldest => true,
            PushOutcome::RejectedFull => {
                warn!("control queue full, write request dropped");
                self.metrics
                    .write_requests_total
                    .with_label_values(&["rejected_full"])
                    .inc();
                false
            }
        }
    }

    /// Drains the queue until `shutdown` fires, dispatching each request on
    /// its own task bounded by the concurrency semaphore.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.queue.pop_timeout(Duration::from_secs(1)).await {
                None => continue,
                Some(request) => {
                    let permit = self.concurrency.clone().acquire_owned().await;
                    let Ok(permit) = permit else { continue };
                    let pool = self.pool.clone();
                    let engine = self.engine.clone();
                    let audit = self.audit.clone();
                    let metrics = self.metrics.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        process_request(&pool, &engine, &audit, &metrics, request).await;
                    });
                }
            }
        }
    }
}

async fn process_request(
    pool: &OpcUaConnectionPool,
    engine: &MappingEngine,
    audit: &AuditLogger,
    metrics: &BridgeMetrics,
    request: WriteRequest,
) {
    let Some(mapping) = engine.find_by_element(request.submodel_id.as_deref(), &request.id_short) else {
        warn!(id_short = %request.id_short, "no mapping for write request");
        metrics
            .sync_events_total
            .with_label_values(&["aas_to_opcua", "failure"])
            .inc();
        return;
    };
    let node_id_text = mapping.rule.opcua_node_id.clone();

    let variant = match engine.transform_to_opcua(&node_id_text, &request.value) {
        Ok(v) => v,
        Err(e) => {
            warn!(node_id = %node_id_text, error = %e, "transform_to_opcua failed");
            metrics
                .sync_events_total
                .with_label_values(&["aas_to_opcua", "failure"])
                .inc();
            return;
        }
    };

    let endpoint_url = match pool.resolve_endpoint_url(mapping.rule.endpoint.as_deref()) {
        Ok(url) => url,
        Err(e) => {
            warn!(node_id = %node_id_text, error = %e, "no endpoint for write request");
            metrics
                .sync_events_total
                .with_label_values(&["aas_to_opcua", "failure"])
                .inc();
            return;
        }
    };

    let handle = match pool.get_connection(&endpoint_url).await {
        Ok(h) => h,
        Err(e) => {
            warn!(endpoint = %endpoint_url, error = %e, "connection unavailable for write request");
            metrics
                .sync_events_total
                .with_label_values(&["aas_to_opcua", "failure"])
                .inc();
            return;
        }
    };

    let opcua_node_id = mapping.node_id.clone();
    match write_with_previous_value(&handle, opcua_node_id, variant).await {
        Ok(previous) => {
            audit
                .log_write(
                    &node_id_text,
                    request.user_id.as_deref(),
                    previous.as_ref(),
                    &request.value,
                    request.correlation_id.as_deref(),
                )
                .await;
            metrics
                .sync_events_total
                .with_label_values(&["aas_to_opcua", "success"])
                .inc();
            metrics
                .write_requests_total
                .with_label_values(&["success"])
                .inc();
            info!(node_id = %node_id_text, "opcua_write_succeeded");
        }
        Err(e) => {
            warn!(node_id = %node_id_text, error = %e, "opcua write failed");
            metrics
                .sync_events_total
                .with_label_values(&["aas_to_opcua", "failure"])
                .inc();
            metrics
                .write_requests_total
                .with_label_values(&["failure"])
                .inc();
        }
    }
}

/// Best-effort read of the current value ahead of the write (for the audit
/// trail), followed by the write itself. A failed read never blocks the
/// write; a failed write is the only thing that fails this call.
async fn write_with_previous_value(
    handle: &crate::connection::pool::ConnectionHandle,
    node_id: opcua::types::NodeId,
    variant: opcua::types::Variant,
) -> Result<Option<AasValue>, BridgeError> {
    let session = handle.session.clone();
    let read_node_id = node_id.clone();
    let previous = tokio::task::spawn_blocking(move || {
        let guard = session.blocking_read();
        guard
            .read(&[ReadValueId::from(read_node_id)], opcua::types::TimestampsToReturn::Neither, 0.0)
            .ok()
            .and_then(|values| values.into_iter().next())
            .and_then(|dv| dv.value)
            .map(|v| crate::types::opcua_to_aas_value(&v))
    })
    .await
    .unwrap_or(None);

    let session = handle.session.clone();
    let statuses = tokio::task::spawn_blocking(move || {
        let guard = session.blocking_write();
        guard.write(&[WriteValue {
            node_id,
            attribute_id: AttributeId::Value as u32,
            index_range: UAString::null(),
            value: DataValue {
                value: Some(variant),
                status: Some(StatusCode::Good),
                source_timestamp: Some(opcua::types::DateTime::now()),
                ..Default::default()
            },
        }])
    })
    .await
    .map_err(|_| BridgeError::Connection("write task panicked".to_string()))?
    .map_err(|status| BridgeError::Connection(format!("write failed: {status}")))?;

    match statuses.into_iter().next() {
        Some(status) if status.is_good() => Ok(previous),
        Some(status) => Err(BridgeError::Connection(format!("write returned status {status}"))),
        None => Err(BridgeError::Connection("write returned no status codes".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_reports_false_on_overflow() {
        let queue: BoundedDropQueue<WriteRequest> = BoundedDropQueue::new(1, OverflowPolicy::DropNewest);
        let request = |id: &str| WriteRequest {
            id_short: id.to_string(),
            submodel_id: None,
            value: AasValue::Float(1.0),
            user_id: None,
            correlation_id: None,
        };
        assert_eq!(queue.push(request("a")).await, PushOutcome::Accepted);
        assert_eq!(queue.push(request("b")).await, PushOutcome::RejectedFull);
    }
}
