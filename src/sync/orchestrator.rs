//! Sync Orchestrator: wires the Connection Pool, Mapping Engine, AAS
//! provider, and the Monitoring/Control Managers into one cooperatively
//! shut-down unit.

use crate::aas::AasProvider;
use crate::connection::pool::OpcUaConnectionPool;
use crate::mapping::MappingEngine;
use crate::metrics::BridgeMetrics;
use crate::security::AuditLogger;
use crate::sync::control::ControlManager;
use crate::sync::monitor::MonitoringManager;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const CONNECTION_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

pub struct SyncOrchestrator {
    pool: Arc<OpcUaConnectionPool>,
    aas: Arc<dyn AasProvider>,
    monitor: Arc<MonitoringManager>,
    control: Arc<ControlManager>,
    shutdown: CancellationToken,
}

impl SyncOrchestrator {
    pub fn new(
        pool: Arc<OpcUaConnectionPool>,
        engine: Arc<MappingEngine>,
        aas: Arc<dyn AasProvider>,
        audit: Arc<AuditLogger>,
        metrics: Arc<BridgeMetrics>,
        subscription_interval_ms: f64,
    ) -> Self {
        let monitor = Arc::new(MonitoringManager::new(
            pool.clone(),
            engine.clone(),
            aas.clone(),
            metrics.clone(),
            subscription_interval_ms,
        ));
        let control = Arc::new(ControlManager::new(pool.clone(), engine, audit, metrics));
        Self {
            pool,
            aas,
            monitor,
            control,
            shutdown: CancellationToken::new(),
        }
    }

    /// Runs the connection-maintenance loop, the monitoring pipeline, the
    /// control pipeline, and the AAS write-request pump concurrently until
    /// `stop` cancels the shared token. Returns once every task has wound
    /// down.
    pub async fn run(&self) {
        info!("sync_orchestrator_started");
        let maintenance = {
            let pool = self.pool.clone();
            let shutdown = self.shutdown.clone();
            async move { pool.maintain_connections(&shutdown, CONNECTION_MAINTENANCE_INTERVAL).await }
        };

        let monitoring = {
            let monitor = self.monitor.clone();
            let shutdown = self.shutdown.clone();
            async move { monitor.run(shutdown).await }
        };

        let controlling = {
            let control = self.control.clone();
            let shutdown = self.shutdown.clone();
            async move { control.run(shutdown).await }
        };

        let write_pump = {
            let aas = self.aas.clone();
            let control = self.control.clone();
            let shutdown = self.shutdown.clone();
            async move { run_write_pump(aas, control, shutdown).await }
        };

        tokio::join!(maintenance, monitoring, controlling, write_pump);
        info!("sync_orchestrator_stopped");
    }

    /// Signals every task spawned by `run` to wind down, then stops the
    /// monitoring manager's subscriptions explicitly (joining the spawned
    /// tasks alone does not close them).
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.monitor.stop().await;
    }
}

/// Forwards the AAS provider's write-request stream into the Control
/// Manager's queue until shutdown, modeling the Python async-generator
/// consumer loop this pipeline replaces.
async fn run_write_pump(aas: Arc<dyn AasProvider>, control: Arc<ControlManager>, shutdown: CancellationToken) {
    use futures::StreamExt;

    if !aas.enable_events() {
        return;
    }

    let mut stream = aas.write_requests(shutdown.clone());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            next = stream.next() => {
                match next {
                    Some(request) => {
                        control.enqueue(request).await;
                    }
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aas::memory::MemoryAasProvider;
    use crate::config::{AasProviderConfig, EndpointConfig, MappingRule, MessageSecurityMode, SecurityPolicy, SyncDirection};
    use crate::types::AasValue;
    use std::collections::HashMap;
    use tokio::sync::Mutex as TokioMutex;

    fn endpoint() -> EndpointConfig {
        EndpointConfig {
            url: "opc.tcp://localhost:4840".to_string(),
            name: "test".to_string(),
            security_policy: SecurityPolicy::None,
            security_mode: MessageSecurityMode::None,
            timeout_ms: 1_000,
            username: None,
            password: None,
        }
    }

    fn rule() -> MappingRule {
        MappingRule {
            opcua_node_id: "ns=2;s=Speed".to_string(),
            aas_id_short: "Speed".to_string(),
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
    async fn write_pump_forwards_queued_writes_into_the_control_manager() {
        let submodels = Arc::new(TokioMutex::new(HashMap::new()));
        let aas_provider = Arc::new(MemoryAasProvider::new(AasProviderConfig::default(), submodels));
        let aas: Arc<dyn AasProvider> = aas_provider.clone();
        let pool = Arc::new(OpcUaConnectionPool::new(vec![endpoint()]));
        let engine = Arc::new(MappingEngine::new(vec![rule()]).unwrap());
        let audit = Arc::new(AuditLogger::new(None, false));
        let metrics = Arc::new(BridgeMetrics::new());
        let control = Arc::new(ControlManager::new(pool, engine, audit, metrics));

        aas_provider
            .submit_write("Speed", AasValue::Float(12.0), Some("urn:test".to_string()), None)
            .await;

        let shutdown = CancellationToken::new();
        let pump_shutdown = shutdown.clone();
        let pump = tokio::spawn(run_write_pump(aas, control, pump_shutdown));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        let _ = pump.await;
    }
}
