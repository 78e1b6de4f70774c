//! OPC UA ⇄ AAS Synchronization Bridge
//!
//! Wires the Connection Pool, Mapping Engine, AAS provider, and the
//! Monitoring/Control Managers together behind a single cancellation
//! barrier, then runs until a shutdown signal arrives.
//!
//! ## Responsibilities
//!
//! 1. Load and validate the bridge configuration
//! 2. Connect every configured OPC UA endpoint (at least one must succeed)
//! 3. Register/provision the configured mappings against the AAS provider
//! 4. Run the monitoring, control, and AAS write-request pipelines
//! 5. Expose a Prometheus `/metrics` endpoint
//!
//! ## NOT responsible for
//!
//! - The YAML schema beyond what `config::BridgeConfig` declares
//! - Certificate generation (only loading, via `security::CertificateManager`)
//! - Node discovery/bootstrap tooling
//! - Any graphical or interactive interface

use anyhow::Context;
use opcua_aas_bridge::aas::build_aas_provider;
use opcua_aas_bridge::config::BridgeConfig;
use opcua_aas_bridge::connection::OpcUaConnectionPool;
use opcua_aas_bridge::mapping::MappingEngine;
use opcua_aas_bridge::metrics::{BridgeMetrics, MetricsServer};
use opcua_aas_bridge::security::{AuditLogger, CertificateManager};
use opcua_aas_bridge::sync::SyncOrchestrator;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opcua_aas_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting OPC UA / AAS bridge v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("BRIDGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config/bridge.yaml"));
    let config = BridgeConfig::load(&config_path)
        .with_context(|| format!("loading bridge config from {}", config_path.display()))?;
    info!(mappings = config.mappings.len(), "Loaded configuration");

    // Certificate loading is startup-fatal when a non-None security policy
    // requires it; validation happens eagerly, before any endpoint connects.
    let cert_manager = CertificateManager::new(&config.security);
    cert_manager
        .load_certificates()
        .await
        .context("certificate configuration is invalid")?;

    let metrics = Arc::new(BridgeMetrics::new());

    let engine = Arc::new(
        MappingEngine::new(config.mappings.clone()).context("failed to resolve mapping rules")?,
    );

    let pool = Arc::new(OpcUaConnectionPool::new(config.opcua.endpoints.clone()));
    pool.connect()
        .await
        .context("failed to connect to any configured OPC UA endpoint")?;
    info!(
        endpoints = config.opcua.endpoints.len(),
        "Connected OPC UA connection pool"
    );

    let aas_provider = build_aas_provider(&config.aas, engine.submodels())
        .context("failed to construct AAS provider")?;
    aas_provider
        .start()
        .await
        .context("failed to start AAS provider")?;

    let mappings: Vec<_> = engine.resolved_mappings().collect();
    aas_provider
        .provision(&engine, &mappings)
        .await
        .context("failed to provision AAS submodels/elements for configured mappings")?;
    info!(mappings = mappings.len(), "Provisioned AAS-side mappings");

    let audit = Arc::new(AuditLogger::new(
        config.security.audit_log_path.clone().map(PathBuf::from),
        config.security.audit_log_enabled,
    ));

    let orchestrator = Arc::new(SyncOrchestrator::new(
        pool.clone(),
        engine,
        aas_provider.clone(),
        audit,
        metrics.clone(),
        config.opcua.subscription_interval_ms,
    ));

    if config.observability.metrics_enabled {
        let metrics_server = MetricsServer::new(config.observability.metrics_port, metrics.clone());
        tokio::spawn(async move {
            if let Err(e) = metrics_server.serve().await {
                error!(error = %e, "metrics server error");
            }
        });
        info!(port = config.observability.metrics_port, "Metrics server listening");
    }

    let run_handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };

    info!("Bridge ready. Listening for shutdown signals (SIGTERM, SIGINT)");
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("SIGINT (Ctrl+C) received, initiating graceful shutdown...");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("SIGTERM received, initiating graceful shutdown...");
        }
    }

    orchestrator.stop().await;
    if let Err(e) = run_handle.await {
        error!(error = %e, "sync orchestrator task panicked");
    }

    pool.disconnect().await;
    aas_provider
        .stop()
        .await
        .context("failed to stop AAS provider cleanly")?;

    info!("OPC UA / AAS bridge stopped successfully");
    Ok(())
}
