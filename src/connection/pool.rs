//! Connection Pool: one OPC UA session per configured endpoint, with
//! reconnect-on-demand and a background maintenance loop.

use crate::config::{EndpointConfig, MessageSecurityMode as ConfiguredMode, SecurityPolicy as ConfiguredPolicy};
use crate::errors::BridgeError;
use opcua::client::prelude::{
    Client, ClientBuilder, IdentityToken, Session, SessionCommand, SubscriptionId,
};
use opcua::crypto::SecurityPolicy;
use opcua::types::{MessageSecurityMode, UserTokenPolicy};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};

struct PooledConnection {
    session: Arc<RwLock<Session>>,
    subscriptions: Arc<Mutex<Vec<SubscriptionId>>>,
    run_handle: mpsc::UnboundedSender<SessionCommand>,
    endpoint: EndpointConfig,
}

/// Cheap-clone view onto a pooled connection's session and subscription
/// list, handed out by `get_connection` instead of a bare table reference
/// so the pool-wide lock is held only for the lookup, not for the
/// connection's lifetime of use.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub session: Arc<RwLock<Session>>,
    pub subscriptions: Arc<Mutex<Vec<SubscriptionId>>>,
}

pub struct OpcUaConnectionPool {
    endpoints: Vec<EndpointConfig>,
    connections: Mutex<HashMap<String, PooledConnection>>,
}

fn map_security_policy(policy: ConfiguredPolicy) -> SecurityPolicy {
    match policy {
        ConfiguredPolicy::None => SecurityPolicy::None,
        ConfiguredPolicy::Basic128Rsa15 => SecurityPolicy::Basic128Rsa15,
        ConfiguredPolicy::Basic256 => SecurityPolicy::Basic256,
        ConfiguredPolicy::Basic256Sha256 => SecurityPolicy::Basic256Sha256,
        ConfiguredPolicy::Aes128Sha256RsaOaep => SecurityPolicy::Aes128Sha256RsaOaep,
        ConfiguredPolicy::Aes256Sha256RsaPss => SecurityPolicy::Aes256Sha256RsaPss,
    }
}

fn map_security_mode(mode: ConfiguredMode) -> MessageSecurityMode {
    match mode {
        ConfiguredMode::None => MessageSecurityMode::None,
        ConfiguredMode::Sign => MessageSecurityMode::Sign,
        ConfiguredMode::SignAndEncrypt => MessageSecurityMode::SignAndEncrypt,
    }
}

impl OpcUaConnectionPool {
    pub fn new(endpoints: Vec<EndpointConfig>) -> Self {
        Self {
            endpoints,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn endpoints(&self) -> &[EndpointConfig] {
        &self.endpoints
    }

    pub fn resolve_endpoint_url(&self, endpoint_ref: Option<&str>) -> Result<String, BridgeError> {
        match endpoint_ref {
            None => self
                .endpoints
                .first()
                .map(|e| e.url.clone())
                .ok_or_else(|| BridgeError::Connection("no OPC UA endpoints configured".to_string())),
            Some(reference) => self
                .endpoints
                .iter()
                .find(|e| e.url == reference || e.name == reference)
                .map(|e| e.url.clone())
                .ok_or_else(|| BridgeError::Connection(format!("unknown endpoint reference: {reference}"))),
        }
    }

    /// Connects every configured endpoint concurrently; startup fails only
    /// if every endpoint fails.
    pub async fn connect(&self) -> Result<(), BridgeError> {
        let results = futures::future::join_all(
            self.endpoints.iter().map(|ep| self.connect_endpoint(ep)),
        )
        .await;

        let successful = results.iter().filter(|r| r.is_ok()).count();
        for (endpoint, result) in self.endpoints.iter().zip(results.iter()) {
            if let Err(e) = result {
                warn!(endpoint = %endpoint.url, error = %e, "endpoint connect failed");
            }
        }

        if successful == 0 {
            return Err(BridgeError::Connection(format!(
                "failed to connect to any of {} endpoints",
                self.endpoints.len()
            )));
        }

        info!(connected = successful, total = self.endpoints.len(), "connection pool ready");
        Ok(())
    }

    async fn connect_endpoint(&self, endpoint: &EndpointConfig) -> Result<(), BridgeError> {
        let mut builder = ClientBuilder::new()
            .application_name("opcua-aas-bridge")
            .application_uri("urn:opcua-aas-bridge")
            .pki_dir("./pki")
            .session_retry_limit(3);

        if map_security_policy(endpoint.security_policy) != SecurityPolicy::None {
            builder = builder.trust_server_certs(true);
        }

        let mut client: Client = builder
            .client()
            .ok_or_else(|| BridgeError::Connection("failed to build OPC UA client".to_string()))?;

        let url = endpoint.url.clone();
        let policy = map_security_policy(endpoint.security_policy);
        let mode = map_security_mode(endpoint.security_mode);
        let identity = match (&endpoint.username, &endpoint.password) {
            (Some(user), Some(pass)) => IdentityToken::UserName(user.clone(), pass.clone()),
            _ => IdentityToken::Anonymous,
        };

        let (tx, rx) = oneshot::channel();
        tokio::task::spawn_blocking(move || {
            let result = client.connect_to_endpoint(
                (url.as_ref(), policy.to_str(), mode, UserTokenPolicy::anonymous()),
                identity,
            );
            let _ = tx.send(result.map(|session| (client, session)));
        });

        let (_client, session) = rx
            .await
            .map_err(|_| BridgeError::Connection("connect task dropped".to_string()))?
            .map_err(|e| BridgeError::Connection(e.to_string()))?;

        let run_handle = Session::run_async(session.clone());

        let pooled = PooledConnection {
            session,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            run_handle,
            endpoint: endpoint.clone(),
        };

        let mut connections = self.connections.lock().await;
        if let Some(old) = connections.remove(&endpoint.url) {
            close_connection(old).await;
        }
        connections.insert(endpoint.url.clone(), pooled);
        info!(endpoint = %endpoint.name, url = %endpoint.url, "endpoint connected");
        Ok(())
    }

    /// Returns a handle to the connection for `endpoint_url`, reconnecting
    /// transparently if it is missing or stale.
    pub async fn get_connection(&self, endpoint_url: &str) -> Result<ConnectionHandle, BridgeError> {
        {
            let connections = self.connections.lock().await;
            if let Some(conn) = connections.get(endpoint_url) {
                return Ok(ConnectionHandle {
                    session: conn.session.clone(),
                    subscriptions: conn.subscriptions.clone(),
                });
            }
        }

        let endpoint = self
            .endpoints
            .iter()
            .find(|e| e.url == endpoint_url)
            .cloned()
            .ok_or_else(|| BridgeError::Connection(format!("no endpoint for {endpoint_url}")))?;
        self.connect_endpoint(&endpoint).await?;

        let connections = self.connections.lock().await;
        connections
            .get(endpoint_url)
            .map(|conn| ConnectionHandle {
                session: conn.session.clone(),
                subscriptions: conn.subscriptions.clone(),
            })
            .ok_or_else(|| BridgeError::Connection(format!("no connection for {endpoint_url}")))
    }

    /// Background loop: wakes every `interval` and reconnects any endpoint
    /// whose connection is missing. Individual failures are logged, never
    /// fatal; the loop itself only exits on shutdown.
    pub async fn maintain_connections(&self, shutdown: &tokio_util::sync::CancellationToken, interval: Duration) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {
                    self.reconnect_missing().await;
                }
            }
        }
    }

    async fn reconnect_missing(&self) {
        for endpoint in &self.endpoints {
            let missing = {
                let connections = self.connections.lock().await;
                !connections.contains_key(&endpoint.url)
            };
            if missing {
                if let Err(e) = self.connect_endpoint(endpoint).await {
                    warn!(endpoint = %endpoint.url, error = %e, "endpoint reconnect failed");
                }
            }
        }
    }

    pub async fn disconnect(&self) {
        let mut connections = self.connections.lock().await;
        for (_, conn) in connections.drain() {
            close_connection(conn).await;
        }
    }
}

async fn close_connection(conn: PooledConnection) {
    let mut subs = conn.subscriptions.lock().await;
    subs.clear();
    let _ = conn.run_handle.send(SessionCommand::Stop);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MessageSecurityMode, SecurityPolicy};

    fn endpoint(url: &str, name: &str) -> EndpointConfig {
        EndpointConfig {
            url: url.to_string(),
            name: name.to_string(),
            security_policy: SecurityPolicy::None,
            security_mode: MessageSecurityMode::None,
            timeout_ms: 10_000,
            username: None,
            password: None,
        }
    }

    #[test]
    fn resolve_endpoint_url_defaults_to_first() {
        let pool = OpcUaConnectionPool::new(vec![
            endpoint("opc.tcp://a:4840", "a"),
            endpoint("opc.tcp://b:4840", "b"),
        ]);
        assert_eq!(pool.resolve_endpoint_url(None).unwrap(), "opc.tcp://a:4840");
    }

    #[test]
    fn resolve_endpoint_url_matches_by_name_or_url() {
        let pool = OpcUaConnectionPool::new(vec![endpoint("opc.tcp://a:4840", "plant-a")]);
        assert_eq!(
            pool.resolve_endpoint_url(Some("plant-a")).unwrap(),
            "opc.tcp://a:4840"
        );
        assert_eq!(
            pool.resolve_endpoint_url(Some("opc.tcp://a:4840")).unwrap(),
            "opc.tcp://a:4840"
        );
        assert!(pool.resolve_endpoint_url(Some("unknown")).is_err());
    }
}
