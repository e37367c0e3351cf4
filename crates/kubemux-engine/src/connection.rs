use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;

use kubemux_k8s::{ClusterClient, api_server_endpoint};
use kubemux_types::{Connection, SshEndpoint};

use crate::error::{EngineError, Result};
use crate::tunnel::TunnelManager;

struct ConnectionEntry {
    connection: Connection,
    cluster: Arc<ClusterClient>,
}

/// Registry of cluster connections and their clients.
///
/// An SSH-backed connection gets a tunnel keyed by its id before the client
/// is built, and every API call for that connection goes through the
/// tunnel's local port. Removing a connection tears the tunnel down.
pub struct ConnectionManager {
    tunnels: Arc<TunnelManager>,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
}

impl ConnectionManager {
    pub fn new(tunnels: Arc<TunnelManager>) -> Self {
        Self {
            tunnels,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register a connection and build its cluster client.
    ///
    /// Re-adding an existing id replaces it, tunnel included.
    pub async fn add(&self, connection: Connection) -> Result<()> {
        self.remove(&connection.id);

        let local_port = match &connection.ssh {
            Some(ssh) => {
                let (host, port) = api_server_endpoint(&connection.kubeconfig)
                    .map_err(|e| EngineError::Auth(format!("{:#}", e)))?;
                let local = self
                    .tunnels
                    .create_tunnel(&connection.id, ssh, &host, port)
                    .await?;
                Some(local)
            }
            None => None,
        };

        let cluster = ClusterClient::from_kubeconfig(&connection.kubeconfig, local_port)
            .await
            .map_err(|e| {
                // A client that never built leaves no tunnel behind
                self.tunnels.close_tunnel(&connection.id);
                EngineError::Auth(format!("{:#}", e))
            })?;

        tracing::debug!(
            connection = %connection.id,
            tunneled = local_port.is_some(),
            "connection registered"
        );

        self.connections.write().insert(
            connection.id.clone(),
            ConnectionEntry {
                connection,
                cluster: Arc::new(cluster),
            },
        );
        Ok(())
    }

    /// Drop a connection, closing its tunnel. Idempotent.
    pub fn remove(&self, connection_id: &str) {
        if self.connections.write().remove(connection_id).is_some() {
            tracing::debug!(connection = connection_id, "connection removed");
        }
        self.tunnels.close_tunnel(connection_id);
    }

    /// The kube client for a registered connection
    pub fn client(&self, connection_id: &str) -> Result<kube::Client> {
        let connections = self.connections.read();
        connections
            .get(connection_id)
            .map(|entry| entry.cluster.client())
            .ok_or_else(|| EngineError::UnknownConnection(connection_id.to_string()))
    }

    /// The full cluster accessor for a registered connection
    pub fn cluster(&self, connection_id: &str) -> Result<Arc<ClusterClient>> {
        let connections = self.connections.read();
        connections
            .get(connection_id)
            .map(|entry| Arc::clone(&entry.cluster))
            .ok_or_else(|| EngineError::UnknownConnection(connection_id.to_string()))
    }

    /// Connection definitions currently registered
    pub fn list(&self) -> Vec<Connection> {
        self.connections
            .read()
            .values()
            .map(|entry| entry.connection.clone())
            .collect()
    }

    /// Handshake-only SSH probe, bounded, leaving nothing behind
    pub async fn test_ssh(&self, ssh: &SshEndpoint) -> bool {
        self.tunnels.test_connection(ssh).await
    }
}

/// JSON persistence for connection definitions.
///
/// One object per connection with fields `{id, name, ssh?, kubeconfig}`;
/// private keys are referenced by path, never stored.
pub struct ConnectionStore {
    path: PathBuf,
}

impl ConnectionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Read the connection list; a missing file is an empty list
    pub fn load(&self) -> io::Result<Vec<Connection>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read(&self.path)?;
        serde_json::from_slice(&data).map_err(io::Error::other)
    }

    /// Write the connection list atomically enough for a config file
    pub fn save(&self, connections: &[Connection]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(connections).map_err(io::Error::other)?;
        std::fs::write(&self.path, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStore::new(dir.path().join("connections.json"));

        let connections = vec![
            Connection::new("c1".to_string(), "prod".to_string(), "apiVersion: v1".to_string()),
            Connection::new("c2".to_string(), "staging".to_string(), "apiVersion: v1".to_string())
                .with_ssh(SshEndpoint::new(
                    "bastion".to_string(),
                    22,
                    "ops".to_string(),
                    "/home/ops/.ssh/id_rsa".to_string(),
                )),
        ];

        store.save(&connections).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "c1");
        assert!(loaded[0].ssh.is_none());
        assert_eq!(loaded[1].ssh.as_ref().unwrap().host, "bastion");
    }

    #[test]
    fn test_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStore::new(dir.path().join("none.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_store_wire_field_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConnectionStore::new(dir.path().join("connections.json"));
        let connection = Connection::new("c1".to_string(), "prod".to_string(), "cfg".to_string())
            .with_ssh(SshEndpoint::new(
                "host".to_string(),
                22,
                "user".to_string(),
                "/key".to_string(),
            ));
        store.save(std::slice::from_ref(&connection)).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("connections.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let obj = &value[0];
        assert!(obj.get("id").is_some());
        assert!(obj.get("name").is_some());
        assert!(obj.get("kubeconfig").is_some());
        assert!(obj["ssh"].get("privateKeyPath").is_some());
    }

    #[test]
    fn test_unknown_connection_errors() {
        let tunnels = Arc::new(TunnelManager::new("ssh".to_string()));
        let manager = ConnectionManager::new(tunnels);
        assert!(matches!(
            manager.client("missing"),
            Err(EngineError::UnknownConnection(_))
        ));
        assert!(manager.list().is_empty());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let tunnels = Arc::new(TunnelManager::new("ssh".to_string()));
        let manager = ConnectionManager::new(tunnels);
        manager.remove("missing");
    }
}
