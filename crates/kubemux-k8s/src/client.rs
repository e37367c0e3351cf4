use anyhow::{Context, Result, anyhow};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::Api;
use kube::api::ListParams;
use kube::config::{KubeConfigOptions, Kubeconfig};

/// Minimal pod description for the accessor contract
#[derive(Clone, Debug)]
pub struct PodSummary {
    pub name: String,
    pub phase: String,
    pub containers: Vec<String>,
}

/// Cluster client built from a kubeconfig document
///
/// When a tunnel port is supplied, the API server URL is rewritten to the
/// local listener and the TLS server name pinned to the original host so
/// certificate verification still succeeds.
pub struct ClusterClient {
    client: kube::Client,
}

impl ClusterClient {
    /// Build a client from a raw kubeconfig document.
    ///
    /// `local_port` routes all API traffic through `127.0.0.1:{port}`.
    pub async fn from_kubeconfig(blob: &str, local_port: Option<u16>) -> Result<Self> {
        let mut kubeconfig =
            Kubeconfig::from_yaml(blob).context("Failed to parse kubeconfig document")?;

        let context_name = kubeconfig
            .current_context
            .clone()
            .or_else(|| kubeconfig.contexts.first().map(|c| c.name.clone()))
            .ok_or_else(|| anyhow!("kubeconfig has no contexts"))?;

        let mut tls_server_name = None;
        if let Some(port) = local_port {
            let (host, _) = api_server_endpoint(blob)?;
            rewrite_server(&mut kubeconfig, &context_name, port)?;
            tls_server_name = Some(host);
        }

        let mut config = kube::Config::from_custom_kubeconfig(
            kubeconfig,
            &KubeConfigOptions {
                context: Some(context_name.clone()),
                ..Default::default()
            },
        )
        .await
        .context(format!(
            "Failed to create config for context: {}",
            context_name
        ))?;

        if tls_server_name.is_some() {
            config.tls_server_name = tls_server_name;
        }

        let client = kube::Client::try_from(config).context(format!(
            "Failed to create client for context: {}",
            context_name
        ))?;

        Ok(Self { client })
    }

    /// The underlying kube client
    pub fn client(&self) -> kube::Client {
        self.client.clone()
    }

    /// Fetch all namespace names from the cluster
    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let list = namespaces
            .list(&ListParams::default())
            .await
            .context("Failed to list namespaces")?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    /// Fetch pods in a namespace
    pub async fn list_pods(&self, namespace: &str) -> Result<Vec<PodSummary>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default())
            .await
            .context(format!("Failed to list pods in {}", namespace))?;

        Ok(list
            .items
            .into_iter()
            .map(|pod| {
                let name = pod.metadata.name.unwrap_or_default();
                let phase = pod
                    .status
                    .and_then(|s| s.phase)
                    .unwrap_or_else(|| "Unknown".to_string());
                let containers = pod
                    .spec
                    .map(|spec| spec.containers.into_iter().map(|c| c.name).collect())
                    .unwrap_or_default();
                PodSummary {
                    name,
                    phase,
                    containers,
                }
            })
            .collect())
    }

    /// Fetch the container names of a single pod
    pub async fn list_containers(&self, namespace: &str, pod: &str) -> Result<Vec<String>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pod = pods.get(pod).await.context(format!(
            "Failed to get pod '{}' in namespace '{}'",
            pod, namespace
        ))?;

        Ok(pod
            .spec
            .map(|spec| spec.containers.into_iter().map(|c| c.name).collect())
            .unwrap_or_default())
    }
}

/// Extract the API server host and port from a kubeconfig document.
///
/// This is the tunnel target for SSH-backed connections.
pub fn api_server_endpoint(blob: &str) -> Result<(String, u16)> {
    let kubeconfig =
        Kubeconfig::from_yaml(blob).context("Failed to parse kubeconfig document")?;

    let context_name = kubeconfig
        .current_context
        .clone()
        .or_else(|| kubeconfig.contexts.first().map(|c| c.name.clone()))
        .ok_or_else(|| anyhow!("kubeconfig has no contexts"))?;

    let cluster_name = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .and_then(|c| c.context.as_ref())
        .map(|c| c.cluster.clone())
        .ok_or_else(|| anyhow!("context '{}' not found in kubeconfig", context_name))?;

    let server = kubeconfig
        .clusters
        .iter()
        .find(|c| c.name == cluster_name)
        .and_then(|c| c.cluster.as_ref())
        .and_then(|c| c.server.clone())
        .ok_or_else(|| anyhow!("cluster '{}' has no server URL", cluster_name))?;

    parse_server_url(&server)
}

/// Parse `https://host:port` (port optional) into host and port
fn parse_server_url(server: &str) -> Result<(String, u16)> {
    let (scheme, rest) = server
        .split_once("://")
        .ok_or_else(|| anyhow!("invalid server URL: {}", server))?;

    let default_port = if scheme == "http" { 80 } else { 443 };
    let authority = rest.split('/').next().unwrap_or(rest);

    // IPv6 literals come bracketed: [::1]:6443
    if let Some(stripped) = authority.strip_prefix('[') {
        let (host, tail) = stripped
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid server URL: {}", server))?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().context("invalid port in server URL")?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().context("invalid port in server URL")?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

/// Rewrite the active cluster's server URL to the tunnel's local listener
fn rewrite_server(kubeconfig: &mut Kubeconfig, context_name: &str, local_port: u16) -> Result<()> {
    let cluster_name = kubeconfig
        .contexts
        .iter()
        .find(|c| c.name == context_name)
        .and_then(|c| c.context.as_ref())
        .map(|c| c.cluster.clone())
        .ok_or_else(|| anyhow!("context '{}' not found in kubeconfig", context_name))?;

    let cluster = kubeconfig
        .clusters
        .iter_mut()
        .find(|c| c.name == cluster_name)
        .and_then(|c| c.cluster.as_mut())
        .ok_or_else(|| anyhow!("cluster '{}' not found in kubeconfig", cluster_name))?;

    cluster.server = Some(format!("https://127.0.0.1:{}", local_port));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: test
contexts:
  - name: test
    context:
      cluster: test-cluster
      user: test-user
clusters:
  - name: test-cluster
    cluster:
      server: https://10.0.0.5:6443
users:
  - name: test-user
    user:
      token: abc
"#;

    #[test]
    fn test_api_server_endpoint() {
        let (host, port) = api_server_endpoint(KUBECONFIG).unwrap();
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, 6443);
    }

    #[test]
    fn test_parse_server_url_default_port() {
        let (host, port) = parse_server_url("https://example.com").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_parse_server_url_with_path() {
        let (host, port) = parse_server_url("https://example.com:8443/k8s/clusters/c-1").unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8443);
    }

    #[test]
    fn test_parse_server_url_ipv6() {
        let (host, port) = parse_server_url("https://[::1]:6443").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 6443);
    }

    #[test]
    fn test_parse_server_url_rejects_garbage() {
        assert!(parse_server_url("not a url").is_err());
    }

    #[test]
    fn test_rewrite_server() {
        let mut kubeconfig = Kubeconfig::from_yaml(KUBECONFIG).unwrap();
        rewrite_server(&mut kubeconfig, "test", 45123).unwrap();
        let server = kubeconfig.clusters[0]
            .cluster
            .as_ref()
            .unwrap()
            .server
            .clone()
            .unwrap();
        assert_eq!(server, "https://127.0.0.1:45123");
    }
}
