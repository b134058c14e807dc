//! Server configuration and credential sources
//!
//! Nothing in the crate reaches into process-wide state to build clients.
//! `main` assembles a [`ServerConfig`] from CLI flags and hands it, together
//! with a [`CredentialSource`], to the constructors that need them. Tests pass
//! their own values and fakes instead.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::clusters::TlsConfig;
use crate::kinds::ResourceKind;
use crate::retry::RetryConfig;
use crate::{Error, Result, DEFAULT_API_PORT, DEFAULT_CLUSTER_NAME};

/// Path to the in-cluster CA certificate
pub const CA_CERT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// Path to the in-cluster ServiceAccount token
pub const TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect/read timeouts applied to every kube client the server builds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KubeTimeouts {
    /// TCP/TLS connect timeout
    pub connect: Duration,
    /// Per-response read timeout
    pub read: Duration,
}

impl Default for KubeTimeouts {
    fn default() -> Self {
        Self {
            connect: DEFAULT_CONNECT_TIMEOUT,
            read: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// How the fleet is discovered
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterMode {
    /// Only the cluster the server runs on
    Single,
    /// Remote clusters described by labelled Secrets
    Fleet {
        /// Namespace holding the cluster Secrets
        namespace: String,
        /// Label selector matching cluster Secrets
        label_selector: String,
        /// Also serve the local cluster under the default name
        include_local: bool,
    },
}

/// Everything the server needs to start, passed explicitly to constructors
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address the HTTP API listens on
    pub listen_addr: SocketAddr,
    /// Name of the default cluster
    pub cluster_name: String,
    /// Fleet discovery mode
    pub mode: ClusterMode,
    /// How often the cluster registry re-fetches membership
    pub refresh_interval: Duration,
    /// Deadline applied to each inbound request
    pub request_timeout: Duration,
    /// Kinds kept in the watch-fed cache
    pub cached_kinds: Vec<ResourceKind>,
    /// Backoff for re-establishing watches
    pub watch_retry: RetryConfig,
    /// Consecutive watch failures before a cluster's cache is marked unavailable
    pub degrade_after: u32,
    /// Per-identity clients unused for this long are evicted
    pub client_idle_ttl: Duration,
    /// Maximum concurrent permission checks per request
    pub authz_concurrency: usize,
    /// Timeouts for every kube client
    pub kube_timeouts: KubeTimeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_API_PORT)),
            cluster_name: DEFAULT_CLUSTER_NAME.to_string(),
            mode: ClusterMode::Single,
            refresh_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            cached_kinds: vec![ResourceKind::Namespace],
            watch_retry: RetryConfig::default(),
            degrade_after: 5,
            client_idle_ttl: Duration::from_secs(15 * 60),
            authz_concurrency: 16,
            kube_timeouts: KubeTimeouts::default(),
        }
    }
}

impl ServerConfig {
    /// Reject settings that would make the server misbehave at runtime
    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            return Err(Error::misconfigured("cluster name must not be empty"));
        }
        if self.authz_concurrency == 0 {
            return Err(Error::misconfigured("authz concurrency must be at least 1"));
        }
        if self.degrade_after == 0 {
            return Err(Error::misconfigured("degrade-after must be at least 1"));
        }
        if self.refresh_interval.is_zero() || self.request_timeout.is_zero() {
            return Err(Error::misconfigured(
                "refresh interval and request timeout must be positive",
            ));
        }
        if let ClusterMode::Fleet { namespace, .. } = &self.mode {
            if namespace.is_empty() {
                return Err(Error::misconfigured("fleet namespace must not be empty"));
            }
        }
        Ok(())
    }
}

/// Trait for reading Kubernetes environment configuration
#[cfg_attr(test, automock)]
pub trait K8sEnvConfig: Send + Sync {
    /// Get the Kubernetes service host from environment
    fn kubernetes_service_host(&self) -> Option<String>;

    /// Get the Kubernetes service port from environment (defaults to 443)
    fn kubernetes_service_port(&self) -> String;
}

/// Reads the real process environment
#[derive(Clone, Default)]
pub struct OsEnvConfig;

impl K8sEnvConfig for OsEnvConfig {
    fn kubernetes_service_host(&self) -> Option<String> {
        std::env::var("KUBERNETES_SERVICE_HOST").ok()
    }

    fn kubernetes_service_port(&self) -> String {
        std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string())
    }
}

/// Build the API server URL from the environment
pub fn api_server_endpoint(env: &dyn K8sEnvConfig) -> Option<String> {
    let host = env.kubernetes_service_host()?;
    let port = env.kubernetes_service_port();
    // IPv6 service hosts need brackets in a URL
    if host.contains(':') {
        Some(format!("https://[{host}]:{port}"))
    } else {
        Some(format!("https://{host}:{port}"))
    }
}

/// The server's own credentials for the cluster it runs on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceCredentials {
    /// API server URL
    pub server: String,
    /// ServiceAccount (or operator-supplied) bearer token
    pub bearer_token: Option<String>,
    /// TLS material
    pub tls: TlsConfig,
}

/// Source of the server's own credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Load the credentials
    async fn load(&self) -> Result<ServiceCredentials>;
}

/// Credentials from the pod's mounted ServiceAccount
pub struct InClusterCredentials {
    env: Arc<dyn K8sEnvConfig>,
    token_path: PathBuf,
    ca_path: PathBuf,
}

impl InClusterCredentials {
    /// Use the standard mount paths and the process environment
    pub fn new() -> Self {
        Self::with_paths(Arc::new(OsEnvConfig), TOKEN_PATH, CA_CERT_PATH)
    }

    /// Use explicit paths and environment
    pub fn with_paths(
        env: Arc<dyn K8sEnvConfig>,
        token_path: impl Into<PathBuf>,
        ca_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            env,
            token_path: token_path.into(),
            ca_path: ca_path.into(),
        }
    }
}

impl Default for InClusterCredentials {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialSource for InClusterCredentials {
    async fn load(&self) -> Result<ServiceCredentials> {
        let server = api_server_endpoint(self.env.as_ref()).ok_or_else(|| {
            Error::misconfigured("KUBERNETES_SERVICE_HOST is not set; not running in a cluster?")
        })?;

        let token = tokio::fs::read_to_string(&self.token_path)
            .await
            .map_err(|e| {
                Error::internal_with_context(
                    "load service account",
                    format!("failed to read {}: {e}", self.token_path.display()),
                )
            })?;

        let ca = tokio::fs::read(&self.ca_path).await.map_err(|e| {
            Error::internal_with_context(
                "load service account",
                format!("failed to read {}: {e}", self.ca_path.display()),
            )
        })?;

        Ok(ServiceCredentials {
            server,
            bearer_token: Some(token.trim().to_string()),
            tls: TlsConfig {
                ca_data: Some(ca),
                ..Default::default()
            },
        })
    }
}

/// Credentials supplied explicitly by the operator
#[derive(Clone, Debug)]
pub struct StaticCredentials(pub ServiceCredentials);

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn load(&self) -> Result<ServiceCredentials> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(host: Option<&'static str>, port: &'static str) -> MockK8sEnvConfig {
        let mut mock = MockK8sEnvConfig::new();
        mock.expect_kubernetes_service_host()
            .returning(move || host.map(str::to_string));
        mock.expect_kubernetes_service_port()
            .returning(move || port.to_string());
        mock
    }

    #[test]
    fn test_api_server_endpoint() {
        assert_eq!(
            api_server_endpoint(&env(Some("10.96.0.1"), "443")).as_deref(),
            Some("https://10.96.0.1:443")
        );
        assert_eq!(
            api_server_endpoint(&env(Some("fd00::1"), "6443")).as_deref(),
            Some("https://[fd00::1]:6443")
        );
        assert_eq!(api_server_endpoint(&env(None, "443")), None);
    }

    #[tokio::test]
    async fn test_in_cluster_credentials_read_mounted_files() {
        let dir = std::env::temp_dir().join(format!("fleet-creds-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let token_path = dir.join("token");
        let ca_path = dir.join("ca.crt");
        tokio::fs::write(&token_path, "sa-token\n").await.unwrap();
        tokio::fs::write(&ca_path, b"CA").await.unwrap();

        let source =
            InClusterCredentials::with_paths(Arc::new(env(Some("10.0.0.1"), "443")), &token_path, &ca_path);
        let creds = source.load().await.unwrap();

        assert_eq!(creds.server, "https://10.0.0.1:443");
        assert_eq!(creds.bearer_token.as_deref(), Some("sa-token"));
        assert_eq!(creds.tls.ca_data.as_deref(), Some(&b"CA"[..]));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_in_cluster_credentials_outside_cluster() {
        let source = InClusterCredentials::with_paths(
            Arc::new(env(None, "443")),
            "/nonexistent/token",
            "/nonexistent/ca.crt",
        );
        assert!(matches!(source.load().await, Err(Error::Misconfigured(_))));
    }

    #[test]
    fn test_validate() {
        assert!(ServerConfig::default().validate().is_ok());

        let cfg = ServerConfig {
            authz_concurrency: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = ServerConfig {
            mode: ClusterMode::Fleet {
                namespace: String::new(),
                label_selector: "x=y".into(),
                include_local: true,
            },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
