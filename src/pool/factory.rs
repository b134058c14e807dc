//! Client construction
//!
//! Every kube client in the server is built here from a [`Cluster`] descriptor,
//! optionally impersonating a caller. The server's own credentials authenticate
//! the connection; `Impersonate-User` / `Impersonate-Group` make the cluster
//! authorize each call as the caller.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::{json, Map, Value};

#[cfg(test)]
use mockall::automock;

use super::client::{ClusterClient, KubeClusterClient};
use crate::clusters::Cluster;
use crate::config::KubeTimeouts;
use crate::identity::UserIdentity;
use crate::{Error, Result};

/// Whose authority a pooled client carries
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClientIdentity {
    /// The server's own service identity (cache watches, namespace candidates)
    Service,
    /// An impersonated caller
    User(UserIdentity),
}

impl ClientIdentity {
    /// Key separating pooled clients by identity
    pub fn pool_key(&self) -> ClientIdentity {
        match self {
            ClientIdentity::Service => ClientIdentity::Service,
            ClientIdentity::User(user) => ClientIdentity::User(user.canonical()),
        }
    }

    /// Whether this is the server's own identity
    pub fn is_service(&self) -> bool {
        matches!(self, ClientIdentity::Service)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientIdentity::Service => f.write_str("<service>"),
            ClientIdentity::User(user) => f.write_str(&user.username),
        }
    }
}

impl From<UserIdentity> for ClientIdentity {
    fn from(user: UserIdentity) -> Self {
        ClientIdentity::User(user)
    }
}

/// Builds clients for (cluster, identity) pairs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientFactory: Send + Sync {
    /// Build a client for `cluster` acting as `identity`
    async fn build(
        &self,
        cluster: &Cluster,
        identity: &ClientIdentity,
    ) -> Result<Arc<dyn ClusterClient>>;
}

/// Factory producing kube-rs clients with impersonation
#[derive(Clone, Debug, Default)]
pub struct ImpersonatingClientFactory {
    timeouts: KubeTimeouts,
}

impl ImpersonatingClientFactory {
    /// Create a factory applying `timeouts` to every client
    pub fn new(timeouts: KubeTimeouts) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl ClientFactory for ImpersonatingClientFactory {
    async fn build(
        &self,
        cluster: &Cluster,
        identity: &ClientIdentity,
    ) -> Result<Arc<dyn ClusterClient>> {
        let client = kube_client_for(cluster, identity, self.timeouts).await?;
        Ok(Arc::new(KubeClusterClient::new(&cluster.name, client)))
    }
}

/// Build a kube client for `cluster`, impersonating `identity` if it is a user
pub async fn kube_client_for(
    cluster: &Cluster,
    identity: &ClientIdentity,
    timeouts: KubeTimeouts,
) -> Result<Client> {
    let kubeconfig = kubeconfig_for(cluster)?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context(
                "create client",
                format!("cluster {}: failed to load config: {e}", cluster.name),
            )
        })?;

    config.connect_timeout = Some(timeouts.connect);
    config.read_timeout = Some(timeouts.read);

    if let ClientIdentity::User(user) = identity {
        config.auth_info.impersonate = Some(user.username.clone());
        if !user.groups.is_empty() {
            config.auth_info.impersonate_groups = Some(user.groups.clone());
        }
    }

    Client::try_from(config).map_err(|e| {
        Error::internal_with_context(
            "create client",
            format!("cluster {}: failed to create client: {e}", cluster.name),
        )
    })
}

/// Render a cluster descriptor as a single-context kubeconfig
pub fn kubeconfig_for(cluster: &Cluster) -> Result<Kubeconfig> {
    let mut cluster_entry = Map::new();
    cluster_entry.insert("server".into(), json!(cluster.server));
    if cluster.tls.insecure {
        cluster_entry.insert("insecure-skip-tls-verify".into(), json!(true));
    } else if let Some(ca) = &cluster.tls.ca_data {
        cluster_entry.insert("certificate-authority-data".into(), json!(BASE64.encode(ca)));
    }

    let mut user_entry = Map::new();
    if let Some(token) = &cluster.bearer_token {
        user_entry.insert("token".into(), json!(token));
    }
    if let (Some(cert), Some(key)) = (&cluster.tls.cert_data, &cluster.tls.key_data) {
        user_entry.insert("client-certificate-data".into(), json!(BASE64.encode(cert)));
        user_entry.insert("client-key-data".into(), json!(BASE64.encode(key)));
    }

    let doc = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{"name": cluster.name, "cluster": Value::Object(cluster_entry)}],
        "users": [{"name": cluster.name, "user": Value::Object(user_entry)}],
        "contexts": [{
            "name": cluster.name,
            "context": {"cluster": cluster.name, "user": cluster.name}
        }],
        "current-context": cluster.name,
    });

    serde_json::from_value(doc).map_err(|e| {
        Error::internal_with_context(
            "create client",
            format!("cluster {}: invalid kubeconfig: {e}", cluster.name),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::{test_cluster, TlsConfig};

    #[test]
    fn test_pool_keys_separate_service_and_users() {
        let alice = ClientIdentity::User(UserIdentity::new("alice", vec!["dev".into()]));
        let alice_again =
            ClientIdentity::from(UserIdentity::new("alice", vec!["dev".into(), "dev".into()]));
        assert_eq!(alice.pool_key(), alice_again.pool_key());
        assert_ne!(alice.pool_key(), ClientIdentity::Service.pool_key());
        assert!(ClientIdentity::Service.is_service());
        assert!(!alice.is_service());
    }

    #[test]
    fn test_kubeconfig_carries_token_and_ca() {
        let mut cluster = test_cluster("prod");
        cluster.tls.ca_data = Some(b"CA".to_vec());

        let kc = kubeconfig_for(&cluster).unwrap();
        assert_eq!(kc.current_context.as_deref(), Some("prod"));

        let named = &kc.clusters[0];
        let c = named.cluster.as_ref().unwrap();
        assert_eq!(c.server.as_deref(), Some("https://prod.example.com:6443"));
        assert_eq!(
            c.certificate_authority_data.as_deref(),
            Some(BASE64.encode(b"CA").as_str())
        );
        assert!(c.insecure_skip_tls_verify.is_none());

        let user = kc.auth_infos[0].auth_info.as_ref().unwrap();
        assert!(user.token.is_some());
        assert!(user.client_certificate_data.is_none());
    }

    #[test]
    fn test_kubeconfig_insecure_drops_ca() {
        let cluster = Cluster {
            tls: TlsConfig {
                ca_data: Some(b"CA".to_vec()),
                insecure: true,
                ..Default::default()
            },
            ..test_cluster("dev")
        };

        let kc = kubeconfig_for(&cluster).unwrap();
        let c = kc.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(c.insecure_skip_tls_verify, Some(true));
        assert!(c.certificate_authority_data.is_none());
    }

    #[test]
    fn test_kubeconfig_client_certificate() {
        let cluster = Cluster {
            bearer_token: None,
            tls: TlsConfig {
                cert_data: Some(b"CERT".to_vec()),
                key_data: Some(b"KEY".to_vec()),
                ..Default::default()
            },
            ..test_cluster("edge")
        };

        let kc = kubeconfig_for(&cluster).unwrap();
        let user = kc.auth_infos[0].auth_info.as_ref().unwrap();
        assert!(user.token.is_none());
        assert_eq!(
            user.client_certificate_data.as_deref(),
            Some(BASE64.encode(b"CERT").as_str())
        );
    }
}
