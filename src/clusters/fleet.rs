//! Fleet mode: remote clusters described by labelled Secrets
//!
//! Each Secret in the fleet namespace carrying the selector label describes one
//! cluster:
//!
//! | key       | required | content                                   |
//! |-----------|----------|-------------------------------------------|
//! | `name`    | no       | cluster name (defaults to the Secret name) |
//! | `server`  | yes      | API server URL                            |
//! | `token`   | no       | bearer token of the server's identity     |
//! | `ca.crt`  | no       | PEM CA bundle                             |
//! | `tls.crt` | no       | PEM client certificate                    |
//! | `tls.key` | no       | PEM client key                            |
//! | `insecure`| no       | `"true"` to skip TLS verification          |
//!
//! Malformed Secrets are logged and skipped so one bad entry cannot take the
//! whole fleet offline. Duplicate names fail the fetch.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::{debug, warn};

use super::single::local_cluster;
use super::{validate_cluster_names, Cluster, ClusterFetcher, TlsConfig};
use crate::config::CredentialSource;
use crate::{Error, Result};

/// Secret data key holding the cluster name
pub const KEY_NAME: &str = "name";
/// Secret data key holding the API server URL
pub const KEY_SERVER: &str = "server";
/// Secret data key holding the bearer token
pub const KEY_TOKEN: &str = "token";
/// Secret data key holding the CA bundle
pub const KEY_CA: &str = "ca.crt";
/// Secret data key holding the client certificate
pub const KEY_CERT: &str = "tls.crt";
/// Secret data key holding the client key
pub const KEY_KEY: &str = "tls.key";
/// Secret data key toggling TLS verification
pub const KEY_INSECURE: &str = "insecure";

/// Fetcher reading cluster credentials from Secrets on the home cluster
pub struct SecretClusterFetcher {
    client: Client,
    namespace: String,
    label_selector: String,
    local: Option<(String, Arc<dyn CredentialSource>)>,
}

impl SecretClusterFetcher {
    /// Create a fetcher over Secrets in `namespace` matching `label_selector`
    pub fn new(
        client: Client,
        namespace: impl Into<String>,
        label_selector: impl Into<String>,
    ) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            label_selector: label_selector.into(),
            local: None,
        }
    }

    /// Also serve the cluster the server runs on, under `name`
    pub fn with_local(mut self, name: impl Into<String>, credentials: Arc<dyn CredentialSource>) -> Self {
        self.local = Some((name.into(), credentials));
        self
    }
}

#[async_trait]
impl ClusterFetcher for SecretClusterFetcher {
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.namespace);
        let secrets = api
            .list(&ListParams::default().labels(&self.label_selector))
            .await
            .map_err(|e| Error::internal_with_context("list cluster secrets", e.to_string()))?;

        let mut clusters = Vec::with_capacity(secrets.items.len() + 1);
        if let Some((name, credentials)) = &self.local {
            clusters.push(local_cluster(name, credentials.as_ref()).await?);
        }
        clusters.extend(clusters_from_secrets(&secrets.items));

        validate_cluster_names(&clusters)?;
        debug!(
            namespace = %self.namespace,
            count = clusters.len(),
            "Fetched fleet clusters"
        );
        Ok(clusters)
    }
}

/// Convert Secrets to clusters, sorted by name, skipping malformed entries
pub fn clusters_from_secrets(secrets: &[Secret]) -> Vec<Cluster> {
    let mut clusters: Vec<Cluster> = secrets
        .iter()
        .filter_map(|secret| match cluster_from_secret(secret) {
            Ok(cluster) => Some(cluster),
            Err(e) => {
                warn!(
                    secret = secret.metadata.name.as_deref().unwrap_or_default(),
                    error = %e,
                    "Skipping malformed cluster secret"
                );
                None
            }
        })
        .collect();
    // stable sort keeps duplicates adjacent for validation
    clusters.sort_by(|a, b| a.name.cmp(&b.name));
    clusters
}

/// Parse one cluster Secret
pub fn cluster_from_secret(secret: &Secret) -> Result<Cluster> {
    let secret_name = secret.metadata.name.clone().unwrap_or_default();
    let empty = BTreeMap::new();
    let data = secret.data.as_ref().unwrap_or(&empty);

    let server = string_value(data, KEY_SERVER)?
        .ok_or_else(|| Error::misconfigured(format!("secret {secret_name} has no '{KEY_SERVER}' key")))?;
    if !server.starts_with("https://") && !server.starts_with("http://") {
        return Err(Error::misconfigured(format!(
            "secret {secret_name}: server '{server}' is not an http(s) URL"
        )));
    }

    let name = string_value(data, KEY_NAME)?.unwrap_or(secret_name);
    let insecure = string_value(data, KEY_INSECURE)?
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    Ok(Cluster {
        name,
        server,
        bearer_token: string_value(data, KEY_TOKEN)?,
        tls: TlsConfig {
            ca_data: bytes_value(data, KEY_CA),
            cert_data: bytes_value(data, KEY_CERT),
            key_data: bytes_value(data, KEY_KEY),
            insecure,
        },
    })
}

fn bytes_value(data: &BTreeMap<String, ByteString>, key: &str) -> Option<Vec<u8>> {
    data.get(key).map(|b| b.0.clone()).filter(|b| !b.is_empty())
}

fn string_value(data: &BTreeMap<String, ByteString>, key: &str) -> Result<Option<String>> {
    match bytes_value(data, key) {
        None => Ok(None),
        Some(bytes) => String::from_utf8(bytes)
            .map(|s| Some(s.trim().to_string()))
            .map_err(|_| Error::misconfigured(format!("key '{key}' is not valid UTF-8"))),
    }
}
