//! Single-cluster mode: the fleet is the cluster the server runs on

use std::sync::Arc;

use async_trait::async_trait;

use super::{Cluster, ClusterFetcher};
use crate::config::CredentialSource;
use crate::Result;

/// Fetcher returning exactly one cluster built from the server's own credentials
pub struct SingleClusterFetcher {
    name: String,
    credentials: Arc<dyn CredentialSource>,
}

impl SingleClusterFetcher {
    /// Create a fetcher naming the local cluster `name`
    pub fn new(name: impl Into<String>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            name: name.into(),
            credentials,
        }
    }
}

/// Build the local cluster descriptor from a credential source
pub async fn local_cluster(name: &str, credentials: &dyn CredentialSource) -> Result<Cluster> {
    let creds = credentials.load().await?;
    Ok(Cluster {
        name: name.to_string(),
        server: creds.server,
        bearer_token: creds.bearer_token,
        tls: creds.tls,
    })
}

#[async_trait]
impl ClusterFetcher for SingleClusterFetcher {
    async fn fetch(&self) -> Result<Vec<Cluster>> {
        Ok(vec![local_cluster(&self.name, self.credentials.as_ref()).await?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::TlsConfig;
    use crate::config::{MockCredentialSource, ServiceCredentials};
    use crate::Error;

    #[tokio::test]
    async fn test_fetch_returns_one_cluster_under_fixed_name() {
        let mut creds = MockCredentialSource::new();
        creds.expect_load().returning(|| {
            Ok(ServiceCredentials {
                server: "https://10.96.0.1:443".into(),
                bearer_token: Some("sa".into()),
                tls: TlsConfig::default(),
            })
        });

        let fetcher = SingleClusterFetcher::new("Default", Arc::new(creds));
        let clusters = fetcher.fetch().await.unwrap();

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].name, "Default");
        assert_eq!(clusters[0].server, "https://10.96.0.1:443");
        assert_eq!(clusters[0].bearer_token.as_deref(), Some("sa"));
    }

    #[tokio::test]
    async fn test_credential_failure_propagates() {
        let mut creds = MockCredentialSource::new();
        creds
            .expect_load()
            .returning(|| Err(Error::misconfigured("not in cluster")));

        let fetcher = SingleClusterFetcher::new("Default", Arc::new(creds));
        assert!(matches!(fetcher.fetch().await, Err(Error::Misconfigured(_))));
    }
}
