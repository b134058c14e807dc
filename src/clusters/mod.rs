//! Cluster registry - the set of clusters this server fronts
//!
//! A [`ClusterFetcher`] produces the current fleet; the [`ClusterRegistry`]
//! validates each fetch and swaps it in as one immutable [`ClusterSet`].
//! Readers always see either the previous set or the next one, never a mix.
//!
//! Consumers that hold per-cluster state (client pool, resource cache)
//! subscribe to membership changes via [`ClusterRegistry::subscribe`].

pub mod fleet;
pub mod single;
pub mod status;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

pub use fleet::SecretClusterFetcher;
pub use single::SingleClusterFetcher;
pub use status::{ClusterStatus, KubeStatusProber, StatusProber};

/// TLS material for reaching a cluster's API server
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TlsConfig {
    /// PEM-encoded CA bundle used to verify the API server
    pub ca_data: Option<Vec<u8>>,
    /// PEM-encoded client certificate
    pub cert_data: Option<Vec<u8>>,
    /// PEM-encoded client key
    pub key_data: Option<Vec<u8>>,
    /// Skip server certificate verification
    pub insecure: bool,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("ca_data", &self.ca_data.as_ref().map(|d| d.len()))
            .field("cert_data", &self.cert_data.as_ref().map(|d| d.len()))
            .field("key_data", &self.key_data.as_ref().map(|_| "<redacted>"))
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Immutable description of one cluster
#[derive(Clone, PartialEq, Eq)]
pub struct Cluster {
    /// Unique, stable identifier
    pub name: String,
    /// API server URL
    pub server: String,
    /// Bearer token of the server's own service identity on this cluster
    pub bearer_token: Option<String>,
    /// TLS material
    pub tls: TlsConfig,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("server", &self.server)
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("tls", &self.tls)
            .finish()
    }
}

/// Snapshot of the fleet, in fetch order
pub type ClusterSet = Arc<Vec<Arc<Cluster>>>;

/// Source of fleet membership
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterFetcher: Send + Sync {
    /// Fetch the current set of clusters, in a stable order
    async fn fetch(&self) -> Result<Vec<Cluster>>;
}

/// Reject empty or duplicate cluster names
pub fn validate_cluster_names(clusters: &[Cluster]) -> Result<()> {
    let mut seen = HashSet::with_capacity(clusters.len());
    for cluster in clusters {
        if cluster.name.is_empty() {
            return Err(Error::misconfigured(format!(
                "cluster with server {} has an empty name",
                cluster.server
            )));
        }
        if !seen.insert(cluster.name.as_str()) {
            return Err(Error::DuplicateClusterName(cluster.name.clone()));
        }
    }
    Ok(())
}

/// Registry of the clusters this server fronts
///
/// Cheap to share behind an `Arc`; reads never block on a fetch.
pub struct ClusterRegistry {
    fetcher: Arc<dyn ClusterFetcher>,
    default_cluster: String,
    tx: watch::Sender<ClusterSet>,
}

impl ClusterRegistry {
    /// Create an empty registry
    ///
    /// # Arguments
    /// * `fetcher` - Source of fleet membership
    /// * `default_cluster` - Cluster used by single-cluster operations
    pub fn new(fetcher: Arc<dyn ClusterFetcher>, default_cluster: impl Into<String>) -> Self {
        let (tx, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            fetcher,
            default_cluster: default_cluster.into(),
            tx,
        }
    }

    /// Fetch the fleet and atomically replace the current set.
    ///
    /// On error the previous set stays in place.
    pub async fn refresh(&self) -> Result<ClusterSet> {
        let clusters = self.fetcher.fetch().await?;
        validate_cluster_names(&clusters)?;

        let set: ClusterSet = Arc::new(clusters.into_iter().map(Arc::new).collect());
        let previous = self.tx.send_replace(set.clone());

        if previous.len() != set.len() || !same_members(&previous, &set) {
            info!(
                clusters = ?set.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                "Cluster set changed"
            );
        } else {
            debug!(count = set.len(), "Cluster set unchanged");
        }

        Ok(set)
    }

    /// Current snapshot of the fleet
    pub fn clusters(&self) -> ClusterSet {
        self.tx.borrow().clone()
    }

    /// Look up a cluster by name in the current snapshot
    pub fn get(&self, name: &str) -> Option<Arc<Cluster>> {
        self.tx.borrow().iter().find(|c| c.name == name).cloned()
    }

    /// Name of the cluster used by single-cluster operations
    pub fn default_cluster_name(&self) -> &str {
        &self.default_cluster
    }

    /// The default cluster, if it is part of the current set
    pub fn default_cluster(&self) -> Option<Arc<Cluster>> {
        self.get(&self.default_cluster)
    }

    /// Receive every new cluster set
    pub fn subscribe(&self) -> watch::Receiver<ClusterSet> {
        self.tx.subscribe()
    }

    /// Re-fetch the fleet every `interval` until cancelled.
    ///
    /// Fetch failures are logged and the previous set is kept.
    pub async fn run_refresh_loop(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; startup already fetched once.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Cluster refresh loop stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Cluster refresh failed, keeping previous set");
                    }
                }
            }
        }
    }
}

impl fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterRegistry")
            .field("default_cluster", &self.default_cluster)
            .field("clusters", &self.clusters().len())
            .finish()
    }
}

fn same_members(a: &[Arc<Cluster>], b: &[Arc<Cluster>]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

#[cfg(test)]
pub(crate) fn test_cluster(name: &str) -> Cluster {
    Cluster {
        name: name.to_string(),
        server: format!("https://{name}.example.com:6443"),
        bearer_token: Some(format!("{name}-token")),
        tls: TlsConfig::default(),
    }
}
