//! Cluster client pool
//!
//! Holds one client per (cluster, identity) pair, built lazily on first use.
//! Concurrent first requests for the same pair share a single in-flight build,
//! so exactly one client exists per pair no matter how the requests race.
//!
//! On top of the pool sit the two read primitives the query handlers use:
//! [`ClientsPool::get`] for a single object on one cluster and
//! [`ClientsPool::clustered_list`] for a fan-out list across the fleet.

pub mod client;
pub mod clustered;
pub mod factory;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{watch, OnceCell};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clusters::{Cluster, ClusterRegistry, ClusterSet};
use crate::kinds::{decode, FleetResource};
use crate::{Error, Result};

pub use client::{ClusterClient, KubeClusterClient, ListOptions, ObjectKey, WatchEvent};
pub use clustered::{ClusteredList, RequestContext};
pub use factory::{ClientFactory, ClientIdentity, ImpersonatingClientFactory};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PoolKey {
    cluster: String,
    identity: ClientIdentity,
}

struct PoolEntry {
    cluster: Arc<Cluster>,
    service: bool,
    client: Arc<OnceCell<Arc<dyn ClusterClient>>>,
    last_used: Instant,
}

impl PoolEntry {
    fn new(cluster: Arc<Cluster>, service: bool) -> Self {
        Self {
            cluster,
            service,
            client: Arc::new(OnceCell::new()),
            last_used: Instant::now(),
        }
    }
}

/// Pool of per-(cluster, identity) clients over the registry's fleet
pub struct ClientsPool {
    registry: Arc<ClusterRegistry>,
    factory: Arc<dyn ClientFactory>,
    entries: DashMap<PoolKey, PoolEntry>,
}

impl ClientsPool {
    /// Create an empty pool
    pub fn new(registry: Arc<ClusterRegistry>, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            registry,
            factory,
            entries: DashMap::new(),
        }
    }

    /// The registry this pool serves
    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    /// Number of pooled clients (built or being built)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the pool holds no clients
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Client for `cluster` acting as `identity`, building it on first use
    pub async fn client(
        &self,
        cluster: &Arc<Cluster>,
        identity: &ClientIdentity,
    ) -> Result<Arc<dyn ClusterClient>> {
        let key = PoolKey {
            cluster: cluster.name.clone(),
            identity: identity.pool_key(),
        };

        // The shard guard must be released before awaiting the build.
        let cell = {
            let mut entry = self
                .entries
                .entry(key)
                .or_insert_with(|| PoolEntry::new(cluster.clone(), identity.is_service()));
            if *entry.cluster != **cluster {
                debug!(cluster = %cluster.name, "Cluster descriptor changed, rebuilding client");
                *entry = PoolEntry::new(cluster.clone(), identity.is_service());
            }
            entry.last_used = Instant::now();
            entry.client.clone()
        };

        let client = cell
            .get_or_try_init(|| async {
                debug!(cluster = %cluster.name, identity = %identity, "Building cluster client");
                self.factory.build(cluster, identity).await
            })
            .await?;
        Ok(client.clone())
    }

    /// Client for the cluster named `name` acting as `identity`
    pub async fn client_for(
        &self,
        name: &str,
        identity: &ClientIdentity,
    ) -> Result<Arc<dyn ClusterClient>> {
        let cluster = self
            .registry
            .get(name)
            .ok_or_else(|| Error::not_found(format!("cluster {name}")))?;
        self.client(&cluster, identity).await
    }

    /// Read one object from one cluster
    pub async fn get<K: FleetResource>(
        &self,
        ctx: &RequestContext,
        identity: &ClientIdentity,
        cluster: &str,
        key: &ObjectKey,
    ) -> Result<K> {
        let obj = ctx
            .run(cluster, async {
                let client = self.client_for(cluster, identity).await?;
                client.get(K::KIND, key).await
            })
            .await?;
        decode::<K>(obj)
    }

    /// List `K` on every cluster of the current fleet concurrently.
    ///
    /// Each cluster gets exactly one entry. A failed, slow or cancelled cluster
    /// only affects its own entry. The call fails only when every cluster did.
    pub async fn clustered_list<K: FleetResource>(
        &self,
        ctx: &RequestContext,
        identity: &ClientIdentity,
        opts: &ListOptions,
    ) -> Result<ClusteredList<K>> {
        let clusters = self.registry.clusters();

        let calls = clusters.iter().map(|cluster| async move {
            let result = ctx
                .run(&cluster.name, async {
                    let client = self.client(cluster, identity).await?;
                    let objects = client.list(K::KIND, opts).await?;
                    objects.into_iter().map(decode::<K>).collect::<Result<Vec<K>>>()
                })
                .await;

            if let Err(e) = &result {
                warn!(cluster = %cluster.name, kind = %K::KIND, error = %e, "Cluster list failed");
            }
            (cluster.name.clone(), result)
        });

        let list = ClusteredList::from_results(join_all(calls).await);

        match list.overall_error() {
            Some(e) => Err(e),
            None => Ok(list),
        }
    }

    /// Drop clients whose cluster left the fleet or changed credentials
    pub fn retain_clusters(&self, clusters: &[Arc<Cluster>]) {
        let before = self.entries.len();
        self.entries.retain(|key, entry| {
            clusters
                .iter()
                .any(|c| c.name == key.cluster && **c == *entry.cluster)
        });
        let dropped = before.saturating_sub(self.entries.len());
        if dropped > 0 {
            info!(dropped, "Dropped clients for removed or changed clusters");
        }
    }

    /// Drop caller clients unused for `ttl`. Service clients are kept.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.service || now.duration_since(entry.last_used) < ttl);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, "Evicted idle clients");
        }
        evicted
    }

    /// Follow fleet changes and evict idle clients until cancelled
    pub async fn run_maintenance(
        self: Arc<Self>,
        mut clusters: watch::Receiver<ClusterSet>,
        idle_ttl: Duration,
        cancel: CancellationToken,
    ) {
        let sweep = (idle_ttl / 2).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(sweep);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = clusters.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let set = clusters.borrow_and_update().clone();
                    self.retain_clusters(&set);
                }
                _ = ticker.tick() => {
                    self.evict_idle(idle_ttl);
                }
            }
        }
    }
}
