//! Watch-fed resource cache
//!
//! One shard per cluster, each holding the last observed body of every object
//! of the cached kinds. Shards are written only by that cluster's watch tasks
//! and read concurrently by query handlers; reads never touch the network.
//!
//! # Versioning
//!
//! Each entry carries the object's resource version. A write with a lower
//! version than the stored one is discarded, so applying events out of order
//! can never regress an entry. Deletes leave a tombstone with the delete's
//! version until the next full resync, which keeps a late stale upsert from
//! resurrecting the object.
//!
//! # Readiness
//!
//! A (cluster, kind) pair is `Syncing` until its first full list completes,
//! then `Ready`. After repeated watch failures it becomes `Unavailable` and
//! reads return [`CacheRead::NotReady`] so callers fall back to a live call.

mod watch;

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use kube::api::DynamicObject;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clusters::{Cluster, ClusterSet};
use crate::kinds::{resource_version, ResourceKind};
use crate::pool::{ClientsPool, ObjectKey, WatchEvent};
use crate::retry::RetryConfig;

/// Readiness of one (cluster, kind) pair
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheState {
    /// Initial list still in progress
    Syncing,
    /// Serving reads
    Ready,
    /// Watch keeps failing; reads must fall back to live calls
    Unavailable,
}

/// Result of a cache read
#[derive(Clone, Debug, PartialEq)]
pub enum CacheRead<T> {
    /// The cache is authoritative for this read
    Ready(T),
    /// The cache cannot answer; ask the cluster
    NotReady,
}

impl<T> CacheRead<T> {
    /// Value if the cache answered
    pub fn ready(self) -> Option<T> {
        match self {
            CacheRead::Ready(v) => Some(v),
            CacheRead::NotReady => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct CacheKey {
    kind: ResourceKind,
    namespace: Option<String>,
    name: String,
}

impl CacheKey {
    fn of(kind: ResourceKind, obj: &DynamicObject) -> Option<Self> {
        Some(Self {
            kind,
            namespace: obj.metadata.namespace.clone(),
            name: obj.metadata.name.clone()?,
        })
    }
}

#[derive(Debug)]
struct CacheEntry {
    version: Option<u64>,
    /// `None` marks a tombstone
    object: Option<Arc<DynamicObject>>,
    generation: u64,
}

#[derive(Debug)]
struct KindState {
    state: CacheState,
    generation: u64,
    failures: u32,
}

impl Default for KindState {
    fn default() -> Self {
        Self {
            state: CacheState::Syncing,
            generation: 0,
            failures: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Shard {
    objects: DashMap<CacheKey, CacheEntry>,
    kinds: DashMap<ResourceKind, KindState>,
}

struct WatchSet {
    cluster: Arc<Cluster>,
    cancel: CancellationToken,
}

/// Whether a write at `incoming` may replace an entry at `current`.
///
/// Versions that are not numeric cannot be ordered and are accepted.
fn is_not_older(incoming: Option<u64>, current: Option<u64>) -> bool {
    match (incoming, current) {
        (Some(i), Some(c)) => i >= c,
        _ => true,
    }
}

/// Process-lifetime cache of watched resources across the fleet
pub struct ResourceCache {
    pool: Arc<ClientsPool>,
    kinds: Vec<ResourceKind>,
    retry: RetryConfig,
    degrade_after: u32,
    shards: DashMap<String, Arc<Shard>>,
    watches: DashMap<String, WatchSet>,
}

impl ResourceCache {
    /// Create an empty cache for `kinds`.
    ///
    /// Watches use the pool's service clients. A (cluster, kind) pair is
    /// marked unavailable after `degrade_after` consecutive watch failures.
    pub fn new(
        pool: Arc<ClientsPool>,
        kinds: Vec<ResourceKind>,
        retry: RetryConfig,
        degrade_after: u32,
    ) -> Self {
        Self {
            pool,
            kinds,
            retry,
            degrade_after: degrade_after.max(1),
            shards: DashMap::new(),
            watches: DashMap::new(),
        }
    }

    /// Kinds this cache watches
    pub fn kinds(&self) -> &[ResourceKind] {
        &self.kinds
    }

    /// Whether `kind` is cached at all
    pub fn caches(&self, kind: ResourceKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Start watching the current fleet and follow membership changes until cancelled
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        let mut clusters = self.pool.registry().subscribe();

        tokio::spawn(async move {
            let initial = clusters.borrow_and_update().clone();
            cache.sync_clusters(&initial, &cancel);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = clusters.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let set: ClusterSet = clusters.borrow_and_update().clone();
                        cache.sync_clusters(&set, &cancel);
                    }
                }
            }

            cache.stop_all();
            debug!("Resource cache stopped");
        })
    }

    /// Start watches for new or changed clusters, stop them for removed ones
    pub fn sync_clusters(self: &Arc<Self>, clusters: &[Arc<Cluster>], parent: &CancellationToken) {
        let wanted: HashSet<&str> = clusters.iter().map(|c| c.name.as_str()).collect();

        let removed: Vec<String> = self
            .watches
            .iter()
            .filter(|w| !wanted.contains(w.key().as_str()))
            .map(|w| w.key().clone())
            .collect();
        for name in removed {
            self.stop_cluster(&name);
            info!(cluster = %name, "Stopped watching removed cluster");
        }

        for cluster in clusters {
            let unchanged = self
                .watches
                .get(&cluster.name)
                .map(|w| *w.cluster == **cluster)
                .unwrap_or(false);
            if unchanged {
                continue;
            }
            // Credentials changed: restart from an empty shard
            self.stop_cluster(&cluster.name);

            let cancel = parent.child_token();
            let shard = self.new_shard();
            self.shards.insert(cluster.name.clone(), shard.clone());

            for kind in &self.kinds {
                tokio::spawn(watch::run(
                    self.clone(),
                    shard.clone(),
                    cluster.clone(),
                    *kind,
                    cancel.clone(),
                ));
            }

            info!(cluster = %cluster.name, kinds = ?self.kinds, "Watching cluster");
            self.watches.insert(
                cluster.name.clone(),
                WatchSet {
                    cluster: cluster.clone(),
                    cancel,
                },
            );
        }
    }

    fn stop_cluster(&self, name: &str) {
        if let Some((_, watch)) = self.watches.remove(name) {
            watch.cancel.cancel();
        }
        self.shards.remove(name);
    }

    fn stop_all(&self) {
        let names: Vec<String> = self.watches.iter().map(|w| w.key().clone()).collect();
        for name in names {
            self.stop_cluster(&name);
        }
    }

    /// Register `cluster` without starting watches.
    ///
    /// Used when events are fed by something other than the built-in watch
    /// loop, e.g. in tests.
    pub fn register_cluster(&self, cluster: &str) {
        self.shards
            .entry(cluster.to_string())
            .or_insert_with(|| self.new_shard());
    }

    fn new_shard(&self) -> Arc<Shard> {
        let shard = Shard::default();
        for kind in &self.kinds {
            shard.kinds.insert(*kind, KindState::default());
        }
        Arc::new(shard)
    }

    fn shard(&self, cluster: &str) -> Option<Arc<Shard>> {
        self.shards.get(cluster).map(|s| s.clone())
    }

    /// Apply one watch event. Returns whether the cache changed.
    pub fn apply(&self, cluster: &str, kind: ResourceKind, event: WatchEvent) -> bool {
        match self.shard(cluster) {
            Some(shard) => self.apply_to(&shard, cluster, kind, event),
            None => false,
        }
    }

    fn apply_to(&self, shard: &Shard, cluster: &str, kind: ResourceKind, event: WatchEvent) -> bool {
        let generation = match shard.kinds.get(&kind) {
            Some(state) => state.generation,
            None => return false,
        };

        match event {
            WatchEvent::Upsert(obj) => {
                let Some(key) = CacheKey::of(kind, &obj) else {
                    return false;
                };
                let version = resource_version(&obj);
                let mut entry = shard.objects.entry(key).or_insert_with(|| CacheEntry {
                    version: None,
                    object: None,
                    generation,
                });
                entry.generation = generation;
                if !is_not_older(version, entry.version) {
                    debug!(cluster, kind = %kind, "Discarded stale upsert");
                    return false;
                }
                entry.version = version;
                entry.object = Some(Arc::new(obj));
                true
            }
            WatchEvent::Delete(obj) => {
                let Some(key) = CacheKey::of(kind, &obj) else {
                    return false;
                };
                let version = resource_version(&obj);
                let mut entry = shard.objects.entry(key).or_insert_with(|| CacheEntry {
                    version: None,
                    object: None,
                    generation,
                });
                if !is_not_older(version, entry.version) {
                    debug!(cluster, kind = %kind, "Discarded stale delete");
                    return false;
                }
                entry.version = version;
                entry.object = None;
                entry.generation = generation;
                true
            }
            WatchEvent::ResyncStart => {
                if let Some(mut state) = shard.kinds.get_mut(&kind) {
                    state.generation += 1;
                }
                false
            }
            WatchEvent::ResyncDone => {
                // Drop objects the relist did not mention, and all tombstones
                shard.objects.retain(|key, entry| {
                    key.kind != kind || (entry.generation == generation && entry.object.is_some())
                });
                if let Some(mut state) = shard.kinds.get_mut(&kind) {
                    if state.state != CacheState::Ready {
                        info!(cluster, kind = %kind, "Cache ready");
                    }
                    state.state = CacheState::Ready;
                    state.failures = 0;
                }
                true
            }
        }
    }

    /// Record a watch failure; returns the consecutive failure count
    pub fn record_failure(&self, cluster: &str, kind: ResourceKind) -> u32 {
        match self.shard(cluster) {
            Some(shard) => self.record_failure_in(&shard, cluster, kind),
            None => 0,
        }
    }

    fn record_failure_in(&self, shard: &Shard, cluster: &str, kind: ResourceKind) -> u32 {
        let Some(mut state) = shard.kinds.get_mut(&kind) else {
            return 0;
        };
        state.failures += 1;
        if state.failures >= self.degrade_after && state.state != CacheState::Unavailable {
            warn!(
                cluster,
                kind = %kind,
                failures = state.failures,
                "Watch keeps failing, cache unavailable for this cluster"
            );
            state.state = CacheState::Unavailable;
        }
        state.failures
    }

    /// Readiness of (cluster, kind); `None` if not cached
    pub fn state(&self, cluster: &str, kind: ResourceKind) -> Option<CacheState> {
        self.shard(cluster)?.kinds.get(&kind).map(|s| s.state)
    }

    fn ready_shard(&self, cluster: &str, kind: ResourceKind) -> Option<Arc<Shard>> {
        let shard = self.shard(cluster)?;
        let ready = shard
            .kinds
            .get(&kind)
            .map(|s| s.state == CacheState::Ready)
            .unwrap_or(false);
        ready.then_some(shard)
    }

    /// All cached objects of `kind` on `cluster`, optionally in one namespace.
    ///
    /// Ordered by namespace, then name.
    pub fn list(
        &self,
        cluster: &str,
        kind: ResourceKind,
        namespace: Option<&str>,
    ) -> CacheRead<Vec<Arc<DynamicObject>>> {
        let Some(shard) = self.ready_shard(cluster, kind) else {
            return CacheRead::NotReady;
        };

        let mut found: Vec<(CacheKey, Arc<DynamicObject>)> = shard
            .objects
            .iter()
            .filter(|e| e.key().kind == kind)
            .filter(|e| namespace.is_none() || e.key().namespace.as_deref() == namespace)
            .filter_map(|e| e.value().object.clone().map(|o| (e.key().clone(), o)))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));

        CacheRead::Ready(found.into_iter().map(|(_, o)| o).collect())
    }

    /// One cached object
    pub fn get(
        &self,
        cluster: &str,
        kind: ResourceKind,
        key: &ObjectKey,
    ) -> CacheRead<Option<Arc<DynamicObject>>> {
        let Some(shard) = self.ready_shard(cluster, kind) else {
            return CacheRead::NotReady;
        };
        let cache_key = CacheKey {
            kind,
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        };
        CacheRead::Ready(shard.objects.get(&cache_key).and_then(|e| e.object.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clusters::{test_cluster, ClusterRegistry, MockClusterFetcher};
    use crate::pool::factory::MockClientFactory;

    fn cache() -> ResourceCache {
        let registry = Arc::new(ClusterRegistry::new(
            Arc::new(MockClusterFetcher::new()),
            "a",
        ));
        let pool = Arc::new(ClientsPool::new(registry, Arc::new(MockClientFactory::new())));
        let cache = ResourceCache::new(
            pool,
            vec![ResourceKind::Namespace],
            RetryConfig::default(),
            3,
        );
        cache.register_cluster("a");
        cache
    }

    fn ns(name: &str, version: &str, label: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ResourceKind::Namespace.api_resource());
        obj.metadata.resource_version = Some(version.to_string());
        obj.metadata.labels = Some([("v".to_string(), label.to_string())].into());
        obj
    }

    fn label(obj: &DynamicObject) -> String {
        obj.metadata.labels.as_ref().unwrap()["v"].clone()
    }

    fn ready(cache: &ResourceCache) {
        cache.apply("a", ResourceKind::Namespace, WatchEvent::ResyncStart);
        cache.apply("a", ResourceKind::Namespace, WatchEvent::ResyncDone);
    }

    fn get(cache: &ResourceCache, name: &str) -> Option<Arc<DynamicObject>> {
        cache
            .get("a", ResourceKind::Namespace, &ObjectKey::cluster_scoped(name))
            .ready()
            .unwrap()
    }

    #[test]
    fn test_not_ready_until_first_resync() {
        let cache = cache();
        assert_eq!(cache.state("a", ResourceKind::Namespace), Some(CacheState::Syncing));
        assert_eq!(
            cache.list("a", ResourceKind::Namespace, None),
            CacheRead::NotReady
        );
        ready(&cache);
        assert_eq!(cache.state("a", ResourceKind::Namespace), Some(CacheState::Ready));
        assert_eq!(
            cache.list("a", ResourceKind::Namespace, None),
            CacheRead::Ready(vec![])
        );
        assert_eq!(
            cache.list("unknown", ResourceKind::Namespace, None),
            CacheRead::NotReady
        );
    }

    #[test]
    fn test_out_of_order_events_never_regress() {
        let cache = cache();
        ready(&cache);

        assert!(cache.apply("a", ResourceKind::Namespace, WatchEvent::Upsert(ns("ns1", "10", "new"))));
        assert!(!cache.apply("a", ResourceKind::Namespace, WatchEvent::Upsert(ns("ns1", "5", "old"))));
        assert_eq!(label(&get(&cache, "ns1").unwrap()), "new");

        // Equal version is not a regression
        assert!(cache.apply("a", ResourceKind::Namespace, WatchEvent::Upsert(ns("ns1", "10", "same"))));
        assert_eq!(label(&get(&cache, "ns1").unwrap()), "same");
    }

    #[test]
    fn test_delete_tombstone_blocks_stale_resurrection() {
        let cache = cache();
        ready(&cache);

        cache.apply("a", ResourceKind::Namespace, WatchEvent::Upsert(ns("ns1", "10", "x")));
        assert!(cache.apply("a", ResourceKind::Namespace, WatchEvent::Delete(ns("ns1", "12", "x"))));
        assert!(get(&cache, "ns1").is_none());

        assert!(!cache.apply("a", ResourceKind::Namespace, WatchEvent::Upsert(ns("ns1", "11", "late"))));
        assert!(get(&cache, "ns1").is_none());

        // A genuinely newer object comes back
        assert!(cache.apply("a", ResourceKind::Namespace, WatchEvent::Upsert(ns("ns1", "20", "recreated"))));
        assert_eq!(label(&get(&cache, "ns1").unwrap()), "recreated");
    }

    #[test]
    fn test_resync_drops_unseen_objects() {
        let cache = cache();
        ready(&cache);
        cache.apply("a", ResourceKind::Namespace, WatchEvent::Upsert(ns("keep", "1", "x")));
        cache.apply("a", ResourceKind::Namespace, WatchEvent::Upsert(ns("gone", "2", "x")));

        cache.apply("a", ResourceKind::Namespace, WatchEvent::ResyncStart);
        cache.apply("a", ResourceKind::Namespace, WatchEvent::Upsert(ns("keep", "1", "x")));
        cache.apply("a", ResourceKind::Namespace, WatchEvent::ResyncDone);

        let names: Vec<_> = cache
            .list("a", ResourceKind::Namespace, None)
            .ready()
            .unwrap()
            .iter()
            .map(|o| o.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["keep"]);
    }

    #[test]
    fn test_list_is_sorted_and_namespace_filtered() {
        let registry = Arc::new(ClusterRegistry::new(
            Arc::new(MockClusterFetcher::new()),
            "a",
        ));
        let pool = Arc::new(ClientsPool::new(registry, Arc::new(MockClientFactory::new())));
        let cache = ResourceCache::new(
            pool,
            vec![ResourceKind::Kustomization],
            RetryConfig::default(),
            3,
        );
        cache.register_cluster("a");
        cache.apply("a", ResourceKind::Kustomization, WatchEvent::ResyncStart);
        cache.apply("a", ResourceKind::Kustomization, WatchEvent::ResyncDone);

        let ar = ResourceKind::Kustomization.api_resource();
        for (ns, name) in [("team-b", "z"), ("team-a", "y"), ("team-a", "x")] {
            let obj = DynamicObject::new(name, &ar).within(ns);
            cache.apply("a", ResourceKind::Kustomization, WatchEvent::Upsert(obj));
        }

        let all: Vec<_> = cache
            .list("a", ResourceKind::Kustomization, None)
            .ready()
            .unwrap()
            .iter()
            .map(|o| o.metadata.name.clone().unwrap())
            .collect();
        assert_eq!(all, vec!["x", "y", "z"]);

        let team_a = cache
            .list("a", ResourceKind::Kustomization, Some("team-a"))
            .ready()
            .unwrap();
        assert_eq!(team_a.len(), 2);
    }

    #[test]
    fn test_repeated_failures_degrade_then_resync_recovers() {
        let cache = cache();
        ready(&cache);

        assert_eq!(cache.record_failure("a", ResourceKind::Namespace), 1);
        assert_eq!(cache.record_failure("a", ResourceKind::Namespace), 2);
        assert_eq!(cache.state("a", ResourceKind::Namespace), Some(CacheState::Ready));
        cache.record_failure("a", ResourceKind::Namespace);
        assert_eq!(
            cache.state("a", ResourceKind::Namespace),
            Some(CacheState::Unavailable)
        );
        assert_eq!(
            cache.list("a", ResourceKind::Namespace, None),
            CacheRead::NotReady
        );

        ready(&cache);
        assert_eq!(cache.state("a", ResourceKind::Namespace), Some(CacheState::Ready));
    }

    #[test]
    fn test_unversioned_writes_are_accepted() {
        assert!(is_not_older(None, Some(10)));
        assert!(is_not_older(Some(3), None));
        assert!(is_not_older(Some(3), Some(3)));
        assert!(!is_not_older(Some(2), Some(3)));
    }

    #[tokio::test]
    async fn test_sync_clusters_follows_membership() {
        {
            let registry = Arc::new(ClusterRegistry::new(
                Arc::new(MockClusterFetcher::new()),
                "a",
            ));
            let mut factory = MockClientFactory::new();
            factory
                .expect_build()
                .returning(|c, _| Err(crate::Error::unavailable(&c.name, "offline")));
            let pool = Arc::new(ClientsPool::new(registry, Arc::new(factory)));
            let cache = Arc::new(ResourceCache::new(
                pool,
                vec![ResourceKind::Namespace],
                RetryConfig::default(),
                3,
            ));
            let cancel = CancellationToken::new();

            let a = Arc::new(test_cluster("a"));
            let b = Arc::new(test_cluster("b"));
            cache.sync_clusters(&[a.clone(), b.clone()], &cancel);
            assert!(cache.state("a", ResourceKind::Namespace).is_some());
            assert!(cache.state("b", ResourceKind::Namespace).is_some());

            cache.sync_clusters(&[a], &cancel);
            assert!(cache.state("a", ResourceKind::Namespace).is_some());
            assert!(cache.state("b", ResourceKind::Namespace).is_none());

            cancel.cancel();
        }
    }
}
