//! Watch loop for one (cluster, kind) pair

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ResourceCache, Shard};
use crate::clusters::Cluster;
use crate::kinds::ResourceKind;
use crate::pool::{ClientIdentity, WatchEvent};
use crate::retry::Backoff;
use crate::{Error, Result};

/// Keep `shard` in sync with `kind` on `cluster` until cancelled.
///
/// A broken watch is re-established after a jittered backoff; each completed
/// resync resets the backoff and the failure count.
pub(super) async fn run(
    cache: Arc<ResourceCache>,
    shard: Arc<Shard>,
    cluster: Arc<Cluster>,
    kind: ResourceKind,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(cache.retry.clone());
    debug!(cluster = %cluster.name, kind = %kind, "Starting watch");

    loop {
        let result = watch_once(&cache, &shard, &cluster, kind, &cancel, &mut backoff).await;
        if cancel.is_cancelled() {
            break;
        }

        let e = match result {
            Ok(()) => Error::unavailable(&cluster.name, "watch stream ended"),
            Err(e) => e,
        };
        let failures = cache.record_failure_in(&shard, &cluster.name, kind);

        if backoff.exhausted() {
            error!(
                cluster = %cluster.name,
                kind = %kind,
                error = %e,
                "Giving up on watch, reads will go to the cluster"
            );
            break;
        }

        let delay = backoff.next_delay();
        warn!(
            cluster = %cluster.name,
            kind = %kind,
            error = %e,
            failures,
            delay_ms = delay.as_millis() as u64,
            "Watch failed, re-establishing"
        );

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    info!(cluster = %cluster.name, kind = %kind, "Watch stopped");
}

/// Run one watch stream to completion; `Ok` means it ended or was cancelled
async fn watch_once(
    cache: &ResourceCache,
    shard: &Shard,
    cluster: &Arc<Cluster>,
    kind: ResourceKind,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Result<()> {
    let client = cache.pool.client(cluster, &ClientIdentity::Service).await?;
    let mut stream = client.watch(kind);

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = stream.next() => event,
        };

        match event {
            None => return Ok(()),
            Some(Err(e)) => return Err(e),
            Some(Ok(event)) => {
                let resynced = matches!(event, WatchEvent::ResyncDone);
                cache.apply_to(shard, &cluster.name, kind, event);
                if resynced {
                    backoff.reset();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheRead, CacheState};
    use crate::clusters::{test_cluster, ClusterRegistry, MockClusterFetcher};
    use crate::pool::client::MockClusterClient;
    use crate::pool::factory::MockClientFactory;
    use crate::pool::{ClientsPool, ClusterClient};
    use crate::retry::RetryConfig;
    use kube::api::DynamicObject;
    use std::time::Duration;

    fn ns(name: &str, version: &str) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &ResourceKind::Namespace.api_resource());
        obj.metadata.resource_version = Some(version.to_string());
        obj
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn cache_with(factory: MockClientFactory, retry: RetryConfig) -> Arc<ResourceCache> {
        let registry = Arc::new(ClusterRegistry::new(
            Arc::new(MockClusterFetcher::new()),
            "a",
        ));
        let pool = Arc::new(ClientsPool::new(registry, Arc::new(factory)));
        Arc::new(ResourceCache::new(pool, vec![ResourceKind::Namespace], retry, 2))
    }

    async fn wait_for_state(cache: &ResourceCache, want: CacheState) {
        for _ in 0..200 {
            if cache.state("a", ResourceKind::Namespace) == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "state never became {want:?}, is {:?}",
            cache.state("a", ResourceKind::Namespace)
        );
    }

    #[tokio::test]
    async fn test_watch_populates_cache() {
        let mut factory = MockClientFactory::new();
        factory.expect_build().returning(|_, _| {
            let mut client = MockClusterClient::new();
            client.expect_watch().returning(|_| {
                futures::stream::iter(vec![
                    Ok(WatchEvent::ResyncStart),
                    Ok(WatchEvent::Upsert(ns("flux-system", "1"))),
                    Ok(WatchEvent::Upsert(ns("default", "2"))),
                    Ok(WatchEvent::ResyncDone),
                ])
                .chain(futures::stream::pending())
                .boxed()
            });
            Ok(Arc::new(client) as Arc<dyn ClusterClient>)
        });

        let cache = cache_with(factory, fast_retry());
        let cancel = CancellationToken::new();
        cache.sync_clusters(&[Arc::new(test_cluster("a"))], &cancel);

        wait_for_state(&cache, CacheState::Ready).await;
        match cache.list("a", ResourceKind::Namespace, None) {
            CacheRead::Ready(objs) => assert_eq!(objs.len(), 2),
            CacheRead::NotReady => panic!("cache not ready"),
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_failing_watch_degrades_cluster() {
        let mut factory = MockClientFactory::new();
        factory.expect_build().returning(|_, _| {
            let mut client = MockClusterClient::new();
            client.expect_watch().returning(|_| {
                futures::stream::iter(vec![Err(Error::unavailable("a", "connection reset"))]).boxed()
            });
            Ok(Arc::new(client) as Arc<dyn ClusterClient>)
        });

        let cache = cache_with(factory, fast_retry());
        let cancel = CancellationToken::new();
        cache.sync_clusters(&[Arc::new(test_cluster("a"))], &cancel);

        wait_for_state(&cache, CacheState::Unavailable).await;
        assert_eq!(
            cache.list("a", ResourceKind::Namespace, None),
            CacheRead::NotReady
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_watch_gives_up_after_max_attempts() {
        let mut factory = MockClientFactory::new();
        factory
            .expect_build()
            .returning(|c, _| Err(Error::unavailable(&c.name, "offline")));

        let retry = RetryConfig {
            max_attempts: 2,
            ..fast_retry()
        };
        let cache = cache_with(factory, retry);
        cache.register_cluster("a");
        let shard = cache.shard("a").unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            run(
                cache.clone(),
                shard,
                Arc::new(test_cluster("a")),
                ResourceKind::Namespace,
                CancellationToken::new(),
            ),
        )
        .await
        .expect("watch loop should stop after max attempts");

        assert_eq!(
            cache.state("a", ResourceKind::Namespace),
            Some(CacheState::Unavailable)
        );
    }
}
