//! Fan-out result accumulator and request context

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Deadline and cancellation shared by every sub-call of one request
#[derive(Clone, Debug)]
pub struct RequestContext {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestContext {
    /// Context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Context with no deadline
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelled when the request is abandoned
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancel every in-flight sub-call
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Absolute deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Run a per-cluster call under this context.
    ///
    /// Cancellation and deadline expiry drop `fut` (aborting its I/O) and
    /// produce an `Unavailable` error for `cluster`.
    pub async fn run<T, F>(&self, cluster: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, fut)
                    .await
                    .map_err(|_| Error::unavailable(cluster, "deadline exceeded"))?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::unavailable(cluster, "request cancelled")),
            result = bounded => result,
        }
    }
}

/// Per-cluster results of one fan-out list
///
/// Holds exactly one entry per cluster that was in the fleet when the call
/// started. Entries are ordered by cluster name.
#[derive(Debug)]
pub struct ClusteredList<K> {
    results: BTreeMap<String, Result<Vec<K>>>,
}

impl<K> Default for ClusteredList<K> {
    fn default() -> Self {
        Self {
            results: BTreeMap::new(),
        }
    }
}

impl<K> ClusteredList<K> {
    /// Build from per-cluster results
    pub fn from_results(results: impl IntoIterator<Item = (String, Result<Vec<K>>)>) -> Self {
        Self {
            results: results.into_iter().collect(),
        }
    }

    /// Results keyed by cluster name
    pub fn results(&self) -> &BTreeMap<String, Result<Vec<K>>> {
        &self.results
    }

    /// Number of clusters with an entry
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Whether no cluster was queried
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Whether there is at least one entry and every entry failed
    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.results.values().all(|r| r.is_err())
    }

    /// Successfully listed objects tagged with their cluster
    pub fn items(&self) -> impl Iterator<Item = (&str, &K)> {
        self.results.iter().flat_map(|(cluster, result)| {
            result
                .iter()
                .flatten()
                .map(move |item| (cluster.as_str(), item))
        })
    }

    /// Failed clusters and their errors
    pub fn errors(&self) -> impl Iterator<Item = (&str, &Error)> {
        self.results
            .iter()
            .filter_map(|(cluster, result)| result.as_ref().err().map(|e| (cluster.as_str(), e)))
    }

    /// Split into tagged items and per-cluster errors
    pub fn into_parts(self) -> (Vec<(String, K)>, Vec<(String, Error)>) {
        let mut items = Vec::new();
        let mut errors = Vec::new();
        for (cluster, result) in self.results {
            match result {
                Ok(list) => items.extend(list.into_iter().map(|k| (cluster.clone(), k))),
                Err(e) => errors.push((cluster, e)),
            }
        }
        (items, errors)
    }

    /// Error to return when every cluster failed.
    ///
    /// If all clusters failed the same way (for example all denied the caller)
    /// that error is returned as-is; mixed failures become `Internal`.
    pub fn overall_error(&self) -> Option<Error> {
        if !self.all_failed() {
            return None;
        }
        let errors: Vec<(&str, &Error)> = self.errors().collect();
        let (_, first) = errors[0];
        if errors
            .iter()
            .all(|(_, e)| std::mem::discriminant(*e) == std::mem::discriminant(first))
        {
            return Some(first.clone());
        }
        let summary = errors
            .iter()
            .map(|(cluster, e)| format!("{cluster}: {e}"))
            .collect::<Vec<_>>()
            .join("; ");
        Some(Error::internal_with_context(
            "clustered list",
            format!("all {} clusters failed: {summary}", errors.len()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_items_and_errors_are_tagged() {
        let list = ClusteredList::from_results([
            ("b".to_string(), Ok(vec![3])),
            ("a".to_string(), Ok(vec![1, 2])),
            ("c".to_string(), Err(Error::unavailable("c", "down"))),
        ]);

        assert_eq!(list.len(), 3);
        assert!(!list.all_failed());
        assert!(list.overall_error().is_none());

        let items: Vec<_> = list.items().map(|(c, v)| (c.to_string(), *v)).collect();
        assert_eq!(
            items,
            vec![("a".into(), 1), ("a".into(), 2), ("b".into(), 3)]
        );

        let errors: Vec<_> = list.errors().map(|(c, _)| c).collect();
        assert_eq!(errors, vec!["c"]);
    }

    #[test]
    fn test_overall_error_same_kind_is_preserved() {
        let list: ClusteredList<u32> = ClusteredList::from_results([
            ("a".to_string(), Err(Error::permission_denied("no"))),
            ("b".to_string(), Err(Error::permission_denied("no"))),
        ]);
        assert!(matches!(list.overall_error(), Some(Error::PermissionDenied(_))));
    }

    #[test]
    fn test_overall_error_mixed_is_internal() {
        let list: ClusteredList<u32> = ClusteredList::from_results([
            ("a".to_string(), Err(Error::permission_denied("no"))),
            ("b".to_string(), Err(Error::unavailable("b", "down"))),
        ]);
        match list.overall_error() {
            Some(Error::Internal { message, .. }) => {
                assert!(message.contains("all 2 clusters failed"));
                assert!(message.contains("b: cluster b unavailable"));
            }
            other => panic!("expected Internal, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_list_is_not_a_failure() {
        let list: ClusteredList<u32> = ClusteredList::default();
        assert!(list.is_empty());
        assert!(!list.all_failed());
        assert!(list.overall_error().is_none());
    }

    #[tokio::test]
    async fn test_run_respects_deadline() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(20));
        let result: Result<()> = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Unavailable { ref cluster, .. }) if cluster == "slow"));
    }

    #[tokio::test]
    async fn test_run_observes_cancellation() {
        let ctx = RequestContext::background();
        ctx.cancel();
        let result: Result<u32> = ctx.run("a", async { Ok(1) }).await;
        match result {
            Err(Error::Unavailable { message, .. }) => assert_eq!(message, "request cancelled"),
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_passes_through_results() {
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));
        assert_eq!(ctx.run("a", async { Ok(7) }).await.unwrap(), 7);
        assert!(matches!(
            ctx.run::<(), _>("a", async { Err(Error::not_found("x")) }).await,
            Err(Error::NotFound(_))
        ));
    }
}
