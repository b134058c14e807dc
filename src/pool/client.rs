//! Per-cluster client capability
//!
//! [`ClusterClient`] is the narrow surface the pool, cache and authorizer need
//! from a cluster: dynamic list/get, a self-rules review and a watch stream.
//! [`KubeClusterClient`] implements it over kube-rs; tests substitute fakes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::authorization::v1::{
    SelfSubjectRulesReview, SelfSubjectRulesReviewSpec, SubjectRulesReviewStatus,
};
use kube::api::{Api, DynamicObject, ListParams, PostParams};
use kube::runtime::watcher;
use kube::Client;
use tracing::trace;

#[cfg(test)]
use mockall::automock;

use crate::kinds::ResourceKind;
use crate::{Error, Result};

/// Filters for a list call
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Restrict to one namespace (ignored for cluster-scoped kinds)
    pub namespace: Option<String>,
    /// Kubernetes label selector
    pub label_selector: Option<String>,
}

impl ListOptions {
    /// List within one namespace
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            label_selector: None,
        }
    }

    /// Add a label selector
    pub fn with_labels(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }
}

/// Identifies one object within a cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for a namespaced object
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key for a cluster-scoped object
    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

/// Change delivered by a watch
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// Object added or modified
    Upsert(DynamicObject),
    /// Object deleted
    Delete(DynamicObject),
    /// A full re-list is starting; following upserts are its contents
    ResyncStart,
    /// The re-list finished; objects not seen since `ResyncStart` are gone
    ResyncDone,
}

/// Operations the fleet performs against one cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List objects of `kind`
    async fn list(&self, kind: ResourceKind, opts: &ListOptions) -> Result<Vec<DynamicObject>>;

    /// Read one object of `kind`
    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Result<DynamicObject>;

    /// Rules the client's identity holds in `namespace`
    async fn rules_review(&self, namespace: &str) -> Result<SubjectRulesReviewStatus>;

    /// Long-lived stream of changes to objects of `kind`.
    ///
    /// The stream ends or yields an error when the watch breaks; callers
    /// re-establish it.
    fn watch(&self, kind: ResourceKind) -> BoxStream<'static, Result<WatchEvent>>;
}

/// [`ClusterClient`] backed by a kube-rs client
#[derive(Clone)]
pub struct KubeClusterClient {
    cluster: String,
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a kube client for `cluster`
    pub fn new(cluster: impl Into<String>, client: Client) -> Self {
        Self {
            cluster: cluster.into(),
            client,
        }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list(&self, kind: ResourceKind, opts: &ListOptions) -> Result<Vec<DynamicObject>> {
        let api = self.api(kind, opts.namespace.as_deref());
        let mut params = ListParams::default();
        if let Some(selector) = &opts.label_selector {
            params = params.labels(selector);
        }

        let list = api
            .list(&params)
            .await
            .map_err(|e| Error::from_kube(&self.cluster, &format!("list {kind}"), e))?;

        trace!(cluster = %self.cluster, kind = %kind, count = list.items.len(), "Listed objects");
        Ok(list.items)
    }

    async fn get(&self, kind: ResourceKind, key: &ObjectKey) -> Result<DynamicObject> {
        let api = self.api(kind, key.namespace.as_deref());
        api.get(&key.name)
            .await
            .map_err(|e| Error::from_kube(&self.cluster, &format!("get {kind} {}", key.name), e))
    }

    async fn rules_review(&self, namespace: &str) -> Result<SubjectRulesReviewStatus> {
        let api: Api<SelfSubjectRulesReview> = Api::all(self.client.clone());
        let review = SelfSubjectRulesReview {
            metadata: Default::default(),
            spec: SelfSubjectRulesReviewSpec {
                namespace: Some(namespace.to_string()),
            },
            status: None,
        };

        let result = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| Error::from_kube(&self.cluster, "rules review", e))?;

        result
            .status
            .ok_or_else(|| Error::internal_with_context("rules review", "no status returned"))
    }

    fn watch(&self, kind: ResourceKind) -> BoxStream<'static, Result<WatchEvent>> {
        let api = self.api(kind, None);
        let cluster = self.cluster.clone();

        watcher::watcher(api, watcher::Config::default())
            .map(move |event| match event {
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    Ok(WatchEvent::Upsert(obj))
                }
                Ok(watcher::Event::Delete(obj)) => Ok(WatchEvent::Delete(obj)),
                Ok(watcher::Event::Init) => Ok(WatchEvent::ResyncStart),
                Ok(watcher::Event::InitDone) => Ok(WatchEvent::ResyncDone),
                Err(e) => Err(Error::unavailable(&cluster, format!("watch {kind}: {e}"))),
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_options_builders() {
        let opts = ListOptions::in_namespace("flux-system").with_labels("a=b");
        assert_eq!(opts.namespace.as_deref(), Some("flux-system"));
        assert_eq!(opts.label_selector.as_deref(), Some("a=b"));
        assert_eq!(ListOptions::default().namespace, None);
    }

    #[test]
    fn test_object_keys() {
        let k = ObjectKey::namespaced("ns", "app");
        assert_eq!(k.namespace.as_deref(), Some("ns"));
        assert_eq!(k.name, "app");

        let k = ObjectKey::cluster_scoped("flux-system");
        assert!(k.namespace.is_none());
    }
}
