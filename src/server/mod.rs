//! Query handlers
//!
//! [`CoreServer`] is a thin composition of the pool, cache and authorizer.
//! Handlers hold no state of their own beyond request parameters; all
//! concurrency and caching lives in the layers below.
//!
//! - Namespace candidates come from the cache (filled with the server's own
//!   credentials) and are filtered per caller by the authorizer.
//! - Automation and source objects are read live through the caller's
//!   impersonated clients, so cluster RBAC decides what the caller sees.

pub mod api;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use tracing::{debug, instrument};

use crate::authz::NamespaceAuthorizer;
use crate::cache::{CacheRead, ResourceCache};
use crate::identity::UserIdentity;
use crate::kinds::{decode, ResourceKind};
use crate::pool::{ClientIdentity, ClientsPool, ListOptions, ObjectKey, RequestContext};
use crate::{Error, Result, FLUX_NAMESPACE_INSTANCE, FLUX_NAMESPACE_PART_OF, LABEL_INSTANCE, LABEL_PART_OF};

use types::{FluxNamespaceResponse, ListError, ListNamespacesResponse, ListResponse, ToWire};

/// The query handlers behind the HTTP API
pub struct CoreServer {
    pool: Arc<ClientsPool>,
    cache: Arc<ResourceCache>,
    authz: NamespaceAuthorizer,
    request_timeout: Duration,
}

impl CoreServer {
    /// Compose a server from its collaborators
    pub fn new(
        pool: Arc<ClientsPool>,
        cache: Arc<ResourceCache>,
        authz: NamespaceAuthorizer,
        request_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            cache,
            authz,
            request_timeout,
        }
    }

    /// Fresh context for one inbound request
    pub fn request_context(&self) -> RequestContext {
        RequestContext::with_timeout(self.request_timeout)
    }

    /// The client pool
    pub fn pool(&self) -> &Arc<ClientsPool> {
        &self.pool
    }

    /// Namespaces on `cluster` (default cluster if `None`) the caller may use
    #[instrument(skip_all, fields(user = %user.username))]
    pub async fn list_namespaces(
        &self,
        ctx: &RequestContext,
        user: &UserIdentity,
        cluster: Option<&str>,
    ) -> Result<ListNamespacesResponse> {
        let registry = self.pool.registry();
        let cluster_name = cluster.unwrap_or_else(|| registry.default_cluster_name());
        let cluster = registry
            .get(cluster_name)
            .ok_or_else(|| Error::not_found(format!("cluster {cluster_name}")))?;

        let candidates = self.namespace_candidates(ctx, cluster_name).await?;
        let total = candidates.len();

        let client = ctx
            .run(cluster_name, self.pool.client(&cluster, &ClientIdentity::User(user.clone())))
            .await?;
        let allowed = self
            .authz
            .filter(ctx, cluster_name, client, candidates, |ns: &Namespace| {
                ns.metadata.name.as_deref().unwrap_or_default()
            })
            .await?;

        debug!(cluster = %cluster_name, total, allowed = allowed.len(), "Filtered namespaces");

        let namespaces = allowed
            .iter()
            .map(|ns| ns.to_wire(cluster_name))
            .collect::<Result<Vec<_>>>()?;
        Ok(ListNamespacesResponse { namespaces })
    }

    /// All namespaces on `cluster`, from the cache when it is ready
    async fn namespace_candidates(&self, ctx: &RequestContext, cluster: &str) -> Result<Vec<Namespace>> {
        if let CacheRead::Ready(objects) = self.cache.list(cluster, ResourceKind::Namespace, None) {
            return objects
                .iter()
                .map(|obj| decode::<Namespace>(obj.as_ref().clone()))
                .collect();
        }

        debug!(cluster, "Namespace cache not ready, listing live");
        let objects = ctx
            .run(cluster, async {
                let client = self.pool.client_for(cluster, &ClientIdentity::Service).await?;
                client
                    .list(ResourceKind::Namespace, &ListOptions::default())
                    .await
            })
            .await?;
        objects.into_iter().map(decode::<Namespace>).collect()
    }

    /// Name of the namespace the GitOps runtime is installed in
    #[instrument(skip_all, fields(user = %user.username))]
    pub async fn get_flux_namespace(
        &self,
        ctx: &RequestContext,
        user: &UserIdentity,
    ) -> Result<FluxNamespaceResponse> {
        let cluster = self.pool.registry().default_cluster_name().to_string();
        let opts = ListOptions::default().with_labels(format!(
            "{LABEL_PART_OF}={FLUX_NAMESPACE_PART_OF},{LABEL_INSTANCE}={FLUX_NAMESPACE_INSTANCE}"
        ));

        let objects = ctx
            .run(&cluster, async {
                let client = self
                    .pool
                    .client_for(&cluster, &ClientIdentity::User(user.clone()))
                    .await?;
                client.list(ResourceKind::Namespace, &opts).await
            })
            .await?;

        let first = objects
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("namespace not found"))?;
        let ns = decode::<Namespace>(first)?;

        Ok(FluxNamespaceResponse {
            name: ns.metadata.name.unwrap_or_default(),
        })
    }

    /// Fan-out list of `K` across the fleet, optionally in one namespace
    #[instrument(skip_all, fields(user = %user.username, kind = %K::KIND))]
    pub async fn list_objects<K: ToWire>(
        &self,
        ctx: &RequestContext,
        user: &UserIdentity,
        namespace: Option<&str>,
    ) -> Result<ListResponse<K::Wire>> {
        let opts = ListOptions {
            namespace: namespace.map(str::to_string),
            label_selector: None,
        };
        let list = self
            .pool
            .clustered_list::<K>(ctx, &ClientIdentity::User(user.clone()), &opts)
            .await?;

        let (items, errors) = list.into_parts();
        let items = items
            .iter()
            .map(|(cluster, obj)| obj.to_wire(cluster))
            .collect::<Result<Vec<_>>>()?;
        let errors = errors
            .into_iter()
            .map(|(cluster_name, e)| ListError {
                cluster_name,
                message: e.to_string(),
            })
            .collect();

        Ok(ListResponse { items, errors })
    }

    /// One object of `K` from one cluster
    #[instrument(skip_all, fields(user = %user.username, kind = %K::KIND, cluster = %cluster))]
    pub async fn get_object<K: ToWire>(
        &self,
        ctx: &RequestContext,
        user: &UserIdentity,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<K::Wire> {
        let obj: K = self
            .pool
            .get(
                ctx,
                &ClientIdentity::User(user.clone()),
                cluster,
                &ObjectKey::namespaced(namespace, name),
            )
            .await?;
        obj.to_wire(cluster)
    }
}
