//! HTTP surface
//!
//! Thin axum adapter over [`CoreServer`]: authenticates the caller, builds the
//! request context and maps errors to status codes. Dropping a request (client
//! disconnect) drops the handler future, which cancels every in-flight cluster
//! call made for it.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::types::ToWire;
use super::CoreServer;
use crate::crd::{GitRepository, HelmRelease, HelmRepository, Kustomization};
use crate::error::ErrorCode;
use crate::identity::{bearer_token, IdentityResolver, UserIdentity};
use crate::kinds::ResourceKind;
use crate::Error;

/// Shared state for handlers
#[derive(Clone)]
pub struct ApiState {
    /// Query handlers
    pub server: Arc<CoreServer>,
    /// Bearer token to identity
    pub resolver: Arc<dyn IdentityResolver>,
}

impl ApiState {
    async fn caller(&self, headers: &HeaderMap) -> Result<UserIdentity, ApiError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .ok_or_else(|| ApiError::Unauthenticated("missing bearer token".into()))?;
        Ok(self.resolver.resolve(token).await?)
    }
}

/// Errors returned by the HTTP surface
#[derive(Debug)]
pub enum ApiError {
    /// No usable credential on the request
    Unauthenticated(String),
    /// Path names a kind that is not served here
    UnknownKind(String),
    /// Failure from the query handlers
    Fleet(Error),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError::Fleet(e)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthenticated(msg) => (StatusCode::UNAUTHORIZED, "unauthenticated", msg),
            ApiError::UnknownKind(kind) => (
                StatusCode::NOT_FOUND,
                ErrorCode::NotFound.as_str(),
                format!("unknown resource kind: {kind}"),
            ),
            ApiError::Fleet(e) => {
                let code = e.code();
                let status = match code {
                    ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
                    ErrorCode::NotFound => StatusCode::NOT_FOUND,
                    ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    warn!(error = %e, "Request failed");
                }
                (status, code.as_str(), e.to_string())
            }
        };

        (status, Json(ErrorBody { code, message })).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct ClusterQuery {
    cluster: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct NamespaceQuery {
    namespace: Option<String>,
}

/// Build the API router
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/namespaces", get(list_namespaces))
        .route("/v1/flux-namespace", get(flux_namespace))
        .route("/v1/{kind}", get(list_kind))
        .route("/v1/{kind}/{cluster}/{namespace}/{name}", get(get_kind))
        .with_state(state)
}

/// Serve `router` on `addr` until `shutdown` is cancelled
pub async fn serve(addr: SocketAddr, router: Router, shutdown: CancellationToken) -> crate::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::misconfigured(format!("bind {addr}: {e}")))?;
    info!(addr = %addr, "Fleet API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::internal_with_context("serve", e.to_string()))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_namespaces(
    State(state): State<ApiState>,
    Query(q): Query<ClusterQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = state.caller(&headers).await?;
    let ctx = state.server.request_context();
    let resp = state
        .server
        .list_namespaces(&ctx, &user, q.cluster.as_deref())
        .await?;
    Ok(Json(resp).into_response())
}

async fn flux_namespace(
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user = state.caller(&headers).await?;
    let ctx = state.server.request_context();
    let resp = state.server.get_flux_namespace(&ctx, &user).await?;
    Ok(Json(resp).into_response())
}

/// Kinds reachable through the generic object routes
fn object_kind(kind: &str) -> Result<ResourceKind, ApiError> {
    match kind.parse::<ResourceKind>() {
        Ok(ResourceKind::Namespace) | Err(_) => Err(ApiError::UnknownKind(kind.to_string())),
        Ok(k) => Ok(k),
    }
}

async fn list_kind(
    State(state): State<ApiState>,
    Path(kind): Path<String>,
    Query(q): Query<NamespaceQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let kind = object_kind(&kind)?;
    let user = state.caller(&headers).await?;
    let ns = q.namespace.as_deref();

    match kind {
        ResourceKind::Kustomization => list_json::<Kustomization>(&state, &user, ns).await,
        ResourceKind::HelmRelease => list_json::<HelmRelease>(&state, &user, ns).await,
        ResourceKind::GitRepository => list_json::<GitRepository>(&state, &user, ns).await,
        ResourceKind::HelmRepository => list_json::<HelmRepository>(&state, &user, ns).await,
        ResourceKind::Namespace => Err(ApiError::UnknownKind(kind.to_string())),
    }
}

async fn list_json<K: ToWire>(
    state: &ApiState,
    user: &UserIdentity,
    namespace: Option<&str>,
) -> Result<Response, ApiError> {
    let ctx = state.server.request_context();
    let resp = state.server.list_objects::<K>(&ctx, user, namespace).await?;
    Ok(Json(resp).into_response())
}

#[derive(Debug, Deserialize)]
struct ObjectPath {
    kind: String,
    cluster: String,
    namespace: String,
    name: String,
}

async fn get_kind(
    State(state): State<ApiState>,
    Path(path): Path<ObjectPath>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let kind = object_kind(&path.kind)?;
    let user = state.caller(&headers).await?;

    match kind {
        ResourceKind::Kustomization => get_json::<Kustomization>(&state, &user, &path).await,
        ResourceKind::HelmRelease => get_json::<HelmRelease>(&state, &user, &path).await,
        ResourceKind::GitRepository => get_json::<GitRepository>(&state, &user, &path).await,
        ResourceKind::HelmRepository => get_json::<HelmRepository>(&state, &user, &path).await,
        ResourceKind::Namespace => Err(ApiError::UnknownKind(path.kind.clone())),
    }
}

async fn get_json<K: ToWire>(
    state: &ApiState,
    user: &UserIdentity,
    path: &ObjectPath,
) -> Result<Response, ApiError> {
    let ctx = state.server.request_context();
    let view = state
        .server
        .get_object::<K>(&ctx, user, &path.cluster, &path.namespace, &path.name)
        .await?;
    Ok(Json(view).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::NamespaceAuthorizer;
    use crate::cache::ResourceCache;
    use crate::clusters::{test_cluster, ClusterRegistry, MockClusterFetcher};
    use crate::identity::MockIdentityResolver;
    use crate::pool::client::MockClusterClient;
    use crate::pool::factory::MockClientFactory;
    use crate::pool::{ClientsPool, ClusterClient};
    use crate::retry::RetryConfig;
    use axum::body::Body;
    use axum::http::Request;
    use crate::pool::ClientIdentity;
    use http_body_util::BodyExt;
    use k8s_openapi::api::authorization::v1::{ResourceRule, SubjectRulesReviewStatus};
    use kube::api::DynamicObject;
    use std::time::Duration;
    use tower::ServiceExt;

    fn kustomization(name: &str) -> DynamicObject {
        DynamicObject::new(name, &ResourceKind::Kustomization.api_resource())
            .within("flux-system")
            .data(serde_json::json!({"spec": {"path": "./apps", "interval": "5m"}}))
    }

    async fn app(factory: MockClientFactory) -> Router {
        let mut fetcher = MockClusterFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|| Ok(vec![test_cluster("a"), test_cluster("b")]));
        let registry = Arc::new(ClusterRegistry::new(Arc::new(fetcher), "a"));
        registry.refresh().await.unwrap();
        let pool = Arc::new(ClientsPool::new(registry, Arc::new(factory)));
        let cache = Arc::new(ResourceCache::new(
            pool.clone(),
            vec![],
            RetryConfig::default(),
            3,
        ));
        let server = Arc::new(CoreServer::new(
            pool,
            cache,
            NamespaceAuthorizer::default(),
            Duration::from_secs(5),
        ));

        let mut resolver = MockIdentityResolver::new();
        resolver.expect_resolve().returning(|token| match token {
            "good" => Ok(UserIdentity::new("alice", vec![])),
            _ => Err(Error::permission_denied("token rejected")),
        });

        router(ApiState {
            server,
            resolver: Arc::new(resolver),
        })
    }

    async fn call(app: Router, uri: &str, token: Option<&str>) -> (StatusCode, serde_json::Value) {
        let mut req = Request::builder().uri(uri);
        if let Some(token) = token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        let resp = app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_healthz_needs_no_token() {
        let app = app(MockClientFactory::new()).await;
        let resp = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let (status, body) = call(app(MockClientFactory::new()).await, "/v1/kustomizations", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_rejected_token_is_forbidden() {
        let (status, body) = call(
            app(MockClientFactory::new()).await,
            "/v1/flux-namespace",
            Some("bad"),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "permission_denied");
    }

    #[tokio::test]
    async fn test_unknown_kind_is_not_found() {
        let (status, body) = call(app(MockClientFactory::new()).await, "/v1/pods", Some("good")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_list_kind_returns_items_and_errors() {
        let mut factory = MockClientFactory::new();
        factory.expect_build().returning(|cluster, _| {
            let mut client = MockClusterClient::new();
            if cluster.name == "a" {
                client
                    .expect_list()
                    .returning(|_, _| Ok(vec![kustomization("apps")]));
            } else {
                client
                    .expect_list()
                    .returning(|_, _| Err(Error::unavailable("b", "connection refused")));
            }
            Ok(Arc::new(client) as Arc<dyn ClusterClient>)
        });

        let (status, body) = call(
            app(factory).await,
            "/v1/kustomizations?namespace=flux-system",
            Some("good"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"][0]["name"], "apps");
        assert_eq!(body["items"][0]["clusterName"], "a");
        assert_eq!(body["errors"][0]["clusterName"], "b");
    }

    #[tokio::test]
    async fn test_get_kind_not_found() {
        let mut factory = MockClientFactory::new();
        factory.expect_build().returning(|_, _| {
            let mut client = MockClusterClient::new();
            client
                .expect_get()
                .returning(|_, _| Err(Error::not_found("helmreleases missing")));
            Ok(Arc::new(client) as Arc<dyn ClusterClient>)
        });

        let (status, body) = call(
            app(factory).await,
            "/v1/helmreleases/a/flux-system/missing",
            Some("good"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_all_clusters_failing_is_internal() {
        let mut factory = MockClientFactory::new();
        factory.expect_build().returning(|cluster, _| {
            let name = cluster.name.clone();
            let mut client = MockClusterClient::new();
            client
                .expect_list()
                .returning(move |_, _| Err(Error::unavailable(name.clone(), "timeout")));
            Ok(Arc::new(client) as Arc<dyn ClusterClient>)
        });

        let (status, body) = call(app(factory).await, "/v1/gitrepositories", Some("good")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["code"], "internal");
    }

    #[tokio::test]
    async fn test_list_namespaces_filters_by_caller_rules() {
        let mut factory = MockClientFactory::new();
        factory.expect_build().returning(|_, identity| {
            let mut client = MockClusterClient::new();
            if identity.is_service() {
                client.expect_list().returning(|kind, _| {
                    Ok(["ns1", "ns2"]
                        .iter()
                        .map(|n| DynamicObject::new(n, &kind.api_resource()))
                        .collect())
                });
            } else {
                assert!(matches!(identity, ClientIdentity::User(u) if u.username == "alice"));
                client.expect_rules_review().returning(|ns| {
                    let mut status = SubjectRulesReviewStatus::default();
                    if ns == "ns1" {
                        status.resource_rules = vec![ResourceRule {
                            api_groups: Some(vec!["".into()]),
                            resources: Some(vec!["*".into()]),
                            verbs: vec!["get".into(), "list".into()],
                            resource_names: None,
                        }];
                    }
                    Ok(status)
                });
            }
            Ok(Arc::new(client) as Arc<dyn ClusterClient>)
        });

        let (status, body) = call(app(factory).await, "/v1/namespaces?cluster=b", Some("good")).await;
        assert_eq!(status, StatusCode::OK);
        let namespaces = body["namespaces"].as_array().unwrap();
        assert_eq!(namespaces.len(), 1);
        assert_eq!(namespaces[0]["name"], "ns1");
        assert_eq!(namespaces[0]["clusterName"], "b");
    }

    #[tokio::test]
    async fn test_list_namespaces_unknown_cluster_is_not_found() {
        let (status, body) = call(
            app(MockClientFactory::new()).await,
            "/v1/namespaces?cluster=nope",
            Some("good"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }
}
