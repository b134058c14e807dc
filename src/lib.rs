//! Lattice Fleet - read-side aggregation over a fleet of Kubernetes clusters
//!
//! Serves GitOps automation objects (Flux Kustomizations, HelmReleases and their
//! sources) and namespaces from many clusters behind one API. Every read is made
//! on behalf of the calling identity via impersonation, so cluster-side RBAC
//! decides what the caller sees.
//!
//! # Architecture
//!
//! ```text
//! request ──► CoreServer ──► ClientsPool ──► per-cluster impersonated clients
//!                │               │
//!                │               └──► ClusteredList fan-out (one task per cluster)
//!                ├──► ResourceCache (watch-fed, service credentials)
//!                └──► NamespaceAuthorizer (SelfSubjectRulesReview per namespace)
//! ```
//!
//! # Modules
//!
//! - [`clusters`] - Cluster descriptors, fetchers and the registry
//! - [`pool`] - Per-(cluster, identity) client pool and clustered fan-out
//! - [`cache`] - Watch-fed resource cache
//! - [`authz`] - Namespace authorization filter
//! - [`server`] - Query handlers and the HTTP surface
//! - [`kinds`] / [`crd`] - Resource kinds served by the fleet
//! - [`identity`] - Caller identity resolution
//! - [`install`] - Installer collaborator interfaces
//! - [`error`] - Error taxonomy

#![deny(missing_docs)]

pub mod authz;
pub mod cache;
pub mod clusters;
pub mod config;
pub mod crd;
pub mod error;
pub mod identity;
pub mod install;
pub mod kinds;
pub mod pool;
pub mod retry;
pub mod server;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Name given to the cluster this server runs on
pub const DEFAULT_CLUSTER_NAME: &str = "Default";

/// `app.kubernetes.io/part-of` value carried by the Flux namespace
pub const FLUX_NAMESPACE_PART_OF: &str = "flux";

/// `app.kubernetes.io/instance` value carried by the Flux namespace
pub const FLUX_NAMESPACE_INSTANCE: &str = "flux-system";

/// Label key identifying which system a resource is part of
pub const LABEL_PART_OF: &str = "app.kubernetes.io/part-of";

/// Label key identifying the instance of a system
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";

/// Label marking a Secret as a fleet cluster credential
pub const FLEET_CLUSTER_LABEL: &str = "fleet.lattice.dev/cluster";

/// Default port for the HTTP query API
pub const DEFAULT_API_PORT: u16 = 9001;
