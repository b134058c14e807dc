//! Cluster status probe
//!
//! Decides whether the GitOps runtime can be installed on a cluster. Only the
//! install path consumes this; queries never depend on it.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// CRD whose presence means the GitOps runtime is installed
pub const GITOPS_CRD: &str = "apps.wego.weave.works";

/// CRD whose presence means Flux is installed
pub const FLUX_CRD: &str = "kustomizations.kustomize.toolkit.fluxcd.io";

/// Installation state of a cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClusterStatus {
    /// Neither Flux nor the GitOps runtime is present
    NotInstalled,
    /// Flux is present without the GitOps runtime
    FluxInstalled,
    /// The GitOps runtime is present
    GitOpsInstalled,
    /// The cluster could not be reached
    Unknown,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::NotInstalled => "NotInstalled",
            ClusterStatus::FluxInstalled => "FluxInstalled",
            ClusterStatus::GitOpsInstalled => "GitOpsInstalled",
            ClusterStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Computes the [`ClusterStatus`] of a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusProber: Send + Sync {
    /// Probe the cluster; never fails, unreachable clusters are `Unknown`
    async fn status(&self) -> ClusterStatus;
}

/// Prober backed by a kube client for the target cluster
pub struct KubeStatusProber {
    client: Client,
    timeout: Duration,
}

impl KubeStatusProber {
    /// Create a prober with a 10s reachability timeout
    pub fn new(client: Client) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(10),
        }
    }

    /// Override the reachability timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn crd_exists(&self, name: &str) -> Option<bool> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        match api.get_opt(name).await {
            Ok(found) => Some(found.is_some()),
            Err(e) => {
                debug!(crd = %name, error = %e, "CRD lookup failed");
                None
            }
        }
    }
}

#[async_trait]
impl StatusProber for KubeStatusProber {
    async fn status(&self) -> ClusterStatus {
        match tokio::time::timeout(self.timeout, self.client.apiserver_version()).await {
            Ok(Ok(version)) => {
                debug!(version = %version.git_version, "API server reachable");
            }
            Ok(Err(e)) => {
                info!(error = %e, "API server not reachable");
                return ClusterStatus::Unknown;
            }
            Err(_) => {
                info!("Timed out waiting for API server");
                return ClusterStatus::Unknown;
            }
        }

        let gitops = self.crd_exists(GITOPS_CRD).await;
        let flux = self.crd_exists(FLUX_CRD).await;
        status_from_probes(gitops, flux)
    }
}

/// Combine CRD lookups into a status. `None` means the lookup failed.
pub fn status_from_probes(gitops: Option<bool>, flux: Option<bool>) -> ClusterStatus {
    match (gitops, flux) {
        (Some(true), _) => ClusterStatus::GitOpsInstalled,
        (None, _) => ClusterStatus::Unknown,
        (Some(false), Some(true)) => ClusterStatus::FluxInstalled,
        (Some(false), Some(false)) => ClusterStatus::NotInstalled,
        (Some(false), None) => ClusterStatus::Unknown,
    }
}
