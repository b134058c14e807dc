//! Installer pipeline
//!
//! Provisions the GitOps runtime onto a cluster by running a fixed list of
//! opaque steps (install the runtime, generate automation manifests, commit
//! them to a repository, associate the cluster). The pipeline owns only the
//! ordering:
//!
//! 1. Probe the cluster status and check the precondition
//! 2. Run each step in order
//!
//! The first failing step aborts the run and its error is returned verbatim.
//! Nothing is rolled back, so a failed install may leave earlier steps applied.
//!
//! # Example
//!
//! ```rust,ignore
//! let pipeline = InstallPipeline::new("Default", Arc::new(KubeStatusProber::new(client)))
//!     .step(Arc::new(FluxInstall::new(..)))
//!     .step(Arc::new(CommitManifests::new(..)));
//! pipeline.run().await?;
//! ```

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{error, info};

#[cfg(test)]
use mockall::automock;

use crate::clusters::{ClusterStatus, StatusProber};
use crate::{Error, Result};

/// One unit of installer work
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InstallStep: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> String;

    /// Perform the step
    async fn run(&self) -> Result<()>;
}

/// Sequential, fail-fast installer
pub struct InstallPipeline {
    cluster: String,
    prober: Arc<dyn StatusProber>,
    steps: Vec<Arc<dyn InstallStep>>,
}

impl InstallPipeline {
    /// Pipeline with no steps installing onto `cluster`
    pub fn new(cluster: impl Into<String>, prober: Arc<dyn StatusProber>) -> Self {
        Self {
            cluster: cluster.into(),
            prober,
            steps: Vec::new(),
        }
    }

    /// Append a step
    pub fn step(mut self, step: Arc<dyn InstallStep>) -> Self {
        self.steps.push(step);
        self
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the pipeline has no steps
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Check the precondition, then run every step in order
    pub async fn run(&self) -> Result<()> {
        let start = Instant::now();

        let status = self.prober.status().await;
        check_precondition(&self.cluster, status)?;
        info!(cluster = %self.cluster, status = %status, steps = self.steps.len(), "Starting install");

        let total = self.steps.len();
        for (i, step) in self.steps.iter().enumerate() {
            let name = step.name();
            info!(step = %name, "[{}/{}] Running", i + 1, total);
            if let Err(e) = step.run().await {
                error!(step = %name, error = %e, "Install step failed, aborting");
                return Err(e);
            }
        }

        info!(elapsed_ms = start.elapsed().as_millis() as u64, "Install complete");
        Ok(())
    }
}

/// Whether installing onto a cluster in `status` may proceed
pub fn check_precondition(cluster: &str, status: ClusterStatus) -> Result<()> {
    match status {
        ClusterStatus::NotInstalled | ClusterStatus::GitOpsInstalled => Ok(()),
        ClusterStatus::FluxInstalled => Err(Error::misconfigured(
            "Flux is already installed on the cluster without the GitOps runtime",
        )),
        ClusterStatus::Unknown => Err(Error::unavailable(cluster, "cannot talk to the cluster")),
    }
}
