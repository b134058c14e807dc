//! Flux CRD types served by the fleet
//!
//! Read-only views: the service never writes these objects, so specs only
//! carry what the query API exposes.

mod helm_release;
mod kustomization;
mod source;
mod types;

pub use helm_release::{
    HelmChartTemplate, HelmChartTemplateSpec, HelmRelease, HelmReleaseSpec, HelmReleaseStatus,
};
pub use kustomization::{Kustomization, KustomizationSpec, KustomizationStatus};
pub use source::{
    GitRepository, GitRepositoryRef, GitRepositorySpec, HelmRepository, HelmRepositorySpec,
    SourceStatus,
};
pub use types::{find_condition, Artifact, Condition, SourceReference};
