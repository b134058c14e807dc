//! Flux source CRDs (read-only views)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Artifact, Condition};

/// GitRepository produces artifacts from a Git remote.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "source.toolkit.fluxcd.io",
    version = "v1beta2",
    kind = "GitRepository",
    namespaced,
    status = "SourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    /// Repository URL
    #[serde(default)]
    pub url: String,

    /// Branch, tag, semver range or commit to check out
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<GitRepositoryRef>,

    /// Poll interval
    #[serde(default)]
    pub interval: String,

    /// Whether reconciliation is paused
    #[serde(default)]
    pub suspend: bool,
}

/// Git checkout reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct GitRepositoryRef {
    /// Branch name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Tag name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Semver range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,
    /// Commit SHA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// HelmRepository indexes charts from a Helm repository.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "source.toolkit.fluxcd.io",
    version = "v1beta2",
    kind = "HelmRepository",
    namespaced,
    status = "SourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositorySpec {
    /// Repository index URL
    #[serde(default)]
    pub url: String,

    /// Poll interval
    #[serde(default)]
    pub interval: String,

    /// "default" or "oci"
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub repository_type: Option<String>,

    /// Whether reconciliation is paused
    #[serde(default)]
    pub suspend: bool,
}

/// Observed state shared by source kinds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SourceStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Latest artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
}
