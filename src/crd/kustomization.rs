//! Flux Kustomization CRD (read-only view)
//!
//! Only the fields the query API exposes are modelled; unknown fields are
//! ignored on deserialization.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SourceReference};

/// Kustomization reconciles a path of a source artifact into the cluster.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kustomize.toolkit.fluxcd.io",
    version = "v1beta2",
    kind = "Kustomization",
    namespaced,
    status = "KustomizationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    /// Path inside the source artifact
    #[serde(default)]
    pub path: String,

    /// Reconciliation interval (Go duration string, e.g. "10m")
    #[serde(default)]
    pub interval: String,

    /// Source the manifests come from
    #[serde(default)]
    pub source_ref: SourceReference,

    /// Whether reconciliation is paused
    #[serde(default)]
    pub suspend: bool,

    /// Whether removed objects are garbage collected
    #[serde(default)]
    pub prune: bool,

    /// Namespace override for all applied objects
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
}

/// Observed state of a Kustomization
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Last revision applied successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,

    /// Last revision an apply was attempted for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,
}
