//! Flux HelmRelease CRD (read-only view)

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, SourceReference};

/// HelmRelease reconciles a Helm chart release into the cluster.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "helm.toolkit.fluxcd.io",
    version = "v2beta1",
    kind = "HelmRelease",
    namespaced,
    status = "HelmReleaseStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseSpec {
    /// Chart template
    #[serde(default)]
    pub chart: HelmChartTemplate,

    /// Reconciliation interval
    #[serde(default)]
    pub interval: String,

    /// Helm release name, defaults to `<targetNamespace>-<name>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,

    /// Namespace the release is installed into
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    /// Whether reconciliation is paused
    #[serde(default)]
    pub suspend: bool,
}

/// Wrapper matching the `spec.chart.spec` nesting of the CRD
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HelmChartTemplate {
    /// Chart coordinates
    #[serde(default)]
    pub spec: HelmChartTemplateSpec,
}

/// Chart coordinates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartTemplateSpec {
    /// Chart name or path
    #[serde(default)]
    pub chart: String,

    /// Version constraint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Source holding the chart
    #[serde(default)]
    pub source_ref: SourceReference,
}

/// Observed state of a HelmRelease
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Last chart version applied successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,

    /// Last chart version an install/upgrade was attempted for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,

    /// `<namespace>/<name>` of the generated HelmChart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm_chart: Option<String>,
}
