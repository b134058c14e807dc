//! Wire format for query responses
//!
//! Pure, stateless translation from cluster objects to response messages.
//! Every translated object carries the name of the cluster it came from.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::crd::{
    find_condition, Artifact, Condition, GitRepository, GitRepositoryRef, HelmRelease,
    HelmRepository, Kustomization, SourceReference,
};
use crate::kinds::FleetResource;
use crate::{Error, Result};

/// A cluster object that has a wire representation
pub trait ToWire: FleetResource {
    /// Wire message type
    type Wire: Serialize + Send + 'static;

    /// Translate, tagging the result with its origin cluster
    fn to_wire(&self, cluster: &str) -> Result<Self::Wire>;
}

/// Per-cluster failure reported alongside partial list results
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListError {
    /// Cluster that failed
    pub cluster_name: String,
    /// What went wrong
    pub message: String,
}

/// Fan-out list response
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse<T> {
    /// Objects from every cluster that answered
    pub items: Vec<T>,
    /// Clusters that did not
    pub errors: Vec<ListError>,
}

/// Namespace as shown to callers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceView {
    /// Namespace name
    pub name: String,
    /// Origin cluster
    pub cluster_name: String,
    /// Lifecycle phase ("Active", "Terminating")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Response of the namespace listing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListNamespacesResponse {
    /// Namespaces the caller may use
    pub namespaces: Vec<NamespaceView>,
}

/// Response of the Flux namespace lookup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxNamespaceResponse {
    /// Name of the namespace Flux is installed in
    pub name: String,
}

/// Fields shared by every Flux object view
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectHeader {
    /// Object name
    pub name: String,
    /// Object namespace
    pub namespace: String,
    /// Origin cluster
    pub cluster_name: String,
    /// Reconcile interval
    pub interval: String,
    /// Whether reconciliation is suspended
    pub suspended: bool,
    /// Status conditions
    pub conditions: Vec<Condition>,
    /// Whether the Ready condition is True
    pub ready: bool,
}

impl ObjectHeader {
    fn new(
        meta: &ObjectMeta,
        cluster: &str,
        interval: &str,
        suspended: bool,
        conditions: &[Condition],
    ) -> Result<Self> {
        let name = meta
            .name
            .clone()
            .ok_or_else(|| Error::internal_with_context("translate object", "object has no name"))?;
        Ok(Self {
            name,
            namespace: meta.namespace.clone().unwrap_or_default(),
            cluster_name: cluster.to_string(),
            interval: interval.to_string(),
            suspended,
            conditions: conditions.to_vec(),
            ready: find_condition(conditions, "Ready")
                .map(|c| c.status == "True")
                .unwrap_or(false),
        })
    }
}

/// Kustomization view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationView {
    /// Common fields
    #[serde(flatten)]
    pub header: ObjectHeader,
    /// Path inside the source artifact
    pub path: String,
    /// Source providing the artifact
    pub source_ref: SourceReference,
    /// Whether removed objects are garbage collected
    pub prune: bool,
    /// Namespace objects are applied into
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    /// Last successfully applied revision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,
    /// Last attempted revision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,
}

impl ToWire for Kustomization {
    type Wire = KustomizationView;

    fn to_wire(&self, cluster: &str) -> Result<KustomizationView> {
        let status = self.status.clone().unwrap_or_default();
        Ok(KustomizationView {
            header: ObjectHeader::new(
                &self.metadata,
                cluster,
                &self.spec.interval,
                self.spec.suspend,
                &status.conditions,
            )?,
            path: self.spec.path.clone(),
            source_ref: self.spec.source_ref.clone(),
            prune: self.spec.prune,
            target_namespace: self.spec.target_namespace.clone(),
            last_applied_revision: status.last_applied_revision,
            last_attempted_revision: status.last_attempted_revision,
        })
    }
}

/// HelmRelease view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmReleaseView {
    /// Common fields
    #[serde(flatten)]
    pub header: ObjectHeader,
    /// Helm release name (defaults to `<namespace>-<name>`)
    pub release_name: String,
    /// Chart name
    pub chart: String,
    /// Chart version constraint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_version: Option<String>,
    /// Source providing the chart
    pub source_ref: SourceReference,
    /// Namespace the release is installed into
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,
    /// Last successfully applied revision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_applied_revision: Option<String>,
    /// Last attempted revision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempted_revision: Option<String>,
    /// `<namespace>/<name>` of the generated HelmChart
    #[serde(skip_serializing_if = "Option::is_none")]
    pub helm_chart: Option<String>,
}

impl ToWire for HelmRelease {
    type Wire = HelmReleaseView;

    fn to_wire(&self, cluster: &str) -> Result<HelmReleaseView> {
        let status = self.status.clone().unwrap_or_default();
        let header = ObjectHeader::new(
            &self.metadata,
            cluster,
            &self.spec.interval,
            self.spec.suspend,
            &status.conditions,
        )?;
        let chart = &self.spec.chart.spec;
        let release_name = self
            .spec
            .release_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", header.namespace, header.name));

        Ok(HelmReleaseView {
            header,
            release_name,
            chart: chart.chart.clone(),
            chart_version: chart.version.clone(),
            source_ref: chart.source_ref.clone(),
            target_namespace: self.spec.target_namespace.clone(),
            last_applied_revision: status.last_applied_revision,
            last_attempted_revision: status.last_attempted_revision,
            helm_chart: status.helm_chart,
        })
    }
}

/// GitRepository view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositoryView {
    /// Common fields
    #[serde(flatten)]
    pub header: ObjectHeader,
    /// Repository URL
    pub url: String,
    /// Branch, tag, semver range or commit to track
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<GitRepositoryRef>,
    /// Latest fetched artifact
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
}

impl ToWire for GitRepository {
    type Wire = GitRepositoryView;

    fn to_wire(&self, cluster: &str) -> Result<GitRepositoryView> {
        let status = self.status.clone().unwrap_or_default();
        Ok(GitRepositoryView {
            header: ObjectHeader::new(
                &self.metadata,
                cluster,
                &self.spec.interval,
                self.spec.suspend,
                &status.conditions,
            )?,
            url: self.spec.url.clone(),
            reference: self.spec.reference.clone(),
            artifact: status.artifact,
        })
    }
}

/// HelmRepository view
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositoryView {
    /// Common fields
    #[serde(flatten)]
    pub header: ObjectHeader,
    /// Repository URL
    pub url: String,
    /// "default" or "oci"
    pub repository_type: String,
    /// Latest fetched index
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
}

impl ToWire for HelmRepository {
    type Wire = HelmRepositoryView;

    fn to_wire(&self, cluster: &str) -> Result<HelmRepositoryView> {
        let status = self.status.clone().unwrap_or_default();
        Ok(HelmRepositoryView {
            header: ObjectHeader::new(
                &self.metadata,
                cluster,
                &self.spec.interval,
                self.spec.suspend,
                &status.conditions,
            )?,
            url: self.spec.url.clone(),
            repository_type: self
                .spec
                .repository_type
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            artifact: status.artifact,
        })
    }
}

impl ToWire for Namespace {
    type Wire = NamespaceView;

    fn to_wire(&self, cluster: &str) -> Result<NamespaceView> {
        let name = self
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::internal_with_context("translate namespace", "namespace has no name"))?;
        Ok(NamespaceView {
            name,
            cluster_name: cluster.to_string(),
            status: self.status.as_ref().and_then(|s| s.phase.clone()),
            labels: self.metadata.labels.clone().unwrap_or_default(),
            annotations: self.metadata.annotations.clone().unwrap_or_default(),
        })
    }
}
