//! Resource kinds served by the fleet
//!
//! Each kind the service lists or caches is a variant of [`ResourceKind`]; the
//! typed side is the [`FleetResource`] trait, which ties a Rust type to its
//! kind at compile time. Per-cluster results are decoded through
//! [`decode`], so a list can never silently contain objects of another kind.

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{ApiResource, DynamicObject};
use kube::core::TypeMeta;
use kube::Resource;
use serde::de::DeserializeOwned;

use crate::crd::{GitRepository, HelmRelease, HelmRepository, Kustomization};
use crate::{Error, Result};

/// Kinds of objects the fleet can list, get and cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// Core `v1/Namespace`
    Namespace,
    /// Flux `Kustomization`
    Kustomization,
    /// Flux `HelmRelease`
    HelmRelease,
    /// Flux `GitRepository`
    GitRepository,
    /// Flux `HelmRepository`
    HelmRepository,
}

impl ResourceKind {
    /// All known kinds
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Namespace,
        ResourceKind::Kustomization,
        ResourceKind::HelmRelease,
        ResourceKind::GitRepository,
        ResourceKind::HelmRepository,
    ];

    /// API resource used to build dynamic `Api` handles
    pub fn api_resource(&self) -> ApiResource {
        match self {
            ResourceKind::Namespace => ApiResource::erase::<Namespace>(&()),
            ResourceKind::Kustomization => ApiResource::erase::<Kustomization>(&()),
            ResourceKind::HelmRelease => ApiResource::erase::<HelmRelease>(&()),
            ResourceKind::GitRepository => ApiResource::erase::<GitRepository>(&()),
            ResourceKind::HelmRepository => ApiResource::erase::<HelmRepository>(&()),
        }
    }

    /// Whether objects of this kind live inside a namespace
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ResourceKind::Namespace)
    }

    /// Lowercase plural name, as used in API paths
    pub fn plural(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "namespaces",
            ResourceKind::Kustomization => "kustomizations",
            ResourceKind::HelmRelease => "helmreleases",
            ResourceKind::GitRepository => "gitrepositories",
            ResourceKind::HelmRepository => "helmrepositories",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.plural())
    }
}

impl FromStr for ResourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_lowercase();
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.plural() == lower || k.api_resource().kind.to_lowercase() == lower)
            .ok_or_else(|| Error::misconfigured(format!("unknown resource kind: {s}")))
    }
}

/// A Rust type that can be served by the fleet
pub trait FleetResource:
    Resource<DynamicType = ()> + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static
{
    /// The kind this type decodes from
    const KIND: ResourceKind;
}

impl FleetResource for Namespace {
    const KIND: ResourceKind = ResourceKind::Namespace;
}

impl FleetResource for Kustomization {
    const KIND: ResourceKind = ResourceKind::Kustomization;
}

impl FleetResource for HelmRelease {
    const KIND: ResourceKind = ResourceKind::HelmRelease;
}

impl FleetResource for GitRepository {
    const KIND: ResourceKind = ResourceKind::GitRepository;
}

impl FleetResource for HelmRepository {
    const KIND: ResourceKind = ResourceKind::HelmRepository;
}

/// Decode a dynamic object into `K`.
///
/// List responses omit `apiVersion`/`kind` on items, so the type meta is
/// filled in from `K` before parsing. An object that carries a different kind
/// is rejected rather than skipped.
pub fn decode<K: FleetResource>(mut obj: DynamicObject) -> Result<K> {
    let ar = K::KIND.api_resource();

    if let Some(types) = &obj.types {
        if types.kind != ar.kind {
            return Err(Error::internal_with_context(
                "decode object",
                format!("expected kind {}, got {}", ar.kind, types.kind),
            ));
        }
    }

    obj.types = Some(TypeMeta {
        api_version: ar.api_version.clone(),
        kind: ar.kind.clone(),
    });

    let name = obj.metadata.name.clone().unwrap_or_default();
    obj.try_parse::<K>().map_err(|e| {
        Error::internal_with_context("decode object", format!("{} {name}: {e}", ar.kind))
    })
}

/// Resource version of an object as an orderable number.
///
/// Kubernetes resource versions are opaque strings; etcd-backed servers use
/// integers. Returns `None` when the version is missing or not numeric.
pub fn resource_version(obj: &DynamicObject) -> Option<u64> {
    obj.metadata
        .resource_version
        .as_deref()
        .and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn dynamic(kind: ResourceKind, name: &str, data: serde_json::Value) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &kind.api_resource()).data(data);
        obj.metadata.namespace = Some("flux-system".into());
        obj
    }

    #[test]
    fn test_kind_metadata() {
        assert_eq!(ResourceKind::Namespace.api_resource().kind, "Namespace");
        assert!(!ResourceKind::Namespace.is_namespaced());

        let ar = ResourceKind::Kustomization.api_resource();
        assert_eq!(ar.group, "kustomize.toolkit.fluxcd.io");
        assert_eq!(ar.plural, "kustomizations");
        assert!(ResourceKind::Kustomization.is_namespaced());

        assert_eq!(
            ResourceKind::HelmRelease.api_resource().api_version,
            "helm.toolkit.fluxcd.io/v2beta1"
        );
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!(
            "kustomizations".parse::<ResourceKind>().unwrap(),
            ResourceKind::Kustomization
        );
        assert_eq!(
            "HelmRelease".parse::<ResourceKind>().unwrap(),
            ResourceKind::HelmRelease
        );
        assert!("deployments".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn test_plural_matches_api_resource() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.plural(), kind.api_resource().plural);
        }
    }

    #[test]
    fn test_decode_without_type_meta() {
        let mut obj = dynamic(
            ResourceKind::Kustomization,
            "apps",
            serde_json::json!({
                "spec": {
                    "path": "./apps",
                    "interval": "10m",
                    "sourceRef": {"kind": "GitRepository", "name": "flux-system"}
                }
            }),
        );
        obj.types = None;

        let k: Kustomization = decode(obj).unwrap();
        assert_eq!(k.metadata.name.as_deref(), Some("apps"));
        assert_eq!(k.spec.path, "./apps");
        assert_eq!(k.spec.source_ref.name, "flux-system");
    }

    #[test]
    fn test_decode_rejects_mismatched_kind() {
        let obj = dynamic(
            ResourceKind::HelmRelease,
            "podinfo",
            serde_json::json!({"spec": {}}),
        );

        let err = decode::<Kustomization>(obj).unwrap_err();
        assert!(err.to_string().contains("expected kind Kustomization"));
    }

    #[test]
    fn test_resource_version_parsing() {
        let mut obj = DynamicObject::new("ns", &ResourceKind::Namespace.api_resource());
        assert_eq!(resource_version(&obj), None);

        obj.metadata = ObjectMeta {
            resource_version: Some("12345".into()),
            ..Default::default()
        };
        assert_eq!(resource_version(&obj), Some(12345));

        obj.metadata.resource_version = Some("opaque-v1".into());
        assert_eq!(resource_version(&obj), None);
    }
}
