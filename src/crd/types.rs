//! Supporting types shared by the Flux CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Standard Kubernetes status condition as reported by Flux controllers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g., "Ready", "Reconciling")
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Machine-readable reason for the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable details
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// RFC 3339 timestamp of the last transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

/// Reference to a source object, possibly in another namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    /// Source kind (GitRepository, HelmRepository, Bucket, ...)
    pub kind: String,
    /// Source name
    pub name: String,
    /// Source namespace, defaults to the referrer's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Artifact produced by a source controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Revision of the artifact (e.g., "main/1a2b3c")
    #[serde(default)]
    pub revision: String,
    /// In-cluster download URL
    #[serde(default)]
    pub url: String,
    /// RFC 3339 timestamp of the last update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_deserializes_type_field() {
        let c: Condition = serde_json::from_value(serde_json::json!({
            "type": "Ready",
            "status": "True",
            "reason": "ReconciliationSucceeded",
            "lastTransitionTime": "2024-01-01T00:00:00Z"
        }))
        .unwrap();

        assert_eq!(c.type_, "Ready");
        assert_eq!(c.reason.as_deref(), Some("ReconciliationSucceeded"));
        assert!(c.message.is_none());
    }

    #[test]
    fn test_find_condition() {
        let conditions = vec![
            Condition {
                type_: "Reconciling".into(),
                status: "False".into(),
                ..Default::default()
            },
            Condition {
                type_: "Ready".into(),
                status: "True".into(),
                ..Default::default()
            },
        ];

        assert_eq!(
            find_condition(&conditions, "Ready").map(|c| c.status.as_str()),
            Some("True")
        );
        assert!(find_condition(&conditions, "Stalled").is_none());
    }
}
