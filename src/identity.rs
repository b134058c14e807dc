//! Caller identity resolution
//!
//! The fleet never reads data with its own credentials on a caller's behalf.
//! Instead the caller's bearer token is turned into a [`UserIdentity`] and every
//! cluster call is impersonated as that user and its groups.
//!
//! # Usage
//!
//! ```rust,ignore
//! let resolver = TokenReviewResolver::new(client);
//! let identity = resolver.resolve(token).await?;
//! // identity.username = "alice@example.com"
//! // identity.groups = ["system:authenticated", "platform-team"]
//! ```

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Authenticated caller identity
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct UserIdentity {
    /// Username impersonated on every cluster
    pub username: String,
    /// Groups impersonated on every cluster
    pub groups: Vec<String>,
}

impl UserIdentity {
    /// Create an identity
    pub fn new(username: impl Into<String>, groups: Vec<String>) -> Self {
        Self {
            username: username.into(),
            groups,
        }
    }

    /// Same identity with groups sorted and de-duplicated.
    ///
    /// Group order is irrelevant to impersonation, so two identities that
    /// differ only in group order compare equal once canonical.
    pub fn canonical(&self) -> Self {
        let mut groups = self.groups.clone();
        groups.sort_unstable();
        groups.dedup();
        Self {
            username: self.username.clone(),
            groups,
        }
    }
}

/// Extract bearer token from an Authorization header value
pub fn bearer_token(header: &str) -> Option<&str> {
    header.strip_prefix("Bearer ").filter(|t| !t.is_empty())
}

/// Turns an inbound credential into a cluster identity
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Resolve a bearer token to an identity
    async fn resolve(&self, token: &str) -> Result<UserIdentity>;
}

/// Resolver backed by the Kubernetes TokenReview API of the home cluster
pub struct TokenReviewResolver {
    client: Client,
    audiences: Option<Vec<String>>,
}

impl TokenReviewResolver {
    /// Create a resolver using the server's own client
    pub fn new(client: Client) -> Self {
        Self {
            client,
            audiences: None,
        }
    }

    /// Create a resolver that also checks token audiences
    pub fn with_audiences(client: Client, audiences: Vec<String>) -> Self {
        Self {
            client,
            audiences: Some(audiences),
        }
    }
}

#[async_trait]
impl IdentityResolver for TokenReviewResolver {
    async fn resolve(&self, token: &str) -> Result<UserIdentity> {
        let api: Api<TokenReview> = Api::all(self.client.clone());

        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: self.audiences.clone(),
            },
            status: None,
        };

        let result = api
            .create(&Default::default(), &review)
            .await
            .map_err(|e| Error::internal_with_context("token review", e.to_string()))?;

        let status = result
            .status
            .ok_or_else(|| Error::internal_with_context("token review", "no status returned"))?;

        identity_from_status(&status)
    }
}

/// Extract the identity from a TokenReview status
fn identity_from_status(status: &TokenReviewStatus) -> Result<UserIdentity> {
    if !status.authenticated.unwrap_or(false) {
        let msg = status
            .error
            .as_deref()
            .unwrap_or("token authentication failed");
        return Err(Error::permission_denied(msg));
    }

    let user = status
        .user
        .as_ref()
        .ok_or_else(|| Error::internal_with_context("token review", "no user info"))?;

    let username = user
        .username
        .clone()
        .ok_or_else(|| Error::internal_with_context("token review", "user has no username"))?;

    let groups = user.groups.clone().unwrap_or_default();

    debug!(username = %username, groups = ?groups, "Resolved caller identity");

    Ok(UserIdentity { username, groups })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::authentication::v1::UserInfo;

    #[test]
    fn test_canonical_ignores_group_order() {
        let a = UserIdentity::new("alice", vec!["dev".into(), "ops".into()]);
        let b = UserIdentity::new("alice", vec!["ops".into(), "dev".into(), "ops".into()]);
        assert_eq!(a.canonical(), b.canonical());

        let c = UserIdentity::new("alice", vec!["dev".into()]);
        assert_ne!(a.canonical(), c.canonical());

        let d = UserIdentity::new("bob", vec!["dev".into(), "ops".into()]);
        assert_ne!(a.canonical(), d.canonical());
    }

    #[test]
    fn test_canonical_keeps_separator_characters_distinct() {
        let a = UserIdentity::new("a|b", vec![]);
        let b = UserIdentity::new("a", vec!["b|".into()]);
        assert_ne!(a.canonical(), b.canonical());

        let c = UserIdentity::new("c", vec!["x,y".into()]);
        let d = UserIdentity::new("c", vec!["x".into(), "y".into()]);
        assert_ne!(c.canonical(), d.canonical());
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc123"), Some("abc123"));
        assert_eq!(bearer_token("Basic abc123"), None);
        assert_eq!(bearer_token("Bearerabc123"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }

    #[test]
    fn test_identity_from_authenticated_status() {
        let status = TokenReviewStatus {
            authenticated: Some(true),
            user: Some(UserInfo {
                username: Some("alice@example.com".to_string()),
                groups: Some(vec!["system:authenticated".to_string()]),
                uid: None,
                extra: None,
            }),
            error: None,
            audiences: None,
        };

        let identity = identity_from_status(&status).unwrap();
        assert_eq!(identity.username, "alice@example.com");
        assert_eq!(identity.groups, vec!["system:authenticated".to_string()]);
    }

    #[test]
    fn test_identity_from_rejected_status() {
        let status = TokenReviewStatus {
            authenticated: Some(false),
            user: None,
            error: Some("token expired".to_string()),
            audiences: None,
        };

        match identity_from_status(&status) {
            Err(Error::PermissionDenied(msg)) => assert_eq!(msg, "token expired"),
            other => panic!("expected PermissionDenied, got {other:?}"),
        }
    }

    #[test]
    fn test_identity_without_username_is_internal() {
        let status = TokenReviewStatus {
            authenticated: Some(true),
            user: Some(UserInfo::default()),
            error: None,
            audiences: None,
        };

        assert!(matches!(
            identity_from_status(&status),
            Err(Error::Internal { .. })
        ));
    }
}
