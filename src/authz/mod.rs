//! Namespace authorization filter
//!
//! A namespace is shown to a caller only if the caller holds every rule in
//! [`necessary_rules`] there. Each candidate is checked with its own
//! SelfSubjectRulesReview through the caller's impersonated client, so the
//! cluster's RBAC is the only source of truth.
//!
//! Rule matching is set based: every (group, resource, verb) triple of a
//! required rule must be covered by at least one returned rule, where `*`
//! covers anything. Order of either side never matters.

use std::collections::HashSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use k8s_openapi::api::authorization::v1::{ResourceRule, SubjectRulesReviewStatus};
use tracing::{debug, warn};

use crate::pool::{ClusterClient, RequestContext};
use crate::{Error, Result};

/// Wildcard accepted in every rule field
const WILDCARD: &str = "*";

/// A permission the caller must hold in a namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequiredRule {
    /// API groups (`""` is the core group)
    pub api_groups: Vec<String>,
    /// Resources
    pub resources: Vec<String>,
    /// Verbs
    pub verbs: Vec<String>,
}

impl RequiredRule {
    fn new(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> Self {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect();
        Self {
            api_groups: owned(api_groups),
            resources: owned(resources),
            verbs: owned(verbs),
        }
    }
}

/// Rules a caller needs in a namespace before it is listed
pub fn necessary_rules() -> Vec<RequiredRule> {
    vec![
        RequiredRule::new(
            &[""],
            &["secrets", "pods", "events", "namespaces"],
            &["get", "list"],
        ),
        RequiredRule::new(&[""], &["services"], &["get", "list"]),
    ]
}

fn covers(values: &Option<Vec<String>>, wanted: &str) -> bool {
    values
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|v| v == WILDCARD || v == wanted)
}

/// Whether `granted` covers one (group, resource, verb) triple.
///
/// Rules limited to specific object names do not grant list access and are
/// ignored.
fn granted_by(granted: &[ResourceRule], group: &str, resource: &str, verb: &str) -> bool {
    granted.iter().any(|rule| {
        let name_scoped = rule
            .resource_names
            .as_ref()
            .map(|names| !names.is_empty())
            .unwrap_or(false);
        !name_scoped
            && covers(&rule.api_groups, group)
            && covers(&rule.resources, resource)
            && rule.verbs.iter().any(|v| v == WILDCARD || v == verb)
    })
}

/// Whether `status` grants every triple of every rule in `required`
pub fn has_all_rules(status: &SubjectRulesReviewStatus, required: &[RequiredRule]) -> bool {
    let triples: HashSet<(&str, &str, &str)> = required
        .iter()
        .flat_map(|rule| {
            rule.api_groups.iter().flat_map(move |g| {
                rule.resources.iter().flat_map(move |r| {
                    rule.verbs
                        .iter()
                        .map(move |v| (g.as_str(), r.as_str(), v.as_str()))
                })
            })
        })
        .collect();

    triples
        .into_iter()
        .all(|(g, r, v)| granted_by(&status.resource_rules, g, r, v))
}

/// Filters candidate namespaces down to those a caller may use
#[derive(Clone, Debug)]
pub struct NamespaceAuthorizer {
    required: Arc<[RequiredRule]>,
    concurrency: usize,
}

impl Default for NamespaceAuthorizer {
    fn default() -> Self {
        Self::new(16)
    }
}

impl NamespaceAuthorizer {
    /// Authorizer checking [`necessary_rules`] with up to `concurrency`
    /// reviews in flight per call
    pub fn new(concurrency: usize) -> Self {
        Self {
            required: necessary_rules().into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Check one namespace
    pub async fn allowed(&self, client: &dyn ClusterClient, namespace: &str) -> Result<bool> {
        review_namespace(client, namespace, &self.required).await
    }

    /// Keep the candidates the caller is authorized for, in input order.
    ///
    /// Each candidate is decided on its own: a failed review excludes only that
    /// namespace. If every review fails the first error is returned.
    pub async fn filter<T, F>(
        &self,
        ctx: &RequestContext,
        cluster: &str,
        client: Arc<dyn ClusterClient>,
        candidates: Vec<T>,
        namespace_of: F,
    ) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&T) -> &str,
    {
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let names: Vec<String> = candidates.iter().map(|c| namespace_of(c).to_string()).collect();

        // Owned inputs keep the handler future Send
        let reviews: Vec<_> = names
            .iter()
            .map(|ns| {
                let ctx = ctx.clone();
                let cluster = cluster.to_string();
                let client = client.clone();
                let required = self.required.clone();
                let ns = ns.clone();
                async move {
                    ctx.run(&cluster, review_namespace(client.as_ref(), &ns, &required))
                        .await
                }
            })
            .collect();
        let decisions: Vec<Result<bool>> = stream::iter(reviews)
            .buffered(self.concurrency)
            .collect()
            .await;

        let mut first_error: Option<Error> = None;
        let mut failures = 0usize;
        let mut allowed = Vec::new();

        for ((candidate, name), decision) in candidates.into_iter().zip(&names).zip(decisions) {
            match decision {
                Ok(true) => allowed.push(candidate),
                Ok(false) => {}
                Err(e) => {
                    warn!(cluster, namespace = %name, error = %e, "Namespace permission check failed");
                    failures += 1;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if failures == names.len() => Err(e),
            _ => Ok(allowed),
        }
    }
}

async fn review_namespace(
    client: &dyn ClusterClient,
    namespace: &str,
    required: &[RequiredRule],
) -> Result<bool> {
    let status = client.rules_review(namespace).await?;
    if status.incomplete {
        debug!(
            namespace,
            error = status.evaluation_error.as_deref().unwrap_or_default(),
            "Rules review incomplete"
        );
    }
    Ok(has_all_rules(&status, required))
}
