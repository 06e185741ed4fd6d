//! Per-resource reports.

use serde::{Deserialize, Serialize};

use crate::collector::{StaleFailure, StaleOutcome};
use crate::deployer::DeploymentOutcome;
use crate::error::DocumentError;
use crate::resource::ResourceIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAction {
    Create,
    Update,
    Delete,
    Conflict,
    NoAction,
}

/// What happened (or would happen, in dry run) to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub identity: ResourceIdentity,
    pub action: ResourceAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Every resource touched by a deploy and stale-collection pass, plus the
/// failures that could not be tied to a parsed resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureReport {
    pub resources: Vec<ResourceReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl FeatureReport {
    /// Fold a deployment and a stale pass into one report, ordered by action.
    #[must_use]
    pub fn build(deployment: &DeploymentOutcome, stale: Option<&StaleOutcome>) -> Self {
        let mut report = Self::default();

        for id in &deployment.created {
            report.push(id, ResourceAction::Create, None);
        }
        for id in &deployment.updated {
            report.push(id, ResourceAction::Update, None);
        }
        for id in &deployment.unchanged {
            report.push(id, ResourceAction::NoAction, None);
        }
        for (id, owner) in &deployment.conflicted {
            let message = match owner {
                Some(owner) => format!("Object currently deployed because of {owner}"),
                None => "Object exists and is not managed by this engine".to_string(),
            };
            report.push(id, ResourceAction::Conflict, Some(message));
        }

        if let Some(stale) = stale {
            for id in &stale.stale {
                let failure = stale.failures.iter().find_map(|f| match f {
                    StaleFailure::Delete { identity, error } if identity == id => Some(error.to_string()),
                    _ => None,
                });
                report.push(id, ResourceAction::Delete, failure);
            }
            report.errors.extend(
                stale
                    .failures
                    .iter()
                    .filter(|f| matches!(f, StaleFailure::List { .. }))
                    .map(ToString::to_string),
            );
        }

        for failure in &deployment.failures {
            match failure {
                DocumentError::Api { identity, source, .. } => {
                    report.push(identity, ResourceAction::NoAction, Some(source.to_string()));
                }
                DocumentError::Parse { .. } => report.errors.push(failure.to_string()),
            }
        }

        report
    }

    fn push(&mut self, identity: &ResourceIdentity, action: ResourceAction, message: Option<String>) {
        self.resources.push(ResourceReport {
            identity: identity.clone(),
            action,
            message,
        });
    }

    /// Reports with the given action.
    pub fn with_action(&self, action: ResourceAction) -> impl Iterator<Item = &ResourceReport> {
        self.resources.iter().filter(move |r| r.action == action)
    }
}
