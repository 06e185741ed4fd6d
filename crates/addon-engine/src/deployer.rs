//! Resource deployer.
//!
//! Applies a bundle of rendered manifest documents to a cluster, in order.
//! Every object is created or updated only when it is absent or already
//! carries the requesting source's ownership labels; anything else is
//! reported as a conflict and left untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{bounded, ClusterClient};
use crate::config::EngineConfig;
use crate::error::{ClusterError, DocumentError, EngineError};
use crate::resource::{
    add_owner_reference, parse_document, strip_server_fields, OwnershipLabels, ResourceIdentity,
    ResourceKind,
};

/// How a feature is kept in sync with the target cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncMode {
    /// Re-apply on every reconciliation.
    #[default]
    Continuous,
    /// Compute and report changes without writing.
    DryRun,
    /// Apply once, then leave the feature alone until reset.
    OneTime,
}

impl SyncMode {
    #[must_use]
    pub fn is_dry_run(self) -> bool {
        self == Self::DryRun
    }
}

/// The cluster a request targets, as named on the management side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRef {
    pub namespace: String,
    pub name: String,
}

/// One apply request: which source produced the manifests and where they go.
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    /// Ownership triple stamped on every deployed object.
    pub source: OwnershipLabels,
    pub cluster: ClusterRef,
    /// Namespace for namespaced objects that do not set one.
    pub target_namespace: String,
    /// Link back to the object that declared the add-on.
    pub owner_reference: Option<OwnerReference>,
    pub sync_mode: SyncMode,
    /// Documents in apply order.
    pub manifests: Vec<String>,
}

/// Itemized result of a [`ResourceDeployer::deploy`] call.
///
/// In dry-run mode `created` and `updated` are predictions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeploymentOutcome {
    pub created: BTreeSet<ResourceIdentity>,
    pub updated: BTreeSet<ResourceIdentity>,
    pub unchanged: BTreeSet<ResourceIdentity>,
    /// Existing objects owned by someone else, with their owner when labelled.
    pub conflicted: BTreeMap<ResourceIdentity, Option<OwnershipLabels>>,
    /// Every identity the bundle declared, including failed and conflicting ones.
    pub declared: BTreeSet<ResourceIdentity>,
    pub failures: Vec<DocumentError>,
    /// Documents handled before the call returned.
    pub processed: usize,
    pub dry_run: bool,
}

impl DeploymentOutcome {
    /// Identities this source now owns in the cluster (or would, in dry run).
    #[must_use]
    pub fn applied(&self) -> BTreeSet<ResourceIdentity> {
        self.created
            .iter()
            .chain(&self.updated)
            .chain(&self.unchanged)
            .cloned()
            .collect()
    }

    /// Kinds of the applied identities.
    #[must_use]
    pub fn kinds(&self) -> BTreeSet<ResourceKind> {
        self.applied().iter().map(ResourceIdentity::resource_kind).collect()
    }

    #[must_use]
    pub fn has_parse_failures(&self) -> bool {
        self.failures.iter().any(DocumentError::is_parse)
    }

    /// No conflicts and no failures.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.conflicted.is_empty() && self.failures.is_empty()
    }
}

enum Applied {
    Created,
    Updated,
    Unchanged,
    Conflicted(Option<OwnershipLabels>),
}

/// Applies manifest bundles through a [`ClusterClient`].
pub struct ResourceDeployer {
    cluster: Arc<dyn ClusterClient>,
    api_timeout: Duration,
}

impl ResourceDeployer {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: &EngineConfig) -> Self {
        Self {
            cluster,
            api_timeout: config.api_timeout,
        }
    }

    /// Apply every document of `request` in order.
    ///
    /// Per-document failures are collected in the outcome and never stop the
    /// batch. Cancellation is checked between documents.
    ///
    /// # Errors
    ///
    /// - [`EngineError::AggregateFailure`] when every document failed.
    /// - [`EngineError::Cancelled`] when `cancel` fired before all documents
    ///   were handled.
    ///
    /// Both carry the outcome accumulated so far.
    #[instrument(skip_all, fields(source = %request.source, mode = ?request.sync_mode, documents = request.manifests.len()))]
    pub async fn deploy(
        &self,
        request: &DeploymentRequest,
        cancel: &CancellationToken,
    ) -> Result<DeploymentOutcome, EngineError> {
        let dry_run = request.sync_mode.is_dry_run();
        let mut outcome = DeploymentOutcome {
            dry_run,
            ..DeploymentOutcome::default()
        };
        let mut failed_documents = 0usize;
        if !dry_run && request.owner_reference.is_none() {
            warn!("No owner reference set, deployed resources will not be garbage collected with their owner");
        }

        for (index, document) in request.manifests.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(processed = outcome.processed, "Deployment cancelled");
                return Err(EngineError::Cancelled {
                    outcome: Box::new(outcome),
                });
            }

            let failures_before = outcome.failures.len();
            self.deploy_document(request, index, document, &mut outcome).await;
            if outcome.failures.len() > failures_before {
                failed_documents += 1;
            }
            outcome.processed += 1;
        }

        if !request.manifests.is_empty() && failed_documents == request.manifests.len() {
            warn!(failures = outcome.failures.len(), "Every document failed");
            return Err(EngineError::AggregateFailure {
                outcome: Box::new(outcome),
            });
        }

        info!(
            created = outcome.created.len(),
            updated = outcome.updated.len(),
            unchanged = outcome.unchanged.len(),
            conflicted = outcome.conflicted.len(),
            failed = outcome.failures.len(),
            dry_run,
            "Deployment finished"
        );
        Ok(outcome)
    }

    async fn deploy_document(
        &self,
        request: &DeploymentRequest,
        index: usize,
        document: &str,
        outcome: &mut DeploymentOutcome,
    ) {
        let objects = match parse_document(document) {
            Ok(objects) => objects,
            Err(message) => {
                warn!(index, error = %message, "Skipping unparseable document");
                outcome.failures.push(DocumentError::Parse { index, message });
                return;
            }
        };

        for object in objects {
            let (id, result) = self.deploy_object(request, object, outcome.dry_run).await;
            outcome.declared.insert(id.clone());
            match result {
                Ok(Applied::Created) => {
                    outcome.created.insert(id);
                }
                Ok(Applied::Updated) => {
                    outcome.updated.insert(id);
                }
                Ok(Applied::Unchanged) => {
                    outcome.unchanged.insert(id);
                }
                Ok(Applied::Conflicted(owner)) => {
                    outcome.conflicted.insert(id, owner);
                }
                Err(source) => {
                    warn!(index, resource = %id, error = %source, "Failed to apply resource");
                    outcome.failures.push(DocumentError::Api {
                        index,
                        identity: id,
                        source,
                    });
                }
            }
        }
    }

    async fn deploy_object(
        &self,
        request: &DeploymentRequest,
        mut desired: DynamicObject,
        dry_run: bool,
    ) -> (ResourceIdentity, Result<Applied, ClusterError>) {
        let kind = desired
            .types
            .as_ref()
            .map(|t| ResourceKind::from_api_version(&t.api_version, &t.kind))
            .unwrap_or_else(|| ResourceKind::new("", "", ""));
        let name = desired.metadata.name.clone().unwrap_or_default();
        let namespace = desired.metadata.namespace.clone().unwrap_or_default();

        let info = match bounded(self.api_timeout, self.cluster.resolve(&kind)).await {
            Ok(info) => info,
            Err(e) => return (ResourceIdentity::new(&kind, namespace, name), Err(e)),
        };

        let namespace = if !info.namespaced {
            String::new()
        } else if namespace.is_empty() {
            request.target_namespace.clone()
        } else {
            namespace
        };
        let id = ResourceIdentity::new(&kind, namespace.clone(), name);
        if info.namespaced && namespace.is_empty() {
            let err = ClusterError::Rejected {
                code: 400,
                message: "namespaced resource has no namespace and the request sets none".to_string(),
            };
            return (id, Err(err));
        }
        desired.metadata.namespace = (!namespace.is_empty()).then_some(namespace);

        strip_server_fields(&mut desired);
        request.source.stamp(&mut desired);
        if let Some(owner) = &request.owner_reference {
            add_owner_reference(&mut desired, owner);
        }

        let result = self.apply(&id, &request.source, desired, dry_run).await;
        (id, result)
    }

    async fn apply(
        &self,
        id: &ResourceIdentity,
        source: &OwnershipLabels,
        mut desired: DynamicObject,
        dry_run: bool,
    ) -> Result<Applied, ClusterError> {
        let Some(live) = bounded(self.api_timeout, self.cluster.get(id)).await? else {
            if dry_run {
                info!(resource = %id, "Would create resource");
            } else {
                bounded(self.api_timeout, self.cluster.create(id, &desired)).await?;
                info!(resource = %id, "Created resource");
            }
            return Ok(Applied::Created);
        };

        let owner = OwnershipLabels::of(&live);
        if owner.as_ref() != Some(source) {
            match &owner {
                Some(owner) => warn!(resource = %id, owner = %owner, "Resource is owned by another source"),
                None => warn!(resource = %id, "Resource exists and is not managed by this engine"),
            }
            return Ok(Applied::Conflicted(owner));
        }

        if is_up_to_date(&desired, &live)? {
            debug!(resource = %id, "Resource is up to date");
            return Ok(Applied::Unchanged);
        }

        if dry_run {
            info!(resource = %id, "Would update resource");
        } else {
            desired.metadata.resource_version = live.metadata.resource_version.clone();
            bounded(self.api_timeout, self.cluster.update(id, &desired)).await?;
            info!(resource = %id, "Updated resource");
        }
        Ok(Applied::Updated)
    }
}

/// Whether every field of `desired` is already present, with the same
/// value, in `live`. Server-managed metadata and status are ignored.
fn is_up_to_date(desired: &DynamicObject, live: &DynamicObject) -> Result<bool, ClusterError> {
    let mut live = live.clone();
    strip_server_fields(&mut live);
    let desired = serde_json::to_value(desired)?;
    let live = serde_json::to_value(&live)?;
    Ok(contains(&live, &desired))
}

fn contains(live: &Value, desired: &Value) -> bool {
    match (live, desired) {
        (Value::Object(live), Value::Object(desired)) => desired.iter().all(|(key, value)| {
            match live.get(key) {
                Some(live_value) => contains(live_value, value),
                None => value.is_null(),
            }
        }),
        (Value::Array(live), Value::Array(desired)) => {
            live.len() == desired.len() && live.iter().zip(desired).all(|(l, d)| contains(l, d))
        }
        (live, desired) => live == desired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn containment_ignores_extra_live_fields() {
        let live = json!({"spec": {"replicas": 3, "strategy": {"type": "RollingUpdate"}}});
        let desired = json!({"spec": {"replicas": 3}});
        assert!(contains(&live, &desired));
        assert!(!contains(&desired, &live));
    }

    #[test]
    fn containment_detects_changed_values_and_list_lengths() {
        let live = json!({"ports": [{"port": 80, "protocol": "TCP"}]});
        assert!(contains(&live, &json!({"ports": [{"port": 80}]})));
        assert!(!contains(&live, &json!({"ports": [{"port": 81}]})));
        assert!(!contains(&live, &json!({"ports": [{"port": 80}, {"port": 443}]})));
    }

    #[test]
    fn null_desired_fields_match_absent_live_fields() {
        assert!(contains(&json!({"a": 1}), &json!({"a": 1, "b": null})));
    }

    #[test]
    fn outcome_kinds_cover_applied_identities_only() {
        let role = ResourceKind::new("rbac.authorization.k8s.io", "v1", "ClusterRole");
        let cm = ResourceKind::new("", "v1", "ConfigMap");
        let mut outcome = DeploymentOutcome::default();
        outcome.created.insert(ResourceIdentity::new(&role, "", "view"));
        outcome
            .conflicted
            .insert(ResourceIdentity::new(&cm, "apps", "taken"), None);

        assert_eq!(outcome.kinds(), BTreeSet::from([role]));
        assert!(!outcome.is_clean());
    }
}
