//! Feature reconciliation.
//!
//! One call per (cluster, feature): fingerprint the inputs, skip when nothing
//! changed, otherwise render, deploy, collect stale resources and fold the
//! result into a new [`FeatureRecord`]. Records are returned to the caller,
//! which owns persistence and write concurrency.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterClient;
use crate::collector::{StaleCollector, StaleFailure, StaleOutcome};
use crate::config::EngineConfig;
use crate::deployer::{ClusterRef, DeploymentOutcome, DeploymentRequest, ResourceDeployer, SyncMode};
use crate::error::{DocumentError, EngineError};
use crate::hash::{compute_hash, should_redeploy, Fingerprint, HashInput};
use crate::render::{ContentSource, ManifestRenderer, RenderContext};
use crate::report::FeatureReport;
use crate::resource::{OwnershipLabels, ResourceIdentity, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FeatureId {
    Resources,
    Helm,
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resources => f.write_str("Resources"),
            Self::Helm => f.write_str("Helm"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureStatus {
    Provisioning,
    Provisioned,
    Failed,
    Removing,
    Removed,
}

/// Durable per (cluster, feature) state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRecord {
    pub feature_id: FeatureId,
    /// Fingerprint of the last successful apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_hash: Option<Fingerprint>,
    pub status: FeatureStatus,
    /// Kinds scanned by stale collection.
    #[serde(default)]
    pub deployed_resource_kinds: BTreeSet<ResourceKind>,
    #[serde(default)]
    pub deployed_resources: BTreeSet<ResourceIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconciled: Option<DateTime<Utc>>,
}

impl FeatureRecord {
    #[must_use]
    pub fn new(feature_id: FeatureId) -> Self {
        Self {
            feature_id,
            last_applied_hash: None,
            status: FeatureStatus::Provisioning,
            deployed_resource_kinds: BTreeSet::new(),
            deployed_resources: BTreeSet::new(),
            failure_message: None,
            last_reconciled: None,
        }
    }

    /// Mark the feature as being removed, before the final undeploy pass.
    pub fn begin_removal(&mut self) {
        self.status = FeatureStatus::Removing;
        self.failure_message = None;
    }
}

/// What to deploy for a feature.
#[derive(Debug, Clone)]
pub enum FeatureContent {
    /// Already rendered documents.
    Manifests(Vec<String>),
    /// ConfigMap/Secret entries, expanded when flagged as templates.
    Source(ContentSource),
    /// Script body evaluated with the active scripting configuration.
    Script(String),
}

/// Inputs of one feature reconciliation.
#[derive(Debug, Clone)]
pub struct FeatureRequest {
    pub feature_id: FeatureId,
    pub source: OwnershipLabels,
    pub cluster: ClusterRef,
    pub target_namespace: String,
    pub owner_reference: Option<OwnerReference>,
    pub sync_mode: SyncMode,
    pub content: FeatureContent,
    /// Objects exposed to templates and scripts.
    pub context: RenderContext,
}

/// A new record and the report of the pass that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureUpdate {
    pub record: FeatureRecord,
    pub report: FeatureReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileResult {
    /// Nothing to do; the previous record stands.
    Unchanged(FeatureRecord),
    Applied(FeatureUpdate),
    /// Predicted changes; the previous record stands.
    DryRun {
        previous: Option<FeatureRecord>,
        report: FeatureReport,
    },
}

impl ReconcileResult {
    /// The record the caller should persist, if any.
    #[must_use]
    pub fn record(&self) -> Option<&FeatureRecord> {
        match self {
            Self::Unchanged(record) | Self::Applied(FeatureUpdate { record, .. }) => Some(record),
            Self::DryRun { previous, .. } => previous.as_ref(),
        }
    }

    #[must_use]
    pub fn report(&self) -> Option<&FeatureReport> {
        match self {
            Self::Unchanged(_) => None,
            Self::Applied(FeatureUpdate { report, .. }) | Self::DryRun { report, .. } => Some(report),
        }
    }
}

/// Drives deploy and stale collection for one target cluster.
pub struct FeatureReconciler {
    deployer: ResourceDeployer,
    collector: StaleCollector,
    renderer: ManifestRenderer,
}

impl FeatureReconciler {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: &EngineConfig) -> Self {
        Self {
            deployer: ResourceDeployer::new(Arc::clone(&cluster), config),
            collector: StaleCollector::new(cluster, config),
            renderer: ManifestRenderer::new(),
        }
    }

    #[must_use]
    pub fn with_renderer(mut self, renderer: ManifestRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    /// Fingerprint over everything that shapes the rendered output.
    #[must_use]
    pub fn fingerprint(&self, request: &FeatureRequest) -> Fingerprint {
        let mut inputs = vec![
            HashInput::Text(request.feature_id.to_string()),
            HashInput::Text(request.source.to_string()),
            HashInput::Text(request.target_namespace.clone()),
        ];
        match &request.content {
            FeatureContent::Manifests(documents) => {
                inputs.push(HashInput::Manifests(documents.join("\n---\n")));
            }
            FeatureContent::Source(source) if source.is_template => {
                inputs.push(HashInput::Text(source.bundle()));
            }
            FeatureContent::Source(source) => inputs.push(HashInput::Manifests(source.bundle())),
            FeatureContent::Script(body) => {
                inputs.push(HashInput::Text(self.renderer.script_config().assemble(body)));
            }
        }
        for (identifier, object) in &request.context {
            inputs.push(HashInput::Text(identifier.clone()));
            match object.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
                Some(version) => inputs.push(HashInput::Text(version.to_string())),
                None => inputs.push(HashInput::Value(object.clone())),
            }
        }
        compute_hash(&inputs)
    }

    /// Reconcile one feature.
    ///
    /// # Errors
    ///
    /// Returns render errors, and the deployer's aggregate-failure and
    /// cancellation errors. On error the previous record stands.
    #[instrument(skip_all, fields(feature = %request.feature_id, source = %request.source, cluster = %request.cluster.name, mode = ?request.sync_mode))]
    pub async fn reconcile(
        &self,
        request: &FeatureRequest,
        previous: Option<&FeatureRecord>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<ReconcileResult, EngineError> {
        let fingerprint = self.fingerprint(request);
        let dry_run = request.sync_mode.is_dry_run();

        if let Some(previous) = previous.filter(|_| !dry_run && !force) {
            if previous.status == FeatureStatus::Provisioned {
                if request.sync_mode == SyncMode::OneTime {
                    debug!("One-time feature already provisioned, skipping");
                    return Ok(ReconcileResult::Unchanged(previous.clone()));
                }
                if !should_redeploy(previous.last_applied_hash.as_ref(), &fingerprint, false) {
                    debug!(hash = %fingerprint, "Feature unchanged, skipping");
                    return Ok(ReconcileResult::Unchanged(previous.clone()));
                }
            }
        }

        let manifests = match &request.content {
            FeatureContent::Manifests(documents) => documents.clone(),
            FeatureContent::Source(source) => self.renderer.render_source(source, &request.context)?,
            FeatureContent::Script(body) => self.renderer.render_script(body, &request.context)?,
        };

        let deployment = DeploymentRequest {
            source: request.source.clone(),
            cluster: request.cluster.clone(),
            target_namespace: request.target_namespace.clone(),
            owner_reference: request.owner_reference.clone(),
            sync_mode: request.sync_mode,
            manifests,
        };
        let outcome = self.deployer.deploy(&deployment, cancel).await?;

        let previous_kinds = previous.map(|p| p.deployed_resource_kinds.clone()).unwrap_or_default();
        let previous_resources = previous.map(|p| p.deployed_resources.clone()).unwrap_or_default();

        // An unparseable document may be the only declaration of a resource
        // that is still wanted.
        let stale = if outcome.has_parse_failures() {
            warn!("Skipping stale collection: some documents could not be parsed");
            None
        } else {
            let kinds: BTreeSet<_> = previous_kinds.union(&outcome.kinds()).cloned().collect();
            Some(
                self.collector
                    .collect(&request.source, &outcome.declared, &kinds, dry_run)
                    .await,
            )
        };

        let report = FeatureReport::build(&outcome, stale.as_ref());
        if dry_run {
            return Ok(ReconcileResult::DryRun {
                previous: previous.cloned(),
                report,
            });
        }

        let (resources, kinds) = match &stale {
            None => {
                let resources: BTreeSet<_> = previous_resources.union(&outcome.applied()).cloned().collect();
                let kinds = previous_kinds.union(&outcome.kinds()).cloned().collect();
                (resources, kinds)
            }
            Some(stale) => tracked_after(&outcome, stale, &previous_resources),
        };

        let failure = failure_summary(&outcome, stale.as_ref());
        let record = FeatureRecord {
            feature_id: request.feature_id,
            last_applied_hash: if failure.is_none() {
                Some(fingerprint)
            } else {
                previous.and_then(|p| p.last_applied_hash.clone())
            },
            status: if failure.is_none() {
                FeatureStatus::Provisioned
            } else {
                FeatureStatus::Failed
            },
            deployed_resource_kinds: kinds,
            deployed_resources: resources,
            failure_message: failure,
            last_reconciled: Some(Utc::now()),
        };

        info!(status = ?record.status, resources = record.deployed_resources.len(), "Feature reconciled");
        Ok(ReconcileResult::Applied(FeatureUpdate { record, report }))
    }

    /// Final pass for a feature that is no longer wanted: remove every
    /// tracked resource still owned by `source`.
    #[instrument(skip_all, fields(feature = %previous.feature_id, source = %source, dry_run = dry_run))]
    pub async fn undeploy(&self, source: &OwnershipLabels, previous: &FeatureRecord, dry_run: bool) -> FeatureUpdate {
        let stale = self
            .collector
            .collect(source, &BTreeSet::new(), &previous.deployed_resource_kinds, dry_run)
            .await;
        let empty = DeploymentOutcome {
            dry_run,
            ..DeploymentOutcome::default()
        };
        let report = FeatureReport::build(&empty, Some(&stale));

        if dry_run {
            return FeatureUpdate {
                record: previous.clone(),
                report,
            };
        }

        let (resources, kinds) = tracked_after(&empty, &stale, &previous.deployed_resources);
        let failure = failure_summary(&empty, Some(&stale));
        let record = FeatureRecord {
            feature_id: previous.feature_id,
            last_applied_hash: None,
            status: if failure.is_none() {
                FeatureStatus::Removed
            } else {
                FeatureStatus::Failed
            },
            deployed_resource_kinds: kinds,
            deployed_resources: resources,
            failure_message: failure,
            last_reconciled: Some(Utc::now()),
        };
        info!(status = ?record.status, removed = stale.removed.len(), "Feature undeployed");
        FeatureUpdate { record, report }
    }
}

/// Identities and kinds to track after a pass with stale collection.
///
/// Kinds that could not be listed stay tracked so the next pass scans them.
fn tracked_after(
    outcome: &DeploymentOutcome,
    stale: &StaleOutcome,
    previous: &BTreeSet<ResourceIdentity>,
) -> (BTreeSet<ResourceIdentity>, BTreeSet<ResourceKind>) {
    let mut resources = outcome.applied();
    resources.extend(
        outcome
            .failures
            .iter()
            .filter_map(DocumentError::identity)
            .filter(|id| previous.contains(*id))
            .cloned(),
    );
    resources.extend(stale.remaining());

    let mut kinds: BTreeSet<_> = resources.iter().map(ResourceIdentity::resource_kind).collect();
    kinds.extend(stale.failures.iter().filter_map(|f| match f {
        StaleFailure::List { kind, .. } => Some(kind.clone()),
        StaleFailure::Delete { .. } => None,
    }));
    (resources, kinds)
}

fn failure_summary(outcome: &DeploymentOutcome, stale: Option<&StaleOutcome>) -> Option<String> {
    let mut messages: Vec<String> = outcome
        .conflicted
        .iter()
        .map(|(id, owner)| match owner {
            Some(owner) => format!("{id} is owned by {owner}"),
            None => format!("{id} exists and is not managed by this engine"),
        })
        .collect();
    messages.extend(outcome.failures.iter().map(ToString::to_string));
    if let Some(stale) = stale {
        messages.extend(stale.failures.iter().map(ToString::to_string));
    }
    (!messages.is_empty()).then(|| messages.join("; "))
}
