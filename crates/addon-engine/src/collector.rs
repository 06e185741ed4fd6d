//! Stale resource collection.
//!
//! Only kinds this engine has deployed before are scanned. Within those,
//! only objects carrying the owner's full label triple are candidates, and a
//! candidate is stale when the owner no longer declares its identity.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{bounded, ClusterClient};
use crate::config::EngineConfig;
use crate::error::ClusterError;
use crate::resource::{OwnershipLabels, ResourceIdentity, ResourceKind};

/// A listing or deletion that did not go through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleFailure {
    List {
        kind: ResourceKind,
        error: ClusterError,
    },
    Delete {
        identity: ResourceIdentity,
        error: ClusterError,
    },
}

impl std::fmt::Display for StaleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::List { kind, error } => write!(f, "failed to list {kind}: {error}"),
            Self::Delete { identity, error } => write!(f, "failed to delete {identity}: {error}"),
        }
    }
}

/// Result of a [`StaleCollector::collect`] pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleOutcome {
    /// Owned objects that are no longer desired.
    pub stale: BTreeSet<ResourceIdentity>,
    /// Stale objects that are gone after this pass. Empty in dry run.
    pub removed: BTreeSet<ResourceIdentity>,
    pub failures: Vec<StaleFailure>,
}

impl StaleOutcome {
    /// Stale objects that are still in the cluster.
    #[must_use]
    pub fn remaining(&self) -> BTreeSet<ResourceIdentity> {
        self.stale.difference(&self.removed).cloned().collect()
    }

    /// Whether some kinds could not be listed, so the stale set may be incomplete.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f, StaleFailure::List { .. }))
    }
}

pub struct StaleCollector {
    cluster: Arc<dyn ClusterClient>,
    api_timeout: Duration,
}

impl StaleCollector {
    pub fn new(cluster: Arc<dyn ClusterClient>, config: &EngineConfig) -> Self {
        Self {
            cluster,
            api_timeout: config.api_timeout,
        }
    }

    /// Find, and unless `dry_run` delete, objects of `kinds` owned by `owner`
    /// whose identity is not in `desired`.
    ///
    /// Failures are best effort: they are recorded in the outcome and never
    /// stop the remaining deletions. A kind the cluster no longer serves has
    /// nothing left to collect.
    #[instrument(skip_all, fields(owner = %owner, kinds = kinds.len(), desired = desired.len(), dry_run = dry_run))]
    pub async fn collect(
        &self,
        owner: &OwnershipLabels,
        desired: &BTreeSet<ResourceIdentity>,
        kinds: &BTreeSet<ResourceKind>,
        dry_run: bool,
    ) -> StaleOutcome {
        let mut outcome = StaleOutcome::default();
        let selector = owner.selector();

        for kind in kinds {
            let objects = match bounded(self.api_timeout, self.cluster.list(kind, &selector)).await {
                Ok(objects) => objects,
                Err(ClusterError::UnknownKind(_) | ClusterError::NotFound(_)) => {
                    debug!(kind = %kind, "Kind is no longer served, nothing to collect");
                    continue;
                }
                Err(error) => {
                    warn!(kind = %kind, error = %error, "Failed to list resources");
                    outcome.failures.push(StaleFailure::List {
                        kind: kind.clone(),
                        error,
                    });
                    continue;
                }
            };

            // The selector is applied server side; the label check guards
            // clients that ignore it.
            for object in objects
                .iter()
                .filter(|object| OwnershipLabels::of(object).as_ref() == Some(owner))
            {
                let Some(id) = ResourceIdentity::listed(kind, object) else {
                    warn!(kind = %kind, "Listed object has no name, skipping");
                    continue;
                };
                if !desired.contains(&id) {
                    outcome.stale.insert(id);
                }
            }
        }

        if dry_run {
            for id in &outcome.stale {
                info!(resource = %id, "Would delete stale resource");
            }
            return outcome;
        }

        let deletions = outcome.stale.iter().map(|id| async move {
            let result = bounded(self.api_timeout, self.cluster.delete(id)).await;
            (id, result)
        });
        for (id, result) in join_all(deletions).await {
            match result {
                Ok(()) | Err(ClusterError::NotFound(_)) => {
                    info!(resource = %id, "Deleted stale resource");
                    outcome.removed.insert(id.clone());
                }
                Err(error) => {
                    warn!(resource = %id, error = %error, "Failed to delete stale resource");
                    outcome.failures.push(StaleFailure::Delete {
                        identity: id.clone(),
                        error,
                    });
                }
            }
        }

        outcome
    }
}
