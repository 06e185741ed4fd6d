#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

//! Add-on deployment and reconciliation engine.
//!
//! Deploys rendered manifests and Helm charts into a workload cluster on
//! behalf of a source object, and keeps them reconciled:
//!
//! - [`hash`] decides whether anything changed since the last apply.
//! - [`deployer`] creates and updates resources, refusing to touch objects
//!   owned by another source.
//! - [`collector`] deletes resources the source no longer declares.
//! - [`helm`] drives chart releases through install, upgrade and uninstall.
//! - [`feature`] ties the first three together into one reconciliation per
//!   (cluster, feature) and produces the record the caller persists.
//!
//! All cluster access goes through [`cluster::ClusterClient`], so every
//! operation works on resource kinds unknown at compile time.

pub mod cluster;
pub mod collector;
pub mod config;
pub mod deployer;
pub mod error;
pub mod feature;
pub mod hash;
pub mod helm;
pub mod render;
pub mod report;
pub mod resource;

pub use cluster::{ClusterClient, InMemoryCluster, KubeClusterClient};
pub use collector::{StaleCollector, StaleOutcome};
pub use config::{EngineConfig, ScriptConfig};
pub use deployer::{ClusterRef, DeploymentOutcome, DeploymentRequest, ResourceDeployer, SyncMode};
pub use error::{ClusterError, DocumentError, EngineError, HelmError, RenderError};
pub use feature::{
    FeatureContent, FeatureId, FeatureReconciler, FeatureRecord, FeatureRequest, FeatureStatus,
    ReconcileResult,
};
pub use hash::{compute_hash, should_redeploy, Fingerprint, HashInput};
pub use helm::{HelmCli, HelmClient, HelmReconciler, HelmReport, ReleaseRecord, ReleaseSpec};
pub use render::{ContentSource, HandlebarsRenderer, ManifestRenderer, RenderContext};
pub use report::{FeatureReport, ResourceAction};
pub use resource::{OwnershipLabels, ResourceIdentity, ResourceKind};
