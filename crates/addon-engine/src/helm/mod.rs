//! Helm release lifecycle.
//!
//! A release goes through `NotInstalled -> Managed -> NotInstalled`, with
//! `Failed` lasting for a single reconciliation and `Unmanaged` for releases
//! that exist in the cluster without having been installed by this engine.
//! The decision functions here are pure; [`HelmReconciler`] applies them
//! through a [`HelmClient`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::{compute_hash, Fingerprint, HashInput};

pub mod client;
pub mod reconciler;

pub use client::{HelmCli, HelmClient};
pub use reconciler::{HelmReconciler, HelmReport, ReleaseAction, ReleaseReport};

/// A release is addressed by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReleaseKey {
    pub namespace: String,
    pub name: String,
}

impl ReleaseKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ReleaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChartAction {
    #[default]
    Install,
    /// Remove the release if this engine manages it.
    Uninstall,
}

/// A desired release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSpec {
    /// Chart repository URL; `oci://` URLs are used as chart reference prefix.
    #[serde(default)]
    pub repository_url: String,
    pub chart_name: String,
    pub chart_version: String,
    pub release_name: String,
    pub release_namespace: String,
    /// Values as a YAML document.
    #[serde(default)]
    pub values: String,
    #[serde(default)]
    pub action: ChartAction,
}

impl ReleaseSpec {
    #[must_use]
    pub fn key(&self) -> ReleaseKey {
        ReleaseKey::new(&self.release_namespace, &self.release_name)
    }

    /// Digest of the chart coordinates and values.
    #[must_use]
    pub fn values_hash(&self) -> Fingerprint {
        compute_hash(&[
            HashInput::Text(self.repository_url.clone()),
            HashInput::Text(self.chart_name.clone()),
            HashInput::Text(self.chart_version.clone()),
            HashInput::Yaml(self.values.clone()),
        ])
    }
}

/// A release as reported by the package manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedRelease {
    pub name: String,
    pub namespace: String,
    pub chart: String,
    pub chart_version: String,
    #[serde(default)]
    pub app_version: String,
    pub status: String,
    #[serde(default)]
    pub revision: u32,
}

impl DeployedRelease {
    #[must_use]
    pub fn key(&self) -> ReleaseKey {
        ReleaseKey::new(&self.namespace, &self.name)
    }

    /// Installed version of the chart named `chart_name`.
    ///
    /// Helm reports `<name>-<version>` in one column, which cannot be split
    /// reliably when the name has a segment starting with a digit. Knowing
    /// the chart name settles it; otherwise the split from the listing is used.
    #[must_use]
    pub fn version_of(&self, chart_name: &str) -> String {
        let column = if self.chart_version.is_empty() {
            self.chart.clone()
        } else {
            format!("{}-{}", self.chart, self.chart_version)
        };
        column
            .strip_prefix(chart_name)
            .and_then(|rest| rest.strip_prefix('-'))
            .filter(|version| !version.is_empty())
            .map_or_else(|| self.chart_version.clone(), str::to_string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseStatus {
    NotInstalled,
    Managed,
    Unmanaged,
    Failed,
}

/// Durable per-release state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRecord {
    pub spec: ReleaseSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_values_hash: Option<Fingerprint>,
    pub status: ReleaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_chart_version: Option<String>,
    /// Set once this engine has issued an install for the release.
    #[serde(default)]
    pub managed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

impl ReleaseRecord {
    #[must_use]
    pub fn key(&self) -> ReleaseKey {
        self.spec.key()
    }
}

/// A release exists but this engine never installed it.
#[must_use]
pub fn is_unmanaged(deployed: Option<&DeployedRelease>, record: Option<&ReleaseRecord>) -> bool {
    deployed.is_some() && !record.is_some_and(|r| r.managed)
}

/// No release with this name exists in the namespace.
#[must_use]
pub fn should_install(deployed: Option<&DeployedRelease>) -> bool {
    deployed.is_none()
}

/// The release exists, is managed, and its values or chart version changed.
#[must_use]
pub fn should_upgrade(
    spec: &ReleaseSpec,
    deployed: Option<&DeployedRelease>,
    record: Option<&ReleaseRecord>,
    values_hash: &Fingerprint,
) -> bool {
    let (Some(deployed), Some(record)) = (deployed, record) else {
        return false;
    };
    if !record.managed {
        return false;
    }
    record.last_applied_values_hash.as_ref() != Some(values_hash)
        || !values_hash.is_stable()
        || deployed.version_of(&spec.chart_name).trim_start_matches('v') != spec.chart_version.trim_start_matches('v')
}

/// A managed release that is no longer desired.
///
/// Whether helm still lists the release does not matter: uninstalling a
/// release that is already gone succeeds.
#[must_use]
pub fn should_uninstall(record: &ReleaseRecord, desired: bool) -> bool {
    record.managed && !desired
}
