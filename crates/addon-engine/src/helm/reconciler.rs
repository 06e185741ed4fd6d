//! Per-cluster Helm reconciliation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{
    is_unmanaged, should_install, should_uninstall, should_upgrade, ChartAction, DeployedRelease,
    HelmClient, ReleaseKey, ReleaseRecord, ReleaseSpec, ReleaseStatus,
};
use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseAction {
    Install,
    Upgrade,
    Uninstall,
    NoAction,
    /// Left alone: the release exists and is not managed by this engine.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseReport {
    pub release: ReleaseKey,
    pub chart_name: String,
    pub chart_version: String,
    pub action: ReleaseAction,
    pub status: ReleaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Outcome of a reconciliation: what happened to each release and the
/// records to persist for the next pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelmReport {
    pub releases: Vec<ReleaseReport>,
    pub records: Vec<ReleaseRecord>,
}

impl HelmReport {
    /// Releases found in the cluster that this engine does not manage.
    pub fn unmanaged(&self) -> impl Iterator<Item = &ReleaseReport> {
        self.releases
            .iter()
            .filter(|r| r.status == ReleaseStatus::Unmanaged)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ReleaseReport> {
        self.releases.iter().filter(|r| r.status == ReleaseStatus::Failed)
    }
}

pub struct HelmReconciler {
    client: Arc<dyn HelmClient>,
}

impl HelmReconciler {
    pub fn new(client: Arc<dyn HelmClient>) -> Self {
        Self { client }
    }

    /// Bring the cluster's releases in line with `desired`.
    ///
    /// Install, upgrade and uninstall failures are reported per release and
    /// retried on the next call. In dry run no helm write is issued and the
    /// previous records are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Helm`] when the installed releases cannot be
    /// listed.
    #[instrument(skip_all, fields(desired = desired.len(), dry_run = dry_run))]
    pub async fn reconcile(
        &self,
        desired: &[ReleaseSpec],
        previous: &[ReleaseRecord],
        dry_run: bool,
    ) -> Result<HelmReport, EngineError> {
        let deployed: BTreeMap<ReleaseKey, DeployedRelease> = self
            .client
            .list_releases()
            .await?
            .into_iter()
            .map(|r| (r.key(), r))
            .collect();
        let previous: BTreeMap<ReleaseKey, &ReleaseRecord> =
            previous.iter().map(|r| (r.key(), r)).collect();

        let mut report = HelmReport::default();
        let mut wanted = BTreeSet::new();

        for spec in desired.iter().filter(|s| s.action == ChartAction::Install) {
            let key = spec.key();
            if !wanted.insert(key.clone()) {
                warn!(release = %key, "Release requested more than once, ignoring duplicate");
                report.releases.push(release_report(
                    spec,
                    ReleaseAction::Conflict,
                    ReleaseStatus::Failed,
                    Some("release is requested by more than one chart entry".to_string()),
                ));
                continue;
            }
            let (release, record) = self
                .reconcile_release(spec, deployed.get(&key), previous.get(&key).copied(), dry_run)
                .await;
            report.releases.push(release);
            report.records.push(record);
        }

        for (key, record) in &previous {
            if wanted.contains(key) {
                continue;
            }
            if !should_uninstall(record, false) {
                debug!(release = %key, "Dropping record of release this engine does not manage");
                continue;
            }
            if !deployed.contains_key(key) {
                debug!(release = %key, "Managed release is not listed, uninstalling anyway");
            }

            if dry_run {
                info!(release = %key, "Would uninstall release");
                report.releases.push(release_report(
                    &record.spec,
                    ReleaseAction::Uninstall,
                    ReleaseStatus::NotInstalled,
                    None,
                ));
                continue;
            }

            match self.client.uninstall(key).await {
                Ok(()) => {
                    info!(release = %key, "Uninstalled release");
                    report.releases.push(release_report(
                        &record.spec,
                        ReleaseAction::Uninstall,
                        ReleaseStatus::NotInstalled,
                        None,
                    ));
                }
                Err(e) => {
                    warn!(release = %key, error = %e, "Failed to uninstall release");
                    let message = e.to_string();
                    report.releases.push(release_report(
                        &record.spec,
                        ReleaseAction::Uninstall,
                        ReleaseStatus::Failed,
                        Some(message.clone()),
                    ));
                    report.records.push(ReleaseRecord {
                        status: ReleaseStatus::Failed,
                        failure_message: Some(message),
                        ..(*record).clone()
                    });
                }
            }
        }

        if dry_run {
            report.records = previous.values().map(|r| (*r).clone()).collect();
        }
        info!(
            releases = report.releases.len(),
            failed = report.failed().count(),
            unmanaged = report.unmanaged().count(),
            "Helm reconciliation finished"
        );
        Ok(report)
    }

    async fn reconcile_release(
        &self,
        spec: &ReleaseSpec,
        deployed: Option<&DeployedRelease>,
        previous: Option<&ReleaseRecord>,
        dry_run: bool,
    ) -> (ReleaseReport, ReleaseRecord) {
        let key = spec.key();
        let values_hash = spec.values_hash();

        if is_unmanaged(deployed, previous) {
            warn!(release = %key, "Release exists and is not managed by this engine");
            let message = deployed.map(|d| format!("{} {} is installed by someone else", d.chart, d.chart_version));
            let record = ReleaseRecord {
                spec: spec.clone(),
                last_applied_values_hash: None,
                status: ReleaseStatus::Unmanaged,
                installed_chart_version: deployed.map(|d| d.version_of(&spec.chart_name)),
                managed: false,
                failure_message: None,
            };
            return (
                release_report(spec, ReleaseAction::Conflict, ReleaseStatus::Unmanaged, message),
                record,
            );
        }

        let action = if should_install(deployed) {
            ReleaseAction::Install
        } else if should_upgrade(spec, deployed, previous, &values_hash) {
            ReleaseAction::Upgrade
        } else {
            ReleaseAction::NoAction
        };

        let mut record = ReleaseRecord {
            spec: spec.clone(),
            last_applied_values_hash: previous.and_then(|p| p.last_applied_values_hash.clone()),
            status: ReleaseStatus::Managed,
            installed_chart_version: deployed
                .map(|d| d.version_of(&spec.chart_name))
                .or_else(|| previous.and_then(|p| p.installed_chart_version.clone())),
            managed: true,
            failure_message: None,
        };

        if action == ReleaseAction::NoAction {
            debug!(release = %key, "Release is up to date");
            return (release_report(spec, action, ReleaseStatus::Managed, None), record);
        }
        if dry_run {
            info!(release = %key, action = ?action, "Would change release");
            let status = previous.map_or(ReleaseStatus::NotInstalled, |p| p.status);
            return (release_report(spec, action, status, None), record);
        }

        let result = match action {
            ReleaseAction::Install => self.client.install(spec).await,
            _ => self.client.upgrade(spec).await,
        };
        match result {
            Ok(()) => {
                info!(release = %key, action = ?action, chart = %spec.chart_name, version = %spec.chart_version, "Release applied");
                record.last_applied_values_hash = Some(values_hash);
                record.installed_chart_version = Some(spec.chart_version.clone());
                (release_report(spec, action, ReleaseStatus::Managed, None), record)
            }
            Err(e) => {
                warn!(release = %key, action = ?action, error = %e, "Failed to apply release");
                record.status = ReleaseStatus::Failed;
                record.failure_message = Some(e.to_string());
                (
                    release_report(spec, action, ReleaseStatus::Failed, Some(e.to_string())),
                    record,
                )
            }
        }
    }
}

fn release_report(
    spec: &ReleaseSpec,
    action: ReleaseAction,
    status: ReleaseStatus,
    message: Option<String>,
) -> ReleaseReport {
    ReleaseReport {
        release: spec.key(),
        chart_name: spec.chart_name.clone(),
        chart_version: spec.chart_version.clone(),
        action,
        status,
        message,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::HelmError;
    use crate::helm::client::MockHelmClient;

    fn spec(values: &str) -> ReleaseSpec {
        ReleaseSpec {
            repository_url: "https://charts.bitnami.com/bitnami".to_string(),
            chart_name: "redis".to_string(),
            chart_version: "18.19.2".to_string(),
            release_name: "cache".to_string(),
            release_namespace: "data".to_string(),
            values: values.to_string(),
            action: ChartAction::Install,
        }
    }

    fn deployed(spec: &ReleaseSpec) -> DeployedRelease {
        DeployedRelease {
            name: spec.release_name.clone(),
            namespace: spec.release_namespace.clone(),
            chart: spec.chart_name.clone(),
            chart_version: spec.chart_version.clone(),
            app_version: "7.2.4".to_string(),
            status: "deployed".to_string(),
            revision: 1,
        }
    }

    /// A mock whose release list follows installs and uninstalls.
    fn tracking_client(
        installs: usize,
        upgrades: usize,
        uninstalls: usize,
    ) -> (MockHelmClient, Arc<Mutex<Vec<DeployedRelease>>>) {
        let state = Arc::new(Mutex::new(Vec::<DeployedRelease>::new()));
        let mut client = MockHelmClient::new();

        let list_state = Arc::clone(&state);
        client
            .expect_list_releases()
            .returning(move || Ok(list_state.lock().unwrap().clone()));

        let install_state = Arc::clone(&state);
        client.expect_install().times(installs).returning(move |spec| {
            install_state.lock().unwrap().push(deployed(spec));
            Ok(())
        });
        client.expect_upgrade().times(upgrades).returning(|_| Ok(()));

        let uninstall_state = Arc::clone(&state);
        client.expect_uninstall().times(uninstalls).returning(move |key| {
            uninstall_state.lock().unwrap().retain(|r| &r.key() != key);
            Ok(())
        });
        (client, state)
    }

    #[tokio::test]
    async fn release_lifecycle_install_noop_upgrade_uninstall() {
        let (client, _) = tracking_client(1, 1, 1);
        let reconciler = HelmReconciler::new(Arc::new(client));

        let first = reconciler.reconcile(&[spec("replicas: 1")], &[], false).await.unwrap();
        assert_eq!(first.releases[0].action, ReleaseAction::Install);
        assert_eq!(first.records[0].status, ReleaseStatus::Managed);
        assert!(first.records[0].managed);

        let second = reconciler
            .reconcile(&[spec("replicas: 1")], &first.records, false)
            .await
            .unwrap();
        assert_eq!(second.releases[0].action, ReleaseAction::NoAction);

        let third = reconciler
            .reconcile(&[spec("replicas: 2")], &second.records, false)
            .await
            .unwrap();
        assert_eq!(third.releases[0].action, ReleaseAction::Upgrade);

        let fourth = reconciler.reconcile(&[], &third.records, false).await.unwrap();
        assert_eq!(fourth.releases[0].action, ReleaseAction::Uninstall);
        assert!(fourth.records.is_empty());
    }

    #[tokio::test]
    async fn unmanaged_releases_are_reported_and_left_alone() {
        let desired = spec("");
        let (client, state) = tracking_client(0, 0, 0);
        state.lock().unwrap().push(deployed(&desired));
        let reconciler = HelmReconciler::new(Arc::new(client));

        let report = reconciler.reconcile(&[desired], &[], false).await.unwrap();
        assert_eq!(report.unmanaged().count(), 1);
        assert_eq!(report.records[0].status, ReleaseStatus::Unmanaged);

        let removed = reconciler.reconcile(&[], &report.records, false).await.unwrap();
        assert!(removed.releases.is_empty());
    }

    #[tokio::test]
    async fn failed_install_is_retried_next_pass() {
        let mut client = MockHelmClient::new();
        client.expect_list_releases().returning(|| Ok(Vec::new()));
        let mut attempts = 0;
        client.expect_install().times(2).returning(move |_| {
            attempts += 1;
            if attempts == 1 {
                Err(HelmError::Command {
                    command: "install".to_string(),
                    stderr: "chart not found".to_string(),
                })
            } else {
                Ok(())
            }
        });
        let reconciler = HelmReconciler::new(Arc::new(client));

        let failed = reconciler.reconcile(&[spec("")], &[], false).await.unwrap();
        assert_eq!(failed.records[0].status, ReleaseStatus::Failed);
        assert!(failed.records[0].failure_message.as_deref().unwrap().contains("chart not found"));
        assert_eq!(failed.records[0].last_applied_values_hash, None);

        let retried = reconciler.reconcile(&[spec("")], &failed.records, false).await.unwrap();
        assert_eq!(retried.records[0].status, ReleaseStatus::Managed);
    }

    fn managed_record(spec: &ReleaseSpec) -> ReleaseRecord {
        ReleaseRecord {
            spec: spec.clone(),
            last_applied_values_hash: Some(spec.values_hash()),
            status: ReleaseStatus::Managed,
            installed_chart_version: Some(spec.chart_version.clone()),
            managed: true,
            failure_message: None,
        }
    }

    fn command_error(command: &str) -> HelmError {
        HelmError::Command {
            command: command.to_string(),
            stderr: "context deadline exceeded".to_string(),
        }
    }

    #[tokio::test]
    async fn failed_upgrade_is_retried_once() {
        let installed = spec("replicas: 1");
        let mut client = MockHelmClient::new();
        let live = deployed(&installed);
        client.expect_list_releases().returning(move || Ok(vec![live.clone()]));
        let mut attempts = 0;
        client.expect_upgrade().times(2).returning(move |_| {
            attempts += 1;
            if attempts == 1 {
                Err(command_error("upgrade"))
            } else {
                Ok(())
            }
        });
        let reconciler = HelmReconciler::new(Arc::new(client));
        let wanted = [spec("replicas: 2")];

        let failed = reconciler
            .reconcile(&wanted, &[managed_record(&installed)], false)
            .await
            .unwrap();
        assert_eq!(failed.releases[0].action, ReleaseAction::Upgrade);
        assert_eq!(failed.records[0].status, ReleaseStatus::Failed);
        assert_eq!(failed.records[0].last_applied_values_hash, Some(installed.values_hash()));

        let retried = reconciler.reconcile(&wanted, &failed.records, false).await.unwrap();
        assert_eq!(retried.releases[0].action, ReleaseAction::Upgrade);
        assert_eq!(retried.records[0].status, ReleaseStatus::Managed);

        let settled = reconciler.reconcile(&wanted, &retried.records, false).await.unwrap();
        assert_eq!(settled.releases[0].action, ReleaseAction::NoAction);
    }

    #[tokio::test]
    async fn failed_uninstall_keeps_the_record_and_is_retried_once() {
        let installed = spec("");
        let state = Arc::new(Mutex::new(vec![deployed(&installed)]));
        let mut client = MockHelmClient::new();
        let list_state = Arc::clone(&state);
        client
            .expect_list_releases()
            .returning(move || Ok(list_state.lock().unwrap().clone()));
        let mut attempts = 0;
        let uninstall_state = Arc::clone(&state);
        client.expect_uninstall().times(2).returning(move |key| {
            attempts += 1;
            if attempts == 1 {
                return Err(command_error("uninstall"));
            }
            uninstall_state.lock().unwrap().retain(|r| &r.key() != key);
            Ok(())
        });
        let reconciler = HelmReconciler::new(Arc::new(client));

        let failed = reconciler.reconcile(&[], &[managed_record(&installed)], false).await.unwrap();
        assert_eq!(failed.releases[0].status, ReleaseStatus::Failed);
        assert_eq!(failed.records.len(), 1);
        assert!(failed.records[0].managed);

        let retried = reconciler.reconcile(&[], &failed.records, false).await.unwrap();
        assert_eq!(retried.releases[0].action, ReleaseAction::Uninstall);
        assert_eq!(retried.releases[0].status, ReleaseStatus::NotInstalled);
        assert!(retried.records.is_empty());
        assert!(state.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn managed_release_missing_from_the_listing_is_still_uninstalled() {
        let (client, _) = tracking_client(0, 0, 1);
        let reconciler = HelmReconciler::new(Arc::new(client));

        let report = reconciler
            .reconcile(&[], &[managed_record(&spec(""))], false)
            .await
            .unwrap();
        assert_eq!(report.releases[0].action, ReleaseAction::Uninstall);
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn dry_run_issues_no_writes() {
        let (client, _) = tracking_client(0, 0, 0);
        let reconciler = HelmReconciler::new(Arc::new(client));

        let report = reconciler.reconcile(&[spec("")], &[], true).await.unwrap();
        assert_eq!(report.releases[0].action, ReleaseAction::Install);
        assert_eq!(report.releases[0].status, ReleaseStatus::NotInstalled);
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn list_failure_is_a_call_level_error() {
        let mut client = MockHelmClient::new();
        client
            .expect_list_releases()
            .returning(|| Err(HelmError::Timeout("list".to_string(), std::time::Duration::from_secs(1))));
        let reconciler = HelmReconciler::new(Arc::new(client));

        let err = reconciler.reconcile(&[spec("")], &[], false).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
