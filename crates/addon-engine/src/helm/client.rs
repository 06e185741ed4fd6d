//! Access to the Helm package manager.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use super::{DeployedRelease, ReleaseKey, ReleaseSpec};
use crate::config::EngineConfig;
use crate::error::HelmError;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait HelmClient: Send + Sync {
    /// Every release in every namespace, whatever its status.
    async fn list_releases(&self) -> Result<Vec<DeployedRelease>, HelmError>;

    async fn install(&self, spec: &ReleaseSpec) -> Result<(), HelmError>;

    async fn upgrade(&self, spec: &ReleaseSpec) -> Result<(), HelmError>;

    async fn uninstall(&self, key: &ReleaseKey) -> Result<(), HelmError>;
}

/// [`HelmClient`] that runs the helm binary.
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: String,
    kubeconfig: Option<PathBuf>,
    timeout: Duration,
}

impl HelmCli {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary: config.helm_binary.clone(),
            kubeconfig: None,
            timeout: config.api_timeout,
        }
    }

    #[must_use]
    pub fn with_kubeconfig(mut self, path: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(path.into());
        self
    }

    async fn run(&self, command: &str, args: Vec<String>, stdin: Option<&str>) -> Result<String, HelmError> {
        debug!(binary = %self.binary, ?args, "Running helm");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(kubeconfig) = &self.kubeconfig {
            cmd.env("KUBECONFIG", kubeconfig);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| HelmError::Spawn(format!("{}: {e}", self.binary)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| HelmError::Spawn(format!("failed to write values to helm: {e}")))?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| HelmError::Timeout(command.to_string(), self.timeout))?
            .map_err(|e| HelmError::Spawn(e.to_string()))?;

        if !output.status.success() {
            return Err(HelmError::Command {
                command: command.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn chart_args(&self, command: &str, spec: &ReleaseSpec) -> Vec<String> {
        let mut args = vec![command.to_string(), spec.release_name.clone()];
        let repository = spec.repository_url.trim_end_matches('/');
        if repository.starts_with("oci://") {
            args.push(format!("{repository}/{}", spec.chart_name));
        } else {
            args.push(spec.chart_name.clone());
            if !repository.is_empty() {
                args.extend(["--repo".to_string(), repository.to_string()]);
            }
        }
        args.extend(["--namespace".to_string(), spec.release_namespace.clone()]);
        if command == "install" {
            args.push("--create-namespace".to_string());
        }
        if !spec.chart_version.is_empty() {
            args.extend(["--version".to_string(), spec.chart_version.clone()]);
        }
        args.extend(["--timeout".to_string(), format!("{}s", self.timeout.as_secs())]);
        if !spec.values.trim().is_empty() {
            args.extend(["-f".to_string(), "-".to_string()]);
        }
        args
    }

    fn values_input(spec: &ReleaseSpec) -> Option<&str> {
        Some(spec.values.as_str()).filter(|v| !v.trim().is_empty())
    }
}

/// `helm list` caps its output at 256 releases unless told otherwise.
fn list_args() -> Vec<String> {
    ["list", "--all-namespaces", "--all", "--max", "0", "--output", "json"]
        .map(str::to_string)
        .to_vec()
}

fn is_release_missing(error: &HelmError) -> bool {
    matches!(error, HelmError::Command { stderr, .. } if stderr.contains("release: not found"))
}

#[derive(Deserialize)]
struct ListEntry {
    name: String,
    namespace: String,
    #[serde(default)]
    revision: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    chart: String,
    #[serde(default)]
    app_version: String,
}

fn parse_list(output: &str) -> Result<Vec<DeployedRelease>, HelmError> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<ListEntry> =
        serde_json::from_str(output).map_err(|e| HelmError::Output(format!("helm list: {e}")))?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let (chart, chart_version) = split_chart(&entry.chart);
            DeployedRelease {
                name: entry.name,
                namespace: entry.namespace,
                chart,
                chart_version,
                app_version: entry.app_version,
                status: entry.status,
                revision: entry.revision.parse().unwrap_or_default(),
            }
        })
        .collect())
}

/// Split helm's `chart` column (`cert-manager-v1.14.4`) into name and version.
fn split_chart(chart: &str) -> (String, String) {
    let bytes = chart.as_bytes();
    for (i, byte) in bytes.iter().enumerate() {
        if *byte != b'-' {
            continue;
        }
        let rest = &bytes[i + 1..];
        let starts_version = match rest {
            [b'v', d, ..] | [d, ..] => d.is_ascii_digit(),
            [] => false,
        };
        if starts_version {
            return (chart[..i].to_string(), chart[i + 1..].to_string());
        }
    }
    (chart.to_string(), String::new())
}

#[async_trait]
impl HelmClient for HelmCli {
    #[instrument(skip(self))]
    async fn list_releases(&self) -> Result<Vec<DeployedRelease>, HelmError> {
        parse_list(&self.run("list", list_args(), None).await?)
    }

    #[instrument(skip(self, spec), fields(release = %spec.key()))]
    async fn install(&self, spec: &ReleaseSpec) -> Result<(), HelmError> {
        self.run("install", self.chart_args("install", spec), Self::values_input(spec))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self, spec), fields(release = %spec.key()))]
    async fn upgrade(&self, spec: &ReleaseSpec) -> Result<(), HelmError> {
        self.run("upgrade", self.chart_args("upgrade", spec), Self::values_input(spec))
            .await
            .map(|_| ())
    }

    #[instrument(skip(self), fields(release = %key))]
    async fn uninstall(&self, key: &ReleaseKey) -> Result<(), HelmError> {
        let args = vec![
            "uninstall".to_string(),
            key.name.clone(),
            "--namespace".to_string(),
            key.namespace.clone(),
        ];
        match self.run("uninstall", args, None).await {
            Ok(_) => Ok(()),
            Err(e) if is_release_missing(&e) => {
                debug!(release = %key, "Release is already gone");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
