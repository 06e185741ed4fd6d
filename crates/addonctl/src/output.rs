//! Report printing.

use addon_engine::feature::FeatureRecord;
use addon_engine::helm::HelmReport;
use addon_engine::report::FeatureReport;
use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn feature_table(report: &FeatureReport) -> String {
    let mut out = format!("{:<10} {:<28} {:<24} {:<36} {}\n", "ACTION", "KIND", "NAMESPACE", "NAME", "MESSAGE");
    for resource in &report.resources {
        let id = &resource.identity;
        out.push_str(&format!(
            "{:<10} {:<28} {:<24} {:<36} {}\n",
            format!("{:?}", resource.action),
            id.kind,
            id.namespace,
            id.name,
            resource.message.as_deref().unwrap_or_default()
        ));
    }
    for error in &report.errors {
        out.push_str(&format!("error: {error}\n"));
    }
    out
}

pub fn record_summary(record: &FeatureRecord) -> String {
    let mut out = format!(
        "status: {:?}, resources: {}, kinds: {}",
        record.status,
        record.deployed_resources.len(),
        record.deployed_resource_kinds.len()
    );
    if let Some(message) = &record.failure_message {
        out.push_str(&format!("\nfailure: {message}"));
    }
    out
}

pub fn helm_table(report: &HelmReport) -> String {
    let mut out = format!("{:<10} {:<12} {:<32} {:<24} {:<12} {}\n", "ACTION", "STATUS", "RELEASE", "CHART", "VERSION", "MESSAGE");
    for release in &report.releases {
        out.push_str(&format!(
            "{:<10} {:<12} {:<32} {:<24} {:<12} {}\n",
            format!("{:?}", release.action),
            format!("{:?}", release.status),
            release.release.to_string(),
            release.chart_name,
            release.chart_version,
            release.message.as_deref().unwrap_or_default()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use addon_engine::report::{ResourceAction, ResourceReport};
    use addon_engine::resource::{ResourceIdentity, ResourceKind};

    #[test]
    fn feature_table_has_one_line_per_resource() {
        let kind = ResourceKind::new("", "v1", "ConfigMap");
        let report = FeatureReport {
            resources: vec![ResourceReport {
                identity: ResourceIdentity::new(&kind, "apps", "settings"),
                action: ResourceAction::Conflict,
                message: Some("Object currently deployed because of Secret ops/other".to_string()),
            }],
            errors: vec!["document 1: parse error: bad".to_string()],
        };
        let table = feature_table(&report);
        let lines: Vec<_> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("Conflict"));
        assert!(lines[1].contains("settings"));
        assert!(lines[2].starts_with("error:"));
    }
}
