//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use addon_engine::deployer::{ClusterRef, DeploymentRequest, SyncMode};
use addon_engine::resource::{parse_document, OwnershipLabels, ResourceIdentity, ResourceKind};
use addon_engine::{EngineConfig, InMemoryCluster};

pub const SERVICE_ACCOUNT: &str = r"apiVersion: v1
kind: ServiceAccount
metadata:
  name: policy-agent
";

pub const CLUSTER_ROLE: &str = r"apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: policy-reader
rules:
  - apiGroups: ['']
    resources: [configmaps]
    verbs: [get, list]
";

pub const DEPLOYMENT: &str = r"apiVersion: apps/v1
kind: Deployment
metadata:
  name: policy-agent
  namespace: policies
spec:
  replicas: 2
  selector:
    matchLabels:
      app: policy-agent
  template:
    metadata:
      labels:
        app: policy-agent
    spec:
      serviceAccountName: policy-agent
      containers:
        - name: agent
          image: ghcr.io/example/policy-agent:1.4.0
";

pub const MALFORMED: &str = "apiVersion: v1\nkind: [ConfigMap\nmetadata:\n  name: broken\n";

pub fn owner() -> OwnershipLabels {
    OwnershipLabels::new("ConfigMap", "policy-bundle", "fleet")
}

pub fn other_owner() -> OwnershipLabels {
    OwnershipLabels::new("Secret", "team-bundle", "fleet")
}

pub fn config() -> EngineConfig {
    EngineConfig::default()
}

pub fn cluster() -> Arc<InMemoryCluster> {
    Arc::new(InMemoryCluster::new())
}

pub fn request(mode: SyncMode, manifests: &[&str]) -> DeploymentRequest {
    DeploymentRequest {
        source: owner(),
        cluster: ClusterRef {
            namespace: "fleet".to_string(),
            name: "prod-eu".to_string(),
        },
        target_namespace: "policies".to_string(),
        owner_reference: None,
        sync_mode: mode,
        manifests: manifests.iter().map(|m| (*m).to_string()).collect(),
    }
}

pub fn identity(api_version: &str, kind: &str, namespace: &str, name: &str) -> ResourceIdentity {
    ResourceIdentity::new(&ResourceKind::from_api_version(api_version, kind), namespace, name)
}

pub fn cluster_role_kind() -> ResourceKind {
    ResourceKind::new("rbac.authorization.k8s.io", "v1", "ClusterRole")
}

/// Seed an object, optionally labelled as owned by `labels`.
pub fn seed(cluster: &InMemoryCluster, manifest: &str, labels: Option<&OwnershipLabels>) -> ResourceIdentity {
    let mut object = parse_document(manifest).unwrap().remove(0);
    if let Some(labels) = labels {
        labels.stamp(&mut object);
    }
    cluster.seed(object).unwrap()
}
