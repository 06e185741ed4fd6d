//! Stale resource collection against the in-memory cluster.

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use addon_engine::cluster::{ClusterClient, KindInfo, Operation};
use addon_engine::collector::{StaleCollector, StaleFailure};
use addon_engine::error::ClusterError;
use addon_engine::resource::{ResourceIdentity, ResourceKind};
use addon_engine::InMemoryCluster;
use async_trait::async_trait;
use kube::api::DynamicObject;

use common::*;

/// Lists the way an API server does: items carry no `apiVersion` or `kind`.
struct UntypedListing(Arc<InMemoryCluster>);

#[async_trait]
impl ClusterClient for UntypedListing {
    async fn resolve(&self, kind: &ResourceKind) -> Result<KindInfo, ClusterError> {
        self.0.resolve(kind).await
    }

    async fn get(&self, id: &ResourceIdentity) -> Result<Option<DynamicObject>, ClusterError> {
        self.0.get(id).await
    }

    async fn create(&self, id: &ResourceIdentity, object: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        self.0.create(id, object).await
    }

    async fn update(&self, id: &ResourceIdentity, object: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        self.0.update(id, object).await
    }

    async fn delete(&self, id: &ResourceIdentity) -> Result<(), ClusterError> {
        self.0.delete(id).await
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let mut items = self.0.list(kind, selector).await?;
        for item in &mut items {
            item.types = None;
        }
        Ok(items)
    }
}

#[tokio::test]
async fn owned_cluster_role_is_deleted_when_no_longer_desired() {
    let cluster = cluster();
    let role = seed(&cluster, CLUSTER_ROLE, Some(&owner()));
    let collector = StaleCollector::new(cluster.clone(), &config());
    let kinds = BTreeSet::from([cluster_role_kind()]);

    let outcome = collector.collect(&owner(), &BTreeSet::new(), &kinds, false).await;

    assert_eq!(outcome.stale, BTreeSet::from([role.clone()]));
    assert_eq!(outcome.removed, outcome.stale);
    assert!(outcome.failures.is_empty());
    assert!(cluster.object(&role).is_none());
}

#[tokio::test]
async fn dry_run_reports_without_deleting() {
    let cluster = cluster();
    let role = seed(&cluster, CLUSTER_ROLE, Some(&owner()));
    let before = cluster.snapshot();
    let collector = StaleCollector::new(cluster.clone(), &config());

    let outcome = collector
        .collect(&owner(), &BTreeSet::new(), &BTreeSet::from([cluster_role_kind()]), true)
        .await;

    assert_eq!(outcome.stale, BTreeSet::from([role]));
    assert!(outcome.removed.is_empty());
    assert_eq!(cluster.calls(Operation::Delete), 0);
    assert_eq!(cluster.snapshot(), before);
}

#[tokio::test]
async fn desired_resources_are_kept() {
    let cluster = cluster();
    let role = seed(&cluster, CLUSTER_ROLE, Some(&owner()));
    let collector = StaleCollector::new(cluster.clone(), &config());

    let outcome = collector
        .collect(
            &owner(),
            &BTreeSet::from([role.clone()]),
            &BTreeSet::from([cluster_role_kind()]),
            false,
        )
        .await;

    assert!(outcome.stale.is_empty());
    assert!(cluster.object(&role).is_some());
}

#[tokio::test]
async fn foreign_and_partially_labelled_objects_are_never_collected() {
    let cluster = cluster();
    seed(&cluster, CLUSTER_ROLE, Some(&other_owner()));
    let mut partial = addon_engine::resource::parse_document(
        &CLUSTER_ROLE.replace("policy-reader", "policy-writer"),
    )
    .unwrap()
    .remove(0);
    let mut labels = owner().selector();
    labels.remove(addon_engine::resource::REFERENCE_NAMESPACE_LABEL);
    partial.metadata.labels = Some(labels);
    cluster.seed(partial).unwrap();
    seed(&cluster, &CLUSTER_ROLE.replace("policy-reader", "unlabelled"), None);

    let collector = StaleCollector::new(cluster.clone(), &config());
    let outcome = collector
        .collect(&owner(), &BTreeSet::new(), &BTreeSet::from([cluster_role_kind()]), false)
        .await;

    assert!(outcome.stale.is_empty());
    assert_eq!(cluster.calls(Operation::Delete), 0);
    assert_eq!(cluster.identities().len(), 3);
}

#[tokio::test]
async fn empty_kind_set_collects_nothing() {
    let cluster = cluster();
    seed(&cluster, CLUSTER_ROLE, Some(&owner()));
    let collector = StaleCollector::new(cluster.clone(), &config());

    let outcome = collector.collect(&owner(), &BTreeSet::new(), &BTreeSet::new(), false).await;

    assert!(outcome.stale.is_empty());
    assert_eq!(cluster.calls(Operation::List), 0);
}

#[tokio::test]
async fn kinds_not_previously_deployed_are_not_scanned() {
    let cluster = cluster();
    let account = seed(
        &cluster,
        &SERVICE_ACCOUNT.replace("name: policy-agent", "name: policy-agent\n  namespace: policies"),
        Some(&owner()),
    );
    let collector = StaleCollector::new(cluster.clone(), &config());

    let outcome = collector
        .collect(&owner(), &BTreeSet::new(), &BTreeSet::from([cluster_role_kind()]), false)
        .await;

    assert!(outcome.stale.is_empty());
    assert!(cluster.object(&account).is_some());
}

#[tokio::test]
async fn one_failed_delete_does_not_block_the_rest() {
    let cluster = cluster();
    let stuck = seed(&cluster, CLUSTER_ROLE, Some(&owner()));
    let gone = seed(&cluster, &CLUSTER_ROLE.replace("policy-reader", "policy-admin"), Some(&owner()));
    cluster.fail_object(
        stuck.clone(),
        Operation::Delete,
        ClusterError::Rejected {
            code: 403,
            message: "forbidden".to_string(),
        },
    );
    let collector = StaleCollector::new(cluster.clone(), &config());

    let outcome = collector
        .collect(&owner(), &BTreeSet::new(), &BTreeSet::from([cluster_role_kind()]), false)
        .await;

    assert_eq!(outcome.stale.len(), 2);
    assert_eq!(outcome.removed, BTreeSet::from([gone]));
    assert_eq!(outcome.remaining(), BTreeSet::from([stuck.clone()]));
    assert!(matches!(
        &outcome.failures[..],
        [StaleFailure::Delete { identity, .. }] if *identity == stuck
    ));
}

#[tokio::test]
async fn unserved_kinds_are_skipped_and_list_failures_recorded() {
    let cluster = cluster();
    let widget = ResourceKind::new("example.dev", "v1", "Widget");
    let config_map = ResourceKind::new("", "v1", "ConfigMap");
    cluster.fail_kind(
        config_map.clone(),
        Operation::List,
        ClusterError::Transient("etcd leader changed".to_string()),
    );
    let collector = StaleCollector::new(cluster.clone(), &config());

    let outcome = collector
        .collect(&owner(), &BTreeSet::new(), &BTreeSet::from([widget, config_map.clone()]), false)
        .await;

    assert!(outcome.is_partial());
    assert!(matches!(
        &outcome.failures[..],
        [StaleFailure::List { kind, .. }] if *kind == config_map
    ));
}

#[tokio::test]
async fn untyped_list_items_are_still_collected() {
    let cluster = cluster();
    let role = seed(&cluster, CLUSTER_ROLE, Some(&owner()));
    let kept = seed(&cluster, &CLUSTER_ROLE.replace("policy-reader", "policy-admin"), Some(&owner()));
    let collector = StaleCollector::new(Arc::new(UntypedListing(cluster.clone())), &config());

    let outcome = collector
        .collect(
            &owner(),
            &BTreeSet::from([kept.clone()]),
            &BTreeSet::from([cluster_role_kind()]),
            false,
        )
        .await;

    assert_eq!(outcome.stale, BTreeSet::from([role.clone()]));
    assert_eq!(outcome.removed, outcome.stale);
    assert!(cluster.object(&role).is_none());
    assert!(cluster.object(&kept).is_some());
}
