//! Generic access to the target cluster.
//!
//! [`ClusterClient`] is the only way the engine reads or writes cluster
//! state. All calls are generic over [`DynamicObject`] and addressed by
//! [`ResourceIdentity`] or [`ResourceKind`].
//!
//! - [`KubeClusterClient`] talks to a real API server through `kube`.
//! - [`InMemoryCluster`] is a deterministic stand-in used by tests and
//!   offline dry runs.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;

use crate::error::ClusterError;
use crate::resource::{ResourceIdentity, ResourceKind};

pub mod kube_client;
pub mod memory;

pub use kube_client::KubeClusterClient;
pub use memory::{InMemoryCluster, Operation};

/// What the API server knows about a kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindInfo {
    pub plural: String,
    pub namespaced: bool,
}

/// Capability-typed client over arbitrary resource kinds.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Look up how the API server serves `kind`.
    async fn resolve(&self, kind: &ResourceKind) -> Result<KindInfo, ClusterError>;

    /// Fetch an object, `None` if it does not exist.
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<DynamicObject>, ClusterError>;

    async fn create(
        &self,
        id: &ResourceIdentity,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    /// Replace an object. `object` carries the live resource version.
    async fn update(
        &self,
        id: &ResourceIdentity,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError>;

    async fn delete(&self, id: &ResourceIdentity) -> Result<(), ClusterError>;

    /// List objects of `kind` across all namespaces carrying every label in
    /// `selector`.
    async fn list(
        &self,
        kind: &ResourceKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, ClusterError>;
}

/// Run a cluster call with an upper bound on its duration.
///
/// # Errors
///
/// Returns the call's own error, or [`ClusterError::Timeout`] when the bound
/// elapses first.
pub async fn bounded<T, F>(timeout: Duration, call: F) -> Result<T, ClusterError>
where
    F: Future<Output = Result<T, ClusterError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| ClusterError::Timeout(timeout))?
}

/// Render a label map as a `k=v,k=v` selector string.
#[must_use]
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}
