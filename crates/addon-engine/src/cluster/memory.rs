//! In-memory [`ClusterClient`].
//!
//! Behaves like a minimal API server: objects get resource versions and uids,
//! stale resource versions are rejected on update, kinds are namespaced or
//! cluster scoped, and failures can be injected per object and operation.
//! [`InMemoryCluster::snapshot`] gives a byte-exact view of the stored state.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use kube::api::{DynamicObject, TypeMeta};

use super::{ClusterClient, KindInfo};
use crate::error::ClusterError;
use crate::resource::{ResourceIdentity, ResourceKind};

/// Client operations, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    Get,
    Create,
    Update,
    Delete,
    List,
}

#[derive(Default)]
struct State {
    kinds: BTreeMap<ResourceKind, KindInfo>,
    objects: BTreeMap<ResourceIdentity, DynamicObject>,
    next_version: u64,
    object_failures: BTreeMap<(ResourceIdentity, Operation), ClusterError>,
    kind_failures: BTreeMap<(ResourceKind, Operation), ClusterError>,
    calls: BTreeMap<Operation, usize>,
}

impl State {
    fn record(&mut self, op: Operation) {
        *self.calls.entry(op).or_default() += 1;
    }

    fn injected(&self, id: &ResourceIdentity, op: Operation) -> Result<(), ClusterError> {
        if let Some(err) = self.object_failures.get(&(id.clone(), op)) {
            return Err(err.clone());
        }
        if let Some(err) = self.kind_failures.get(&(id.resource_kind(), op)) {
            return Err(err.clone());
        }
        Ok(())
    }

    fn kind(&self, kind: &ResourceKind) -> Result<&KindInfo, ClusterError> {
        self.kinds
            .get(kind)
            .ok_or_else(|| ClusterError::UnknownKind(kind.to_string()))
    }

    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Normalize an incoming object to the identity it is stored under.
    fn admit(&self, id: &ResourceIdentity, object: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let kind = id.resource_kind();
        let info = self.kind(&kind)?;
        if info.namespaced == id.namespace.is_empty() {
            return Err(ClusterError::Rejected {
                code: 400,
                message: format!("{id}: namespace does not match the scope of {kind}"),
            });
        }
        let mut stored = object.clone();
        stored.types = Some(TypeMeta {
            api_version: kind.api_version(),
            kind: kind.kind.clone(),
        });
        stored.metadata.name = Some(id.name.clone());
        stored.metadata.namespace = (!id.namespace.is_empty()).then(|| id.namespace.clone());
        Ok(stored)
    }
}

/// Deterministic in-memory cluster.
pub struct InMemoryCluster {
    state: Mutex<State>,
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    /// A cluster serving the common built-in kinds.
    #[must_use]
    pub fn new() -> Self {
        let cluster = Self {
            state: Mutex::new(State::default()),
        };
        for (group, kind, plural, namespaced) in [
            ("", "Namespace", "namespaces", false),
            ("", "ConfigMap", "configmaps", true),
            ("", "Secret", "secrets", true),
            ("", "Service", "services", true),
            ("", "ServiceAccount", "serviceaccounts", true),
            ("", "Pod", "pods", true),
            ("apps", "Deployment", "deployments", true),
            ("apps", "StatefulSet", "statefulsets", true),
            ("apps", "DaemonSet", "daemonsets", true),
            ("rbac.authorization.k8s.io", "ClusterRole", "clusterroles", false),
            ("rbac.authorization.k8s.io", "ClusterRoleBinding", "clusterrolebindings", false),
            ("rbac.authorization.k8s.io", "Role", "roles", true),
            ("rbac.authorization.k8s.io", "RoleBinding", "rolebindings", true),
            ("networking.k8s.io", "NetworkPolicy", "networkpolicies", true),
            ("apiextensions.k8s.io", "CustomResourceDefinition", "customresourcedefinitions", false),
        ] {
            cluster.register_kind(ResourceKind::new(group, "v1", kind), plural, namespaced);
        }
        cluster
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serve an additional kind (e.g. a custom resource).
    pub fn register_kind(&self, kind: ResourceKind, plural: &str, namespaced: bool) {
        self.lock().kinds.insert(
            kind,
            KindInfo {
                plural: plural.to_string(),
                namespaced,
            },
        );
    }

    /// Store an object directly, bypassing failure injection and call counting.
    ///
    /// # Errors
    ///
    /// Returns an error if the object has no type/name or its kind is not served.
    pub fn seed(&self, object: DynamicObject) -> Result<ResourceIdentity, ClusterError> {
        let id = ResourceIdentity::of(&object)
            .ok_or_else(|| ClusterError::Serialization("object has no type or name".to_string()))?;
        let mut state = self.lock();
        let mut stored = state.admit(&id, &object)?;
        stored.metadata.resource_version = Some(state.bump());
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        state.objects.insert(id.clone(), stored);
        Ok(id)
    }

    #[must_use]
    pub fn object(&self, id: &ResourceIdentity) -> Option<DynamicObject> {
        self.lock().objects.get(id).cloned()
    }

    #[must_use]
    pub fn identities(&self) -> Vec<ResourceIdentity> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Make `op` on `id` fail with `error` until cleared.
    pub fn fail_object(&self, id: ResourceIdentity, op: Operation, error: ClusterError) {
        self.lock().object_failures.insert((id, op), error);
    }

    /// Make `op` on every object of `kind` (including `List`) fail with `error`.
    pub fn fail_kind(&self, kind: ResourceKind, op: Operation, error: ClusterError) {
        self.lock().kind_failures.insert((kind, op), error);
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.object_failures.clear();
        state.kind_failures.clear();
    }

    /// Number of calls made for `op`.
    #[must_use]
    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or_default()
    }

    /// Number of mutating calls made (create, update, delete).
    #[must_use]
    pub fn writes(&self) -> usize {
        [Operation::Create, Operation::Update, Operation::Delete]
            .into_iter()
            .map(|op| self.calls(op))
            .sum()
    }

    /// Serialized view of every stored object, in identity order.
    #[must_use]
    pub fn snapshot(&self) -> String {
        let state = self.lock();
        let objects: Vec<&DynamicObject> = state.objects.values().collect();
        serde_json::to_string(&objects).unwrap_or_default()
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn resolve(&self, kind: &ResourceKind) -> Result<KindInfo, ClusterError> {
        self.lock().kind(kind).cloned()
    }

    async fn get(&self, id: &ResourceIdentity) -> Result<Option<DynamicObject>, ClusterError> {
        let mut state = self.lock();
        state.record(Operation::Get);
        state.injected(id, Operation::Get)?;
        state.kind(&id.resource_kind())?;
        Ok(state.objects.get(id).cloned())
    }

    async fn create(
        &self,
        id: &ResourceIdentity,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let mut state = self.lock();
        state.record(Operation::Create);
        state.injected(id, Operation::Create)?;
        if state.objects.contains_key(id) {
            return Err(ClusterError::Transient(format!("{id} already exists")));
        }
        let mut stored = state.admit(id, object)?;
        stored.metadata.resource_version = Some(state.bump());
        stored.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        stored.metadata.generation = Some(1);
        state.objects.insert(id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        id: &ResourceIdentity,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let mut state = self.lock();
        state.record(Operation::Update);
        state.injected(id, Operation::Update)?;
        let live = state
            .objects
            .get(id)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))?;
        if let Some(version) = &object.metadata.resource_version {
            if live.metadata.resource_version.as_ref() != Some(version) {
                return Err(ClusterError::Transient(format!(
                    "{id}: the object has been modified"
                )));
            }
        }
        let mut stored = state.admit(id, object)?;
        stored.metadata.resource_version = Some(state.bump());
        stored.metadata.uid = live.metadata.uid;
        stored.metadata.generation = Some(live.metadata.generation.unwrap_or(1) + 1);
        state.objects.insert(id.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, id: &ResourceIdentity) -> Result<(), ClusterError> {
        let mut state = self.lock();
        state.record(Operation::Delete);
        state.injected(id, Operation::Delete)?;
        state
            .objects
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(id.to_string()))
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let mut state = self.lock();
        state.record(Operation::List);
        if let Some(err) = state.kind_failures.get(&(kind.clone(), Operation::List)) {
            return Err(err.clone());
        }
        state.kind(kind)?;
        Ok(state
            .objects
            .iter()
            .filter(|(id, _)| id.group == kind.group && id.version == kind.version && id.kind == kind.kind)
            .filter(|(_, object)| {
                let labels = object.metadata.labels.as_ref();
                selector
                    .iter()
                    .all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
            })
            .map(|(_, object)| object.clone())
            .collect())
    }
}
