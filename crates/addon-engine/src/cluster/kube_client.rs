//! [`ClusterClient`] backed by a Kubernetes API server.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::{self, Scope};
use kube::{Client, Config};
use tracing::{debug, instrument};

use super::{selector_string, ClusterClient, KindInfo};
use crate::config::EngineConfig;
use crate::error::ClusterError;
use crate::resource::{ResourceIdentity, ResourceKind};

/// Dynamic-object client for a single cluster.
///
/// Kind discovery results are cached for the lifetime of the client.
pub struct KubeClusterClient {
    client: Client,
    field_manager: String,
    kinds: DashMap<ResourceKind, (ApiResource, KindInfo)>,
}

impl KubeClusterClient {
    #[must_use]
    pub fn new(client: Client, config: &EngineConfig) -> Self {
        Self {
            client,
            field_manager: config.field_manager.clone(),
            kinds: DashMap::new(),
        }
    }

    /// Create a client from a kubeconfig file.
    ///
    /// # Errors
    ///
    /// Returns an error if the kubeconfig cannot be read or the client cannot be created.
    pub async fn from_kubeconfig(path: &Path, config: &EngineConfig) -> Result<Self, ClusterError> {
        let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
            ClusterError::Config(format!("failed to read kubeconfig {}: {e}", path.display()))
        })?;
        let kube_config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| ClusterError::Config(format!("invalid kubeconfig {}: {e}", path.display())))?;
        let client = Client::try_from(kube_config)?;
        Ok(Self::new(client, config))
    }

    /// Create a client from the in-cluster or default kubeconfig environment.
    ///
    /// # Errors
    ///
    /// Returns an error if no usable configuration is found.
    pub async fn try_default(config: &EngineConfig) -> Result<Self, ClusterError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, config))
    }

    async fn api_resource(&self, kind: &ResourceKind) -> Result<(ApiResource, KindInfo), ClusterError> {
        if let Some(cached) = self.kinds.get(kind) {
            return Ok(cached.value().clone());
        }

        let (resource, capabilities) = discovery::pinned_kind(&self.client, &kind.to_gvk())
            .await
            .map_err(|e| match e {
                kube::Error::Discovery(_) => ClusterError::UnknownKind(kind.to_string()),
                other => match ClusterError::from(other) {
                    ClusterError::NotFound(_) => ClusterError::UnknownKind(kind.to_string()),
                    classified => classified,
                },
            })?;

        let info = KindInfo {
            plural: resource.plural.clone(),
            namespaced: capabilities.scope == Scope::Namespaced,
        };
        debug!(kind = %kind, plural = %info.plural, namespaced = info.namespaced, "Discovered resource kind");
        self.kinds.insert(kind.clone(), (resource.clone(), info.clone()));
        Ok((resource, info))
    }

    async fn api_for(&self, id: &ResourceIdentity) -> Result<Api<DynamicObject>, ClusterError> {
        let (resource, info) = self.api_resource(&id.resource_kind()).await?;
        if info.namespaced && !id.namespace.is_empty() {
            Ok(Api::namespaced_with(self.client.clone(), &id.namespace, &resource))
        } else {
            Ok(Api::all_with(self.client.clone(), &resource))
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn resolve(&self, kind: &ResourceKind) -> Result<KindInfo, ClusterError> {
        self.api_resource(kind).await.map(|(_, info)| info)
    }

    #[instrument(skip(self), fields(resource = %id))]
    async fn get(&self, id: &ResourceIdentity) -> Result<Option<DynamicObject>, ClusterError> {
        let api = self.api_for(id).await?;
        Ok(api.get_opt(&id.name).await?)
    }

    #[instrument(skip(self, object), fields(resource = %id))]
    async fn create(
        &self,
        id: &ResourceIdentity,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let api = self.api_for(id).await?;
        Ok(api.create(&self.post_params(), object).await?)
    }

    #[instrument(skip(self, object), fields(resource = %id))]
    async fn update(
        &self,
        id: &ResourceIdentity,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClusterError> {
        let api = self.api_for(id).await?;
        Ok(api.replace(&id.name, &self.post_params(), object).await?)
    }

    #[instrument(skip(self), fields(resource = %id))]
    async fn delete(&self, id: &ResourceIdentity) -> Result<(), ClusterError> {
        let api = self.api_for(id).await?;
        api.delete(&id.name, &DeleteParams::background()).await?;
        Ok(())
    }

    #[instrument(skip(self, selector), fields(kind = %kind))]
    async fn list(
        &self,
        kind: &ResourceKind,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let (resource, _) = self.api_resource(kind).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &resource);
        let params = ListParams::default().labels(&selector_string(selector));
        Ok(api.list(&params).await?.items)
    }
}
