//! Resource store abstraction used by the reconciliation engine.
//!
//! The engine only ever talks to a [`ResourceStore`]: fetch, create, and
//! update calls for a Synapse and its dependents, addressed by
//! (namespace, name). [`KubeStore`] backs it with the cluster API server;
//! [`MemoryStore`] is a process-local implementation for tests and dry
//! runs.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::Synapse;

/// Identity of a Synapse instance and its dependents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn from_meta(meta: &ObjectMeta) -> Self {
        Self {
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl From<&Synapse> for ResourceId {
    fn from(synapse: &Synapse) -> Self {
        Self {
            namespace: synapse.namespace().unwrap_or_default(),
            name: synapse.name_any(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Create raced with another writer. The reconciler treats this as
    /// success: the resource exists, which is all it wanted.
    #[error("resource already exists")]
    AlreadyExists,
    /// Optimistic-concurrency conflict on update. Retryable; the next pass
    /// re-reads and re-derives.
    #[error("resource version conflict")]
    Conflict,
    /// Update target disappeared between fetch and write. Retryable.
    #[error("resource not found")]
    NotFound,
    /// Any other API failure, transient from the engine's perspective.
    #[error(transparent)]
    Api(#[from] kube::Error),
}

/// Store calls the reconciliation engine needs. `get_*` return `Ok(None)`
/// for absent resources; absence is state, not an error.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_synapse(&self, id: &ResourceId) -> Result<Option<Synapse>, StoreError>;
    async fn get_secret(&self, id: &ResourceId) -> Result<Option<Secret>, StoreError>;
    async fn get_config_map(&self, id: &ResourceId) -> Result<Option<ConfigMap>, StoreError>;
    async fn get_deployment(&self, id: &ResourceId) -> Result<Option<Deployment>, StoreError>;

    async fn create_secret(&self, secret: Secret) -> Result<(), StoreError>;
    async fn create_config_map(&self, config_map: ConfigMap) -> Result<(), StoreError>;
    async fn create_deployment(&self, deployment: Deployment) -> Result<(), StoreError>;

    async fn update_config_map(&self, config_map: ConfigMap) -> Result<(), StoreError>;
}

/// [`ResourceStore`] backed by the cluster API server. Ownership links are
/// plain `ownerReferences`, so cascading deletion is the cluster garbage
/// collector's job.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl fmt::Debug for KubeStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeStore").finish_non_exhaustive()
    }
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn fetch<K>(&self, id: &ResourceId) -> Result<Option<K>, StoreError>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + fmt::Debug,
        K::DynamicType: Default,
    {
        Ok(self.api::<K>(&id.namespace).get_opt(&id.name).await?)
    }

    async fn create<K>(&self, resource: &K) -> Result<(), StoreError>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + fmt::Debug,
        K::DynamicType: Default,
    {
        let namespace = resource.namespace().unwrap_or_default();
        self.api::<K>(&namespace)
            .create(&PostParams::default(), resource)
            .await
            .map(drop)
            .map_err(|err| match err {
                kube::Error::Api(ref response) if response.code == 409 => {
                    StoreError::AlreadyExists
                }
                other => StoreError::Api(other),
            })
    }

    async fn replace<K>(&self, resource: &K) -> Result<(), StoreError>
    where
        K: kube::Resource<Scope = NamespaceResourceScope>
            + Clone
            + Serialize
            + DeserializeOwned
            + fmt::Debug,
        K::DynamicType: Default,
    {
        let namespace = resource.namespace().unwrap_or_default();
        self.api::<K>(&namespace)
            .replace(&resource.name_any(), &PostParams::default(), resource)
            .await
            .map(drop)
            .map_err(|err| match err {
                kube::Error::Api(ref response) if response.code == 409 => StoreError::Conflict,
                kube::Error::Api(ref response) if response.code == 404 => StoreError::NotFound,
                other => StoreError::Api(other),
            })
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_synapse(&self, id: &ResourceId) -> Result<Option<Synapse>, StoreError> {
        self.fetch(id).await
    }

    async fn get_secret(&self, id: &ResourceId) -> Result<Option<Secret>, StoreError> {
        self.fetch(id).await
    }

    async fn get_config_map(&self, id: &ResourceId) -> Result<Option<ConfigMap>, StoreError> {
        self.fetch(id).await
    }

    async fn get_deployment(&self, id: &ResourceId) -> Result<Option<Deployment>, StoreError> {
        self.fetch(id).await
    }

    async fn create_secret(&self, secret: Secret) -> Result<(), StoreError> {
        self.create(&secret).await
    }

    async fn create_config_map(&self, config_map: ConfigMap) -> Result<(), StoreError> {
        self.create(&config_map).await
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<(), StoreError> {
        self.create(&deployment).await
    }

    async fn update_config_map(&self, config_map: ConfigMap) -> Result<(), StoreError> {
        self.replace(&config_map).await
    }
}

/// Process-local [`ResourceStore`].
///
/// Used by the engine tests and for dry runs without a cluster. Unlike
/// Kubernetes there is no garbage collector here, so the ownership contract
/// is implemented explicitly: [`MemoryStore::delete_synapse`] sweeps every
/// dependent whose `ownerReferences` point at the deleted resource's uid.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    synapses: BTreeMap<ResourceId, Synapse>,
    secrets: BTreeMap<ResourceId, Secret>,
    config_maps: BTreeMap<ResourceId, ConfigMap>,
    deployments: BTreeMap<ResourceId, Deployment>,
    uid_counter: u64,
    mutations: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a Synapse resource, assigning a uid if it has
    /// none so owner references can link to it.
    pub fn put_synapse(&self, mut synapse: Synapse) {
        let mut inner = self.lock();
        if synapse.metadata.uid.is_none() {
            inner.uid_counter += 1;
            synapse.metadata.uid = Some(format!("uid-{}", inner.uid_counter));
        }
        inner.synapses.insert(ResourceId::from(&synapse), synapse);
    }

    /// Deletes a Synapse and sweeps all dependents it owns.
    pub fn delete_synapse(&self, id: &ResourceId) {
        let mut inner = self.lock();
        let Some(synapse) = inner.synapses.remove(id) else {
            return;
        };
        let uid = synapse.metadata.uid.unwrap_or_default();
        inner.secrets.retain(|_, s| !owned_by(&s.metadata, &uid));
        inner
            .config_maps
            .retain(|_, cm| !owned_by(&cm.metadata, &uid));
        inner
            .deployments
            .retain(|_, d| !owned_by(&d.metadata, &uid));
    }

    /// Number of writes (creates and updates) accepted so far. Lets tests
    /// assert that a converged state produces no further mutations.
    pub fn mutation_count(&self) -> u64 {
        self.lock().mutations
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

fn owned_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .iter()
        .flatten()
        .any(|oref| oref.uid == uid)
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_synapse(&self, id: &ResourceId) -> Result<Option<Synapse>, StoreError> {
        Ok(self.lock().synapses.get(id).cloned())
    }

    async fn get_secret(&self, id: &ResourceId) -> Result<Option<Secret>, StoreError> {
        Ok(self.lock().secrets.get(id).cloned())
    }

    async fn get_config_map(&self, id: &ResourceId) -> Result<Option<ConfigMap>, StoreError> {
        Ok(self.lock().config_maps.get(id).cloned())
    }

    async fn get_deployment(&self, id: &ResourceId) -> Result<Option<Deployment>, StoreError> {
        Ok(self.lock().deployments.get(id).cloned())
    }

    async fn create_secret(&self, secret: Secret) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let id = ResourceId::from_meta(&secret.metadata);
        if inner.secrets.contains_key(&id) {
            return Err(StoreError::AlreadyExists);
        }
        inner.secrets.insert(id, secret);
        inner.mutations += 1;
        Ok(())
    }

    async fn create_config_map(&self, config_map: ConfigMap) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let id = ResourceId::from_meta(&config_map.metadata);
        if inner.config_maps.contains_key(&id) {
            return Err(StoreError::AlreadyExists);
        }
        inner.config_maps.insert(id, config_map);
        inner.mutations += 1;
        Ok(())
    }

    async fn create_deployment(&self, deployment: Deployment) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let id = ResourceId::from_meta(&deployment.metadata);
        if inner.deployments.contains_key(&id) {
            return Err(StoreError::AlreadyExists);
        }
        inner.deployments.insert(id, deployment);
        inner.mutations += 1;
        Ok(())
    }

    async fn update_config_map(&self, config_map: ConfigMap) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let id = ResourceId::from_meta(&config_map.metadata);
        if !inner.config_maps.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        inner.config_maps.insert(id, config_map);
        inner.mutations += 1;
        Ok(())
    }
}
