//! In-memory registries of Kubernetes resources.
//!
//! A `Store` is fed by a `kubert::index` task and read through the `Lister` trait. The caches never
//! watch the API server themselves; they only read snapshots of these stores.

use clusterview_core::Error;
use clusterview_k8s_api::ResourceExt;
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

pub type SharedStore<K> = Arc<RwLock<Store<K>>>;

/// Read access to a registry of resources of a single kind.
pub trait Lister<K>: Send + Sync {
    /// Returns every object in the registry, ordered by namespace and name.
    fn list(&self) -> Result<Vec<Arc<K>>, Error>;

    fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<Arc<K>>, Error>;

    /// An opaque version that changes whenever the registry's contents change.
    fn last_sync_resource_version(&self) -> String;
}

/// Holds the current state of a single resource kind.
#[derive(Debug)]
pub struct Store<K> {
    kind: &'static str,

    /// Set once the watch has delivered its initial list.
    synced: bool,

    /// Advanced on every change to `objects`.
    generation: u64,

    objects: BTreeMap<ResourceId, Arc<K>>,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    /// Empty for cluster-scoped resources.
    pub namespace: String,
    pub name: String,
}

// === impl Store ===

impl<K> Store<K> {
    pub fn shared(kind: &'static str) -> SharedStore<K> {
        Arc::new(RwLock::new(Self {
            kind,
            synced: false,
            generation: 0,
            objects: BTreeMap::new(),
        }))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }
}

impl<K: ResourceExt> Store<K> {
    fn insert(&mut self, resource: K) {
        let id = ResourceId::new(resource.namespace().unwrap_or_default(), resource.name_any());
        if let Some(prior) = self.objects.get(&id) {
            let version = resource.resource_version();
            if version.is_some() && prior.resource_version() == version {
                tracing::trace!(kind = self.kind, ns = %id.namespace, name = %id.name, "unchanged");
                return;
            }
        }
        tracing::trace!(kind = self.kind, ns = %id.namespace, name = %id.name, "applied");
        self.objects.insert(id, Arc::new(resource));
        self.generation += 1;
    }

    fn remove(&mut self, id: &ResourceId) {
        if self.objects.remove(id).is_some() {
            tracing::trace!(kind = self.kind, ns = %id.namespace, name = %id.name, "deleted");
            self.generation += 1;
        }
    }

    fn replace(&mut self, resources: Vec<K>) {
        let objects = resources
            .into_iter()
            .map(|r| {
                let id = ResourceId::new(r.namespace().unwrap_or_default(), r.name_any());
                (id, Arc::new(r))
            })
            .collect::<BTreeMap<_, _>>();
        tracing::debug!(kind = self.kind, size = objects.len(), "reset");
        self.objects = objects;
        self.synced = true;
        self.generation += 1;
    }
}

impl<K> kubert::index::IndexClusterResource<K> for Store<K>
where
    K: ResourceExt,
{
    fn apply(&mut self, resource: K) {
        self.insert(resource);
    }

    fn delete(&mut self, name: String) {
        self.remove(&ResourceId::new(String::new(), name));
    }

    fn reset(&mut self, resources: Vec<K>, _removed: kubert::index::ClusterRemoved) {
        self.replace(resources);
    }
}

impl<K> kubert::index::IndexNamespacedResource<K> for Store<K>
where
    K: ResourceExt,
{
    fn apply(&mut self, resource: K) {
        self.insert(resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.remove(&ResourceId::new(namespace, name));
    }

    fn reset(&mut self, resources: Vec<K>, _removed: kubert::index::NamespacedRemoved) {
        self.replace(resources);
    }
}

impl<K> Lister<K> for RwLock<Store<K>>
where
    K: Send + Sync,
{
    fn list(&self) -> Result<Vec<Arc<K>>, Error> {
        let store = self.read();
        if !store.synced {
            return Err(Error::NotSynced(store.kind));
        }
        Ok(store.objects.values().cloned().collect())
    }

    fn get(&self, namespace: Option<&str>, name: &str) -> Result<Option<Arc<K>>, Error> {
        let store = self.read();
        if !store.synced {
            return Err(Error::NotSynced(store.kind));
        }
        let id = ResourceId::new(namespace.unwrap_or_default().to_string(), name.to_string());
        Ok(store.objects.get(&id).cloned())
    }

    fn last_sync_resource_version(&self) -> String {
        self.read().generation.to_string()
    }
}

// === impl ResourceId ===

impl ResourceId {
    pub fn new(namespace: String, name: String) -> Self {
        Self { namespace, name }
    }
}
