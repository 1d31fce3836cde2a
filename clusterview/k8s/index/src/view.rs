use crate::{
    auth_cache::AuthCache,
    rbac::Target,
    store::Lister,
    subject_index::SubjectIndex,
    watcher::{self, Watch, WatchSource},
};
use clusterview_core::{Error, UserInfo};
use clusterview_k8s_api::{ResourceExt, Selector};
use std::sync::Arc;

/// A caller-scoped view of one resource kind.
///
/// Every operation fails with `NotSynced` until the backing cache has been reconciled once.
pub trait ResourceView: Send + Sync + 'static {
    type Object;

    /// The plural resource name served by the view.
    fn kind(&self) -> &'static str;

    /// Lists the objects visible to the user that match the selector, ordered by name.
    fn list(&self, user: &UserInfo, selector: &Selector) -> Result<Vec<Self::Object>, Error>;

    /// Returns the object if it is visible to the user.
    ///
    /// Fails with `Forbidden` when the name is not visible or no longer exists.
    fn get(&self, user: &UserInfo, name: &str) -> Result<Self::Object, Error>;

    /// Builds a typed object carrying only a name.
    fn convert_resource(&self, name: &str) -> Self::Object;

    fn watch(&self, user: &UserInfo, include_initial: bool) -> Result<Watch<Self::Object>, Error>;
}

/// A cluster-scoped resource served through an [`AuthCache`].
pub trait ViewedResource: ResourceExt + Send + Sync + 'static {
    const KIND: &'static str;
    const TARGET: Target;

    fn placeholder(name: &str) -> Self;
}

/// Serves a registry of `K` through the subject index of an [`AuthCache`].
pub struct RegistryView<K> {
    cache: Arc<AuthCache<K>>,
    source: Arc<RegistrySource<K>>,
}

struct RegistrySource<K> {
    registry: Arc<dyn Lister<K>>,
}

// === impl RegistryView ===

impl<K: ViewedResource> RegistryView<K> {
    pub fn new(cache: Arc<AuthCache<K>>) -> Self {
        let source = Arc::new(RegistrySource {
            registry: cache.registry.clone(),
        });
        Self { cache, source }
    }

    pub fn cache(&self) -> &Arc<AuthCache<K>> {
        &self.cache
    }

    fn ensure_synced(&self) -> Result<(), Error> {
        if self.cache.is_synced() {
            Ok(())
        } else {
            Err(Error::NotSynced(K::KIND))
        }
    }
}

impl<K: ViewedResource> ResourceView for RegistryView<K> {
    type Object = Arc<K>;

    fn kind(&self) -> &'static str {
        K::KIND
    }

    fn list(&self, user: &UserInfo, selector: &Selector) -> Result<Vec<Arc<K>>, Error> {
        self.ensure_synced()?;
        let names = self.cache.lookup(user);
        let mut objects = Vec::with_capacity(names.len());
        for name in names {
            let obj = match self.cache.registry.get(None, &name)? {
                Some(obj) => obj,
                None => continue,
            };
            if selector.matches(obj.labels()) {
                objects.push(obj);
            }
        }
        Ok(objects)
    }

    fn get(&self, user: &UserInfo, name: &str) -> Result<Arc<K>, Error> {
        self.ensure_synced()?;
        if !self.cache.index.read().contains(user, name) {
            return Err(Error::forbidden(K::KIND, name));
        }
        self.cache
            .registry
            .get(None, name)?
            .ok_or_else(|| Error::forbidden(K::KIND, name))
    }

    fn convert_resource(&self, name: &str) -> Arc<K> {
        Arc::new(K::placeholder(name))
    }

    fn watch(&self, user: &UserInfo, include_initial: bool) -> Result<Watch<Arc<K>>, Error> {
        self.ensure_synced()?;
        let index = self.cache.index.read();
        watcher::start(
            &self.cache.watchers,
            self.source.clone(),
            &*index,
            user.clone(),
            include_initial,
            self.cache.queue_capacity,
            self.cache.metrics.watcher_overflows.clone(),
        )
    }
}

// === impl RegistrySource ===

impl<K: ViewedResource> WatchSource for RegistrySource<K> {
    type Index = SubjectIndex;
    type Object = Arc<K>;

    fn fetch(
        &self,
        _index: &SubjectIndex,
        _user: &UserInfo,
        name: &str,
    ) -> Result<Option<Arc<K>>, Error> {
        self.registry.get(None, name)
    }

    fn placeholder(&self, name: &str) -> Arc<K> {
        Arc::new(K::placeholder(name))
    }

    fn resource_version(obj: &Arc<K>) -> String {
        obj.resource_version().unwrap_or_default()
    }
}
