use crate::{
    metrics::{CacheMetrics, CacheStats},
    rbac::{resolve_rules, ReadableNames, RuleResolver, Subjects, Target},
    store::Lister,
    subject_index::{SubjectIndex, SubjectKind},
    watcher::{MembershipChange, WatcherList, DEFAULT_QUEUE_CAPACITY},
    NameSet,
};
use clusterview_core::UserInfo;
use clusterview_k8s_api::{ClusterRole, ClusterRoleBinding, ResourceExt};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::{
    collections::{BTreeMap, BTreeSet},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::time;

/// Projects a registry of resources onto the users and groups that may discover them.
///
/// The cache reads three listers: cluster roles, cluster role bindings and the registry itself.
/// Each call to [`AuthCache::synchronize`] rebuilds the subject index from their current contents
/// and notifies registered watchers of the result.
pub struct AuthCache<K> {
    kind: &'static str,
    target: Target,
    roles: Arc<dyn Lister<ClusterRole>>,
    bindings: Arc<dyn Lister<ClusterRoleBinding>>,
    pub(crate) registry: Arc<dyn Lister<K>>,
    resolver: Arc<dyn RuleResolver>,

    pub(crate) index: RwLock<SubjectIndex>,
    pub(crate) watchers: Arc<WatcherList<SubjectIndex>>,

    /// Serializes reconciliations.
    state: Mutex<SyncState>,

    /// Set once a reconciliation has completed.
    synced: AtomicBool,

    pub(crate) metrics: CacheMetrics,
    pub(crate) queue_capacity: usize,
}

#[derive(Debug, Default)]
struct SyncState {
    fingerprint: Option<String>,
    users: BTreeSet<String>,
    groups: BTreeSet<String>,
}

/// The result of a reconciliation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The inputs were unchanged since the last reconciliation.
    Skipped,
    Updated { users: usize, groups: usize },
}

/// A cache that is periodically reconciled.
pub trait Synchronize: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn synchronize(&self) -> anyhow::Result<Outcome>;
}

// === impl AuthCache ===

impl<K> AuthCache<K>
where
    K: ResourceExt + Send + Sync + 'static,
{
    pub fn new(
        kind: &'static str,
        target: Target,
        roles: Arc<dyn Lister<ClusterRole>>,
        bindings: Arc<dyn Lister<ClusterRoleBinding>>,
        registry: Arc<dyn Lister<K>>,
    ) -> Self {
        Self {
            kind,
            target,
            roles,
            bindings,
            registry,
            resolver: Arc::new(ReadableNames),
            index: RwLock::new(SubjectIndex::default()),
            watchers: Arc::new(WatcherList::default()),
            state: Mutex::new(SyncState::default()),
            synced: AtomicBool::new(false),
            metrics: CacheMetrics::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_resolver(mut self, resolver: impl RuleResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// The names visible to the user.
    pub fn lookup(&self, user: &UserInfo) -> NameSet {
        self.index.read().lookup(user)
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    fn fingerprint(&self) -> String {
        format!(
            "{}/{}/{}",
            self.roles.last_sync_resource_version(),
            self.bindings.last_sync_resource_version(),
            self.registry.last_sync_resource_version(),
        )
    }

    /// Resolves the names each subject is granted by the current bindings.
    fn grants(
        &self,
        known: &NameSet,
    ) -> anyhow::Result<(BTreeMap<String, NameSet>, BTreeMap<String, NameSet>)> {
        let mut by_user = BTreeMap::<String, NameSet>::new();
        let mut by_group = BTreeMap::<String, NameSet>::new();

        for binding in self.bindings.list()? {
            let name = binding.name_any();
            let role_ref = &binding.role_ref;
            if role_ref.kind != "ClusterRole" {
                tracing::debug!(binding = %name, kind = %role_ref.kind, "skipping unsupported role kind");
                continue;
            }
            let role = match self.roles.get(None, &role_ref.name)? {
                Some(role) => role,
                None => {
                    tracing::debug!(binding = %name, role = %role_ref.name, "role not found");
                    continue;
                }
            };

            let granted = resolve_rules(
                &*self.resolver,
                role.rules.iter().flatten(),
                &self.target,
            )
            .within(known);
            if granted.is_empty() {
                continue;
            }

            let Subjects { users, groups } =
                Subjects::from_rbac(binding.subjects.iter().flatten(), None);
            for user in users {
                by_user
                    .entry(user)
                    .or_default()
                    .extend(granted.iter().cloned());
            }
            for group in groups {
                by_group
                    .entry(group)
                    .or_default()
                    .extend(granted.iter().cloned());
            }
        }

        Ok((by_user, by_group))
    }
}

impl<K> Synchronize for AuthCache<K>
where
    K: ResourceExt + Send + Sync + 'static,
{
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn synchronize(&self) -> anyhow::Result<Outcome> {
        let mut state = self.state.lock();

        let fingerprint = self.fingerprint();
        if state.fingerprint.as_deref() == Some(fingerprint.as_str()) {
            tracing::trace!(kind = self.kind, %fingerprint, "inputs unchanged");
            self.metrics.reconcile_skips.inc();
            return Ok(Outcome::Skipped);
        }

        let known = self
            .registry
            .list()?
            .iter()
            .map(|r| r.name_any())
            .collect::<NameSet>();
        let (by_user, by_group) = self.grants(&known)?;

        let removed_users = state
            .users
            .iter()
            .filter(|u| !by_user.contains_key(*u))
            .cloned()
            .collect::<Vec<_>>();
        let removed_groups = state
            .groups
            .iter()
            .filter(|g| !by_group.contains_key(*g))
            .cloned()
            .collect::<Vec<_>>();

        let mut index = self.index.write();
        for (user, names) in &by_user {
            index.update(SubjectKind::User, user, names.clone());
        }
        for (group, names) in &by_group {
            index.update(SubjectKind::Group, group, names.clone());
        }
        for user in &removed_users {
            index.delete(SubjectKind::User, user);
        }
        for group in &removed_groups {
            index.delete(SubjectKind::Group, group);
        }

        // Watchers observe the new state while further writes are excluded.
        let index = RwLockWriteGuard::downgrade(index);
        let empty = NameSet::new();
        let mut notified = 0;
        for (user, names) in &by_user {
            notified += self.watchers.notify(&MembershipChange {
                index: &*index,
                names,
                users: std::slice::from_ref(user),
                groups: &[],
            });
        }
        for (group, names) in &by_group {
            notified += self.watchers.notify(&MembershipChange {
                index: &*index,
                names,
                users: &[],
                groups: std::slice::from_ref(group),
            });
        }
        for user in &removed_users {
            notified += self.watchers.notify(&MembershipChange {
                index: &*index,
                names: &empty,
                users: std::slice::from_ref(user),
                groups: &[],
            });
        }
        for group in &removed_groups {
            notified += self.watchers.notify(&MembershipChange {
                index: &*index,
                names: &empty,
                users: &[],
                groups: std::slice::from_ref(group),
            });
        }
        drop(index);

        tracing::debug!(
            kind = self.kind,
            users = by_user.len(),
            groups = by_group.len(),
            removed_users = removed_users.len(),
            removed_groups = removed_groups.len(),
            "reconciled"
        );
        self.metrics.reconciles.inc();
        self.metrics.notifications.inc_by(notified as u64);

        let outcome = Outcome::Updated {
            users: by_user.len(),
            groups: by_group.len(),
        };
        state.users = by_user.into_keys().collect();
        state.groups = by_group.into_keys().collect();
        state.fingerprint = Some(fingerprint);
        self.synced.store(true, Ordering::Release);
        Ok(outcome)
    }
}

impl<K> CacheStats for AuthCache<K>
where
    K: ResourceExt + Send + Sync + 'static,
{
    fn kind(&self) -> &'static str {
        self.kind
    }

    fn users_len(&self) -> usize {
        self.index.read().users_len()
    }

    fn groups_len(&self) -> usize {
        self.index.read().groups_len()
    }

    fn watchers_len(&self) -> usize {
        self.watchers.len()
    }
}

impl<K> std::fmt::Debug for AuthCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCache")
            .field("kind", &self.kind)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Reconciles the cache every `period` until `shutdown` completes.
///
/// Failures are logged and retried on the next tick.
pub async fn run<S>(cache: Arc<S>, period: time::Duration, shutdown: impl Future<Output = ()>)
where
    S: Synchronize + ?Sized,
{
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::debug!(kind = cache.kind(), "reconciler shutting down");
                return;
            }
            _ = interval.tick() => {}
        }

        if let Err(error) = cache.synchronize() {
            tracing::warn!(kind = cache.kind(), %error, "failed to reconcile");
        }
    }
}
