//! Synthesizes `UserPermission` records from RBAC evidence.
//!
//! Three sources contribute to a caller's permissions:
//!
//! - `RoleBinding`s in a managed cluster's namespace, and `ClusterRoleBinding`s, that grant
//!   `create` on `managedclusteractions` or `managedclusterviews`. These are reported under the
//!   synthetic `open-cluster-management:admin` and `open-cluster-management:view` roles.
//! - `ClusterPermission`s in a managed cluster's namespace that bind discoverable cluster roles.
//!
//! A cluster role is discoverable when it carries the discoverable label or when its rules grant
//! one of the designated resources.

use crate::{
    auth_cache::{Outcome, Synchronize},
    metrics::{CacheMetrics, CacheStats},
    rbac::{verb_matches, Subjects, Target},
    store::Lister,
    subject_index::{SubjectKind, VisibleNames},
    view::ResourceView,
    watcher::{self, MembershipChange, Watch, WatchSource, WatcherList, DEFAULT_QUEUE_CAPACITY},
    NameSet,
};
use ahash::{AHashMap as HashMap, RandomState};
use clusterview_core::{Error, UserInfo};
use clusterview_k8s_api::{
    labels::Map, ClusterBinding, ClusterPermission, ClusterRole, ClusterRoleBinding,
    ManagedCluster, PolicyRule, ResourceExt, Role, RoleBinding, Selector, UserPermission,
    ACTION_API_GROUP, VIEW_API_GROUP,
};
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use std::{
    collections::{BTreeMap, BTreeSet},
    hash::{BuildHasher, Hash, Hasher},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

pub const KIND: &str = "userpermissions";

pub const ADMIN_ROLE: &str = "open-cluster-management:admin";
pub const VIEW_ROLE: &str = "open-cluster-management:view";

pub const DISCOVERABLE_LABEL: &str = "clusterview.open-cluster-management.io/discoverable";

const DESIGNATED_VERB: &str = "create";

const DESIGNATED: [Designated; 2] = [
    Designated {
        role: ADMIN_ROLE,
        target: Target::new(ACTION_API_GROUP, "managedclusteractions"),
    },
    Designated {
        role: VIEW_ROLE,
        target: Target::new(VIEW_API_GROUP, "managedclusterviews"),
    },
];

/// A resource whose `create` grant confers a synthetic role.
struct Designated {
    role: &'static str,
    target: Target,
}

/// The registries a `PermissionCache` reads.
pub struct PermissionListers {
    pub cluster_roles: Arc<dyn Lister<ClusterRole>>,
    pub cluster_role_bindings: Arc<dyn Lister<ClusterRoleBinding>>,
    pub roles: Arc<dyn Lister<Role>>,
    pub role_bindings: Arc<dyn Lister<RoleBinding>>,
    pub clusters: Arc<dyn Lister<ManagedCluster>>,
    pub cluster_permissions: Arc<dyn Lister<ClusterPermission>>,
}

/// Maps subjects to the roles they hold on each managed cluster.
#[derive(Debug, Default)]
pub struct PermissionIndex {
    users: HashMap<String, RoleGrants>,
    groups: HashMap<String, RoleGrants>,
    roles: BTreeMap<String, RoleDefinition>,
}

/// Bindings by role name and then by cluster name.
type RoleGrants = BTreeMap<String, BTreeMap<String, ClusterBinding>>;

#[derive(Clone, Debug, Default)]
struct RoleDefinition {
    rules: Vec<PolicyRule>,
    labels: Map,
}

/// A role held by a set of subjects on a set of clusters.
#[derive(Debug)]
struct Evidence {
    role: String,
    bindings: Vec<ClusterBinding>,
    subjects: Subjects,
}

struct Collected {
    content_hash: u64,
    roles: BTreeMap<String, RoleDefinition>,
    evidence: Vec<Evidence>,
}

pub struct PermissionCache {
    listers: PermissionListers,
    discoverable_label: String,

    index: RwLock<PermissionIndex>,
    watchers: Arc<WatcherList<PermissionIndex>>,

    /// The content hash of the last reconciled inputs. Also serializes reconciliations.
    state: Mutex<Option<u64>>,
    synced: AtomicBool,

    metrics: CacheMetrics,
    queue_capacity: usize,
}

/// Serves `UserPermission` records.
pub struct UserPermissionView {
    cache: Arc<PermissionCache>,
    source: Arc<PermissionSource>,
}

struct PermissionSource;

// === impl Designated ===

impl Designated {
    fn rules(&self) -> Vec<PolicyRule> {
        vec![PolicyRule {
            api_groups: Some(vec![self.target.group.to_string()]),
            resources: Some(vec![self.target.resource.to_string()]),
            verbs: vec![DESIGNATED_VERB.to_string()],
            ..Default::default()
        }]
    }
}

/// Returns the synthetic roles conferred by the rules.
fn designated_roles<'r>(rules: impl IntoIterator<Item = &'r PolicyRule>) -> Vec<&'static str> {
    let rules = rules.into_iter().collect::<Vec<_>>();
    DESIGNATED
        .iter()
        .filter(|d| {
            rules
                .iter()
                .any(|r| d.target.matches(r) && verb_matches(r, DESIGNATED_VERB))
        })
        .map(|d| d.role)
        .collect()
}

fn content_hasher() -> impl Hasher {
    RandomState::with_seeds(
        0x6f63_6d2d_7669_6577,
        0x7573_6572_7065_726d,
        0x636c_7573_7465_7273,
        0x6469_7363_6f76_6572,
    )
    .build_hasher()
}

// === impl RoleDefinition ===

impl Hash for RoleDefinition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for rule in &self.rules {
            rule.api_groups.hash(state);
            rule.resources.hash(state);
            rule.resource_names.hash(state);
            rule.non_resource_urls.hash(state);
            rule.verbs.hash(state);
        }
        self.labels.hash(state);
    }
}

// === impl PermissionIndex ===

impl PermissionIndex {
    fn grant(&mut self, kind: SubjectKind, subject: &str, role: &str, binding: ClusterBinding) {
        let subjects = match kind {
            SubjectKind::User => &mut self.users,
            SubjectKind::Group => &mut self.groups,
        };
        let clusters = subjects
            .entry(subject.to_string())
            .or_default()
            .entry(role.to_string())
            .or_default();
        match clusters.get_mut(&binding.cluster) {
            Some(existing) => existing.merge(binding),
            None => {
                clusters.insert(binding.cluster.clone(), binding);
            }
        }
    }

    /// Merges the user's and its groups' bindings for a role into a single record.
    pub fn permission(&self, user: &UserInfo, role: &str) -> Option<UserPermission> {
        let mut merged = BTreeMap::<String, ClusterBinding>::new();
        let grants = self
            .users
            .get(&user.name)
            .into_iter()
            .chain(user.groups.iter().filter_map(|g| self.groups.get(g)))
            .filter_map(|grants| grants.get(role));
        for clusters in grants {
            for (cluster, binding) in clusters {
                match merged.get_mut(cluster) {
                    Some(existing) => existing.merge(binding.clone()),
                    None => {
                        merged.insert(cluster.clone(), binding.clone());
                    }
                }
            }
        }
        if merged.is_empty() {
            return None;
        }

        let bindings = merged.into_values().collect::<Vec<_>>();
        let def = self.roles.get(role).cloned().unwrap_or_default();

        // The role's rules and labels are part of the object, so they are part of its version.
        let mut hasher = content_hasher();
        bindings.hash(&mut hasher);
        def.hash(&mut hasher);
        let version = format!("{:016x}", hasher.finish());

        let mut permission = UserPermission::new(role, version, def.rules, bindings);
        if !def.labels.is_empty() {
            permission.metadata.labels = Some(def.labels);
        }
        Some(permission)
    }

    pub fn users_len(&self) -> usize {
        self.users.len()
    }

    pub fn groups_len(&self) -> usize {
        self.groups.len()
    }
}

impl VisibleNames for PermissionIndex {
    fn visible_names(&self, user: &UserInfo) -> NameSet {
        let mut roles = self
            .users
            .get(&user.name)
            .map(|grants| grants.keys().cloned().collect::<NameSet>())
            .unwrap_or_default();
        for group in &user.groups {
            if let Some(grants) = self.groups.get(group) {
                roles.extend(grants.keys().cloned());
            }
        }
        roles
    }
}

// === impl PermissionCache ===

impl PermissionCache {
    pub fn new(listers: PermissionListers) -> Self {
        Self {
            listers,
            discoverable_label: DISCOVERABLE_LABEL.to_string(),
            index: RwLock::new(PermissionIndex::default()),
            watchers: Arc::new(WatcherList::default()),
            state: Mutex::new(None),
            synced: AtomicBool::new(false),
            metrics: CacheMetrics::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }

    pub fn with_discoverable_label(mut self, label: impl ToString) -> Self {
        self.discoverable_label = label.to_string();
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
        KIND
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

    fn is_labeled(&self, role: &ClusterRole) -> bool {
        role.labels()
            .get(&self.discoverable_label)
            .is_some_and(|v| v == "true")
    }

    /// Gathers the evidence that contributes to permissions, hashing the versions of every input
    /// that contributed.
    fn collect(&self) -> anyhow::Result<Collected> {
        let mut hasher = content_hasher();

        let clusters = self
            .listers
            .clusters
            .list()?
            .iter()
            .map(|c| c.name_any())
            .collect::<NameSet>();
        clusters.hash(&mut hasher);

        let mut roles = BTreeMap::new();
        let mut discoverable = BTreeSet::new();
        let mut designated_by_role = HashMap::<String, Vec<&'static str>>::new();
        for role in self.listers.cluster_roles.list()? {
            let name = role.name_any();
            let designated = designated_roles(role.rules.iter().flatten());
            if designated.is_empty() && !self.is_labeled(&role) {
                continue;
            }
            ("ClusterRole", name.as_str(), role.resource_version()).hash(&mut hasher);
            roles.insert(
                name.clone(),
                RoleDefinition {
                    rules: role.rules.clone().unwrap_or_default(),
                    labels: role.labels().clone(),
                },
            );
            discoverable.insert(name.clone());
            if !designated.is_empty() {
                designated_by_role.insert(name, designated);
            }
        }
        for d in &DESIGNATED {
            roles.insert(
                d.role.to_string(),
                RoleDefinition {
                    rules: d.rules(),
                    labels: Map::new(),
                },
            );
        }

        let mut evidence = Vec::new();

        for crb in self.listers.cluster_role_bindings.list()? {
            if crb.role_ref.kind != "ClusterRole" {
                continue;
            }
            let Some(designated) = designated_by_role.get(&crb.role_ref.name) else {
                continue;
            };
            let subjects = Subjects::from_rbac(crb.subjects.iter().flatten(), None);
            if subjects.is_empty() {
                continue;
            }
            ("ClusterRoleBinding", crb.name_any(), crb.resource_version()).hash(&mut hasher);
            for role in designated {
                evidence.push(Evidence {
                    role: role.to_string(),
                    bindings: clusters.iter().map(ClusterBinding::cluster_scoped).collect(),
                    subjects: subjects.clone(),
                });
            }
        }

        for rb in self.listers.role_bindings.list()? {
            let Some(ns) = rb.namespace() else {
                continue;
            };
            if !clusters.contains(&ns) {
                continue;
            }
            let designated = match rb.role_ref.kind.as_str() {
                "ClusterRole" => designated_by_role
                    .get(&rb.role_ref.name)
                    .cloned()
                    .unwrap_or_default(),
                "Role" => match self.listers.roles.get(Some(ns.as_str()), &rb.role_ref.name)? {
                    Some(role) => {
                        let designated = designated_roles(role.rules.iter().flatten());
                        if !designated.is_empty() {
                            ("Role", ns.as_str(), role.name_any(), role.resource_version())
                                .hash(&mut hasher);
                        }
                        designated
                    }
                    None => {
                        tracing::debug!(
                            namespace = %ns,
                            binding = %rb.name_any(),
                            role = %rb.role_ref.name,
                            "role not found"
                        );
                        continue;
                    }
                },
                kind => {
                    tracing::debug!(%kind, binding = %rb.name_any(), "skipping unsupported role kind");
                    continue;
                }
            };
            if designated.is_empty() {
                continue;
            }
            let subjects = Subjects::from_rbac(rb.subjects.iter().flatten(), Some(ns.as_str()));
            if subjects.is_empty() {
                continue;
            }
            ("RoleBinding", ns.as_str(), rb.name_any(), rb.resource_version()).hash(&mut hasher);
            for role in designated {
                evidence.push(Evidence {
                    role: role.to_string(),
                    bindings: vec![ClusterBinding::cluster_scoped(&ns)],
                    subjects: subjects.clone(),
                });
            }
        }

        for cp in self.listers.cluster_permissions.list()? {
            let Some(cluster) = cp.namespace() else {
                continue;
            };
            if !clusters.contains(&cluster) {
                continue;
            }
            let name = cp.name_any();
            let mut relevant = false;

            let cluster_role_bindings = cp
                .spec
                .cluster_role_binding
                .iter()
                .chain(cp.spec.cluster_role_bindings.iter().flatten());
            for crb in cluster_role_bindings {
                let role = match &crb.role_ref {
                    Some(role_ref) if role_ref.kind != "ClusterRole" => continue,
                    Some(role_ref) => role_ref.name.clone(),
                    None => name.clone(),
                };
                if !discoverable.contains(&role) {
                    continue;
                }
                let subjects = Subjects::from_cluster_permission(crb.subjects(), None);
                if subjects.is_empty() {
                    continue;
                }
                relevant = true;
                evidence.push(Evidence {
                    role,
                    bindings: vec![ClusterBinding::cluster_scoped(&cluster)],
                    subjects,
                });
            }

            for rb in cp.spec.role_bindings.iter().flatten() {
                if rb.role_ref.kind != "ClusterRole" || !discoverable.contains(&rb.role_ref.name) {
                    continue;
                }
                let subjects = Subjects::from_cluster_permission(rb.subjects(), Some(rb.namespace.as_str()));
                if subjects.is_empty() {
                    continue;
                }
                relevant = true;
                evidence.push(Evidence {
                    role: rb.role_ref.name.clone(),
                    bindings: vec![ClusterBinding::namespaced(&cluster, [&rb.namespace])],
                    subjects,
                });
            }

            if relevant {
                ("ClusterPermission", cluster.as_str(), name, cp.resource_version())
                    .hash(&mut hasher);
            }
        }

        Ok(Collected {
            content_hash: hasher.finish(),
            roles,
            evidence,
        })
    }
}

impl Synchronize for PermissionCache {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn synchronize(&self) -> anyhow::Result<Outcome> {
        let mut state = self.state.lock();

        let Collected {
            content_hash,
            roles,
            evidence,
        } = self.collect()?;
        if *state == Some(content_hash) {
            tracing::trace!(kind = KIND, content_hash, "inputs unchanged");
            self.metrics.reconcile_skips.inc();
            return Ok(Outcome::Skipped);
        }

        let mut next = PermissionIndex {
            roles,
            ..Default::default()
        };
        for Evidence {
            role,
            bindings,
            subjects,
        } in evidence
        {
            for binding in bindings {
                for user in &subjects.users {
                    next.grant(SubjectKind::User, user, &role, binding.clone());
                }
                for group in &subjects.groups {
                    next.grant(SubjectKind::Group, group, &role, binding.clone());
                }
            }
        }

        let mut index = self.index.write();
        let prior = std::mem::replace(&mut *index, next);
        let index = RwLockWriteGuard::downgrade(index);

        let mut notified = 0;
        for (user, grants) in index.users.iter() {
            let names = grants.keys().cloned().collect::<NameSet>();
            notified += self.watchers.notify(&MembershipChange {
                index: &*index,
                names: &names,
                users: std::slice::from_ref(user),
                groups: &[],
            });
        }
        for (group, grants) in index.groups.iter() {
            let names = grants.keys().cloned().collect::<NameSet>();
            notified += self.watchers.notify(&MembershipChange {
                index: &*index,
                names: &names,
                users: &[],
                groups: std::slice::from_ref(group),
            });
        }
        let empty = NameSet::new();
        for user in prior.users.keys().filter(|u| !index.users.contains_key(*u)) {
            notified += self.watchers.notify(&MembershipChange {
                index: &*index,
                names: &empty,
                users: std::slice::from_ref(user),
                groups: &[],
            });
        }
        for group in prior.groups.keys().filter(|g| !index.groups.contains_key(*g)) {
            notified += self.watchers.notify(&MembershipChange {
                index: &*index,
                names: &empty,
                users: &[],
                groups: std::slice::from_ref(group),
            });
        }

        let outcome = Outcome::Updated {
            users: index.users_len(),
            groups: index.groups_len(),
        };
        drop(index);

        tracing::debug!(kind = KIND, ?outcome, "reconciled");
        self.metrics.reconciles.inc();
        self.metrics.notifications.inc_by(notified as u64);
        *state = Some(content_hash);
        self.synced.store(true, Ordering::Release);
        Ok(outcome)
    }
}

impl CacheStats for PermissionCache {
    fn kind(&self) -> &'static str {
        KIND
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

impl std::fmt::Debug for PermissionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionCache")
            .field("discoverable_label", &self.discoverable_label)
            .finish_non_exhaustive()
    }
}

// === impl UserPermissionView ===

impl UserPermissionView {
    pub fn new(cache: Arc<PermissionCache>) -> Self {
        Self {
            cache,
            source: Arc::new(PermissionSource),
        }
    }

    pub fn cache(&self) -> &Arc<PermissionCache> {
        &self.cache
    }

    fn ensure_synced(&self) -> Result<(), Error> {
        if self.cache.is_synced() {
            Ok(())
        } else {
            Err(Error::NotSynced(KIND))
        }
    }
}

impl ResourceView for UserPermissionView {
    type Object = UserPermission;

    fn kind(&self) -> &'static str {
        KIND
    }

    fn list(&self, user: &UserInfo, selector: &Selector) -> Result<Vec<UserPermission>, Error> {
        self.ensure_synced()?;
        let index = self.cache.index.read();
        let empty = Map::new();
        Ok(index
            .visible_names(user)
            .iter()
            .filter_map(|role| index.permission(user, role))
            .filter(|p| selector.matches(p.metadata.labels.as_ref().unwrap_or(&empty)))
            .collect())
    }

    fn get(&self, user: &UserInfo, name: &str) -> Result<UserPermission, Error> {
        self.ensure_synced()?;
        self.cache
            .index
            .read()
            .permission(user, name)
            .ok_or_else(|| Error::forbidden(KIND, name))
    }

    fn convert_resource(&self, name: &str) -> UserPermission {
        UserPermission::new(name, "", Vec::new(), Vec::new())
    }

    fn watch(
        &self,
        user: &UserInfo,
        include_initial: bool,
    ) -> Result<Watch<UserPermission>, Error> {
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

// === impl PermissionSource ===

impl WatchSource for PermissionSource {
    type Index = PermissionIndex;
    type Object = UserPermission;

    fn fetch(
        &self,
        index: &PermissionIndex,
        user: &UserInfo,
        name: &str,
    ) -> Result<Option<UserPermission>, Error> {
        Ok(index.permission(user, name))
    }

    fn placeholder(&self, name: &str) -> UserPermission {
        UserPermission::new(name, "", Vec::new(), Vec::new())
    }

    fn resource_version(obj: &UserPermission) -> String {
        obj.resource_version().to_string()
    }
}
