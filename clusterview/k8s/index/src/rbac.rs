//! Helpers for interpreting RBAC rules and subjects.

use crate::NameSet;
use clusterview_k8s_api::{cluster_permission, PolicyRule, Subject};

/// The api group and resource a cache projects.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Target {
    pub group: &'static str,
    pub resource: &'static str,
}

/// The names a set of rules grants on a target.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Grant {
    pub names: NameSet,

    /// Set when a rule covers the target without a `resourceNames` restriction.
    pub all: bool,
}

/// Extracts the names a single rule grants on a target.
pub trait RuleResolver: Send + Sync + 'static {
    fn resolve(&self, rule: &PolicyRule, target: &Target) -> Grant;
}

/// Grants names through any rule carrying a read verb.
#[derive(Copy, Clone, Debug, Default)]
pub struct ReadableNames;

const READ_VERBS: [&str; 3] = ["get", "list", "watch"];

const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// Users and groups named by a binding's subjects.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subjects {
    pub users: Vec<String>,
    pub groups: Vec<String>,
}

// === impl Target ===

impl Target {
    pub const fn new(group: &'static str, resource: &'static str) -> Self {
        Self { group, resource }
    }

    /// Returns true when the rule names this target's api group and resource.
    pub fn matches(&self, rule: &PolicyRule) -> bool {
        api_group_matches(rule, self.group) && resource_matches(rule, self.resource)
    }
}

// === impl Grant ===

impl Grant {
    pub fn all() -> Self {
        Self {
            names: NameSet::new(),
            all: true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.names.is_empty()
    }

    fn extend(&mut self, other: Grant) {
        self.all |= other.all;
        self.names.extend(other.names);
    }

    /// Restricts the grant to the known names, expanding `all` to every known name.
    pub fn within(self, known: &NameSet) -> NameSet {
        if self.all {
            return known.clone();
        }
        self.names.intersection(known).cloned().collect()
    }
}

// === impl ReadableNames ===

impl RuleResolver for ReadableNames {
    fn resolve(&self, rule: &PolicyRule, target: &Target) -> Grant {
        if !target.matches(rule) {
            return Grant::default();
        }
        if !READ_VERBS.iter().any(|verb| verb_matches(rule, verb)) {
            return Grant::default();
        }

        match rule.resource_names.as_deref() {
            None | Some([]) => Grant::all(),
            Some(names) => Grant {
                names: names.iter().cloned().collect(),
                all: false,
            },
        }
    }
}

/// Unions the grants of every rule.
pub fn resolve_rules<'r>(
    resolver: &dyn RuleResolver,
    rules: impl IntoIterator<Item = &'r PolicyRule>,
    target: &Target,
) -> Grant {
    let mut grant = Grant::default();
    for rule in rules {
        grant.extend(resolver.resolve(rule, target));
        if grant.all {
            // Nothing more can be granted.
            return Grant::all();
        }
    }
    grant
}

pub fn api_group_matches(rule: &PolicyRule, group: &str) -> bool {
    rule.api_groups
        .iter()
        .flatten()
        .any(|g| g == "*" || g == group)
}

/// Matches a resource, ignoring `resource/subresource` entries.
pub fn resource_matches(rule: &PolicyRule, resource: &str) -> bool {
    rule.resources
        .iter()
        .flatten()
        .any(|r| r == "*" || r == resource)
}

pub fn verb_matches(rule: &PolicyRule, verb: &str) -> bool {
    rule.verbs.iter().any(|v| v == "*" || v == verb)
}

// === impl Subjects ===

impl Subjects {
    /// Translates RBAC subjects into user and group names.
    ///
    /// Service accounts are named as users of the form `system:serviceaccount:<ns>:<name>`. When a
    /// service account subject has no namespace, the binding's namespace is used.
    pub fn from_rbac<'s>(
        subjects: impl IntoIterator<Item = &'s Subject>,
        binding_ns: Option<&str>,
    ) -> Self {
        let mut this = Self::default();
        for s in subjects {
            this.push(&s.kind, &s.name, s.namespace.as_deref().or(binding_ns));
        }
        this
    }

    /// Translates the subjects of a `ClusterPermission` binding.
    pub fn from_cluster_permission<'s>(
        subjects: impl IntoIterator<Item = &'s cluster_permission::Subject>,
        binding_ns: Option<&str>,
    ) -> Self {
        let mut this = Self::default();
        for s in subjects {
            this.push(&s.kind, &s.name, s.namespace.as_deref().or(binding_ns));
        }
        this
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.groups.is_empty()
    }

    fn push(&mut self, kind: &str, name: &str, namespace: Option<&str>) {
        match kind {
            "User" => self.users.push(name.to_string()),
            "Group" => self.groups.push(name.to_string()),
            "ServiceAccount" => match namespace {
                Some(ns) => self
                    .users
                    .push(format!("{SERVICE_ACCOUNT_PREFIX}{ns}:{name}")),
                None => tracing::debug!(%name, "ignoring service account without a namespace"),
            },
            kind => tracing::debug!(%kind, %name, "ignoring unsupported subject kind"),
        }
    }
}
