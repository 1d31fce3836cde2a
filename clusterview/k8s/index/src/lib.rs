//! Authorization-scoped resource caches
//!
//! The caches answer two questions for an authenticated caller: which resources of a kind may the
//! caller discover, and how do changes to those resources or to RBAC reach the caller's open
//! watches. They are built from in-memory registries that are fed by Kubernetes watches:
//!
//! - A [`Store`] holds a single resource kind and is read through the [`Lister`] trait.
//! - An [`AuthCache`] periodically projects `ClusterRoleBinding`s and their `ClusterRole`s onto
//!   the names of a registry, maintaining a [`SubjectIndex`] of the names each user and group may
//!   see. After each reconciliation it notifies registered watchers.
//! - A [`PermissionCache`] synthesizes `UserPermission` records from role bindings and
//!   `ClusterPermission`s.
//! - A [`ResourceView`] serves list, get and watch requests for one kind on behalf of a caller.
//!
//! ```text
//! [ Registry ] ─┐
//! [ Roles ]    ─┼─> [ AuthCache ] ─(membership changes)─> [ Watcher ] ─> caller stream
//! [ Bindings ] ─┘         │
//!                         └─> [ SubjectIndex ] ─> list / get
//! ```

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod auth_cache;
pub mod cluster;
pub mod metrics;
pub mod rbac;
pub mod store;
pub mod subject_index;
pub mod user_permission;
pub mod view;
pub mod watcher;


pub use self::{
    auth_cache::{run, AuthCache, Outcome, Synchronize},
    cluster::{ClusterSetView, ClusterView},
    metrics::{CacheMetrics, CacheStats, MetricsFamilies},
    rbac::{ReadableNames, RuleResolver, Target},
    store::{Lister, SharedStore, Store},
    subject_index::{SubjectIndex, SubjectKind},
    user_permission::{PermissionCache, PermissionListers, UserPermissionView},
    view::{RegistryView, ResourceView, ViewedResource},
    watcher::{StopHandle, Watch},
};

/// An ordered set of resource names.
pub type NameSet = std::collections::BTreeSet<String>;
