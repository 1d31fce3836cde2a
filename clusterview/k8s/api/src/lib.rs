#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod cluster_permission;
pub mod labels;
pub mod user_permission;

pub use self::{
    cluster::{ManagedCluster, ManagedClusterSet},
    cluster_permission::ClusterPermission,
    labels::Selector,
    user_permission::{BindingScope, ClusterBinding, UserPermission},
};
pub use k8s_openapi::api::{
    self,
    rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject},
};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    Client, Resource,
};

/// The api group of managed clusters and cluster sets.
pub const CLUSTER_API_GROUP: &str = "cluster.open-cluster-management.io";

/// The api group of `ManagedClusterAction` resources.
pub const ACTION_API_GROUP: &str = "action.open-cluster-management.io";

/// The api group of `ManagedClusterView` resources.
pub const VIEW_API_GROUP: &str = "view.open-cluster-management.io";
