use k8s_openapi::api::rbac::v1::PolicyRule;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};

pub const USER_PERMISSION_API_VERSION: &str = "clusterview.open-cluster-management.io/v1alpha1";
pub const USER_PERMISSION_KIND: &str = "UserPermission";

/// Describes a role a caller holds and the managed clusters on which it holds it.
///
/// These objects are never stored; they are synthesized per caller from RBAC evidence.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPermission {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub status: UserPermissionStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissionStatus {
    pub cluster_role_definition: ClusterRoleDefinition,
    pub bindings: Vec<ClusterBinding>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct ClusterRoleDefinition {
    pub rules: Vec<PolicyRule>,
}

/// A role's reach on a single managed cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterBinding {
    pub cluster: String,
    pub scope: BindingScope,
    pub namespaces: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum BindingScope {
    Cluster,
    Namespace,
}

// === impl UserPermission ===

impl UserPermission {
    pub fn new(
        name: impl ToString,
        resource_version: impl ToString,
        rules: Vec<PolicyRule>,
        bindings: Vec<ClusterBinding>,
    ) -> Self {
        Self {
            api_version: USER_PERMISSION_API_VERSION.to_string(),
            kind: USER_PERMISSION_KIND.to_string(),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                resource_version: Some(resource_version.to_string()),
                ..Default::default()
            },
            status: UserPermissionStatus {
                cluster_role_definition: ClusterRoleDefinition { rules },
                bindings,
            },
        }
    }

    pub fn resource_version(&self) -> &str {
        self.metadata.resource_version.as_deref().unwrap_or_default()
    }
}

// === impl ClusterBinding ===

impl ClusterBinding {
    /// A binding that applies to every namespace of the cluster.
    pub fn cluster_scoped(cluster: impl ToString) -> Self {
        Self {
            cluster: cluster.to_string(),
            scope: BindingScope::Cluster,
            namespaces: vec!["*".to_string()],
        }
    }

    pub fn namespaced(
        cluster: impl ToString,
        namespaces: impl IntoIterator<Item = impl ToString>,
    ) -> Self {
        let mut namespaces = namespaces
            .into_iter()
            .map(|ns| ns.to_string())
            .collect::<Vec<_>>();
        namespaces.sort();
        namespaces.dedup();
        Self {
            cluster: cluster.to_string(),
            scope: BindingScope::Namespace,
            namespaces,
        }
    }

    /// Folds another binding for the same cluster into this one.
    ///
    /// A cluster-scoped binding absorbs anything merged into it and replaces a namespace-scoped
    /// binding. Two namespace-scoped bindings union their namespaces.
    pub fn merge(&mut self, other: ClusterBinding) {
        debug_assert_eq!(self.cluster, other.cluster);
        match (self.scope, other.scope) {
            (BindingScope::Cluster, _) => {}
            (_, BindingScope::Cluster) => *self = other,
            (BindingScope::Namespace, BindingScope::Namespace) => {
                self.namespaces.extend(other.namespaces);
                self.namespaces.sort();
                self.namespaces.dedup();
            }
        }
    }
}
