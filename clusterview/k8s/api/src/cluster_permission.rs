use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Grants subjects roles on the managed cluster named by the resource's namespace.
#[derive(Clone, Debug, Default, PartialEq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "rbac.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ClusterPermission",
    plural = "clusterpermissions",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPermissionSpec {
    pub cluster_role_binding: Option<ClusterRoleBindingSpec>,
    pub cluster_role_bindings: Option<Vec<ClusterRoleBindingSpec>>,
    pub role_bindings: Option<Vec<RoleBindingSpec>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRoleBindingSpec {
    pub name: Option<String>,

    /// When unset, the binding refers to the `ClusterRole` named after the `ClusterPermission`.
    pub role_ref: Option<RoleRef>,
    pub subject: Option<Subject>,
    pub subjects: Option<Vec<Subject>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleBindingSpec {
    pub name: Option<String>,

    /// The namespace on the managed cluster in which the binding applies.
    pub namespace: String,
    pub role_ref: RoleRef,
    pub subject: Option<Subject>,
    pub subjects: Option<Vec<Subject>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

// === impl ClusterRoleBindingSpec ===

impl ClusterRoleBindingSpec {
    pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
        self.subject.iter().chain(self.subjects.iter().flatten())
    }
}

// === impl RoleBindingSpec ===

impl RoleBindingSpec {
    pub fn subjects(&self) -> impl Iterator<Item = &Subject> {
        self.subject.iter().chain(self.subjects.iter().flatten())
    }
}
