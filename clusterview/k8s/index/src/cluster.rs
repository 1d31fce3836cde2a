use crate::{
    rbac::Target,
    view::{RegistryView, ViewedResource},
};
use clusterview_k8s_api::{ManagedCluster, ManagedClusterSet, ObjectMeta, CLUSTER_API_GROUP};

/// Serves managed clusters.
pub type ClusterView = RegistryView<ManagedCluster>;

/// Serves managed cluster sets.
pub type ClusterSetView = RegistryView<ManagedClusterSet>;

impl ViewedResource for ManagedCluster {
    const KIND: &'static str = "managedclusters";
    const TARGET: Target = Target::new(CLUSTER_API_GROUP, "managedclusters");

    fn placeholder(name: &str) -> Self {
        ManagedCluster {
            metadata: named(name),
            spec: Default::default(),
            status: None,
        }
    }
}

impl ViewedResource for ManagedClusterSet {
    const KIND: &'static str = "managedclustersets";
    const TARGET: Target = Target::new(CLUSTER_API_GROUP, "managedclustersets");

    fn placeholder(name: &str) -> Self {
        ManagedClusterSet {
            metadata: named(name),
            spec: Default::default(),
        }
    }
}

fn named(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        ..Default::default()
    }
}
