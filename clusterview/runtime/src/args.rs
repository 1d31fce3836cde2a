use crate::{
    api::Api,
    index::{
        self, metrics::register_stats, AuthCache, CacheStats, ClusterSetView, ClusterView,
        MetricsFamilies, PermissionCache, PermissionListers, Store, UserPermissionView,
        ViewedResource,
    },
    k8s::{self, Client, Resource},
};
use anyhow::{bail, Result};
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "clusterview",
    about = "Serves managed cluster resources scoped to each caller's RBAC grants"
)]
pub struct Args {
    #[clap(long, default_value = "clusterview=info,warn", env = "CLUSTERVIEW_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the HTTP read API server.
    #[clap(long)]
    api_disabled: bool,

    /// How often each cache is reconciled against its inputs.
    #[clap(long, default_value = "5000")]
    reconcile_period_ms: u64,

    /// The number of events buffered for a watcher before it is dropped.
    #[clap(long, default_value = "1000")]
    watch_queue_capacity: usize,

    /// The label that marks cluster roles as discoverable user permissions.
    #[clap(long, default_value = index::user_permission::DISCOVERABLE_LABEL)]
    discoverable_role_label: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            api_disabled,
            reconcile_period_ms,
            watch_queue_capacity,
            discoverable_role_label,
        } = self;

        let server = if api_disabled { None } else { Some(server) };
        let reconcile_period = Duration::from_millis(reconcile_period_ms);

        // Registries fed by the resource watches below.
        let cluster_roles = Store::<k8s::ClusterRole>::shared("clusterroles");
        let cluster_role_bindings = Store::<k8s::ClusterRoleBinding>::shared("clusterrolebindings");
        let roles = Store::<k8s::Role>::shared("roles");
        let role_bindings = Store::<k8s::RoleBinding>::shared("rolebindings");
        let clusters = Store::<k8s::ManagedCluster>::shared("managedclusters");
        let cluster_sets = Store::<k8s::ManagedClusterSet>::shared("managedclustersets");
        let cluster_permissions = Store::<k8s::ClusterPermission>::shared("clusterpermissions");

        let mut prom = <Registry>::default();
        let index_metrics = prom.sub_registry_with_prefix("index");
        let families = MetricsFamilies::register(index_metrics);

        let clusters_cache = Arc::new(
            AuthCache::new(
                <k8s::ManagedCluster as ViewedResource>::KIND,
                <k8s::ManagedCluster as ViewedResource>::TARGET,
                cluster_roles.clone(),
                cluster_role_bindings.clone(),
                clusters.clone(),
            )
            .with_metrics(families.metrics(<k8s::ManagedCluster as ViewedResource>::KIND))
            .with_queue_capacity(watch_queue_capacity),
        );
        let cluster_sets_cache = Arc::new(
            AuthCache::new(
                <k8s::ManagedClusterSet as ViewedResource>::KIND,
                <k8s::ManagedClusterSet as ViewedResource>::TARGET,
                cluster_roles.clone(),
                cluster_role_bindings.clone(),
                cluster_sets.clone(),
            )
            .with_metrics(families.metrics(<k8s::ManagedClusterSet as ViewedResource>::KIND))
            .with_queue_capacity(watch_queue_capacity),
        );
        let permissions_cache = Arc::new(
            PermissionCache::new(PermissionListers {
                cluster_roles: cluster_roles.clone(),
                cluster_role_bindings: cluster_role_bindings.clone(),
                roles: roles.clone(),
                role_bindings: role_bindings.clone(),
                clusters: clusters.clone(),
                cluster_permissions: cluster_permissions.clone(),
            })
            .with_discoverable_label(discoverable_role_label)
            .with_metrics(families.metrics(index::user_permission::KIND))
            .with_queue_capacity(watch_queue_capacity),
        );
        let stats: Vec<Arc<dyn CacheStats>> = vec![
            clusters_cache.clone(),
            cluster_sets_cache.clone(),
            permissions_cache.clone(),
        ];
        register_stats(index_metrics, stats);

        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        // Spawn resource watches.

        let watches = runtime.watch_all::<k8s::ClusterRole>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(cluster_roles, watches).instrument(info_span!("clusterroles")),
        );

        let watches = runtime.watch_all::<k8s::ClusterRoleBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(cluster_role_bindings, watches)
                .instrument(info_span!("clusterrolebindings")),
        );

        let watches = runtime.watch_all::<k8s::Role>(watcher::Config::default());
        tokio::spawn(kubert::index::namespaced(roles, watches).instrument(info_span!("roles")));

        let watches = runtime.watch_all::<k8s::RoleBinding>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(role_bindings, watches)
                .instrument(info_span!("rolebindings")),
        );

        let watches = runtime.watch_all::<k8s::ManagedCluster>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(clusters, watches).instrument(info_span!("managedclusters")),
        );

        let watches = runtime.watch_all::<k8s::ManagedClusterSet>(watcher::Config::default());
        tokio::spawn(
            kubert::index::cluster(cluster_sets, watches)
                .instrument(info_span!("managedclustersets")),
        );

        if api_resource_exists::<k8s::ClusterPermission>(&runtime.client()).await {
            let watches = runtime.watch_all::<k8s::ClusterPermission>(watcher::Config::default());
            tokio::spawn(
                kubert::index::namespaced(cluster_permissions, watches)
                    .instrument(info_span!("clusterpermissions")),
            );
        } else {
            tracing::warn!(
                "clusterpermissions.rbac.open-cluster-management.io resource kind not found, skipping watches"
            );
            kubert::index::IndexNamespacedResource::reset(
                &mut *cluster_permissions.write(),
                Vec::new(),
                Default::default(),
            );
        }

        // Spawn the reconcilers.

        info!(period = ?reconcile_period, "starting reconcilers");
        tokio::spawn(
            index::run(
                clusters_cache.clone(),
                reconcile_period,
                shutdown(runtime.shutdown_handle()),
            )
            .instrument(info_span!("managedclusters_cache")),
        );
        tokio::spawn(
            index::run(
                cluster_sets_cache.clone(),
                reconcile_period,
                shutdown(runtime.shutdown_handle()),
            )
            .instrument(info_span!("managedclustersets_cache")),
        );
        tokio::spawn(
            index::run(
                permissions_cache.clone(),
                reconcile_period,
                shutdown(runtime.shutdown_handle()),
            )
            .instrument(info_span!("userpermissions_cache")),
        );

        let api = Api::new(
            Arc::new(ClusterView::new(clusters_cache)),
            Arc::new(ClusterSetView::new(cluster_sets_cache)),
            Arc::new(UserPermissionView::new(permissions_cache)),
            runtime.shutdown_handle(),
        );
        let runtime = runtime.spawn_server(move || api.clone());

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}

/// Completes when the process begins shutting down.
async fn shutdown(drain: drain::Watch) {
    let _ = drain.signaled().await;
}

async fn api_resource_exists<T>(client: &Client) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    client
        .list_api_group_resources(&T::api_version(&dt))
        .await
        .ok()
        .iter()
        .flat_map(|r| r.resources.iter())
        .any(|r| r.kind == T::kind(&dt))
}
