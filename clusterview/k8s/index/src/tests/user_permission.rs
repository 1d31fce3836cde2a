use super::*;
use crate::{
    user_permission::{ADMIN_ROLE, DISCOVERABLE_LABEL, VIEW_ROLE},
    PermissionCache, PermissionListers, UserPermissionView,
};
use clusterview_core::{Error, EventStream};
use clusterview_k8s_api::{
    cluster_permission::{self as cp, ClusterPermissionSpec},
    ClusterBinding, ClusterPermission, Role, RoleBinding, UserPermission, ACTION_API_GROUP,
    VIEW_API_GROUP,
};
use maplit::{btreemap, convert_args};
use tokio_test::{assert_pending, task};

struct PermissionTest {
    cluster_roles: SharedStore<ClusterRole>,
    cluster_role_bindings: SharedStore<ClusterRoleBinding>,
    roles: SharedStore<Role>,
    role_bindings: SharedStore<RoleBinding>,
    clusters: SharedStore<ManagedCluster>,
    cluster_permissions: SharedStore<ClusterPermission>,
    cache: Arc<PermissionCache>,
    view: UserPermissionView,
    _tracing: tracing::subscriber::DefaultGuard,
}

impl PermissionTest {
    fn new(clusters: &[&str]) -> Self {
        let _tracing = init_tracing();
        let cluster_roles = synced_store::<ClusterRole>("clusterroles");
        let cluster_role_bindings = synced_store::<ClusterRoleBinding>("clusterrolebindings");
        let roles = synced_store::<Role>("roles");
        let role_bindings = synced_store::<RoleBinding>("rolebindings");
        let cluster_store = synced_store::<ManagedCluster>("managedclusters");
        let cluster_permissions = synced_store::<ClusterPermission>("clusterpermissions");
        for c in clusters {
            apply(&cluster_store, mk_cluster(c, NO_LABELS));
        }

        let cache = Arc::new(PermissionCache::new(PermissionListers {
            cluster_roles: cluster_roles.clone(),
            cluster_role_bindings: cluster_role_bindings.clone(),
            roles: roles.clone(),
            role_bindings: role_bindings.clone(),
            clusters: cluster_store.clone(),
            cluster_permissions: cluster_permissions.clone(),
        }));
        let view = UserPermissionView::new(cache.clone());
        Self {
            cluster_roles,
            cluster_role_bindings,
            roles,
            role_bindings,
            clusters: cluster_store,
            cluster_permissions,
            cache,
            view,
            _tracing,
        }
    }

    fn sync(&self) -> Outcome {
        self.cache
            .synchronize()
            .expect("reconciliation must succeed")
    }

    fn list(&self, user: &UserInfo) -> Vec<UserPermission> {
        self.view
            .list(user, &Selector::default())
            .expect("list must succeed")
    }

    fn roles(&self, user: &UserInfo) -> Vec<String> {
        self.list(user)
            .iter()
            .filter_map(|p| p.metadata.name.clone())
            .collect()
    }
}

fn view_rule() -> PolicyRule {
    mk_rule(&[VIEW_API_GROUP], &["managedclusterviews"], &["create"], &[])
}

fn action_rule() -> PolicyRule {
    mk_rule(&[ACTION_API_GROUP], &["managedclusteractions"], &["create"], &[])
}

fn mk_role(ns: &str, name: &str, rules: impl IntoIterator<Item = PolicyRule>) -> Role {
    Role {
        metadata: mk_meta(Some(ns), name, NO_LABELS),
        rules: Some(rules.into_iter().collect()),
    }
}

fn mk_role_binding(
    ns: &str,
    name: &str,
    role_ref: RoleRef,
    subjects: impl IntoIterator<Item = Subject>,
) -> RoleBinding {
    RoleBinding {
        metadata: mk_meta(Some(ns), name, NO_LABELS),
        role_ref,
        subjects: Some(subjects.into_iter().collect()),
    }
}

fn discoverable_role(name: &str) -> ClusterRole {
    mk_labeled_cluster_role(
        name,
        [(DISCOVERABLE_LABEL, "true"), ("tier", "ops")],
        [mk_rule(&["apps"], &["deployments"], &["get", "list"], &[])],
    )
}

fn mk_cluster_permission(ns: &str, name: &str, spec: ClusterPermissionSpec) -> ClusterPermission {
    ClusterPermission {
        metadata: mk_meta(Some(ns), name, NO_LABELS),
        spec,
    }
}

fn cp_subject(kind: &str, name: &str) -> cp::Subject {
    cp::Subject {
        kind: kind.to_string(),
        name: name.to_string(),
        ..Default::default()
    }
}

fn cp_cluster_role(name: &str) -> cp::RoleRef {
    cp::RoleRef {
        api_group: Some("rbac.authorization.k8s.io".to_string()),
        kind: "ClusterRole".to_string(),
        name: name.to_string(),
    }
}

#[test]
fn designated_role_binding_in_cluster_namespace() {
    let test = PermissionTest::new(&["c1"]);
    apply(&test.roles, mk_role("c1", "viewer", [view_rule()]));
    apply(
        &test.role_bindings,
        mk_role_binding(
            "c1",
            "bX",
            mk_role_ref("Role", "viewer"),
            [user_subject("alice")],
        ),
    );
    assert_eq!(
        test.sync(),
        Outcome::Updated {
            users: 1,
            groups: 0
        }
    );

    let permissions = test.list(&user("alice"));
    assert_eq!(permissions.len(), 1);
    let p = &permissions[0];
    assert_eq!(p.metadata.name.as_deref(), Some(VIEW_ROLE));
    assert_eq!(p.status.bindings, [ClusterBinding::cluster_scoped("c1")]);
    assert_eq!(p.status.cluster_role_definition.rules, [view_rule()]);

    assert!(test.list(&user("bob")).is_empty());
}

#[test]
fn designated_cluster_role_binding_covers_every_cluster() {
    let test = PermissionTest::new(&["c1", "c2"]);
    apply(
        &test.cluster_roles,
        mk_cluster_role("cluster-admin", [mk_rule(&["*"], &["*"], &["*"], &[])]),
    );
    apply(
        &test.cluster_role_bindings,
        mk_binding("admins", "cluster-admin", [group_subject("admins")]),
    );
    test.sync();

    let admins = UserInfo::from_groups(["admins"]);
    assert_eq!(test.roles(&admins), [ADMIN_ROLE, VIEW_ROLE]);
    let admin = test.view.get(&admins, ADMIN_ROLE).unwrap();
    assert_eq!(
        admin.status.bindings,
        [
            ClusterBinding::cluster_scoped("c1"),
            ClusterBinding::cluster_scoped("c2"),
        ]
    );
}

#[test]
fn cluster_role_via_role_binding() {
    let test = PermissionTest::new(&["c1", "c2"]);
    apply(&test.cluster_roles, mk_cluster_role("actor", [action_rule()]));
    apply(
        &test.role_bindings,
        mk_role_binding(
            "c2",
            "act",
            mk_role_ref("ClusterRole", "actor"),
            [Subject {
                kind: "ServiceAccount".to_string(),
                name: "agent".to_string(),
                ..Default::default()
            }],
        ),
    );
    test.sync();

    let agent = user("system:serviceaccount:c2:agent");
    let p = test.view.get(&agent, ADMIN_ROLE).unwrap();
    assert_eq!(p.status.bindings, [ClusterBinding::cluster_scoped("c2")]);
    assert_eq!(
        test.view.get(&agent, VIEW_ROLE).unwrap_err(),
        Error::forbidden("userpermissions", VIEW_ROLE)
    );
}

#[test]
fn bindings_outside_cluster_namespaces_are_ignored() {
    let test = PermissionTest::new(&["c1"]);
    apply(&test.roles, mk_role("default", "viewer", [view_rule()]));
    apply(
        &test.role_bindings,
        mk_role_binding(
            "default",
            "b",
            mk_role_ref("Role", "viewer"),
            [user_subject("alice")],
        ),
    );
    apply(&test.cluster_roles, discoverable_role("reader"));
    apply(
        &test.cluster_permissions,
        mk_cluster_permission(
            "default",
            "reader",
            ClusterPermissionSpec {
                cluster_role_binding: Some(cp::ClusterRoleBindingSpec {
                    subject: Some(cp_subject("User", "alice")),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ),
    );
    test.sync();

    assert!(test.list(&user("alice")).is_empty());
}

#[test]
fn undesignated_grants_are_ignored() {
    let test = PermissionTest::new(&["c1"]);
    apply(
        &test.roles,
        mk_role(
            "c1",
            "getter",
            [mk_rule(&[VIEW_API_GROUP], &["managedclusterviews"], &["get"], &[])],
        ),
    );
    apply(
        &test.role_bindings,
        mk_role_binding(
            "c1",
            "b",
            mk_role_ref("Role", "getter"),
            [user_subject("alice")],
        ),
    );
    // Dangling references are skipped.
    apply(
        &test.role_bindings,
        mk_role_binding(
            "c1",
            "dangling",
            mk_role_ref("Role", "missing"),
            [user_subject("alice")],
        ),
    );
    test.sync();

    assert!(test.list(&user("alice")).is_empty());
}

#[test]
fn cluster_permission_scopes() {
    let test = PermissionTest::new(&["c1", "c2"]);
    apply(&test.cluster_roles, discoverable_role("reader"));
    apply(
        &test.cluster_permissions,
        mk_cluster_permission(
            "c1",
            "whole-cluster",
            ClusterPermissionSpec {
                cluster_role_bindings: Some(vec![cp::ClusterRoleBindingSpec {
                    role_ref: Some(cp_cluster_role("reader")),
                    subjects: Some(vec![cp_subject("User", "alice")]),
                    ..Default::default()
                }]),
                ..Default::default()
            },
        ),
    );
    apply(
        &test.cluster_permissions,
        mk_cluster_permission(
            "c2",
            "some-namespaces",
            ClusterPermissionSpec {
                role_bindings: Some(vec![
                    cp::RoleBindingSpec {
                        namespace: "ns-b".to_string(),
                        role_ref: cp_cluster_role("reader"),
                        subject: Some(cp_subject("Group", "devs")),
                        ..Default::default()
                    },
                    cp::RoleBindingSpec {
                        namespace: "ns-a".to_string(),
                        role_ref: cp_cluster_role("reader"),
                        subject: Some(cp_subject("User", "alice")),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            },
        ),
    );
    test.sync();

    let p = test
        .view
        .get(&UserInfo::new("alice", ["devs"]), "reader")
        .unwrap();
    assert_eq!(
        p.status.bindings,
        [
            ClusterBinding::cluster_scoped("c1"),
            ClusterBinding::namespaced("c2", ["ns-a", "ns-b"]),
        ]
    );
    let labels = p.metadata.labels.as_ref().expect("role labels must be copied");
    assert_eq!(labels.get("tier").map(String::as_str), Some("ops"));
    assert_eq!(p.status.cluster_role_definition.rules.len(), 1);

    let devs = test
        .view
        .get(&UserInfo::from_groups(["devs"]), "reader")
        .unwrap();
    assert_eq!(
        devs.status.bindings,
        [ClusterBinding::namespaced("c2", ["ns-b"])]
    );
    assert_ne!(devs.resource_version(), p.resource_version());
}

#[test]
fn cluster_permission_role_defaults_to_its_name() {
    let test = PermissionTest::new(&["c1"]);
    apply(&test.cluster_roles, discoverable_role("reader"));
    apply(
        &test.cluster_permissions,
        mk_cluster_permission(
            "c1",
            "reader",
            ClusterPermissionSpec {
                cluster_role_binding: Some(cp::ClusterRoleBindingSpec {
                    subject: Some(cp_subject("User", "alice")),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ),
    );
    test.sync();

    assert_eq!(test.roles(&user("alice")), ["reader"]);
}

#[test]
fn undiscoverable_roles_are_ignored() {
    let test = PermissionTest::new(&["c1"]);
    apply(
        &test.cluster_roles,
        mk_cluster_role(
            "hidden",
            [mk_rule(&["apps"], &["deployments"], &["get"], &[])],
        ),
    );
    apply(
        &test.cluster_roles,
        mk_labeled_cluster_role(
            "disabled",
            [(DISCOVERABLE_LABEL, "false")],
            [mk_rule(&["apps"], &["deployments"], &["get"], &[])],
        ),
    );
    let bind = |role: &str| cp::ClusterRoleBindingSpec {
        role_ref: Some(cp_cluster_role(role)),
        subject: Some(cp_subject("User", "alice")),
        ..Default::default()
    };
    apply(
        &test.cluster_permissions,
        mk_cluster_permission(
            "c1",
            "cp",
            ClusterPermissionSpec {
                cluster_role_bindings: Some(vec![bind("hidden"), bind("disabled")]),
                ..Default::default()
            },
        ),
    );
    test.sync();

    assert!(test.list(&user("alice")).is_empty());
}

#[test]
fn custom_discoverable_label() {
    let test = PermissionTest::new(&["c1"]);
    let cache = Arc::new(
        PermissionCache::new(PermissionListers {
            cluster_roles: test.cluster_roles.clone(),
            cluster_role_bindings: test.cluster_role_bindings.clone(),
            roles: test.roles.clone(),
            role_bindings: test.role_bindings.clone(),
            clusters: test.clusters.clone(),
            cluster_permissions: test.cluster_permissions.clone(),
        })
        .with_discoverable_label("example.com/visible"),
    );
    apply(
        &test.cluster_roles,
        mk_labeled_cluster_role("reader", [("example.com/visible", "true")], None),
    );
    apply(
        &test.cluster_permissions,
        mk_cluster_permission(
            "c1",
            "reader",
            ClusterPermissionSpec {
                cluster_role_binding: Some(cp::ClusterRoleBindingSpec {
                    subject: Some(cp_subject("User", "alice")),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ),
    );
    cache.synchronize().unwrap();
    test.sync();

    let view = UserPermissionView::new(cache);
    assert_eq!(
        view.get(&user("alice"), "reader").unwrap().status.bindings,
        [ClusterBinding::cluster_scoped("c1")]
    );
    assert!(test.list(&user("alice")).is_empty());
}

#[test]
fn list_filters_on_role_labels() {
    let test = PermissionTest::new(&["c1"]);
    apply(&test.cluster_roles, discoverable_role("reader"));
    apply(&test.cluster_roles, mk_cluster_role("viewer", [view_rule()]));
    apply(
        &test.cluster_role_bindings,
        mk_binding("viewers", "viewer", [user_subject("alice")]),
    );
    apply(
        &test.cluster_permissions,
        mk_cluster_permission(
            "c1",
            "reader",
            ClusterPermissionSpec {
                cluster_role_binding: Some(cp::ClusterRoleBindingSpec {
                    subject: Some(cp_subject("User", "alice")),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ),
    );
    test.sync();

    assert_eq!(test.roles(&user("alice")), [VIEW_ROLE, "reader"]);
    let ops = Selector::from_map(convert_args!(btreemap!("tier" => "ops")));
    let listed = test.view.list(&user("alice"), &ops).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].metadata.name.as_deref(), Some("reader"));
}

#[test]
fn irrelevant_changes_skip_reconciliation() {
    let test = PermissionTest::new(&["c1"]);
    apply(&test.roles, mk_role("c1", "viewer", [view_rule()]));
    apply(
        &test.role_bindings,
        mk_role_binding(
            "c1",
            "b",
            mk_role_ref("Role", "viewer"),
            [user_subject("alice")],
        ),
    );
    assert!(matches!(test.sync(), Outcome::Updated { .. }));
    assert_eq!(test.sync(), Outcome::Skipped);

    apply(&test.cluster_roles, mk_cluster_role("unrelated", None));
    apply(
        &test.role_bindings,
        mk_role_binding(
            "default",
            "b",
            mk_role_ref("Role", "viewer"),
            [user_subject("bob")],
        ),
    );
    assert_eq!(test.sync(), Outcome::Skipped);
    assert_eq!(test.cache.metrics().reconcile_skips(), 2);

    delete_namespaced(&test.role_bindings, "c1", "b");
    assert!(matches!(test.sync(), Outcome::Updated { .. }));
    assert!(test.list(&user("alice")).is_empty());
}

#[tokio::test]
async fn watch_follows_permission_changes() {
    let test = PermissionTest::new(&["c1", "c2"]);
    apply(&test.cluster_roles, mk_cluster_role("viewer", [view_rule()]));
    test.sync();

    let watch = test.view.watch(&user("alice"), true).unwrap();
    assert!(watch.initial().is_empty());
    let mut events = task::spawn(watch.results());
    assert_pending!(events.poll_next());

    let mut observed = Vec::new();
    let mut observe = |events: &mut task::Spawn<EventStream<UserPermission>>| {
        while let std::task::Poll::Ready(Some(ev)) = events.poll_next() {
            let bindings = ev
                .object()
                .map(|p| p.status.bindings.len())
                .unwrap_or_default();
            observed.push((ev.type_name(), bindings));
        }
    };

    let bind = |ns: &str| {
        mk_role_binding(
            ns,
            "view",
            mk_role_ref("ClusterRole", "viewer"),
            [user_subject("alice")],
        )
    };
    apply(&test.role_bindings, bind("c1"));
    test.sync();
    observe(&mut events);

    apply(&test.role_bindings, bind("c2"));
    test.sync();
    observe(&mut events);

    delete_namespaced(&test.role_bindings, "c1", "view");
    delete_namespaced(&test.role_bindings, "c2", "view");
    test.sync();
    observe(&mut events);

    assert_eq!(observed, [("ADDED", 1), ("MODIFIED", 2), ("DELETED", 0)]);
    assert_eq!(test.cache.watcher_count(), 1);
    drop(events);
    assert_eq!(test.cache.watcher_count(), 0);
}

#[tokio::test]
async fn role_definition_changes_reach_watchers() {
    let test = PermissionTest::new(&["c1"]);
    apply(&test.cluster_roles, discoverable_role("reader"));
    apply(
        &test.cluster_permissions,
        mk_cluster_permission(
            "c1",
            "readers",
            ClusterPermissionSpec {
                cluster_role_bindings: Some(vec![cp::ClusterRoleBindingSpec {
                    role_ref: Some(cp_cluster_role("reader")),
                    subjects: Some(vec![cp_subject("User", "alice")]),
                    ..Default::default()
                }]),
                ..Default::default()
            },
        ),
    );
    test.sync();

    let mut events = task::spawn(test.view.watch(&user("alice"), true).unwrap().results());
    let next = |events: &mut task::Spawn<EventStream<UserPermission>>| {
        let mut ready = Vec::new();
        while let std::task::Poll::Ready(Some(ev)) = events.poll_next() {
            ready.push(ev);
        }
        ready
    };
    let initial = next(&mut events);
    assert_eq!(initial.len(), 1);
    assert_eq!(initial[0].type_name(), "ADDED");

    // The bindings are unchanged; only the role's rules are.
    let mut reader = discoverable_role("reader");
    reader.metadata.resource_version = Some("2".to_string());
    reader.rules = Some(vec![mk_rule(&["*"], &["*"], &["*"], &[])]);
    apply(&test.cluster_roles, reader.clone());
    assert!(matches!(test.sync(), Outcome::Updated { .. }));

    let changed = next(&mut events);
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].type_name(), "MODIFIED");
    let p = changed[0].object().expect("modified events carry the permission");
    assert_eq!(p.status.cluster_role_definition.rules[0].verbs, ["*"]);

    // Labels are part of the object too.
    reader.metadata.resource_version = Some("3".to_string());
    reader
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert("tier".to_string(), "platform".to_string());
    apply(&test.cluster_roles, reader);
    test.sync();

    let changed = next(&mut events);
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].type_name(), "MODIFIED");
    let labels = changed[0]
        .object()
        .and_then(|p| p.metadata.labels.as_ref())
        .expect("role labels must be copied");
    assert_eq!(labels.get("tier").map(String::as_str), Some("platform"));
    assert_pending!(events.poll_next());
}
