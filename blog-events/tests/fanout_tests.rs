//! Cross-instance invalidation tests.
//!
//! Two engines share one store, as two processes would share a database.
//! Writes go through node A's admin; node B must stop answering from its
//! cache once the event reaches it. The last two tests break graph reloads
//! on purpose and check that announced users are still invalidated.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blog_events::{BusPublisher, EventBus, InvalidationHandler, MemoryEventBus, RbacEvent};
use blog_rbac::{
    AdminStore, HierarchyStore, HttpMethod, InMemoryRbacStore, Mutation, Permission,
    PermissionId, PermissionStore, RbacAdmin, RbacConfig, RbacEngine, RbacError, RbacResult, Role,
    RoleEdge, RoleId, User, UserDirectory, UserId,
};

struct Cluster {
    admin: RbacAdmin,
    node_b: Arc<RbacEngine>,
    bus: Arc<MemoryEventBus>,
}

async fn cluster() -> Cluster {
    let bus = Arc::new(MemoryEventBus::new());
    let store = Arc::new(InMemoryRbacStore::new());

    let node_a = Arc::new(RbacEngine::new(store.clone(), RbacConfig::default()).unwrap());
    let node_b = Arc::new(RbacEngine::new(store.clone(), RbacConfig::default()).unwrap());

    let admin = RbacAdmin::new(store, node_a.clone());
    let (publisher, _task) = BusPublisher::spawn(bus.clone(), "node-a");
    admin.subscribe(publisher);

    bus.register_handler(Arc::new(InvalidationHandler::new(node_a, "node-a")))
        .await
        .unwrap();
    bus.register_handler(Arc::new(InvalidationHandler::new(node_b.clone(), "node-b")))
        .await
        .unwrap();

    Cluster { admin, node_b, bus }
}

/// Poll until `check` holds or a second passes.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_revoke_reaches_other_node() {
    let c = cluster().await;
    let role = c.admin.create_role(Role::new("editor", "Editor")).unwrap().id;
    let p = c
        .admin
        .create_permission(Permission::new("post.create", "/api/v1/posts/", HttpMethod::Post))
        .unwrap()
        .id;
    c.admin.grant(role, p).unwrap();
    let user = User::new(1).with_role(role);
    c.admin.save_user(user.clone()).unwrap();

    // Warm node B's cache.
    assert!(c
        .node_b
        .has_permission(&user, "/api/v1/posts/", HttpMethod::Post)
        .unwrap());

    c.admin.revoke(role, p).unwrap();

    assert!(
        eventually(|| !c
            .node_b
            .has_permission(&user, "/api/v1/posts/", HttpMethod::Post)
            .unwrap())
        .await
    );
}

#[tokio::test]
async fn test_hierarchy_edit_reaches_other_node() {
    let c = cluster().await;
    let parent = c.admin.create_role(Role::new("admin", "Admin")).unwrap().id;
    let child = c.admin.create_role(Role::new("viewer", "Viewer")).unwrap().id;
    let p = c
        .admin
        .create_permission(Permission::new("role.create", "/api/v1/roles/", HttpMethod::Post))
        .unwrap()
        .id;
    c.admin.grant(parent, p).unwrap();
    let user = User::new(1).with_role(child);
    c.admin.save_user(user.clone()).unwrap();

    assert!(!c
        .node_b
        .has_permission(&user, "/api/v1/roles/", HttpMethod::Post)
        .unwrap());

    c.admin.add_hierarchy_edge(parent, child).unwrap();

    // Node B reloads its graph and drops the stale denial.
    assert!(
        eventually(|| c
            .node_b
            .has_permission(&user, "/api/v1/roles/", HttpMethod::Post)
            .unwrap())
        .await
    );
    assert!(c.node_b.role_graph().contains_edge(parent, child));
}

#[tokio::test]
async fn test_deleted_role_reaches_other_node() {
    let c = cluster().await;
    let role = c.admin.create_role(Role::new("editor", "Editor")).unwrap().id;
    let p = c
        .admin
        .create_permission(Permission::new("post.create", "/api/v1/posts/", HttpMethod::Post))
        .unwrap()
        .id;
    c.admin.grant(role, p).unwrap();
    c.admin.save_user(User::new(1).with_role(role)).unwrap();

    // A request still carrying the old user snapshot.
    let stale = User::new(1).with_role(role);
    assert!(c
        .node_b
        .has_permission(&stale, "/api/v1/posts/", HttpMethod::Post)
        .unwrap());

    c.admin.delete_role(role).unwrap();

    assert!(
        eventually(|| !c
            .node_b
            .has_permission(&stale, "/api/v1/posts/", HttpMethod::Post)
            .unwrap())
        .await
    );
    assert!(c.bus.stats().await.events_published >= 4);
}

/// Read-through view of a store whose edge list can be made unreadable.
struct FlakyEdges {
    inner: Arc<InMemoryRbacStore>,
    failing: AtomicBool,
}

impl FlakyEdges {
    fn new(inner: Arc<InMemoryRbacStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failing: AtomicBool::new(false),
        })
    }

    fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

impl PermissionStore for FlakyEdges {
    fn permission_by_id(&self, id: PermissionId) -> RbacResult<Permission> {
        self.inner.permission_by_id(id)
    }

    fn permission_by_api_and_method(
        &self,
        api_url: &str,
        method: HttpMethod,
    ) -> RbacResult<Permission> {
        self.inner.permission_by_api_and_method(api_url, method)
    }

    fn permission_by_code(&self, code: &str) -> RbacResult<Permission> {
        self.inner.permission_by_code(code)
    }

    fn active_permissions_for_role(&self, role: RoleId) -> RbacResult<Vec<Permission>> {
        self.inner.active_permissions_for_role(role)
    }

    fn active_permissions(&self) -> RbacResult<Vec<Permission>> {
        self.inner.active_permissions()
    }

    fn role_by_id(&self, id: RoleId) -> RbacResult<Role> {
        self.inner.role_by_id(id)
    }

    fn role_by_code(&self, code: &str) -> RbacResult<Role> {
        self.inner.role_by_code(code)
    }

    fn roles_linking(&self, permission: PermissionId) -> RbacResult<Vec<RoleId>> {
        self.inner.roles_linking(permission)
    }
}

impl HierarchyStore for FlakyEdges {
    fn hierarchy_edges(&self) -> RbacResult<Vec<RoleEdge>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RbacError::Store("hierarchy table unavailable".to_string()));
        }
        self.inner.hierarchy_edges()
    }

    fn insert_edge(&self, edge: RoleEdge) -> RbacResult<()> {
        self.inner.insert_edge(edge)
    }

    fn delete_edge(&self, edge: RoleEdge) -> RbacResult<bool> {
        self.inner.delete_edge(edge)
    }
}

impl UserDirectory for FlakyEdges {
    fn user_by_id(&self, id: UserId) -> RbacResult<User> {
        self.inner.user_by_id(id)
    }

    fn users_with_roles(&self, roles: &HashSet<RoleId>) -> RbacResult<Vec<UserId>> {
        self.inner.users_with_roles(roles)
    }

    fn users_referencing_role(&self, role: RoleId) -> RbacResult<Vec<UserId>> {
        self.inner.users_referencing_role(role)
    }

    fn users_referencing_permission(&self, permission: PermissionId) -> RbacResult<Vec<UserId>> {
        self.inner.users_referencing_permission(permission)
    }

    fn save_user(&self, user: User) -> RbacResult<()> {
        self.inner.save_user(user)
    }
}

#[tokio::test]
async fn test_failed_reload_still_drops_announced_users() {
    let store = Arc::new(InMemoryRbacStore::new());
    let flaky = FlakyEdges::new(store.clone());
    let engine = Arc::new(RbacEngine::new(flaky.clone(), RbacConfig::default()).unwrap());

    let role = store.create_role(Role::new("editor", "Editor")).unwrap().id;
    let other = store.create_role(Role::new("viewer", "Viewer")).unwrap().id;
    let p = store
        .create_permission(Permission::new("post.create", "/api/v1/posts/", HttpMethod::Post))
        .unwrap()
        .id;
    store.grant(role, p).unwrap();
    let user = User::new(1).with_role(role);
    store.save_user(user.clone()).unwrap();

    assert!(engine
        .has_permission(&user, "/api/v1/posts/", HttpMethod::Post)
        .unwrap());

    // Another instance revoked the grant and then edited the hierarchy;
    // this instance can no longer read the edge list.
    store.revoke(role, p).unwrap();
    flaky.fail();

    let handler = InvalidationHandler::new(engine.clone(), "node-b");
    let event = RbacEvent::new(
        Mutation::HierarchyChanged {
            parent: other,
            child: role,
        },
        &BTreeSet::from([1]),
    );
    assert!(handler.apply(&event).is_err());

    assert!(!engine
        .has_permission(&user, "/api/v1/posts/", HttpMethod::Post)
        .unwrap());
}

#[tokio::test]
async fn test_failed_local_refresh_still_publishes() {
    let bus = Arc::new(MemoryEventBus::new());
    let store = Arc::new(InMemoryRbacStore::new());
    let flaky = FlakyEdges::new(store.clone());

    let node_a = Arc::new(RbacEngine::new(flaky.clone(), RbacConfig::default()).unwrap());
    let node_b = Arc::new(RbacEngine::new(store.clone(), RbacConfig::default()).unwrap());

    let admin = RbacAdmin::new(store.clone(), node_a.clone());
    let (publisher, _task) = BusPublisher::spawn(bus.clone(), "node-a");
    admin.subscribe(publisher);
    bus.register_handler(Arc::new(InvalidationHandler::new(node_b.clone(), "node-b")))
        .await
        .unwrap();

    let role = admin.create_role(Role::new("editor", "Editor")).unwrap().id;
    let p = admin
        .create_permission(Permission::new("post.create", "/api/v1/posts/", HttpMethod::Post))
        .unwrap()
        .id;
    admin.grant(role, p).unwrap();
    let user = User::new(1).with_role(role);
    admin.save_user(user.clone()).unwrap();

    for node in [&node_a, &node_b] {
        assert!(node
            .has_permission(&user, "/api/v1/posts/", HttpMethod::Post)
            .unwrap());
    }

    flaky.fail();
    let err = admin.set_role_active(role, false).unwrap_err();
    assert!(matches!(err, RbacError::Store(_)));

    // The write is committed and node A dropped the holder's entry.
    assert!(!store.role_by_id(role).unwrap().is_active);
    assert!(!node_a
        .has_permission(&user, "/api/v1/posts/", HttpMethod::Post)
        .unwrap());

    // Node B heard about it anyway.
    assert!(
        eventually(|| !node_b
            .has_permission(&user, "/api/v1/posts/", HttpMethod::Post)
            .unwrap())
        .await
    );
}
