//! # RBAC engine
//!
//! [`RbacEngine`] wires a store, the role graph and an optional permission
//! cache together. It answers permission checks, owns the hierarchy lock, and
//! turns [`Mutation`]s into cache invalidations.
//!
//! ```text
//! check ──▶ cache ──hit──▶ hydrate ──▶ answer
//!             │
//!            miss ──▶ resolver (graph + store) ──▶ write back
//! ```
//!
//! Cache failures are never fatal: a failed read resolves directly and a
//! failed write is logged and ignored.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStats, MemoryPermissionCache, PermissionCache};
use crate::config::RbacConfig;
use crate::error::RbacResult;
use crate::graph::RoleGraph;
use crate::resolver::PermissionResolver;
use crate::store::RbacStore;
use crate::types::{HttpMethod, Permission, PermissionId, RoleEdge, RoleId, User, UserId};

/// A write to RBAC state that may change someone's effective permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    /// A permission definition was created, edited, toggled or deleted
    PermissionChanged {
        /// Permission that changed
        permission_id: PermissionId,
    },
    /// A role was created, edited, toggled or deleted
    RoleChanged {
        /// Role that changed
        role_id: RoleId,
    },
    /// A role gained, lost, suspended or resumed a permission link
    RolePermissionChanged {
        /// Role whose links changed
        role_id: RoleId,
    },
    /// A hierarchy edge was added or removed
    HierarchyChanged {
        /// Parent side of the edge
        parent: RoleId,
        /// Child side of the edge
        child: RoleId,
    },
    /// A user's roles or overrides changed
    UserChanged {
        /// User that changed
        user_id: UserId,
    },
}

impl Mutation {
    /// Stable name of the mutation kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Mutation::PermissionChanged { .. } => "permission_changed",
            Mutation::RoleChanged { .. } => "role_changed",
            Mutation::RolePermissionChanged { .. } => "role_permission_changed",
            Mutation::HierarchyChanged { .. } => "hierarchy_changed",
            Mutation::UserChanged { .. } => "user_changed",
        }
    }

    /// Whether applying this mutation requires reloading the role graph.
    pub fn touches_hierarchy(&self) -> bool {
        matches!(
            self,
            Mutation::RoleChanged { .. } | Mutation::HierarchyChanged { .. }
        )
    }
}

/// Permission-resolution engine.
pub struct RbacEngine {
    store: Arc<dyn RbacStore>,
    graph: RwLock<RoleGraph>,
    cache: Option<Arc<dyn PermissionCache>>,
    config: RbacConfig,
}

impl std::fmt::Debug for RbacEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RbacEngine")
            .field("edges", &self.graph.read().len())
            .field("cache_enabled", &self.cache.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl RbacEngine {
    /// Create an engine over `store`.
    ///
    /// A process-local [`MemoryPermissionCache`] is created when
    /// `config.cache_enabled` is set.
    ///
    /// # Errors
    ///
    /// - [`crate::RbacError::Config`] if the configuration is invalid
    /// - [`crate::RbacError::Validation`] if the stored hierarchy has a cycle
    pub fn new(store: Arc<dyn RbacStore>, config: RbacConfig) -> RbacResult<Self> {
        let cache: Option<Arc<dyn PermissionCache>> = if config.cache_enabled {
            Some(Arc::new(MemoryPermissionCache::from_config(&config)))
        } else {
            None
        };
        Self::build(store, config, cache)
    }

    /// Create an engine that uses `cache`, regardless of `config.cache_enabled`.
    pub fn with_cache(
        store: Arc<dyn RbacStore>,
        config: RbacConfig,
        cache: Arc<dyn PermissionCache>,
    ) -> RbacResult<Self> {
        Self::build(store, config, Some(cache))
    }

    fn build(
        store: Arc<dyn RbacStore>,
        config: RbacConfig,
        cache: Option<Arc<dyn PermissionCache>>,
    ) -> RbacResult<Self> {
        config.validate()?;
        let graph = RoleGraph::from_edges(store.hierarchy_edges()?)?;
        info!(
            edges = graph.len(),
            cache_enabled = cache.is_some(),
            "rbac engine initialized"
        );

        Ok(Self {
            store,
            graph: RwLock::new(graph),
            cache,
            config,
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &RbacConfig {
        &self.config
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn RbacStore> {
        &self.store
    }

    /// Snapshot of the role graph.
    pub fn role_graph(&self) -> RoleGraph {
        self.graph.read().clone()
    }

    /// Rebuild the role graph from the store's edge list.
    ///
    /// # Errors
    ///
    /// [`crate::RbacError::Validation`] naming the cycle if the stored edges
    /// contain one; the current graph is kept in that case.
    pub fn reload_hierarchy(&self) -> RbacResult<()> {
        // Read under the write lock so an edge committed concurrently is not lost.
        let mut graph = self.graph.write();
        let fresh = RoleGraph::from_edges(self.store.hierarchy_edges()?)?;
        debug!(edges = fresh.len(), "role hierarchy reloaded");
        *graph = fresh;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Checks
    // ---------------------------------------------------------------------

    /// Effective permission ids of `user`, through the cache.
    pub fn effective_permission_ids(&self, user: &User) -> RbacResult<BTreeSet<PermissionId>> {
        if user.is_superuser {
            return self.with_resolver(|r| r.resolve_ids(user));
        }

        let key = self.cache_key(user.id);
        if let Some(cache) = &self.cache {
            match cache.get(&key) {
                Ok(Some(ids)) => return Ok(ids),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "permission cache read failed, resolving directly"),
            }
        }

        let ids = self.with_resolver(|r| r.resolve_ids(user))?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.set(&key, &ids) {
                warn!(key = %key, error = %e, "permission cache write failed");
            }
        }
        Ok(ids)
    }

    /// Effective permissions of `user`, sorted by id.
    pub fn resolve(&self, user: &User) -> RbacResult<Vec<Permission>> {
        if user.is_superuser {
            return self.with_resolver(|r| r.resolve(user));
        }
        let ids = self.effective_permission_ids(user)?;
        self.with_resolver(|r| r.hydrate(&ids))
    }

    /// Check whether `user` may call `method api_url`.
    ///
    /// Superusers are allowed without touching the store.
    pub fn has_permission(&self, user: &User, api_url: &str, method: HttpMethod) -> RbacResult<bool> {
        if user.is_superuser {
            return Ok(true);
        }
        let allowed = self
            .resolve(user)?
            .iter()
            .any(|p| p.matches(api_url, method));
        debug!(user_id = user.id, %method, api_url, allowed, "permission check");
        Ok(allowed)
    }

    /// Check whether `user` holds the permission with `code`.
    pub fn has_permission_code(&self, user: &User, code: &str) -> RbacResult<bool> {
        if user.is_superuser {
            return Ok(true);
        }
        Ok(self.resolve(user)?.iter().any(|p| p.code == code))
    }

    /// Check whether `user` holds at least one of `ids`.
    pub fn has_any_permission(&self, user: &User, ids: &[PermissionId]) -> RbacResult<bool> {
        if user.is_superuser {
            return Ok(true);
        }
        let held = self.held_ids(user)?;
        Ok(ids.iter().any(|id| held.contains(id)))
    }

    /// Check whether `user` holds every one of `ids`.
    pub fn has_all_permissions(&self, user: &User, ids: &[PermissionId]) -> RbacResult<bool> {
        if user.is_superuser {
            return Ok(true);
        }
        let held = self.held_ids(user)?;
        Ok(ids.iter().all(|id| held.contains(id)))
    }

    fn held_ids(&self, user: &User) -> RbacResult<HashSet<PermissionId>> {
        Ok(self.resolve(user)?.iter().map(|p| p.id).collect())
    }

    // ---------------------------------------------------------------------
    // Role inspection
    // ---------------------------------------------------------------------

    /// Permissions `role` is granted directly.
    pub fn role_permissions(&self, role: RoleId) -> RbacResult<Vec<Permission>> {
        self.with_resolver(|r| r.role_permissions(role))
    }

    /// Permissions `role` inherits from its ancestors.
    pub fn inherited_permissions(&self, role: RoleId) -> RbacResult<Vec<Permission>> {
        self.with_resolver(|r| r.inherited_permissions(role))
    }

    /// Own and inherited permissions of `role`.
    pub fn all_role_permissions(&self, role: RoleId) -> RbacResult<Vec<Permission>> {
        self.with_resolver(|r| r.all_role_permissions(role))
    }

    // ---------------------------------------------------------------------
    // Hierarchy management
    // ---------------------------------------------------------------------

    /// Add `parent -> child` to the hierarchy and persist it.
    ///
    /// Other engines may have written to the store since this one last
    /// loaded it, so the graph is refreshed from the stored edges before the
    /// check. The store repeats the check atomically with its insert, which
    /// is what keeps concurrent writers from different engines from closing
    /// a loop between them.
    ///
    /// # Errors
    ///
    /// - [`crate::RbacError::NotFound`] if either role is missing
    /// - [`crate::RbacError::Validation`] for a duplicate edge or a cycle
    pub fn add_hierarchy_edge(&self, parent: RoleId, child: RoleId) -> RbacResult<()> {
        {
            let mut graph = self.graph.write();
            self.store.role_by_id(parent)?;
            self.store.role_by_id(child)?;

            *graph = RoleGraph::from_edges(self.store.hierarchy_edges()?)?;
            graph.add_edge(parent, child)?;

            if let Err(e) = self.store.insert_edge(RoleEdge::new(parent, child)) {
                graph.remove_edge(parent, child);
                return Err(e);
            }
        }

        info!(parent, child, "hierarchy edge added");
        self.invalidate_for(&Mutation::HierarchyChanged { parent, child })?;
        Ok(())
    }

    /// Remove `parent -> child`. Removing an absent edge is not an error.
    ///
    /// Returns whether the edge existed.
    pub fn remove_hierarchy_edge(&self, parent: RoleId, child: RoleId) -> RbacResult<bool> {
        let existed = {
            let mut graph = self.graph.write();
            let stored = self.store.delete_edge(RoleEdge::new(parent, child))?;
            graph.remove_edge(parent, child) || stored
        };

        if existed {
            info!(parent, child, "hierarchy edge removed");
            self.invalidate_for(&Mutation::HierarchyChanged { parent, child })?;
        }
        Ok(existed)
    }

    // ---------------------------------------------------------------------
    // Invalidation
    // ---------------------------------------------------------------------

    /// Users whose effective permissions `mutation` may change, computed
    /// against current state.
    pub fn affected_users(&self, mutation: &Mutation) -> RbacResult<BTreeSet<UserId>> {
        match *mutation {
            Mutation::PermissionChanged { permission_id } => {
                let mut users: BTreeSet<UserId> = self
                    .store
                    .users_referencing_permission(permission_id)?
                    .into_iter()
                    .collect();
                for role in self.store.roles_linking(permission_id)? {
                    users.extend(self.users_for_role(role)?);
                }
                Ok(users)
            }
            Mutation::RoleChanged { role_id } | Mutation::RolePermissionChanged { role_id } => {
                self.users_for_role(role_id)
            }
            Mutation::HierarchyChanged { child, .. } => self.users_for_role(child),
            Mutation::UserChanged { user_id } => Ok(BTreeSet::from([user_id])),
        }
    }

    /// Users holding `role` or one of its descendants, plus users whose
    /// overrides name `role`.
    fn users_for_role(&self, role: RoleId) -> RbacResult<BTreeSet<UserId>> {
        let roles = self.graph.read().expand(role);
        let mut users: BTreeSet<UserId> =
            self.store.users_with_roles(&roles)?.into_iter().collect();
        users.extend(self.store.users_referencing_role(role)?);
        Ok(users)
    }

    /// Bring the engine in line with `mutation`, which has already been
    /// written: reload the graph if needed, then drop the cache entries of
    /// every affected user.
    ///
    /// Returns the affected users.
    pub fn apply(&self, mutation: &Mutation) -> RbacResult<BTreeSet<UserId>> {
        if mutation.touches_hierarchy() {
            self.reload_hierarchy()?;
        }
        self.invalidate_for(mutation)
    }

    fn invalidate_for(&self, mutation: &Mutation) -> RbacResult<BTreeSet<UserId>> {
        let users = self.affected_users(mutation)?;
        let dropped = self.invalidate_users(&users);
        info!(
            mutation = mutation.kind(),
            affected = users.len(),
            dropped,
            "permission cache invalidated"
        );
        Ok(users)
    }

    /// Drop cached entries for `users`. Returns how many deletes succeeded.
    pub fn invalidate_users(&self, users: &BTreeSet<UserId>) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };

        let mut dropped = 0;
        for &user in users {
            let key = self.cache_key(user);
            match cache.delete(&key) {
                Ok(()) => dropped += 1,
                Err(e) => warn!(key = %key, error = %e, "permission cache delete failed"),
            }
        }
        dropped
    }

    /// Drop one user's cached entry.
    pub fn invalidate_user(&self, user: UserId) {
        self.invalidate_users(&BTreeSet::from([user]));
    }

    /// Drop every cached entry.
    pub fn clear_cache(&self) -> RbacResult<()> {
        match &self.cache {
            Some(cache) => cache.clear(),
            None => Ok(()),
        }
    }

    /// Cache counters, if caching is on.
    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.stats())
    }

    /// A permission definition changed.
    pub fn on_permission_changed(&self, permission_id: PermissionId) -> RbacResult<BTreeSet<UserId>> {
        self.apply(&Mutation::PermissionChanged { permission_id })
    }

    /// A role changed.
    pub fn on_role_changed(&self, role_id: RoleId) -> RbacResult<BTreeSet<UserId>> {
        self.apply(&Mutation::RoleChanged { role_id })
    }

    /// A role's permission links changed.
    pub fn on_role_permission_changed(&self, role_id: RoleId) -> RbacResult<BTreeSet<UserId>> {
        self.apply(&Mutation::RolePermissionChanged { role_id })
    }

    /// A hierarchy edge changed.
    pub fn on_hierarchy_changed(&self, parent: RoleId, child: RoleId) -> RbacResult<BTreeSet<UserId>> {
        self.apply(&Mutation::HierarchyChanged { parent, child })
    }

    /// A user record changed.
    pub fn on_user_changed(&self, user_id: UserId) -> RbacResult<BTreeSet<UserId>> {
        self.apply(&Mutation::UserChanged { user_id })
    }

    fn cache_key(&self, user: UserId) -> CacheKey {
        CacheKey::new(self.config.user_kind.as_str(), user)
    }

    fn with_resolver<T>(
        &self,
        f: impl FnOnce(&PermissionResolver<'_, dyn RbacStore>) -> RbacResult<T>,
    ) -> RbacResult<T> {
        let graph = self.graph.read();
        let resolver = PermissionResolver::new(&*self.store, &graph);
        f(&resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RbacError;
    use crate::memory::InMemoryRbacStore;
    use crate::store::{AdminStore, HierarchyStore, UserDirectory};
    use crate::types::Role;

    fn setup() -> (Arc<InMemoryRbacStore>, RbacEngine) {
        let store = Arc::new(InMemoryRbacStore::new());
        let engine = RbacEngine::new(store.clone(), RbacConfig::default()).unwrap();
        (store, engine)
    }

    #[test]
    fn test_mutation_serialization() {
        let json = serde_json::to_string(&Mutation::HierarchyChanged { parent: 1, child: 2 }).unwrap();
        assert_eq!(json, r#"{"kind":"hierarchy_changed","parent":1,"child":2}"#);
        let back: Mutation = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "hierarchy_changed");
    }

    #[test]
    fn test_loading_cyclic_hierarchy_fails() {
        let store = Arc::new(InMemoryRbacStore::new());
        let a = store.create_role(Role::new("a", "A")).unwrap().id;
        let b = store.create_role(Role::new("b", "B")).unwrap().id;
        store.insert_edge_unchecked(RoleEdge::new(a, b));
        store.insert_edge_unchecked(RoleEdge::new(b, a));

        let err = RbacEngine::new(store, RbacConfig::default()).unwrap_err();
        assert!(matches!(err, RbacError::Validation(ref msg) if msg.contains("cycle")));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let store = Arc::new(InMemoryRbacStore::new());
        let config = RbacConfig {
            cache_ttl_secs: 0,
            ..Default::default()
        };
        assert!(matches!(
            RbacEngine::new(store, config),
            Err(RbacError::Config { .. })
        ));
    }

    #[test]
    fn test_add_edge_validates_and_persists() {
        let (store, engine) = setup();
        let a = store.create_role(Role::new("a", "A")).unwrap().id;
        let b = store.create_role(Role::new("b", "B")).unwrap().id;

        engine.add_hierarchy_edge(a, b).unwrap();
        assert_eq!(store.hierarchy_edges().unwrap(), vec![RoleEdge::new(a, b)]);

        assert!(matches!(
            engine.add_hierarchy_edge(a, b),
            Err(RbacError::Validation(_))
        ));
        assert!(matches!(
            engine.add_hierarchy_edge(b, a),
            Err(RbacError::Validation(_))
        ));
        assert!(matches!(
            engine.add_hierarchy_edge(a, 99),
            Err(RbacError::NotFound { .. })
        ));
        assert_eq!(store.hierarchy_edges().unwrap().len(), 1);
        assert_eq!(engine.role_graph().len(), 1);
    }

    #[test]
    fn test_add_edge_sees_edges_written_by_another_engine() {
        let (store, node_a) = setup();
        let node_b = RbacEngine::new(store.clone(), RbacConfig::default()).unwrap();
        let a = store.create_role(Role::new("a", "A")).unwrap().id;
        let b = store.create_role(Role::new("b", "B")).unwrap().id;

        node_a.add_hierarchy_edge(a, b).unwrap();
        // node_b has not heard of a -> b yet.
        assert!(node_b.role_graph().is_empty());

        assert!(matches!(
            node_b.add_hierarchy_edge(b, a),
            Err(RbacError::Validation(ref msg)) if msg.contains("cycle")
        ));
        assert!(node_b.role_graph().contains_edge(a, b));
        assert_eq!(store.hierarchy_edges().unwrap(), vec![RoleEdge::new(a, b)]);
        assert!(RbacEngine::new(store, RbacConfig::default()).is_ok());
    }

    #[test]
    fn test_remove_edge_is_idempotent() {
        let (store, engine) = setup();
        let a = store.create_role(Role::new("a", "A")).unwrap().id;
        let b = store.create_role(Role::new("b", "B")).unwrap().id;
        engine.add_hierarchy_edge(a, b).unwrap();

        assert!(engine.remove_hierarchy_edge(a, b).unwrap());
        assert!(!engine.remove_hierarchy_edge(a, b).unwrap());
        assert!(engine.role_graph().is_empty());
    }

    #[test]
    fn test_affected_users() {
        let (store, engine) = setup();
        let parent = store.create_role(Role::new("parent", "Parent")).unwrap().id;
        let child = store.create_role(Role::new("child", "Child")).unwrap().id;
        let other = store.create_role(Role::new("other", "Other")).unwrap().id;
        let p = store
            .create_permission(Permission::new("post.create", "/api/v1/posts/", HttpMethod::Post))
            .unwrap()
            .id;
        store.grant(parent, p).unwrap();
        engine.add_hierarchy_edge(parent, child).unwrap();

        store.save_user(User::new(1).with_role(parent)).unwrap();
        store.save_user(User::new(2).with_role(child)).unwrap();
        store.save_user(User::new(3).with_role(other)).unwrap();
        store
            .save_user(User::new(4).with_enabled(crate::types::OverrideRef::Role(parent)))
            .unwrap();
        store.save_user(User::new(5).with_disabled(p)).unwrap();

        let by_role = engine
            .affected_users(&Mutation::RolePermissionChanged { role_id: parent })
            .unwrap();
        assert_eq!(by_role, BTreeSet::from([1, 2, 4]));

        let by_child = engine
            .affected_users(&Mutation::RoleChanged { role_id: child })
            .unwrap();
        assert_eq!(by_child, BTreeSet::from([2]));

        let by_permission = engine
            .affected_users(&Mutation::PermissionChanged { permission_id: p })
            .unwrap();
        assert_eq!(by_permission, BTreeSet::from([1, 2, 4, 5]));

        let by_edge = engine
            .affected_users(&Mutation::HierarchyChanged { parent, child })
            .unwrap();
        assert_eq!(by_edge, BTreeSet::from([2]));
    }

    #[test]
    fn test_checks_use_and_refresh_cache() {
        let (store, engine) = setup();
        let role = store.create_role(Role::new("editor", "Editor")).unwrap().id;
        let p = store
            .create_permission(Permission::new("post.create", "/api/v1/posts/", HttpMethod::Post))
            .unwrap()
            .id;
        store.grant(role, p).unwrap();
        let user = User::new(1).with_role(role);
        store.save_user(user.clone()).unwrap();

        assert!(engine.has_permission(&user, "/api/v1/posts/", HttpMethod::Post).unwrap());
        assert!(engine.has_permission(&user, "/api/v1/posts/", HttpMethod::Post).unwrap());
        let stats = engine.cache_stats().unwrap();
        assert_eq!((stats.misses, stats.hits), (1, 1));

        store.revoke(role, p).unwrap();
        engine.on_role_permission_changed(role).unwrap();
        assert!(!engine.has_permission(&user, "/api/v1/posts/", HttpMethod::Post).unwrap());
    }

    #[test]
    fn test_code_and_set_checks() {
        let (store, engine) = setup();
        let role = store.create_role(Role::new("editor", "Editor")).unwrap().id;
        let a = store
            .create_permission(Permission::new("post.create", "/api/v1/posts/", HttpMethod::Post))
            .unwrap()
            .id;
        let b = store
            .create_permission(Permission::new("post.delete", "/api/v1/posts/1/", HttpMethod::Delete))
            .unwrap()
            .id;
        store.grant(role, a).unwrap();
        let user = User::new(1).with_role(role);

        assert!(engine.has_permission_code(&user, "post.create").unwrap());
        assert!(!engine.has_permission_code(&user, "post.delete").unwrap());
        assert!(engine.has_any_permission(&user, &[a, b]).unwrap());
        assert!(!engine.has_all_permissions(&user, &[a, b]).unwrap());
        assert!(engine.has_all_permissions(&User::superuser(2), &[a, b]).unwrap());
    }

    #[test]
    fn test_disabled_cache() {
        let store = Arc::new(InMemoryRbacStore::new());
        let engine = RbacEngine::new(store, RbacConfig::default().without_cache()).unwrap();
        assert!(engine.cache_stats().is_none());
        assert_eq!(engine.invalidate_users(&BTreeSet::from([1])), 0);
        assert!(!engine
            .has_permission(&User::new(1), "/api/v1/posts/", HttpMethod::Get)
            .unwrap());
    }
}
