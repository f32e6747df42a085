//! In-memory record store.
//!
//! Implements every store trait over a single `RwLock`-guarded state, and
//! carries the administrative writes (create/update/delete of permissions,
//! roles and links) with the same uniqueness and cascade rules the database
//! schema enforces. Suitable for tests and single-process deployments.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{Entity, RbacError, RbacResult};
use crate::graph::RoleGraph;
use crate::store::{AdminStore, HierarchyStore, PermissionStore, UserDirectory};
use crate::types::{
    HttpMethod, Permission, PermissionId, Role, RoleEdge, RoleId, RolePermission, User, UserId,
};

#[derive(Debug, Default)]
struct StoreState {
    next_permission_id: PermissionId,
    next_role_id: RoleId,
    permissions: BTreeMap<PermissionId, Permission>,
    roles: BTreeMap<RoleId, Role>,
    /// `(role, permission) -> is_active`
    links: BTreeMap<(RoleId, PermissionId), bool>,
    edges: BTreeSet<RoleEdge>,
    users: BTreeMap<UserId, User>,
}

impl StoreState {
    fn permission(&self, id: PermissionId) -> RbacResult<&Permission> {
        self.permissions
            .get(&id)
            .ok_or_else(|| RbacError::permission_not_found(id))
    }

    fn role(&self, id: RoleId) -> RbacResult<&Role> {
        self.roles.get(&id).ok_or_else(|| RbacError::role_not_found(id))
    }

    fn check_permission_unique(&self, candidate: &Permission) -> RbacResult<()> {
        for existing in self.permissions.values() {
            if existing.id == candidate.id {
                continue;
            }
            if existing.code == candidate.code {
                return Err(RbacError::Validation(format!(
                    "permission code '{}' already exists",
                    candidate.code
                )));
            }
            if existing.natural_key() == candidate.natural_key() {
                let (module, action, resource) = candidate.natural_key();
                return Err(RbacError::Validation(format!(
                    "permission ({module}, {action}, {resource}) already exists"
                )));
            }
        }
        Ok(())
    }

    fn check_role_unique(&self, candidate: &Role) -> RbacResult<()> {
        if self
            .roles
            .values()
            .any(|r| r.id != candidate.id && r.code == candidate.code)
        {
            return Err(RbacError::Validation(format!(
                "role code '{}' already exists",
                candidate.code
            )));
        }
        Ok(())
    }
}

/// In-memory implementation of every store trait.
///
/// Writes here do not touch any cache; callers publish the matching
/// mutation afterwards (see [`crate::admin::RbacAdmin`]). Hierarchy inserts
/// are cycle-checked under the state lock, so engines sharing one store
/// cannot together persist a loop.
#[derive(Debug, Default)]
pub struct InMemoryRbacStore {
    state: RwLock<StoreState>,
}

impl InMemoryRbacStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn insert_edge_unchecked(&self, edge: RoleEdge) {
        self.state.write().edges.insert(edge);
    }
}

impl AdminStore for InMemoryRbacStore {
    fn create_permission(&self, mut permission: Permission) -> RbacResult<Permission> {
        let mut state = self.state.write();
        permission.id = 0;
        state.check_permission_unique(&permission)?;

        state.next_permission_id += 1;
        permission.id = state.next_permission_id;
        state.permissions.insert(permission.id, permission.clone());

        debug!(id = permission.id, code = %permission.code, "permission created");
        Ok(permission)
    }

    fn update_permission(&self, permission: Permission) -> RbacResult<Permission> {
        let mut state = self.state.write();
        state.permission(permission.id)?;
        state.check_permission_unique(&permission)?;
        state.permissions.insert(permission.id, permission.clone());
        Ok(permission)
    }

    fn set_permission_active(&self, id: PermissionId, is_active: bool) -> RbacResult<()> {
        let mut state = self.state.write();
        let permission = state
            .permissions
            .get_mut(&id)
            .ok_or_else(|| RbacError::permission_not_found(id))?;
        permission.is_active = is_active;
        Ok(())
    }

    fn delete_permission(&self, id: PermissionId) -> RbacResult<Permission> {
        let mut state = self.state.write();
        let removed = state
            .permissions
            .remove(&id)
            .ok_or_else(|| RbacError::permission_not_found(id))?;
        state.links.retain(|&(_, permission), _| permission != id);
        Ok(removed)
    }

    fn create_role(&self, mut role: Role) -> RbacResult<Role> {
        let mut state = self.state.write();
        role.id = 0;
        state.check_role_unique(&role)?;

        state.next_role_id += 1;
        role.id = state.next_role_id;
        state.roles.insert(role.id, role.clone());

        debug!(id = role.id, code = %role.code, "role created");
        Ok(role)
    }

    fn update_role(&self, role: Role) -> RbacResult<Role> {
        let mut state = self.state.write();
        state.role(role.id)?;
        state.check_role_unique(&role)?;
        state.roles.insert(role.id, role.clone());
        Ok(role)
    }

    fn set_role_active(&self, id: RoleId, is_active: bool) -> RbacResult<()> {
        let mut state = self.state.write();
        let role = state
            .roles
            .get_mut(&id)
            .ok_or_else(|| RbacError::role_not_found(id))?;
        role.is_active = is_active;
        Ok(())
    }

    fn delete_role(&self, id: RoleId) -> RbacResult<Role> {
        let mut state = self.state.write();
        let removed = state
            .roles
            .remove(&id)
            .ok_or_else(|| RbacError::role_not_found(id))?;
        state.links.retain(|&(role, _), _| role != id);
        state.edges.retain(|edge| edge.parent != id && edge.child != id);
        for user in state.users.values_mut() {
            user.roles.retain(|&role| role != id);
        }
        Ok(removed)
    }

    fn grant(&self, role: RoleId, permission: PermissionId) -> RbacResult<RolePermission> {
        let mut state = self.state.write();
        state.role(role)?;
        state.permission(permission)?;
        if state.links.contains_key(&(role, permission)) {
            return Err(RbacError::Validation(format!(
                "role {role} already holds permission {permission}"
            )));
        }
        state.links.insert((role, permission), true);
        Ok(RolePermission {
            role_id: role,
            permission_id: permission,
            is_active: true,
        })
    }

    fn revoke(&self, role: RoleId, permission: PermissionId) -> RbacResult<bool> {
        Ok(self.state.write().links.remove(&(role, permission)).is_some())
    }

    fn set_link_active(
        &self,
        role: RoleId,
        permission: PermissionId,
        is_active: bool,
    ) -> RbacResult<()> {
        let mut state = self.state.write();
        match state.links.get_mut(&(role, permission)) {
            Some(active) => {
                *active = is_active;
                Ok(())
            }
            None => Err(RbacError::not_found(
                Entity::Permission,
                format!("{permission} on role {role}"),
            )),
        }
    }

    fn set_role_permissions(&self, role: RoleId, permissions: &[PermissionId]) -> RbacResult<()> {
        let mut state = self.state.write();
        state.role(role)?;
        for &permission in permissions {
            state.permission(permission)?;
        }
        state.links.retain(|&(r, _), _| r != role);
        for &permission in permissions {
            state.links.insert((role, permission), true);
        }
        Ok(())
    }

    fn links_for_role(&self, role: RoleId) -> RbacResult<Vec<RolePermission>> {
        let state = self.state.read();
        Ok(state
            .links
            .range((role, PermissionId::MIN)..=(role, PermissionId::MAX))
            .map(|(&(role_id, permission_id), &is_active)| RolePermission {
                role_id,
                permission_id,
                is_active,
            })
            .collect())
    }
}

impl PermissionStore for InMemoryRbacStore {
    fn permission_by_id(&self, id: PermissionId) -> RbacResult<Permission> {
        self.state.read().permission(id).cloned()
    }

    fn permission_by_api_and_method(
        &self,
        api_url: &str,
        method: HttpMethod,
    ) -> RbacResult<Permission> {
        let state = self.state.read();
        state
            .permissions
            .values()
            .find(|p| p.matches(api_url, method))
            .cloned()
            .ok_or_else(|| RbacError::not_found(Entity::Permission, format!("{method} {api_url}")))
    }

    fn permission_by_code(&self, code: &str) -> RbacResult<Permission> {
        let state = self.state.read();
        state
            .permissions
            .values()
            .find(|p| p.code == code)
            .cloned()
            .ok_or_else(|| RbacError::not_found(Entity::Permission, code))
    }

    fn active_permissions_for_role(&self, role: RoleId) -> RbacResult<Vec<Permission>> {
        let state = self.state.read();
        Ok(state
            .links
            .range((role, PermissionId::MIN)..=(role, PermissionId::MAX))
            .filter(|&(_, &active)| active)
            .filter_map(|(&(_, permission), _)| state.permissions.get(&permission))
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }

    fn active_permissions(&self) -> RbacResult<Vec<Permission>> {
        let state = self.state.read();
        Ok(state
            .permissions
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect())
    }

    fn role_by_id(&self, id: RoleId) -> RbacResult<Role> {
        self.state.read().role(id).cloned()
    }

    fn role_by_code(&self, code: &str) -> RbacResult<Role> {
        let state = self.state.read();
        state
            .roles
            .values()
            .find(|r| r.code == code)
            .cloned()
            .ok_or_else(|| RbacError::not_found(Entity::Role, code))
    }

    fn roles_linking(&self, permission: PermissionId) -> RbacResult<Vec<RoleId>> {
        let state = self.state.read();
        Ok(state
            .links
            .keys()
            .filter(|&&(_, p)| p == permission)
            .map(|&(role, _)| role)
            .collect())
    }
}

impl HierarchyStore for InMemoryRbacStore {
    fn hierarchy_edges(&self) -> RbacResult<Vec<RoleEdge>> {
        Ok(self.state.read().edges.iter().copied().collect())
    }

    fn insert_edge(&self, edge: RoleEdge) -> RbacResult<()> {
        let mut state = self.state.write();
        state.role(edge.parent)?;
        state.role(edge.child)?;

        // Check against the stored edges, not any engine's copy of them.
        let mut graph = RoleGraph::from_edges(state.edges.iter().copied())?;
        graph.add_edge(edge.parent, edge.child)?;
        state.edges.insert(edge);
        Ok(())
    }

    fn delete_edge(&self, edge: RoleEdge) -> RbacResult<bool> {
        Ok(self.state.write().edges.remove(&edge))
    }
}

impl UserDirectory for InMemoryRbacStore {
    fn user_by_id(&self, id: UserId) -> RbacResult<User> {
        self.state
            .read()
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| RbacError::user_not_found(id))
    }

    fn users_with_roles(&self, roles: &HashSet<RoleId>) -> RbacResult<Vec<UserId>> {
        let state = self.state.read();
        Ok(state
            .users
            .values()
            .filter(|u| u.roles.iter().any(|r| roles.contains(r)))
            .map(|u| u.id)
            .collect())
    }

    fn users_referencing_role(&self, role: RoleId) -> RbacResult<Vec<UserId>> {
        let state = self.state.read();
        Ok(state
            .users
            .values()
            .filter(|u| u.references_role(role))
            .map(|u| u.id)
            .collect())
    }

    fn users_referencing_permission(&self, permission: PermissionId) -> RbacResult<Vec<UserId>> {
        let state = self.state.read();
        Ok(state
            .users
            .values()
            .filter(|u| u.references_permission(permission))
            .map(|u| u.id)
            .collect())
    }

    fn save_user(&self, user: User) -> RbacResult<()> {
        self.state.write().users.insert(user.id, user);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perm(code: &str, url: &str, method: HttpMethod) -> Permission {
        Permission::new(code, url, method).with_module("rbac")
    }

    #[test]
    fn test_create_assigns_ids() {
        let store = InMemoryRbacStore::new();
        let a = store
            .create_permission(perm("role.list", "/api/v1/roles/", HttpMethod::Get))
            .unwrap();
        let b = store
            .create_permission(perm("role.create", "/api/v1/roles/", HttpMethod::Post))
            .unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert_eq!(store.permission_by_id(2).unwrap().code, "role.create");
    }

    #[test]
    fn test_duplicate_permission_code_rejected() {
        let store = InMemoryRbacStore::new();
        store
            .create_permission(perm("role.list", "/api/v1/roles/", HttpMethod::Get))
            .unwrap();
        let err = store
            .create_permission(
                Permission::new("role.list", "/api/v1/other/", HttpMethod::Get).with_module("blog"),
            )
            .unwrap_err();
        assert!(matches!(err, RbacError::Validation(_)));
    }

    #[test]
    fn test_duplicate_natural_key_rejected() {
        let store = InMemoryRbacStore::new();
        store
            .create_permission(perm("role.list", "/api/v1/roles/", HttpMethod::Get))
            .unwrap();
        let mut twin = perm("roles.index", "/api/v1/roles/all/", HttpMethod::Get);
        twin.action = "list".to_string();
        twin.resource = "role".to_string();
        assert!(matches!(
            store.create_permission(twin),
            Err(RbacError::Validation(_))
        ));
    }

    #[test]
    fn test_duplicate_role_code_rejected() {
        let store = InMemoryRbacStore::new();
        store.create_role(Role::new("admin", "Admin")).unwrap();
        assert!(matches!(
            store.create_role(Role::new("admin", "Other")),
            Err(RbacError::Validation(_))
        ));
    }

    #[test]
    fn test_active_permissions_for_role_filters_both_flags() {
        let store = InMemoryRbacStore::new();
        let role = store.create_role(Role::new("editor", "Editor")).unwrap();
        let live = store
            .create_permission(perm("post.create", "/api/v1/posts/", HttpMethod::Post))
            .unwrap();
        let suspended = store
            .create_permission(perm("post.update", "/api/v1/posts/1/", HttpMethod::Put))
            .unwrap();
        let retired = store
            .create_permission(perm("post.delete", "/api/v1/posts/1/", HttpMethod::Delete).inactive())
            .unwrap();

        store.grant(role.id, live.id).unwrap();
        store.grant(role.id, suspended.id).unwrap();
        store.grant(role.id, retired.id).unwrap();
        store.set_link_active(role.id, suspended.id, false).unwrap();

        let ids: Vec<PermissionId> = store
            .active_permissions_for_role(role.id)
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![live.id]);
        assert_eq!(store.links_for_role(role.id).unwrap().len(), 3);
    }

    #[test]
    fn test_grant_requires_existing_records() {
        let store = InMemoryRbacStore::new();
        let role = store.create_role(Role::new("editor", "Editor")).unwrap();
        assert!(matches!(
            store.grant(role.id, 42),
            Err(RbacError::NotFound { .. })
        ));
        let p = store
            .create_permission(perm("post.create", "/api/v1/posts/", HttpMethod::Post))
            .unwrap();
        store.grant(role.id, p.id).unwrap();
        assert!(matches!(
            store.grant(role.id, p.id),
            Err(RbacError::Validation(_))
        ));
    }

    #[test]
    fn test_delete_role_cascades() {
        let store = InMemoryRbacStore::new();
        let parent = store.create_role(Role::new("admin", "Admin")).unwrap();
        let child = store.create_role(Role::new("viewer", "Viewer")).unwrap();
        let p = store
            .create_permission(perm("role.list", "/api/v1/roles/", HttpMethod::Get))
            .unwrap();
        store.grant(parent.id, p.id).unwrap();
        store.insert_edge(RoleEdge::new(parent.id, child.id)).unwrap();
        store.save_user(User::new(1).with_role(parent.id)).unwrap();

        store.delete_role(parent.id).unwrap();

        assert!(store.hierarchy_edges().unwrap().is_empty());
        assert!(store.links_for_role(parent.id).unwrap().is_empty());
        assert!(store.user_by_id(1).unwrap().roles.is_empty());
        assert!(store.roles_linking(p.id).unwrap().is_empty());
    }

    #[test]
    fn test_delete_permission_cascades_links() {
        let store = InMemoryRbacStore::new();
        let role = store.create_role(Role::new("admin", "Admin")).unwrap();
        let p = store
            .create_permission(perm("role.list", "/api/v1/roles/", HttpMethod::Get))
            .unwrap();
        store.grant(role.id, p.id).unwrap();

        store.delete_permission(p.id).unwrap();
        assert!(store.links_for_role(role.id).unwrap().is_empty());
        assert!(matches!(
            store.permission_by_id(p.id),
            Err(RbacError::NotFound { .. })
        ));
    }

    #[test]
    fn test_lookup_by_api_and_method_is_exact() {
        let store = InMemoryRbacStore::new();
        store
            .create_permission(perm("role.list", "/api/v1/roles/", HttpMethod::Get))
            .unwrap();
        assert!(store
            .permission_by_api_and_method("/api/v1/roles/", HttpMethod::Get)
            .is_ok());
        assert!(store
            .permission_by_api_and_method("/api/v1/roles", HttpMethod::Get)
            .is_err());
        assert!(store
            .permission_by_api_and_method("/api/v1/roles/", HttpMethod::Post)
            .is_err());
    }

    #[test]
    fn test_insert_edge_rejects_duplicates_and_unknown_roles() {
        let store = InMemoryRbacStore::new();
        let a = store.create_role(Role::new("a", "A")).unwrap();
        let b = store.create_role(Role::new("b", "B")).unwrap();
        store.insert_edge(RoleEdge::new(a.id, b.id)).unwrap();
        assert!(matches!(
            store.insert_edge(RoleEdge::new(a.id, b.id)),
            Err(RbacError::Validation(_))
        ));
        assert!(matches!(
            store.insert_edge(RoleEdge::new(a.id, 99)),
            Err(RbacError::NotFound { .. })
        ));
        assert!(store.delete_edge(RoleEdge::new(a.id, b.id)).unwrap());
        assert!(!store.delete_edge(RoleEdge::new(a.id, b.id)).unwrap());
    }

    #[test]
    fn test_insert_edge_rejects_cycles_against_stored_edges() {
        let store = InMemoryRbacStore::new();
        let a = store.create_role(Role::new("a", "A")).unwrap().id;
        let b = store.create_role(Role::new("b", "B")).unwrap().id;
        let c = store.create_role(Role::new("c", "C")).unwrap().id;
        store.insert_edge(RoleEdge::new(a, b)).unwrap();
        store.insert_edge(RoleEdge::new(b, c)).unwrap();

        let err = store.insert_edge(RoleEdge::new(c, a)).unwrap_err();
        assert!(matches!(err, RbacError::Validation(ref msg) if msg.contains("cycle")));
        assert!(matches!(
            store.insert_edge(RoleEdge::new(a, a)),
            Err(RbacError::Validation(_))
        ));
        assert_eq!(
            store.hierarchy_edges().unwrap(),
            vec![RoleEdge::new(a, b), RoleEdge::new(b, c)]
        );
    }

    #[test]
    fn test_role_by_code() {
        let store = InMemoryRbacStore::new();
        let editor = store.create_role(Role::new("editor", "Editor")).unwrap();
        assert_eq!(store.role_by_code("editor").unwrap().id, editor.id);
        assert!(matches!(
            store.role_by_code("ghost"),
            Err(RbacError::NotFound { .. })
        ));
    }

    #[test]
    fn test_user_queries() {
        let store = InMemoryRbacStore::new();
        store.save_user(User::new(1).with_role(10)).unwrap();
        store
            .save_user(User::new(2).with_enabled(crate::types::OverrideRef::Role(10)))
            .unwrap();
        store.save_user(User::new(3).with_disabled(5)).unwrap();

        let roles: HashSet<RoleId> = HashSet::from([10]);
        assert_eq!(store.users_with_roles(&roles).unwrap(), vec![1]);
        assert_eq!(store.users_referencing_role(10).unwrap(), vec![2]);
        assert_eq!(store.users_referencing_permission(5).unwrap(), vec![3]);
        assert!(matches!(
            store.user_by_id(9),
            Err(RbacError::NotFound { .. })
        ));
    }
}
