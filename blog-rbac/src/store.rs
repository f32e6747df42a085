//! # Stores
//!
//! Narrow read interfaces the engine needs from the persistence layer, plus the
//! two writes hierarchy management and account management perform.
//! [`AdminStore`] adds the administrative writes behind [`crate::admin::RbacAdmin`].
//! Implementations live outside the engine; [`crate::memory::InMemoryRbacStore`]
//! is the reference one.

use std::collections::{BTreeSet, HashSet};

use crate::error::{RbacError, RbacResult};
use crate::types::{
    HttpMethod, Permission, PermissionId, Role, RoleEdge, RoleId, RolePermission, User, UserId,
};

/// Read access to permission definitions, roles and role-permission links.
pub trait PermissionStore: Send + Sync {
    /// Look up a permission by id.
    ///
    /// # Errors
    ///
    /// [`RbacError::NotFound`] if no such permission exists.
    fn permission_by_id(&self, id: PermissionId) -> RbacResult<Permission>;

    /// Look up a permission by exact `(api_url, method)`.
    fn permission_by_api_and_method(
        &self,
        api_url: &str,
        method: HttpMethod,
    ) -> RbacResult<Permission>;

    /// Look up a permission by its unique code.
    fn permission_by_code(&self, code: &str) -> RbacResult<Permission>;

    /// Permissions granted by `role` through an active link, where the
    /// permission itself is active too.
    fn active_permissions_for_role(&self, role: RoleId) -> RbacResult<Vec<Permission>>;

    /// Every active permission.
    fn active_permissions(&self) -> RbacResult<Vec<Permission>>;

    /// Look up a role by id.
    fn role_by_id(&self, id: RoleId) -> RbacResult<Role>;

    /// Look up a role by its unique code.
    fn role_by_code(&self, code: &str) -> RbacResult<Role>;

    /// Roles linked to `permission`, whether the link is active or suspended.
    fn roles_linking(&self, permission: PermissionId) -> RbacResult<Vec<RoleId>>;

    /// Hydrate a set of ids, silently dropping ids that no longer exist.
    fn permissions_by_ids(&self, ids: &BTreeSet<PermissionId>) -> RbacResult<Vec<Permission>> {
        let mut permissions = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.permission_by_id(id) {
                Ok(permission) => permissions.push(permission),
                Err(RbacError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(permissions)
    }
}

/// Persistence of role hierarchy edges.
pub trait HierarchyStore: Send + Sync {
    /// Every stored edge.
    fn hierarchy_edges(&self) -> RbacResult<Vec<RoleEdge>>;

    /// Persist a new edge.
    ///
    /// Several engines may write to one store, each holding its own view of
    /// the graph, so the store has the final say: the cycle check against the
    /// stored edges and the insert must be a single atomic step (one lock, or
    /// one serializable transaction).
    ///
    /// # Errors
    ///
    /// - [`RbacError::NotFound`] if either role is missing
    /// - [`RbacError::Validation`] for a duplicate edge or an edge that would
    ///   close a loop
    fn insert_edge(&self, edge: RoleEdge) -> RbacResult<()>;

    /// Delete an edge. Returns whether it existed.
    fn delete_edge(&self, edge: RoleEdge) -> RbacResult<bool>;
}

/// Read access to user records, plus the save account management needs.
pub trait UserDirectory: Send + Sync {
    /// Look up a user by id.
    fn user_by_id(&self, id: UserId) -> RbacResult<User>;

    /// Users that directly hold any of `roles`.
    fn users_with_roles(&self, roles: &HashSet<RoleId>) -> RbacResult<Vec<UserId>>;

    /// Users whose overrides name `{role: role}`.
    fn users_referencing_role(&self, role: RoleId) -> RbacResult<Vec<UserId>>;

    /// Users whose overrides or revocations name `permission`.
    fn users_referencing_permission(&self, permission: PermissionId) -> RbacResult<Vec<UserId>>;

    /// Persist a user record.
    fn save_user(&self, user: User) -> RbacResult<()>;
}

/// Everything the engine needs from persistence.
pub trait RbacStore: PermissionStore + HierarchyStore + UserDirectory {}

impl<T> RbacStore for T where T: PermissionStore + HierarchyStore + UserDirectory {}

/// Administrative writes to permissions, roles and role-permission links.
///
/// None of these touch a cache; [`crate::admin::RbacAdmin`] wraps each one
/// with affected-user bookkeeping and invalidation.
pub trait AdminStore: RbacStore {
    /// Insert a permission, assigning its id.
    ///
    /// # Errors
    ///
    /// [`RbacError::Validation`] if the code or `(module, action, resource)`
    /// is already taken.
    fn create_permission(&self, permission: Permission) -> RbacResult<Permission>;

    /// Replace a permission definition.
    fn update_permission(&self, permission: Permission) -> RbacResult<Permission>;

    /// Toggle a permission's active flag.
    fn set_permission_active(&self, id: PermissionId, is_active: bool) -> RbacResult<()>;

    /// Delete a permission and every link to it.
    fn delete_permission(&self, id: PermissionId) -> RbacResult<Permission>;

    /// Insert a role, assigning its id.
    fn create_role(&self, role: Role) -> RbacResult<Role>;

    /// Replace a role definition.
    fn update_role(&self, role: Role) -> RbacResult<Role>;

    /// Toggle a role's active flag.
    fn set_role_active(&self, id: RoleId, is_active: bool) -> RbacResult<()>;

    /// Delete a role, its links, its hierarchy edges and its user assignments.
    fn delete_role(&self, id: RoleId) -> RbacResult<Role>;

    /// Link `permission` to `role` as an active grant.
    ///
    /// # Errors
    ///
    /// - [`RbacError::NotFound`] if either side is missing
    /// - [`RbacError::Validation`] if the link exists already
    fn grant(&self, role: RoleId, permission: PermissionId) -> RbacResult<RolePermission>;

    /// Delete a link. Returns whether it existed.
    fn revoke(&self, role: RoleId, permission: PermissionId) -> RbacResult<bool>;

    /// Suspend or resume an existing link without deleting it.
    fn set_link_active(&self, role: RoleId, permission: PermissionId, is_active: bool)
        -> RbacResult<()>;

    /// Replace every link of `role` with active links to `permissions`.
    fn set_role_permissions(&self, role: RoleId, permissions: &[PermissionId]) -> RbacResult<()>;

    /// Every link of `role`, active or suspended.
    fn links_for_role(&self, role: RoleId) -> RbacResult<Vec<RolePermission>>;
}
