//! # Administrative mutations
//!
//! [`RbacAdmin`] is the single write path for RBAC state. Every operation
//! follows the same sequence:
//!
//! 1. compute the users the change can affect, against the old state
//! 2. write to the store
//! 3. drop the cache entries of those users
//! 4. bring the engine up to date and drop entries of newly affected users
//! 5. notify listeners (e.g. an event bus feeding other processes)
//!
//! Step 1 matters for deletes: once a role is gone, nothing in the store
//! still points at the users who held it. Once step 2 succeeds, steps 3 and 5
//! always run; a failure in step 4 is returned after them.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::engine::{Mutation, RbacEngine};
use crate::error::RbacResult;
use crate::store::AdminStore;
use crate::types::{
    OverrideRef, Permission, PermissionId, Role, RoleId, RolePermission, User, UserId,
};

/// Receives every committed mutation together with the users it affected.
pub trait MutationListener: Send + Sync {
    /// Called after the write and the local invalidation.
    fn on_mutation(&self, mutation: &Mutation, affected: &BTreeSet<UserId>);
}

/// Write path for permissions, roles, links, hierarchy edges and user
/// assignments.
pub struct RbacAdmin {
    store: Arc<dyn AdminStore>,
    engine: Arc<RbacEngine>,
    listeners: RwLock<Vec<Arc<dyn MutationListener>>>,
}

impl RbacAdmin {
    /// Create an admin over `store`, keeping `engine` coherent.
    ///
    /// `engine` is expected to read from the same store.
    pub fn new(store: Arc<dyn AdminStore>, engine: Arc<RbacEngine>) -> Self {
        Self {
            store,
            engine,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Register a listener.
    pub fn subscribe(&self, listener: Arc<dyn MutationListener>) {
        self.listeners.write().push(listener);
    }

    /// The engine this admin keeps coherent.
    pub fn engine(&self) -> &Arc<RbacEngine> {
        &self.engine
    }

    fn commit<T>(&self, mutation: Mutation, write: impl FnOnce() -> RbacResult<T>) -> RbacResult<T> {
        let before = self.engine.affected_users(&mutation)?;
        let out = write()?;

        // The write is committed; from here on every step runs.
        self.engine.invalidate_users(&before);
        let applied = self.engine.apply(&mutation);

        let mut affected = before;
        match &applied {
            Ok(after) => affected.extend(after),
            Err(e) => warn!(mutation = mutation.kind(), error = %e, "engine refresh failed after commit"),
        }

        info!(mutation = mutation.kind(), affected = affected.len(), "rbac mutation committed");
        for listener in self.listeners.read().iter() {
            listener.on_mutation(&mutation, &affected);
        }

        applied.map(|_| out)
    }

    // ---------------------------------------------------------------------
    // Permissions
    // ---------------------------------------------------------------------

    /// Create a permission.
    pub fn create_permission(&self, permission: Permission) -> RbacResult<Permission> {
        let created = self.store.create_permission(permission)?;
        // Nothing can reference a new id yet, but listeners still hear of it.
        self.commit(
            Mutation::PermissionChanged {
                permission_id: created.id,
            },
            || Ok(created),
        )
    }

    /// Replace a permission definition.
    pub fn update_permission(&self, permission: Permission) -> RbacResult<Permission> {
        let permission_id = permission.id;
        self.commit(Mutation::PermissionChanged { permission_id }, || {
            self.store.update_permission(permission)
        })
    }

    /// Toggle a permission's active flag.
    pub fn set_permission_active(&self, permission_id: PermissionId, is_active: bool) -> RbacResult<()> {
        self.commit(Mutation::PermissionChanged { permission_id }, || {
            self.store.set_permission_active(permission_id, is_active)
        })
    }

    /// Delete a permission and its links.
    pub fn delete_permission(&self, permission_id: PermissionId) -> RbacResult<Permission> {
        self.commit(Mutation::PermissionChanged { permission_id }, || {
            self.store.delete_permission(permission_id)
        })
    }

    // ---------------------------------------------------------------------
    // Roles
    // ---------------------------------------------------------------------

    /// Create a role.
    pub fn create_role(&self, role: Role) -> RbacResult<Role> {
        let created = self.store.create_role(role)?;
        self.commit(Mutation::RoleChanged { role_id: created.id }, || Ok(created))
    }

    /// Replace a role definition.
    pub fn update_role(&self, role: Role) -> RbacResult<Role> {
        let role_id = role.id;
        self.commit(Mutation::RoleChanged { role_id }, || self.store.update_role(role))
    }

    /// Toggle a role's active flag.
    pub fn set_role_active(&self, role_id: RoleId, is_active: bool) -> RbacResult<()> {
        self.commit(Mutation::RoleChanged { role_id }, || {
            self.store.set_role_active(role_id, is_active)
        })
    }

    /// Delete a role with its links, edges and assignments.
    pub fn delete_role(&self, role_id: RoleId) -> RbacResult<Role> {
        self.commit(Mutation::RoleChanged { role_id }, || self.store.delete_role(role_id))
    }

    // ---------------------------------------------------------------------
    // Role-permission links
    // ---------------------------------------------------------------------

    /// Grant `permission` to `role`.
    pub fn grant(&self, role_id: RoleId, permission: PermissionId) -> RbacResult<RolePermission> {
        self.commit(Mutation::RolePermissionChanged { role_id }, || {
            self.store.grant(role_id, permission)
        })
    }

    /// Delete the link between `role` and `permission`. Returns whether it existed.
    pub fn revoke(&self, role_id: RoleId, permission: PermissionId) -> RbacResult<bool> {
        self.commit(Mutation::RolePermissionChanged { role_id }, || {
            self.store.revoke(role_id, permission)
        })
    }

    /// Suspend or resume a link.
    pub fn set_link_active(
        &self,
        role_id: RoleId,
        permission: PermissionId,
        is_active: bool,
    ) -> RbacResult<()> {
        self.commit(Mutation::RolePermissionChanged { role_id }, || {
            self.store.set_link_active(role_id, permission, is_active)
        })
    }

    /// Replace every link of `role`.
    pub fn set_role_permissions(&self, role_id: RoleId, permissions: &[PermissionId]) -> RbacResult<()> {
        self.commit(Mutation::RolePermissionChanged { role_id }, || {
            self.store.set_role_permissions(role_id, permissions)
        })
    }

    /// Every link of `role`, active or suspended.
    pub fn role_links(&self, role_id: RoleId) -> RbacResult<Vec<RolePermission>> {
        self.store.role_by_id(role_id)?;
        self.store.links_for_role(role_id)
    }

    // ---------------------------------------------------------------------
    // Hierarchy
    // ---------------------------------------------------------------------

    /// Add `parent -> child`; see [`RbacEngine::add_hierarchy_edge`].
    pub fn add_hierarchy_edge(&self, parent: RoleId, child: RoleId) -> RbacResult<()> {
        self.commit(Mutation::HierarchyChanged { parent, child }, || {
            self.engine.add_hierarchy_edge(parent, child)
        })
    }

    /// Remove `parent -> child`. Returns whether the edge existed.
    pub fn remove_hierarchy_edge(&self, parent: RoleId, child: RoleId) -> RbacResult<bool> {
        self.commit(Mutation::HierarchyChanged { parent, child }, || {
            self.engine.remove_hierarchy_edge(parent, child)
        })
    }

    // ---------------------------------------------------------------------
    // Users
    // ---------------------------------------------------------------------

    /// Insert or replace a user record.
    pub fn save_user(&self, user: User) -> RbacResult<()> {
        let user_id = user.id;
        self.commit(Mutation::UserChanged { user_id }, || self.store.save_user(user))
    }

    /// Replace the user's directly assigned roles.
    pub fn assign_roles(&self, user_id: UserId, roles: &[RoleId]) -> RbacResult<()> {
        for &role in roles {
            self.store.role_by_id(role)?;
        }
        self.update_user(user_id, |user| {
            user.roles.clear();
            for &role in roles {
                if !user.roles.contains(&role) {
                    user.roles.push(role);
                }
            }
        })
    }

    /// Assign one more role.
    pub fn add_role(&self, user_id: UserId, role: RoleId) -> RbacResult<()> {
        self.store.role_by_id(role)?;
        self.update_user(user_id, |user| {
            if !user.roles.contains(&role) {
                user.roles.push(role);
            }
        })
    }

    /// Unassign a role.
    pub fn remove_role(&self, user_id: UserId, role: RoleId) -> RbacResult<()> {
        self.update_user(user_id, |user| user.roles.retain(|&r| r != role))
    }

    /// Add an explicit grant.
    ///
    /// # Errors
    ///
    /// [`crate::RbacError::NotFound`] if the user or the referenced record is missing.
    pub fn enable_permission(&self, user_id: UserId, grant: OverrideRef) -> RbacResult<()> {
        match grant {
            OverrideRef::Permission(id) => {
                self.store.permission_by_id(id)?;
            }
            OverrideRef::Role(id) => {
                self.store.role_by_id(id)?;
            }
        }
        self.update_user(user_id, |user| {
            if !user.enabled_permissions.contains(&grant) {
                user.enabled_permissions.push(grant);
            }
        })
    }

    /// Add an explicit revocation.
    pub fn disable_permission(&self, user_id: UserId, permission: PermissionId) -> RbacResult<()> {
        self.update_user(user_id, |user| {
            if !user.disabled_permissions.contains(&permission) {
                user.disabled_permissions.push(permission);
            }
        })
    }

    /// Remove an explicit revocation.
    pub fn restore_permission(&self, user_id: UserId, permission: PermissionId) -> RbacResult<()> {
        self.update_user(user_id, |user| {
            user.disabled_permissions.retain(|&p| p != permission)
        })
    }

    fn update_user(&self, user_id: UserId, change: impl FnOnce(&mut User)) -> RbacResult<()> {
        let mut user = self.store.user_by_id(user_id)?;
        change(&mut user);
        self.commit(Mutation::UserChanged { user_id }, || self.store.save_user(user))
    }

    /// Look up a user.
    pub fn user(&self, user_id: UserId) -> RbacResult<User> {
        self.store.user_by_id(user_id)
    }

    /// Look up a permission by code.
    pub fn permission_by_code(&self, code: &str) -> RbacResult<Permission> {
        self.store.permission_by_code(code)
    }

    /// Look up a role by code.
    pub fn role_by_code(&self, code: &str) -> RbacResult<Role> {
        self.store.role_by_code(code)
    }
}
