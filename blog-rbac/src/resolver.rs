//! # Permission resolution
//!
//! Computes the effective permission set of a user:
//!
//! ```text
//! roles      = direct roles ∪ their ancestors         (active roles only)
//! granted    = grants of roles ∪ explicit overrides   (active links and permissions only)
//! effective  = granted \ disabled_permissions
//! ```
//!
//! The resolver is a short-lived view over a store and a role graph; it holds
//! no state of its own and never touches the cache.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};

use crate::error::{RbacError, RbacResult};
use crate::graph::RoleGraph;
use crate::store::PermissionStore;
use crate::types::{HttpMethod, OverrideRef, Permission, PermissionId, RoleId, User};

/// Resolves users to their effective permissions.
pub struct PermissionResolver<'a, S: PermissionStore + ?Sized> {
    store: &'a S,
    graph: &'a RoleGraph,
}

impl<'a, S: PermissionStore + ?Sized> PermissionResolver<'a, S> {
    /// Create a resolver over `store` and `graph`.
    pub fn new(store: &'a S, graph: &'a RoleGraph) -> Self {
        Self { store, graph }
    }

    /// Effective permissions of `user`, sorted by id.
    ///
    /// Superusers resolve to every active permission.
    pub fn resolve(&self, user: &User) -> RbacResult<Vec<Permission>> {
        if user.is_superuser {
            return self.store.active_permissions();
        }
        let ids = self.resolve_ids(user)?;
        self.hydrate(&ids)
    }

    /// Effective permission ids of `user`.
    ///
    /// This is the value the cache stores.
    pub fn resolve_ids(&self, user: &User) -> RbacResult<BTreeSet<PermissionId>> {
        if user.is_superuser {
            return Ok(self.store.active_permissions()?.iter().map(|p| p.id).collect());
        }

        let mut granted = BTreeSet::new();

        for role in self.effective_roles(user)? {
            granted.extend(self.store.active_permissions_for_role(role)?.iter().map(|p| p.id));
        }

        for grant in &user.enabled_permissions {
            match *grant {
                OverrideRef::Permission(id) => match self.store.permission_by_id(id) {
                    Ok(permission) if permission.is_active => {
                        granted.insert(permission.id);
                    }
                    Ok(_) => {}
                    Err(RbacError::NotFound { .. }) => {
                        warn!(user_id = user.id, permission_id = id, "override names a missing permission");
                    }
                    Err(e) => return Err(e),
                },
                OverrideRef::Role(role) => {
                    if self.role_is_active(role)? {
                        granted.extend(
                            self.store.active_permissions_for_role(role)?.iter().map(|p| p.id),
                        );
                    }
                }
            }
        }

        for revoked in &user.disabled_permissions {
            granted.remove(revoked);
        }

        debug!(user_id = user.id, permissions = granted.len(), "resolved permissions");
        Ok(granted)
    }

    /// Turn an id set back into permissions, dropping ids that have since
    /// been deleted or deactivated.
    pub fn hydrate(&self, ids: &BTreeSet<PermissionId>) -> RbacResult<Vec<Permission>> {
        let mut permissions = self.store.permissions_by_ids(ids)?;
        permissions.retain(|p| p.is_active);
        permissions.sort_by_key(|p| p.id);
        Ok(permissions)
    }

    /// Active roles whose grants reach `user`: direct roles plus every
    /// ancestor. Inactive roles are skipped but still pass their ancestors on.
    pub fn effective_roles(&self, user: &User) -> RbacResult<BTreeSet<RoleId>> {
        let mut reachable: HashSet<RoleId> = HashSet::new();
        for &role in &user.roles {
            reachable.insert(role);
            reachable.extend(self.graph.ancestors(role));
        }

        let mut active = BTreeSet::new();
        for role in reachable {
            if self.role_is_active(role)? {
                active.insert(role);
            }
        }
        Ok(active)
    }

    /// Check whether `user` may call `method api_url`.
    pub fn has_permission(&self, user: &User, api_url: &str, method: HttpMethod) -> RbacResult<bool> {
        if user.is_superuser {
            return Ok(true);
        }
        Ok(self
            .resolve(user)?
            .iter()
            .any(|p| p.matches(api_url, method)))
    }

    /// Permissions `role` is granted directly.
    pub fn role_permissions(&self, role: RoleId) -> RbacResult<Vec<Permission>> {
        self.store.role_by_id(role)?;
        let mut permissions = self.store.active_permissions_for_role(role)?;
        permissions.sort_by_key(|p| p.id);
        Ok(permissions)
    }

    /// Permissions `role` inherits from its active ancestors.
    pub fn inherited_permissions(&self, role: RoleId) -> RbacResult<Vec<Permission>> {
        self.store.role_by_id(role)?;
        let mut ids = BTreeSet::new();
        for ancestor in self.graph.ancestors(role) {
            if self.role_is_active(ancestor)? {
                ids.extend(self.store.active_permissions_for_role(ancestor)?.iter().map(|p| p.id));
            }
        }
        self.hydrate(&ids)
    }

    /// Own and inherited permissions of `role`.
    pub fn all_role_permissions(&self, role: RoleId) -> RbacResult<Vec<Permission>> {
        let mut ids: BTreeSet<PermissionId> =
            self.role_permissions(role)?.iter().map(|p| p.id).collect();
        ids.extend(self.inherited_permissions(role)?.iter().map(|p| p.id));
        self.hydrate(&ids)
    }

    fn role_is_active(&self, role: RoleId) -> RbacResult<bool> {
        match self.store.role_by_id(role) {
            Ok(r) => Ok(r.is_active),
            Err(RbacError::NotFound { .. }) => {
                warn!(role_id = role, "skipping missing role");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
