//! # Blog RBAC (Role-Based Access Control)
//!
//! Permission-resolution engine for the blogsite backend: given a user and a
//! request `(method, path)`, decide whether the request is authorized.
//!
//! ## Overview
//!
//! The blog-rbac crate handles:
//! - **Role hierarchy**: a DAG of roles where children inherit their parents' grants
//! - **Resolution**: role grants plus per-user overrides, minus revocations
//! - **Caching**: resolved permission-id sets per user, invalidated on write
//! - **Gate**: the per-request allow/deny decision
//!
//! ## Architecture
//!
//! ```text
//! AuthorizationGate ──▶ RbacEngine ──▶ PermissionCache (hit?)
//!                           │
//!                           └──▶ PermissionResolver ──▶ RoleGraph + PermissionStore
//!
//! RbacAdmin ──write──▶ store ──▶ RbacEngine::apply ──▶ invalidate ──▶ listeners
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use blog_rbac::{
//!     AuthorizationGate, HttpMethod, InMemoryRbacStore, Permission, RbacAdmin, RbacConfig,
//!     RbacEngine, Role, User,
//! };
//!
//! let store = Arc::new(InMemoryRbacStore::new());
//! let engine = Arc::new(RbacEngine::new(store.clone(), RbacConfig::default()).unwrap());
//! let admin = RbacAdmin::new(store, engine.clone());
//!
//! let admin_role = admin.create_role(Role::new("admin", "Administrator")).unwrap();
//! let viewer_role = admin.create_role(Role::new("viewer", "Viewer")).unwrap();
//! let create = admin
//!     .create_permission(Permission::new("role.create", "/api/v1/roles/", HttpMethod::Post))
//!     .unwrap();
//! admin.grant(admin_role.id, create.id).unwrap();
//!
//! // viewer inherits everything admin is granted
//! admin.add_hierarchy_edge(admin_role.id, viewer_role.id).unwrap();
//!
//! let user = User::new(1).with_role(viewer_role.id);
//! admin.save_user(user.clone()).unwrap();
//!
//! let gate = AuthorizationGate::new(engine);
//! assert!(gate.decide(Some(&user), "/api/v1/roles/", "POST").unwrap().is_allowed());
//! assert!(!gate.decide(Some(&user), "/api/v1/roles/", "DELETE").unwrap().is_allowed());
//! ```
//!
//! ## Invariants
//!
//! - The hierarchy is acyclic; the store checks and inserts edges in one step.
//! - `disabled_permissions` wins over every grant path.
//! - Inactive permissions, links and roles contribute nothing.
//! - The cache is disposable: clearing it never changes an answer.

pub mod admin;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod gate;
pub mod graph;
pub mod memory;
pub mod resolver;
pub mod store;
pub mod types;

pub use admin::{MutationListener, RbacAdmin};
pub use cache::{CacheKey, CacheStats, MemoryPermissionCache, PermissionCache};
pub use config::RbacConfig;
pub use engine::{Mutation, RbacEngine};
pub use error::{Entity, RbacError, RbacResult};
pub use gate::{AllowReason, AuthorizationGate, Decision};
pub use graph::{GraphError, RoleGraph};
pub use memory::InMemoryRbacStore;
pub use resolver::PermissionResolver;
pub use store::{AdminStore, HierarchyStore, PermissionStore, RbacStore, UserDirectory};
pub use types::{
    HttpMethod, OverrideRef, Permission, PermissionId, Role, RoleEdge, RoleId, RolePermission,
    Stage, User, UserId,
};
