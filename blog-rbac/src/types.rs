//! # Types
//!
//! Records the engine reads: permissions, roles, role-permission links,
//! hierarchy edges and the user principal with its per-user overrides.

use serde::{Deserialize, Serialize};

/// Unique permission identifier
pub type PermissionId = i64;

/// Unique role identifier
pub type RoleId = i64;

/// Unique user identifier
pub type UserId = i64;

/// HTTP verbs a permission can be bound to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// PATCH
    Patch,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// OPTIONS
    Options,
}

impl HttpMethod {
    /// Get the canonical (uppercase) verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }

    /// Parse a verb, case-insensitively.
    ///
    /// # Example
    ///
    /// ```
    /// use blog_rbac::types::HttpMethod;
    ///
    /// assert_eq!(HttpMethod::parse("post"), Some(HttpMethod::Post));
    /// assert_eq!(HttpMethod::parse("BREW"), None);
    /// ```
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            "PATCH" => Some(Self::Patch),
            "DELETE" => Some(Self::Delete),
            "HEAD" => Some(Self::Head),
            "OPTIONS" => Some(Self::Options),
            _ => None,
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the site a permission or role belongs to.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Public-facing pages and APIs
    #[default]
    Frontstage,
    /// Administrative pages and APIs
    Backstage,
}

impl Stage {
    /// Get the lowercase name of the stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Frontstage => "frontstage",
            Stage::Backstage => "backstage",
        }
    }
}

/// An atomic grant, matched at check time by `(api_url, method)`.
///
/// `code` is globally unique and is what humans and audits refer to;
/// `(module, action, resource)` is unique as well.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permission {
    /// Identifier assigned by the store
    pub id: PermissionId,
    /// Unique code, e.g. `role.create`
    pub code: String,
    /// Display name
    pub name: String,
    /// Action verb in the permission catalogue (e.g. `create`)
    pub action: String,
    /// Resource the action applies to (e.g. `role`)
    pub resource: String,
    /// Grouping used by the admin UI
    #[serde(default)]
    pub category: String,
    /// Owning module (e.g. `rbac`, `blog`)
    #[serde(default)]
    pub module: String,
    /// Frontstage or backstage
    #[serde(default)]
    pub stage: Stage,
    /// Literal request path this permission authorizes
    pub api_url: String,
    /// HTTP verb this permission authorizes
    pub method: HttpMethod,
    /// Inactive permissions never contribute to a grant
    pub is_active: bool,
}

impl Permission {
    /// Create an active permission bound to `method api_url`.
    ///
    /// The id is assigned by the store on insert; `action` and `resource`
    /// are derived from the code (`resource.action`) and can be overridden.
    pub fn new(
        code: impl Into<String>,
        api_url: impl Into<String>,
        method: HttpMethod,
    ) -> Self {
        let code = code.into();
        let (resource, action) = match code.split_once('.') {
            Some((resource, action)) => (resource.to_string(), action.to_string()),
            None => (code.clone(), method.as_str().to_lowercase()),
        };

        Self {
            id: 0,
            name: code.clone(),
            code,
            action,
            resource,
            category: String::new(),
            module: String::new(),
            stage: Stage::default(),
            api_url: api_url.into(),
            method,
            is_active: true,
        }
    }

    /// Set the owning module.
    pub fn with_module(mut self, module: impl Into<String>) -> Self {
        self.module = module.into();
        self
    }

    /// Set the category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Set the stage.
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// Mark the permission inactive.
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Check whether this permission authorizes `method api_url`.
    ///
    /// Matching is literal string equality on the path; parameterized
    /// routes are stored as one row per concrete action.
    pub fn matches(&self, api_url: &str, method: HttpMethod) -> bool {
        self.method == method && self.api_url == api_url
    }

    /// Key used to enforce `(module, action, resource)` uniqueness.
    pub fn natural_key(&self) -> (&str, &str, &str) {
        (&self.module, &self.action, &self.resource)
    }
}

/// A role. Roles form a DAG through [`RoleEdge`]s.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Role {
    /// Identifier assigned by the store
    pub id: RoleId,
    /// Unique code, e.g. `admin`
    pub code: String,
    /// Display name
    pub name: String,
    /// Informational depth hint; the hierarchy itself lives in the edges
    #[serde(default)]
    pub level: u32,
    /// Inactive roles grant nothing
    pub is_active: bool,
    /// Frontstage or backstage
    #[serde(default)]
    pub stage: Stage,
}

impl Role {
    /// Create an active role. The id is assigned by the store on insert.
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: 0,
            code: code.into(),
            name: name.into(),
            level: 0,
            is_active: true,
            stage: Stage::default(),
        }
    }

    /// Set the level hint.
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = level;
        self
    }

    /// Set the stage.
    pub fn with_stage(mut self, stage: Stage) -> Self {
        self.stage = stage;
        self
    }

    /// Mark the role inactive.
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// Association between a role and a permission.
///
/// `is_active = false` suspends the grant without deleting the row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct RolePermission {
    /// Granting role
    pub role_id: RoleId,
    /// Granted permission
    pub permission_id: PermissionId,
    /// Whether the grant is in effect
    pub is_active: bool,
}

/// Hierarchy edge: `child` inherits every permission granted to `parent`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoleEdge {
    /// Role whose grants flow down
    pub parent: RoleId,
    /// Role that inherits
    pub child: RoleId,
}

impl RoleEdge {
    /// Create an edge `parent -> child`.
    pub fn new(parent: RoleId, child: RoleId) -> Self {
        Self { parent, child }
    }
}

/// Explicit per-user grant, independent of role membership.
///
/// Serialized in the shapes the account records use: a bare permission id,
/// `{"permission": id}`, or `{"role": id}`.
///
/// # Example
///
/// ```
/// use blog_rbac::types::OverrideRef;
///
/// let list: Vec<OverrideRef> = serde_json::from_str(r#"[3, {"role": 2}, {"permission": 9}]"#).unwrap();
/// assert_eq!(list, vec![
///     OverrideRef::Permission(3),
///     OverrideRef::Role(2),
///     OverrideRef::Permission(9),
/// ]);
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(from = "RawOverride", into = "RawOverride")]
pub enum OverrideRef {
    /// Grants a single permission
    Permission(PermissionId),
    /// Grants every active permission of a role, without membership
    Role(RoleId),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawOverride {
    Bare(PermissionId),
    Role { role: RoleId },
    Permission { permission: PermissionId },
}

impl From<RawOverride> for OverrideRef {
    fn from(raw: RawOverride) -> Self {
        match raw {
            RawOverride::Bare(id) | RawOverride::Permission { permission: id } => {
                OverrideRef::Permission(id)
            }
            RawOverride::Role { role } => OverrideRef::Role(role),
        }
    }
}

impl From<OverrideRef> for RawOverride {
    fn from(value: OverrideRef) -> Self {
        match value {
            OverrideRef::Permission(id) => RawOverride::Bare(id),
            OverrideRef::Role(role) => RawOverride::Role { role },
        }
    }
}

/// The principal an authorization check is made for.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    /// User identifier
    pub id: UserId,
    /// Global bypass
    #[serde(default)]
    pub is_superuser: bool,
    /// Directly assigned roles
    #[serde(default)]
    pub roles: Vec<RoleId>,
    /// Explicit grants
    #[serde(default)]
    pub enabled_permissions: Vec<OverrideRef>,
    /// Explicit revocations; these win over every grant path
    #[serde(default)]
    pub disabled_permissions: Vec<PermissionId>,
}

impl User {
    /// Create a regular user with no roles or overrides.
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    /// Create a superuser.
    pub fn superuser(id: UserId) -> Self {
        Self {
            id,
            is_superuser: true,
            ..Default::default()
        }
    }

    /// Add a directly assigned role.
    pub fn with_role(mut self, role: RoleId) -> Self {
        if !self.roles.contains(&role) {
            self.roles.push(role);
        }
        self
    }

    /// Add an explicit grant.
    pub fn with_enabled(mut self, grant: OverrideRef) -> Self {
        if !self.enabled_permissions.contains(&grant) {
            self.enabled_permissions.push(grant);
        }
        self
    }

    /// Add an explicit revocation.
    pub fn with_disabled(mut self, permission: PermissionId) -> Self {
        if !self.disabled_permissions.contains(&permission) {
            self.disabled_permissions.push(permission);
        }
        self
    }

    /// Check whether the user names `role` in an override.
    pub fn references_role(&self, role: RoleId) -> bool {
        self.enabled_permissions.contains(&OverrideRef::Role(role))
    }

    /// Check whether the user names `permission` in an override or revocation.
    pub fn references_permission(&self, permission: PermissionId) -> bool {
        self.enabled_permissions
            .contains(&OverrideRef::Permission(permission))
            || self.disabled_permissions.contains(&permission)
    }
}
