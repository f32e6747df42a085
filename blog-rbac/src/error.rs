//! Error types for authorization operations
//!
//! This module defines every error the RBAC engine can surface: validation
//! failures at the mutation boundary, missing records, denied requests, and
//! backend failures of the store or the cache.

use thiserror::Error;

use crate::types::{PermissionId, RoleId, UserId};

/// Kind of record referenced by a [`RbacError::NotFound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    /// A permission definition
    Permission,
    /// A role
    Role,
    /// A user record
    User,
}

impl Entity {
    /// Get the lowercase name of the entity.
    pub fn as_str(&self) -> &'static str {
        match self {
            Entity::Permission => "permission",
            Entity::Role => "role",
            Entity::User => "user",
        }
    }
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization error types.
#[derive(Debug, Error)]
pub enum RbacError {
    /// A mutation would break an invariant (cycle, duplicate edge, duplicate code)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A referenced record does not exist
    #[error("{entity} {key} not found")]
    NotFound {
        /// Kind of record
        entity: Entity,
        /// Identifier or lookup key that matched nothing
        key: String,
    },

    /// The gate denied the request
    #[error("Permission denied: {method} {path}")]
    PermissionDenied {
        /// HTTP method of the denied request
        method: String,
        /// Request path of the denied request
        path: String,
    },

    /// The cache backend failed
    #[error("Cache error: {0}")]
    Cache(String),

    /// The record store failed
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    Config {
        /// Configuration key
        key: String,
        /// Error message
        message: String,
    },
}

/// Result type for authorization operations.
pub type RbacResult<T> = Result<T, RbacError>;

impl RbacError {
    /// Missing record looked up by `key`.
    pub fn not_found(entity: Entity, key: impl ToString) -> Self {
        RbacError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Missing permission.
    pub fn permission_not_found(id: PermissionId) -> Self {
        Self::not_found(Entity::Permission, id)
    }

    /// Missing role.
    pub fn role_not_found(id: RoleId) -> Self {
        Self::not_found(Entity::Role, id)
    }

    /// Missing user.
    pub fn user_not_found(id: UserId) -> Self {
        Self::not_found(Entity::User, id)
    }

    /// Denied request.
    pub fn denied(method: impl Into<String>, path: impl Into<String>) -> Self {
        RbacError::PermissionDenied {
            method: method.into(),
            path: path.into(),
        }
    }

    /// Check if this error is the final outcome of an authorization check.
    pub fn is_denied(&self) -> bool {
        matches!(self, RbacError::PermissionDenied { .. })
    }

    /// Check if this error should be logged at error level.
    ///
    /// Validation failures, missing records and denials are expected
    /// outcomes and should not be logged as errors.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            RbacError::Cache(_) | RbacError::Store(_) | RbacError::Config { .. }
        )
    }

    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            RbacError::Validation(_) => 400,
            RbacError::NotFound { .. } => 404,
            RbacError::PermissionDenied { .. } => 403,
            RbacError::Cache(_) | RbacError::Store(_) | RbacError::Config { .. } => 500,
        }
    }

    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            RbacError::Validation(_) => "VALIDATION_ERROR",
            RbacError::NotFound { .. } => "NOT_FOUND",
            RbacError::PermissionDenied { .. } => "PERMISSION_DENIED",
            RbacError::Cache(_) => "CACHE_ERROR",
            RbacError::Store(_) => "STORE_ERROR",
            RbacError::Config { .. } => "CONFIG_ERROR",
        }
    }
}
