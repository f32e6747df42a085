//! Engine configuration.
//!
//! Configuration is loaded from environment variables with defaults that
//! match the production settings of the blogsite backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RbacError, RbacResult};

/// Default lifetime of a cached permission set.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3600;

/// Default maximum number of cached users.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// Default cache-key namespace.
pub const DEFAULT_USER_KIND: &str = "User";

/// RBAC engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RbacConfig {
    /// Whether resolved permission sets are cached.
    pub cache_enabled: bool,

    /// Seconds a cached permission set stays valid.
    pub cache_ttl_secs: u64,

    /// Maximum number of cached users.
    pub cache_capacity: usize,

    /// Paths that skip the permission check (trailing slashes ignored).
    pub white_list: Vec<String>,

    /// When set, only paths under this prefix are checked by the gate.
    pub api_prefix: Option<String>,

    /// Namespace for cache keys, one per concrete principal type.
    pub user_kind: String,
}

impl Default for RbacConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            white_list: Vec::new(),
            api_prefix: None,
            user_kind: DEFAULT_USER_KIND.to_string(),
        }
    }
}

impl RbacConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RBAC_CACHE_ENABLED`: cache resolved permission sets (default: true)
    /// - `RBAC_CACHE_TTL_SECS`: cache entry lifetime (default: 3600)
    /// - `RBAC_CACHE_CAPACITY`: maximum cached users (default: 10000)
    /// - `RBAC_WHITE_LIST`: comma-separated paths that skip the check
    /// - `RBAC_API_PREFIX`: only check paths under this prefix (default: unset)
    /// - `RBAC_USER_KIND`: cache-key namespace (default: User)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            cache_enabled: std::env::var("RBAC_CACHE_ENABLED")
                .map(|s| s != "false" && s != "0")
                .unwrap_or(default.cache_enabled),
            cache_ttl_secs: std::env::var("RBAC_CACHE_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.cache_ttl_secs),
            cache_capacity: std::env::var("RBAC_CACHE_CAPACITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(default.cache_capacity),
            white_list: std::env::var("RBAC_WHITE_LIST")
                .map(|s| parse_list(&s))
                .unwrap_or(default.white_list),
            api_prefix: std::env::var("RBAC_API_PREFIX")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            user_kind: std::env::var("RBAC_USER_KIND").unwrap_or(default.user_kind),
        }
    }

    /// Add a white-listed path.
    pub fn with_white_listed(mut self, path: impl Into<String>) -> Self {
        self.white_list.push(path.into());
        self
    }

    /// Restrict checks to paths under `prefix`.
    pub fn with_api_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.api_prefix = Some(prefix.into());
        self
    }

    /// Turn caching off.
    pub fn without_cache(mut self) -> Self {
        self.cache_enabled = false;
        self
    }

    /// Cache entry lifetime.
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// [`RbacError::Config`] for a zero TTL, a zero capacity or an empty
    /// user kind.
    pub fn validate(&self) -> RbacResult<()> {
        if self.cache_ttl_secs == 0 {
            return Err(RbacError::Config {
                key: "cache_ttl_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.cache_capacity == 0 {
            return Err(RbacError::Config {
                key: "cache_capacity".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.user_kind.trim().is_empty() {
            return Err(RbacError::Config {
                key: "user_kind".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
