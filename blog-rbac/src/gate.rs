//! Request-time authorization gate.
//!
//! Each request runs through a fixed sequence of rules; the first rule that
//! matches decides:
//!
//! 1. no authenticated user: allow (endpoints apply their own policy)
//! 2. superuser: allow
//! 3. path outside the configured API prefix: allow
//! 4. white-listed path (trailing slashes ignored): allow
//! 5. otherwise allow iff the user holds a permission for `(path, method)`

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::RbacEngine;
use crate::error::{RbacError, RbacResult};
use crate::types::{HttpMethod, User};

/// Why a request was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    /// No authenticated user
    Anonymous,
    /// Superuser bypass
    Superuser,
    /// Path is outside the checked API prefix
    OutsideApi,
    /// Path is white-listed
    WhiteListed,
    /// The user holds a matching permission
    Granted,
}

/// Outcome of a gate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Let the request through
    Allow(AllowReason),
    /// Reject the request
    Deny,
}

impl Decision {
    /// Check if the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

/// The per-request decision point.
#[derive(Debug, Clone)]
pub struct AuthorizationGate {
    engine: Arc<RbacEngine>,
    white_list: HashSet<String>,
    api_prefix: Option<String>,
}

impl AuthorizationGate {
    /// Create a gate using the white list and API prefix of the engine's
    /// configuration.
    pub fn new(engine: Arc<RbacEngine>) -> Self {
        let white_list = engine
            .config()
            .white_list
            .iter()
            .map(|path| normalize(path).to_string())
            .collect();
        let api_prefix = engine.config().api_prefix.clone();

        Self {
            engine,
            white_list,
            api_prefix,
        }
    }

    /// Add a white-listed path.
    pub fn allow_path(mut self, path: &str) -> Self {
        self.white_list.insert(normalize(path).to_string());
        self
    }

    /// Check whether `path` is white-listed.
    pub fn is_white_listed(&self, path: &str) -> bool {
        self.white_list.contains(normalize(path))
    }

    /// Decide a request.
    ///
    /// An unrecognised method is denied: no permission can match it.
    ///
    /// # Errors
    ///
    /// Store failures during resolution. A denial is `Ok(Decision::Deny)`.
    pub fn decide(&self, user: Option<&User>, path: &str, method: &str) -> RbacResult<Decision> {
        let Some(user) = user else {
            return Ok(Decision::Allow(AllowReason::Anonymous));
        };

        if user.is_superuser {
            return Ok(Decision::Allow(AllowReason::Superuser));
        }

        if let Some(prefix) = &self.api_prefix {
            if !path.starts_with(prefix.as_str()) {
                return Ok(Decision::Allow(AllowReason::OutsideApi));
            }
        }

        if self.is_white_listed(path) {
            return Ok(Decision::Allow(AllowReason::WhiteListed));
        }

        let Some(method) = HttpMethod::parse(method) else {
            debug!(user_id = user.id, method, path, "unknown method");
            return Ok(Decision::Deny);
        };

        if self.engine.has_permission(user, path, method)? {
            Ok(Decision::Allow(AllowReason::Granted))
        } else {
            Ok(Decision::Deny)
        }
    }

    /// Decide a request, turning a denial into [`RbacError::PermissionDenied`].
    pub fn authorize(&self, user: Option<&User>, path: &str, method: &str) -> RbacResult<AllowReason> {
        match self.decide(user, path, method)? {
            Decision::Allow(reason) => Ok(reason),
            Decision::Deny => {
                info!(user_id = user.map(|u| u.id), method, path, "request denied");
                Err(RbacError::denied(method.to_uppercase(), path))
            }
        }
    }
}

fn normalize(path: &str) -> &str {
    path.trim_end_matches('/')
}
