//! Identity extraction.
//!
//! Authentication happens upstream; the gateway consumes an
//! already-validated identity from request headers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use kiln_engine::Env;

use crate::error::ErrorEnvelope;

pub const GAMESPACE_HEADER: &str = "x-gamespace";
pub const ACCOUNT_HEADER: &str = "x-account";
pub const SCOPES_HEADER: &str = "x-access-scopes";

/// Scope required for calls and sessions.
pub const SCOPE_CALL: &str = "exec_func_call";
/// Scope required for debug sessions.
pub const SCOPE_DEBUG: &str = "exec_debug";
/// Scope required for server-code calls.
pub const SCOPE_ADMIN: &str = "exec_admin";

/// The validated caller identity.
#[derive(Debug, Clone)]
pub struct Identity {
    pub gamespace: String,
    pub account: String,
    pub scopes: Vec<String>,
}

impl Identity {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }

    pub fn require_scope(&self, scope: &str) -> Result<(), ErrorEnvelope> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(ErrorEnvelope::new(403, format!("Missing scope: {scope}")))
        }
    }

    /// Environment for an application call.
    pub fn env(&self, application_name: &str, application_version: &str) -> Env {
        Env::new(&self.gamespace, &self.account)
            .application(application_name, application_version)
            .scopes(self.scopes.clone())
    }

    /// Environment for a server-code call.
    pub fn server_env(&self) -> Env {
        Env::new(&self.gamespace, &self.account).scopes(self.scopes.clone())
    }
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ErrorEnvelope;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let gamespace = header(GAMESPACE_HEADER)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ErrorEnvelope::new(401, "Missing gamespace"))?;
        let account = header(ACCOUNT_HEADER).unwrap_or_default();
        let scopes = header(SCOPES_HEADER)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            gamespace,
            account,
            scopes,
        })
    }
}
