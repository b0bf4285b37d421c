//! The per-call environment attached to every script invocation.

use serde::{Deserialize, Serialize};

/// Identity and addressing for one call or session.
///
/// Immutable for the lifetime of the invocation; the host API reads it to
/// address downstream services, and scripts see it as the `env` global and
/// as the second constructor argument of session classes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Env {
    pub gamespace_id: String,
    #[serde(default)]
    pub application_name: String,
    #[serde(default)]
    pub application_version: String,
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub access_scopes: Vec<String>,
}

impl Env {
    pub fn new(gamespace_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            gamespace_id: gamespace_id.into(),
            account_id: account_id.into(),
            ..Self::default()
        }
    }

    pub fn application(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        self.application_name = name.into();
        self.application_version = version.into();
        self
    }

    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.access_scopes = scopes;
        self
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.access_scopes.iter().any(|s| s == scope)
    }
}
