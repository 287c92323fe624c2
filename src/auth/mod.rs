//! Connection authorization.
//!
//! Credential verification belongs to an external collaborator; the core
//! only needs the [`Authenticator`] seam. [`StaticAuthenticator`] checks a
//! configured user table and is what the bundled server uses.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::config::AuthSettings;

/// Outcome of one authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub ok: bool,
    pub reason: Option<String>,
}

impl AuthResult {
    pub fn allowed() -> Self {
        Self {
            ok: true,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, username: &str, password: &str) -> AuthResult;
}

/// Username/password table loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(settings.users.clone())
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> AuthResult {
        match self.users.get(username) {
            Some(expected) if expected == password => AuthResult::allowed(),
            _ => AuthResult::denied("invalid credentials"),
        }
    }
}
