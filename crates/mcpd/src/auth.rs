//! Credential verification and per-principal rate limiting.
//!
//! The server never interprets credentials itself; it delegates to an
//! [`AuthVerifier`] collaborator that turns a bearer token into a
//! principal and its capability grants. The grants bind to the session at
//! `initialize` time and gate primitive invocation from then on.

use crate::session::Principal;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Verified caller identity.
#[derive(Debug, Clone)]
pub struct Identity {
    pub principal: Principal,
    pub capabilities: HashSet<String>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("invalid credentials")]
    InvalidCredentials,
}

/// Collaborator that validates transport credentials.
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, token: Option<&str>) -> Result<Identity, AuthError>;
}

/// Verifier backed by a fixed token table.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        StaticTokenVerifier {
            tokens: HashMap::new(),
        }
    }

    /// Grant `capabilities` to callers presenting `token`.
    pub fn grant(
        mut self,
        token: impl Into<String>,
        principal: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            Identity {
                principal: Principal::User(principal.into()),
                capabilities: capabilities.into_iter().collect(),
            },
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for StaticTokenVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StaticTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Don't leak token values in debug output
        f.debug_struct("StaticTokenVerifier")
            .field("tokens", &format!("<{} redacted>", self.tokens.len()))
            .finish()
    }
}

#[async_trait]
impl AuthVerifier for StaticTokenVerifier {
    async fn verify(&self, token: Option<&str>) -> Result<Identity, AuthError> {
        let token = token.ok_or(AuthError::MissingCredentials)?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidCredentials)
    }
}

/// Verifier that accepts everyone with a fixed capability set. Meant for
/// stdio deployments and tests.
#[derive(Debug, Clone)]
pub struct AnonymousVerifier {
    capabilities: HashSet<String>,
}

impl AnonymousVerifier {
    pub fn new(capabilities: impl IntoIterator<Item = String>) -> Self {
        AnonymousVerifier {
            capabilities: capabilities.into_iter().collect(),
        }
    }
}

#[async_trait]
impl AuthVerifier for AnonymousVerifier {
    async fn verify(&self, _token: Option<&str>) -> Result<Identity, AuthError> {
        Ok(Identity {
            principal: Principal::Anonymous,
            capabilities: self.capabilities.clone(),
        })
    }
}

/// Fixed-window request counter per principal.
pub struct RateLimiter {
    per_minute: u32,
    windows: Mutex<HashMap<String, (i64, u32)>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        RateLimiter {
            per_minute,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request; returns the advisory wait in milliseconds when
    /// the principal is over its budget for the current minute.
    pub fn check(&self, principal: &Principal) -> Result<(), u64> {
        let now = Utc::now();
        let minute = now.timestamp() / 60;
        let mut windows = self.windows.lock();
        let entry = windows.entry(principal.to_string()).or_insert((minute, 0));
        if entry.0 != minute {
            *entry = (minute, 0);
        }
        if entry.1 >= self.per_minute {
            let remaining_ms = 60_000 - (now.timestamp_millis() % 60_000);
            return Err(remaining_ms.max(0) as u64);
        }
        entry.1 += 1;
        Ok(())
    }
}
