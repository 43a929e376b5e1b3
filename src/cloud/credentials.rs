//! Credential Manager
//!
//! Owns the access token. The token is renewed through a token exchange:
//! the current token authorizes minting a new one on behalf of a registered
//! application. The application identity is discovered (or registered)
//! once and then cached for good.
//!
//! ```text
//! NoToken ──bootstrap──▶ Valid ──lead time reached──▶ Expiring ──renewed──▶ Valid
//!    ▲                                                   │
//!    │                                                   ├─renewal failed─▶ stale token kept
//!    └──────────────── token rejected by renewal ────────┘
//! ```

use super::{now_ms, CloudApi, CloudError, Target};
use crate::state::{Credential, StateError, StateStore};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while obtaining a valid token
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("No usable access token; configure a new one")]
    NoToken,

    #[error("Token renewal failed: {0}")]
    Renewal(CloudError),

    #[error("Device {0} has no owner, cannot discover an application identity")]
    NoOwner(String),

    #[error("Device group {0} has no devices, cannot discover an application identity")]
    EmptyGroup(String),

    #[error("User {0} has no publisher account")]
    NoPublisher(String),

    #[error("Cloud error during application discovery: {0}")]
    Discovery(#[from] CloudError),

    #[error("State error: {0}")]
    State(#[from] StateError),
}

/// Single owner of the access token and application identity
pub struct CredentialManager {
    api: Arc<dyn CloudApi>,
    store: Arc<StateStore>,
    target: Target,
    app_name: String,
    credential: Option<Credential>,
    app_id: Option<String>,
}

impl CredentialManager {
    /// Create a manager, preferring persisted state over the bootstrap credential.
    ///
    /// A persisted credential is used while it is unexpired; otherwise the
    /// bootstrap credential (typically from configuration) takes over.
    pub fn new(
        api: Arc<dyn CloudApi>,
        store: Arc<StateStore>,
        target: Target,
        app_name: impl Into<String>,
        bootstrap: Option<Credential>,
    ) -> Self {
        let state = store.load();
        let now = now_ms();

        let credential = match (state.credential, bootstrap) {
            (Some(saved), _) if saved.expires_at > now => Some(saved),
            (_, Some(bootstrap)) => Some(bootstrap),
            (saved, None) => saved,
        };

        Self {
            api,
            store,
            target,
            app_name: app_name.into(),
            credential,
            app_id: state.app_id,
        }
    }

    /// Copy of the current token, possibly stale
    pub fn snapshot(&self) -> Option<String> {
        self.credential.as_ref().map(|c| c.token.clone())
    }

    /// Expiry of the current token (Unix ms)
    pub fn expires_at(&self) -> Option<i64> {
        self.credential.as_ref().map(|c| c.expires_at)
    }

    /// Whether the token must be renewed to stay valid for `lead_ms` past `now`
    pub fn needs_renewal(&self, now: i64, lead_ms: i64) -> bool {
        match &self.credential {
            Some(c) => c.expires_at - now <= lead_ms,
            None => true,
        }
    }

    /// Return a token valid for at least `lead_ms`, renewing first if needed.
    ///
    /// On renewal failure the stale token stays in place and the error is
    /// returned; the caller decides whether to go on with [`Self::snapshot`].
    pub async fn ensure_valid(&mut self, lead_ms: i64) -> Result<String, AuthError> {
        if !self.needs_renewal(now_ms(), lead_ms) {
            if let Some(token) = self.snapshot() {
                return Ok(token);
            }
        }
        self.renew().await
    }

    /// Renew unconditionally.
    ///
    /// A token the renewal endpoint itself rejects cannot be recovered: it is
    /// discarded and [`AuthError::NoToken`] is returned from then on.
    pub async fn renew(&mut self) -> Result<String, AuthError> {
        let current = self.snapshot().ok_or(AuthError::NoToken)?;
        let app_id = self.app_id(&current).await?;

        tracing::info!(app_id = %app_id, "Renewing access token");
        let fresh = match self.api.renew_token(&current, &app_id).await {
            Ok(fresh) => fresh,
            Err(e) if e.is_unauthorized() => {
                tracing::error!(error = %e, "Token rejected by the renewal endpoint, discarding it");
                self.discard();
                return Err(AuthError::NoToken);
            }
            Err(e) => return Err(AuthError::Renewal(e)),
        };

        if let Err(e) = self.store.save_credential(&fresh) {
            // The new token is still usable for this process lifetime
            tracing::warn!(error = %e, "Failed to persist renewed token");
        }

        tracing::info!(expires_at = fresh.expires_at, "Access token renewed");
        let token = fresh.token.clone();
        self.credential = Some(fresh);
        Ok(token)
    }

    fn discard(&mut self) {
        self.credential = None;
        if let Err(e) = self.store.clear_credential() {
            tracing::warn!(error = %e, "Failed to forget the rejected token");
        }
    }

    /// Application identity used for renewal, discovered on first use
    async fn app_id(&mut self, token: &str) -> Result<String, AuthError> {
        if let Some(id) = &self.app_id {
            return Ok(id.clone());
        }

        // The owner of the (first) mirrored device owns the application
        let device_id = match &self.target {
            Target::Device(id) => id.clone(),
            Target::Group(group) => self
                .api
                .group_devices(token, group)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| AuthError::EmptyGroup(group.clone()))?,
        };

        let device = self.api.device(token, &device_id).await?;
        let owner = device.owner.ok_or(AuthError::NoOwner(device_id))?;

        let publisher = self
            .api
            .publishers(token, &owner)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AuthError::NoPublisher(owner.clone()))?;

        let existing = self
            .api
            .apps(token, &publisher.id)
            .await?
            .into_iter()
            .find(|app| app.name == self.app_name);

        let app = match existing {
            Some(app) => {
                tracing::info!(app_id = %app.id, "Reusing registered application");
                app
            }
            None => {
                tracing::info!(
                    publisher = %publisher.id,
                    name = %self.app_name,
                    "Registering application"
                );
                self.api
                    .register_app(token, &publisher.id, &self.app_name)
                    .await?
            }
        };

        self.store.save_app_id(&app.id)?;
        self.app_id = Some(app.id.clone());
        Ok(app.id)
    }
}
