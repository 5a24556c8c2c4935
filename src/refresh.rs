use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;

use crate::crypto::SecretCipher;
use crate::oidc::{OidcError, OidcFlows};
use crate::store::{self, RefreshStore, StoreError, MAX_STORE_TTL};
use crate::token;
use crate::user::Identity;

#[derive(Error, Debug, Clone)]
pub enum RefreshError {
    /// The provider rejected the refresh token; the session must be purged.
    #[error("refresh token rejected by provider")]
    InvalidGrant,
    /// No refresh token could be retrieved; the caller needs a fresh login.
    #[error("no refresh token available for session")]
    NoRefreshToken,
    /// The provider could not be reached; the session is left untouched.
    #[error("provider unreachable during refresh: {0}")]
    Transport(String),
    #[error("refresh produced an unusable token: {0}")]
    Invalid(String),
}

/// Everything a successful refresh replaces: the new access token and its
/// identity, the re-encrypted (possibly rotated) refresh token, and the new
/// session key the store entry moved to.
#[derive(Debug, Clone)]
pub struct RefreshedSession {
    pub access_token: String,
    pub identity: Identity,
    pub session_key: String,
    pub state_ciphertext: String,
    pub cookie_ttl: Duration,
}

/// Inputs for one refresh attempt, owned so the work can be shared between
/// concurrent waiters.
#[derive(Clone)]
pub struct RefreshRequest {
    pub session_key: String,
    pub cookie_ciphertext: Option<String>,
    pub provider: Arc<dyn OidcFlows>,
    pub store: Option<Arc<dyn RefreshStore>>,
    pub cipher: Arc<SecretCipher>,
    pub fallback_ttl: Duration,
}

type SharedOutcome = Shared<BoxFuture<'static, Result<RefreshedSession, RefreshError>>>;

/// Coalesces concurrent refreshes of the same session into one token
/// endpoint call. The first request for a key starts the exchange; late
/// joiners await the same shared future and receive its result. Entries are
/// removed once their outcome is delivered, tagged with a generation so a
/// slow waiter cannot evict a successor's in-flight entry.
#[derive(Default)]
pub struct RefreshCoordinator {
    inflight: Mutex<HashMap<String, (u64, SharedOutcome)>>,
    generation: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn refresh(&self, request: RefreshRequest) -> Result<RefreshedSession, RefreshError> {
        let key = request.session_key.clone();
        let (generation, outcome) = {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match inflight.get(&key) {
                Some((generation, shared)) => (*generation, shared.clone()),
                None => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                    let shared = perform(request).boxed().shared();
                    inflight.insert(key.clone(), (generation, shared.clone()));
                    (generation, shared)
                }
            }
        };

        let result = outcome.await;

        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if matches!(inflight.get(&key), Some((current, _)) if *current == generation) {
            inflight.remove(&key);
        }
        result
    }
}

async fn perform(request: RefreshRequest) -> Result<RefreshedSession, RefreshError> {
    let RefreshRequest {
        session_key,
        cookie_ciphertext,
        provider,
        store,
        cipher,
        fallback_ttl,
    } = request;

    let ciphertext = match &store {
        Some(backend) => backend.get(&session_key).await.map_err(|err| match err {
            StoreError::Missing => RefreshError::NoRefreshToken,
            StoreError::Backend(msg) => {
                log::warn!("refresh store read failed: {}", msg);
                RefreshError::NoRefreshToken
            }
        })?,
        None => cookie_ciphertext.ok_or(RefreshError::NoRefreshToken)?,
    };

    let refresh_plain = cipher.decode(&ciphertext).map_err(|err| {
        log::warn!("stored refresh token failed to decrypt: {}", err);
        RefreshError::InvalidGrant
    })?;

    let pair = provider
        .refresh_exchange(&refresh_plain)
        .await
        .map_err(|err| match err {
            OidcError::InvalidGrant => RefreshError::InvalidGrant,
            OidcError::Transport(msg) => RefreshError::Transport(msg),
            other => RefreshError::Transport(other.to_string()),
        })?;

    let (_, identity) = token::parse(&pair.access_token)
        .map_err(|err| RefreshError::Invalid(err.to_string()))?;

    // Providers may rotate the refresh token on every exchange.
    let current_refresh = pair.refresh_token.unwrap_or(refresh_plain);
    let state_ciphertext = cipher
        .encode(&current_refresh)
        .map_err(|err| RefreshError::Invalid(err.to_string()))?;
    let cookie_ttl = refresh_ttl(&current_refresh, fallback_ttl);

    let new_key = store::session_key(&identity);
    if let Some(backend) = &store {
        if new_key != session_key {
            if let Err(err) = backend.delete(&session_key).await {
                log::warn!("failed to drop superseded session entry: {}", err);
            }
        }
        if let Err(err) = backend
            .put(&new_key, &state_ciphertext, cookie_ttl.min(MAX_STORE_TTL))
            .await
        {
            log::warn!("failed to save refresh token in store: {}", err);
        }
    }

    Ok(RefreshedSession {
        access_token: pair.access_token,
        identity,
        session_key: new_key,
        state_ciphertext,
        cookie_ttl,
    })
}

/// Lifetime to give a refresh token at rest. JWT refresh tokens carry their
/// own expiry; opaque ones get the configured fallback.
pub fn refresh_ttl(refresh_token: &str, fallback: Duration) -> Duration {
    match token::parse(refresh_token) {
        Ok((_, identity)) => (identity.expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO),
        Err(_) => fallback,
    }
}
