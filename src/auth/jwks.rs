//! Resource-server side of the trust handshake: a cached copy of the
//! authorization server's JWK Set.
//!
//! - Fetched once at startup, then refreshed on an interval in the background.
//! - A failed refresh keeps the last-known-good keys, so a flaky auth server
//!   doesn't take the resource server down with it.
//! - An unknown `kid` triggers one forced refresh (throttled), which is how a
//!   key rotation on the issuer gets picked up before the next scheduled fetch.
//! - If keys were never loaded at all, every token is rejected.

use super::error::ValidationError;
use super::keys::VerificationKey;
use super::token::KeySource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::JwkSet;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// don't hammer the issuer when someone sprays random kids at us
const MIN_FORCED_REFRESH_GAP: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum JwksError {
    #[error("JWKS fetch error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JWKS contained no usable Ed25519 keys")]
    NoUsableKeys,
}

struct CachedKeys {
    keys: HashMap<String, DecodingKey>,
    fetched_at: Instant,
}

pub struct JwksCache {
    http: reqwest::Client,
    jwks_uri: String,
    cached: RwLock<Option<Arc<CachedKeys>>>,
    last_forced_refresh: Mutex<Option<Instant>>,
}

impl JwksCache {
    pub fn new(jwks_uri: String, fetch_timeout: Duration) -> Result<Self, JwksError> {
        let http = reqwest::Client::builder().timeout(fetch_timeout).build()?;
        Ok(Self {
            http,
            jwks_uri,
            cached: RwLock::new(None),
            last_forced_refresh: Mutex::new(None),
        })
    }

    pub fn jwks_uri(&self) -> &str {
        &self.jwks_uri
    }

    pub fn is_loaded(&self) -> bool {
        self.cached.read().is_some()
    }

    /// Fetch the JWKS and swap it in. On any failure the previous keys stay.
    pub async fn refresh(&self) -> Result<usize, JwksError> {
        debug!("Fetching JWKS from {}", self.jwks_uri);
        let jwks: JwkSet = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut keys = HashMap::with_capacity(jwks.keys.len());
        for jwk in jwks.keys {
            match VerificationKey::from_jwk(jwk) {
                Ok(key) => {
                    keys.insert(key.kid, key.decoding);
                }
                Err(e) => warn!("Skipping unusable key in JWKS: {}", e),
            }
        }

        if keys.is_empty() {
            return Err(JwksError::NoUsableKeys);
        }

        let count = keys.len();
        *self.cached.write() = Some(Arc::new(CachedKeys {
            keys,
            fetched_at: Instant::now(),
        }));
        Ok(count)
    }

    /// Periodic refresh loop, runs until the task is dropped
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match self.refresh().await {
                    Ok(count) => debug!("Refreshed JWKS, {} keys", count),
                    Err(e) => {
                        let age = self
                            .cached
                            .read()
                            .as_ref()
                            .map(|c| c.fetched_at.elapsed().as_secs());
                        warn!(
                            "JWKS refresh failed, keeping last-known-good keys (age {:?}s): {}",
                            age, e
                        );
                    }
                }
            }
        })
    }

    fn lookup(&self, kid: &str) -> Option<DecodingKey> {
        self.cached
            .read()
            .as_ref()
            .and_then(|c| c.keys.get(kid).cloned())
    }

    /// Claim the forced-refresh slot if it's free
    fn may_force_refresh(&self) -> bool {
        let mut last = self.last_forced_refresh.lock();
        match *last {
            Some(at) if at.elapsed() < MIN_FORCED_REFRESH_GAP => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

#[async_trait]
impl KeySource for JwksCache {
    async fn decoding_key(
        &self,
        kid: &str,
        _now: DateTime<Utc>,
    ) -> Result<Option<DecodingKey>, ValidationError> {
        if let Some(key) = self.lookup(kid) {
            return Ok(Some(key));
        }

        // unknown kid: the issuer may have rotated since we last looked
        if self.may_force_refresh() {
            match self.refresh().await {
                Ok(_) => info!(kid = %kid, "Refreshed JWKS after unknown key id"),
                Err(e) => warn!(kid = %kid, "Forced JWKS refresh failed: {}", e),
            }
            if let Some(key) = self.lookup(kid) {
                return Ok(Some(key));
            }
        }

        if !self.is_loaded() {
            return Err(ValidationError::KeysUnavailable);
        }
        Ok(None)
    }
}
