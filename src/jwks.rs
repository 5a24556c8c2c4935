use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

/// How often the background task rotates the key set.
pub const ROTATION_PERIOD: Duration = Duration::from_secs(10 * 60);

/// Floor between on-demand refreshes, so a storm of unknown-kid tokens
/// cannot hammer the provider.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum JwksError {
    #[error("fetching JWKS failed: {0}")]
    Fetch(String),
    #[error("unusable JWK: {0}")]
    Key(String),
}

#[derive(Debug, Deserialize)]
struct RawJwks {
    keys: Vec<RawJwk>,
}

#[derive(Debug, Deserialize)]
struct RawJwk {
    #[serde(default)]
    kid: Option<String>,
    kty: String,
    #[serde(default)]
    alg: Option<String>,
    #[serde(default)]
    n: Option<String>,
    #[serde(default)]
    e: Option<String>,
    #[serde(default)]
    crv: Option<String>,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<String>,
    #[serde(default)]
    k: Option<String>,
}

/// Key components are kept raw and the `DecodingKey` rebuilt on demand, so
/// the cached map stays cheap to clone into snapshots.
#[derive(Debug, Clone)]
enum KeyMaterial {
    Rsa { n: String, e: String },
    Ec { x: String, y: String },
    Secret(Vec<u8>),
}

#[derive(Debug, Clone)]
pub(crate) struct CachedKey {
    alg: Algorithm,
    material: KeyMaterial,
}

impl CachedKey {
    fn decoding_key(&self) -> Result<DecodingKey, JwksError> {
        match &self.material {
            KeyMaterial::Rsa { n, e } => DecodingKey::from_rsa_components(n, e)
                .map_err(|err| JwksError::Key(err.to_string())),
            KeyMaterial::Ec { x, y } => DecodingKey::from_ec_components(x, y)
                .map_err(|err| JwksError::Key(err.to_string())),
            KeyMaterial::Secret(secret) => Ok(DecodingKey::from_secret(secret)),
        }
    }
}

fn cache_key(jwk: &RawJwk) -> Option<CachedKey> {
    let declared = jwk.alg.as_deref().and_then(|alg| alg.parse::<Algorithm>().ok());
    match jwk.kty.as_str() {
        "RSA" => Some(CachedKey {
            alg: declared.unwrap_or(Algorithm::RS256),
            material: KeyMaterial::Rsa {
                n: jwk.n.clone()?,
                e: jwk.e.clone()?,
            },
        }),
        "EC" => Some(CachedKey {
            alg: declared.unwrap_or(match jwk.crv.as_deref() {
                Some("P-384") => Algorithm::ES384,
                _ => Algorithm::ES256,
            }),
            material: KeyMaterial::Ec {
                x: jwk.x.clone()?,
                y: jwk.y.clone()?,
            },
        }),
        "oct" => Some(CachedKey {
            alg: declared.unwrap_or(Algorithm::HS256),
            material: KeyMaterial::Secret(URL_SAFE_NO_PAD.decode(jwk.k.as_deref()?).ok()?),
        }),
        other => {
            log::debug!("skipping JWK with unsupported key type {}", other);
            None
        }
    }
}

/// An immutable snapshot of the key set, handed to the token codec so
/// verification never holds the cache lock.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    keys: HashMap<String, CachedKey>,
}

impl KeySet {
    /// Select the verification key for a token. Without a `kid` the set must
    /// contain exactly one key to be usable.
    pub fn resolve(&self, kid: Option<&str>) -> Option<(Algorithm, DecodingKey)> {
        let cached = match kid {
            Some(kid) => self.keys.get(kid),
            None if self.keys.len() == 1 => self.keys.values().next(),
            None => None,
        }?;
        match cached.decoding_key() {
            Ok(key) => Some((cached.alg, key)),
            Err(err) => {
                log::warn!("cached JWK is unusable: {}", err);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Cache of the provider's signing keys, indexed by `kid`. Readers take
/// cheap snapshots; the periodic rotation task and on-demand refreshes (after
/// an unknown-kid verification failure) are the only writers.
pub struct JwksCache {
    jwks_uri: String,
    http: reqwest::Client,
    keys: RwLock<HashMap<String, CachedKey>>,
    refresh_gate: Mutex<Option<Instant>>,
}

impl JwksCache {
    pub fn new(http: reqwest::Client, jwks_uri: String) -> Self {
        Self {
            jwks_uri,
            http,
            keys: RwLock::new(HashMap::new()),
            refresh_gate: Mutex::new(None),
        }
    }

    pub async fn snapshot(&self) -> KeySet {
        KeySet {
            keys: self.keys.read().await.clone(),
        }
    }

    /// Fetch the key set and replace the cache wholesale. Readers holding a
    /// snapshot are unaffected.
    pub async fn refresh(&self) -> Result<(), JwksError> {
        let jwks: RawJwks = self
            .http
            .get(&self.jwks_uri)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| JwksError::Fetch(err.to_string()))?
            .json()
            .await
            .map_err(|err| JwksError::Fetch(err.to_string()))?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            let Some(kid) = jwk.kid.clone() else { continue };
            if let Some(cached) = cache_key(&jwk) {
                keys.insert(kid, cached);
            }
        }

        log::debug!("rotated JWKS, {} signing keys", keys.len());
        *self.keys.write().await = keys;
        Ok(())
    }

    /// On-demand refresh for unknown-kid retries. Serialized, and a no-op
    /// when another refresh ran within the last few seconds.
    pub async fn refresh_throttled(&self) -> Result<(), JwksError> {
        let mut gate = self.refresh_gate.lock().await;
        if let Some(last) = *gate {
            if last.elapsed() < MIN_REFRESH_INTERVAL {
                return Ok(());
            }
        }
        *gate = Some(Instant::now());
        self.refresh().await
    }

    #[cfg(test)]
    pub(crate) fn static_keys(entries: &[(&str, &[u8])]) -> Self {
        let keys = entries
            .iter()
            .map(|(kid, secret)| {
                (
                    (*kid).to_owned(),
                    CachedKey {
                        alg: Algorithm::HS256,
                        material: KeyMaterial::Secret(secret.to_vec()),
                    },
                )
            })
            .collect();
        Self {
            jwks_uri: String::new(),
            http: reqwest::Client::new(),
            keys: RwLock::new(keys),
            refresh_gate: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn snapshot_blocking(&self) -> KeySet {
        KeySet {
            keys: self.keys.try_read().expect("jwks cache locked").clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa_jwk(kid: &str) -> RawJwk {
        RawJwk {
            kid: Some(kid.to_owned()),
            kty: "RSA".to_owned(),
            alg: Some("RS256".to_owned()),
            n: Some("qr0-9zjQ".to_owned()),
            e: Some("AQAB".to_owned()),
            crv: None,
            x: None,
            y: None,
            k: None,
        }
    }

    #[test]
    fn rsa_keys_default_to_rs256() {
        let mut jwk = rsa_jwk("a");
        jwk.alg = None;
        let cached = cache_key(&jwk).unwrap();
        assert_eq!(cached.alg, Algorithm::RS256);
    }

    #[test]
    fn ec_curve_picks_the_algorithm() {
        let jwk = RawJwk {
            kid: Some("ec".to_owned()),
            kty: "EC".to_owned(),
            alg: None,
            n: None,
            e: None,
            crv: Some("P-384".to_owned()),
            x: Some("x".to_owned()),
            y: Some("y".to_owned()),
            k: None,
        };
        assert_eq!(cache_key(&jwk).unwrap().alg, Algorithm::ES384);
    }

    #[test]
    fn unsupported_key_types_are_skipped() {
        let jwk = RawJwk {
            kid: Some("okp".to_owned()),
            kty: "OKP".to_owned(),
            alg: None,
            n: None,
            e: None,
            crv: None,
            x: None,
            y: None,
            k: None,
        };
        assert!(cache_key(&jwk).is_none());
    }

    #[test]
    fn kid_lookup_and_single_key_fallback() {
        let cache = JwksCache::static_keys(&[("only", b"secret")]);
        let set = cache.snapshot_blocking();
        assert!(set.resolve(Some("only")).is_some());
        assert!(set.resolve(Some("missing")).is_none());
        assert!(set.resolve(None).is_some());
    }

    #[test]
    fn no_kid_is_ambiguous_with_several_keys() {
        let cache = JwksCache::static_keys(&[("a", b"one"), ("b", b"two")]);
        assert!(cache.snapshot_blocking().resolve(None).is_none());
    }

    #[actix_web::test]
    async fn throttle_suppresses_back_to_back_refreshes() {
        // Refresh against an unroutable URI: the first attempt fails with a
        // fetch error, the immediate second attempt is swallowed by the gate.
        let cache = JwksCache::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/jwks".to_owned(),
        );
        assert!(cache.refresh_throttled().await.is_err());
        assert!(cache.refresh_throttled().await.is_ok());
    }
}
