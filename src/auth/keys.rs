//! Signing key material shared by the issuer and the validator.
//!
//! The issuer signs with Ed25519 and publishes only public halves as a JWK Set.
//! Rotation swaps in a whole new [`KeySet`]. The key that was current moves to
//! the retired list and stays trusted for `grace_period`, so tokens minted just
//! before a rotation keep working until they could plausibly have expired.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey as Ed25519SigningKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, Jwk, JwkSet, KeyAlgorithm,
    OctetKeyPairParameters, OctetKeyPairType, PublicKeyUse,
};
use jsonwebtoken::{DecodingKey, EncodingKey};
use parking_lot::RwLock;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("failed to encode signing key: {0}")]
    Encode(String),

    #[error("unusable verification key: {0}")]
    Jwk(#[from] jsonwebtoken::errors::Error),

    #[error("verification key has no kid")]
    MissingKeyId,

    #[error("verification key is not an Ed25519 key")]
    UnsupportedKeyType,
}

/// Private half, only ever held by the issuer
#[derive(Clone)]
pub struct SigningKey {
    pub kid: String,
    pub encoding: EncodingKey,
}

/// Public half, as published and as used for signature checks
#[derive(Clone)]
pub struct VerificationKey {
    pub kid: String,
    pub jwk: Jwk,
    pub decoding: DecodingKey,
}

impl VerificationKey {
    /// Accept a published JWK. Only Ed25519 keys with a kid are usable here.
    pub fn from_jwk(jwk: Jwk) -> Result<Self, KeyError> {
        let kid = jwk.common.key_id.clone().ok_or(KeyError::MissingKeyId)?;
        match &jwk.algorithm {
            AlgorithmParameters::OctetKeyPair(okp) if okp.curve == EllipticCurve::Ed25519 => {}
            _ => return Err(KeyError::UnsupportedKeyType),
        }
        let decoding = DecodingKey::from_jwk(&jwk)?;
        Ok(Self { kid, jwk, decoding })
    }
}

#[derive(Clone)]
struct RetiredKey {
    key: VerificationKey,
    retired_at: DateTime<Utc>,
}

/// One immutable generation of key material
pub struct KeySet {
    current: SigningKey,
    current_public: VerificationKey,
    retired: Vec<RetiredKey>,
}

impl KeySet {
    pub fn signing_key(&self) -> &SigningKey {
        &self.current
    }

    /// Keys a validator should accept at `now`: the current one plus anything
    /// retired less than `grace` ago
    pub fn trusted(&self, grace: Duration, now: DateTime<Utc>) -> Vec<&VerificationKey> {
        std::iter::once(&self.current_public)
            .chain(
                self.retired
                    .iter()
                    .filter(move |r| now < r.retired_at + grace)
                    .map(|r| &r.key),
            )
            .collect()
    }
}

/// Holder of the live [`KeySet`]. Readers grab an `Arc` snapshot, rotation
/// replaces the `Arc` wholesale, so nobody sees half a rotation.
pub struct KeyRing {
    keys: RwLock<Arc<KeySet>>,
    grace_period: Duration,
}

impl KeyRing {
    pub fn generate(grace_period: std::time::Duration) -> Result<Self, KeyError> {
        let (current, current_public) = generate_keypair()?;
        tracing::info!(kid = %current.kid, "generated initial signing key");

        Ok(Self {
            keys: RwLock::new(Arc::new(KeySet {
                current,
                current_public,
                retired: Vec::new(),
            })),
            grace_period: Duration::from_std(grace_period).unwrap_or(Duration::zero()),
        })
    }

    pub fn snapshot(&self) -> Arc<KeySet> {
        self.keys.read().clone()
    }

    pub fn rotate(&self) -> Result<String, KeyError> {
        self.rotate_at(Utc::now())
    }

    /// Swap in a fresh key. The old current key is retired as of `now`, and
    /// retired keys already past their grace window are dropped.
    pub fn rotate_at(&self, now: DateTime<Utc>) -> Result<String, KeyError> {
        // keygen outside the lock
        let (current, current_public) = generate_keypair()?;
        let kid = current.kid.clone();

        let mut guard = self.keys.write();
        let previous = guard.clone();

        let mut retired: Vec<RetiredKey> = previous
            .retired
            .iter()
            .filter(|r| now < r.retired_at + self.grace_period)
            .cloned()
            .collect();
        retired.push(RetiredKey {
            key: previous.current_public.clone(),
            retired_at: now,
        });

        *guard = Arc::new(KeySet {
            current,
            current_public,
            retired,
        });
        drop(guard);

        tracing::info!(
            kid = %kid,
            previous_kid = %previous.current.kid,
            grace_secs = self.grace_period.num_seconds(),
            "rotated signing key"
        );
        Ok(kid)
    }

    pub fn verification_key(&self, kid: &str, now: DateTime<Utc>) -> Option<DecodingKey> {
        let keys = self.snapshot();
        keys.trusted(self.grace_period, now)
            .into_iter()
            .find(|k| k.kid == kid)
            .map(|k| k.decoding.clone())
    }

    /// What goes out on the JWKS endpoint
    pub fn jwks_at(&self, now: DateTime<Utc>) -> JwkSet {
        let keys = self.snapshot();
        JwkSet {
            keys: keys
                .trusted(self.grace_period, now)
                .into_iter()
                .map(|k| k.jwk.clone())
                .collect(),
        }
    }
}

fn generate_keypair() -> Result<(SigningKey, VerificationKey), KeyError> {
    let mut seed = [0u8; 32];
    rand::rng().fill(&mut seed);
    let key = Ed25519SigningKey::from_bytes(&seed);

    let der = key
        .to_pkcs8_der()
        .map_err(|e| KeyError::Encode(e.to_string()))?;
    let encoding = EncodingKey::from_ed_der(der.as_bytes());

    let x = URL_SAFE_NO_PAD.encode(key.verifying_key().as_bytes());
    let kid = thumbprint(&x);

    let jwk = Jwk {
        common: CommonParameters {
            public_key_use: Some(PublicKeyUse::Signature),
            key_algorithm: Some(KeyAlgorithm::EdDSA),
            key_id: Some(kid.clone()),
            ..Default::default()
        },
        algorithm: AlgorithmParameters::OctetKeyPair(OctetKeyPairParameters {
            key_type: OctetKeyPairType::OctetKeyPair,
            curve: EllipticCurve::Ed25519,
            x,
        }),
    };
    let public = VerificationKey::from_jwk(jwk)?;

    Ok((SigningKey { kid, encoding }, public))
}

/// RFC 7638 JWK thumbprint of an Ed25519 public key
fn thumbprint(x: &str) -> String {
    // members in lexicographic order, no whitespace
    let canonical = format!(r#"{{"crv":"Ed25519","kty":"OKP","x":"{x}"}}"#);
    URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}
