use super::error::CredentialError;
use argon2::password_hash::{PasswordHash, PasswordHasher, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::Rng;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// Argon2id cost knobs. Raising either makes every token request slower and
/// every offline guess against a leaked hash slower by the same factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashParams {
    pub memory_kib: u32,
    pub iterations: u32,
}

impl Default for HashParams {
    // OWASP baseline for argon2id
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
        }
    }
}

/// One-way storage for client secrets. Secrets go in, PHC strings come out,
/// and the plaintext is never kept.
#[derive(Clone)]
pub struct CredentialStore {
    params: Params,
    /// hash of a throwaway secret, checked against when the client id is unknown
    dummy_hash: Arc<str>,
}

impl CredentialStore {
    pub fn new(params: HashParams) -> Result<Self, CredentialError> {
        let params = Params::new(params.memory_kib, params.iterations, 1, None)
            .map_err(|e| CredentialError::Params(e.to_string()))?;

        let mut store = Self {
            params,
            dummy_hash: Arc::from(""),
        };
        store.dummy_hash = Arc::from(store.hash(&Uuid::new_v4().to_string())?);
        Ok(store)
    }

    fn hasher(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Salted argon2id hash in PHC string form
    pub fn hash(&self, secret: &str) -> Result<String, CredentialError> {
        let mut salt = [0u8; 16];
        rand::rng().fill(&mut salt);
        let salt =
            SaltString::encode_b64(&salt).map_err(|e| CredentialError::Hash(e.to_string()))?;

        let hash = self
            .hasher()
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| CredentialError::Hash(e.to_string()))?;

        Ok(hash.to_string())
    }

    /// Recompute the hash with the stored salt and parameters, then compare
    /// digests in constant time.
    ///
    /// Parameters come from the stored hash, not from `self`, so hashes made
    /// under an older cost setting keep verifying after the knob moves.
    pub fn verify(&self, secret: &str, secret_hash: &str) -> Result<bool, CredentialError> {
        let stored = PasswordHash::new(secret_hash)
            .map_err(|e| CredentialError::StoredHash(e.to_string()))?;

        let (Some(salt), Some(expected)) = (stored.salt, stored.hash) else {
            return Err(CredentialError::StoredHash(
                "missing salt or digest".to_string(),
            ));
        };

        let params =
            Params::try_from(&stored).map_err(|e| CredentialError::StoredHash(e.to_string()))?;

        let candidate = Argon2::default()
            .hash_password_customized(
                secret.as_bytes(),
                Some(stored.algorithm),
                stored.version,
                params,
                salt,
            )
            .map_err(|e| CredentialError::Hash(e.to_string()))?;

        let Some(actual) = candidate.hash else {
            return Ok(false);
        };

        Ok(actual.as_bytes().ct_eq(expected.as_bytes()).into())
    }

    /// Spend the same effort as a real verification and always fail.
    /// Keeps "no such client" from answering faster than "wrong secret".
    pub fn verify_unknown(&self, secret: &str) -> bool {
        let _ = self.verify(secret, &self.dummy_hash);
        false
    }

    /// Is this an argon2 PHC string we know how to check? Anything else
    /// (pbkdf2, bcrypt, bad params) would only fail later, on every request.
    pub fn is_valid_hash(secret_hash: &str) -> bool {
        PasswordHash::new(secret_hash).is_ok_and(|h| {
            h.salt.is_some()
                && h.hash.is_some()
                && Algorithm::try_from(h.algorithm).is_ok()
                && Params::try_from(&h).is_ok()
        })
    }
}

#[cfg(test)]
pub(crate) fn cheap_store() -> CredentialStore {
    CredentialStore::new(HashParams {
        memory_kib: 8,
        iterations: 1,
    })
    .unwrap()
}
