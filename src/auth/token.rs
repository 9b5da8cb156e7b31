use super::error::{IssueError, ValidationError};
use super::keys::KeyRing;
use super::traits::{
    AccessToken, Claims, Principal, TokenIssuer, TokenValidator, format_scope, parse_scope,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation, decode, decode_header, encode};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// RFC 9068 media type for JWT access tokens
const ACCESS_TOKEN_TYP: &str = "at+jwt";

pub struct JwtTokenIssuer {
    keys: Arc<KeyRing>,
    issuer: String,
    lifetime: Duration,
}

impl JwtTokenIssuer {
    pub fn new(keys: Arc<KeyRing>, issuer: String, lifetime: std::time::Duration) -> Self {
        Self {
            keys,
            issuer,
            lifetime: Duration::from_std(lifetime).unwrap_or(Duration::minutes(5)),
        }
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue_token(
        &self,
        subject: &str,
        scopes: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<AccessToken, IssueError> {
        let keys = self.keys.snapshot();
        let signing = keys.signing_key();

        let issued_at = now.timestamp();
        let expires_at = now
            .checked_add_signed(self.lifetime)
            .ok_or(IssueError::ExpiryOutOfRange)?
            .timestamp();

        let claims = Claims {
            iss: self.issuer.clone(),
            sub: subject.to_string(),
            client_id: subject.to_string(),
            scope: format_scope(&scopes),
            iat: issued_at,
            exp: expires_at,
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(signing.kid.clone());
        header.typ = Some(ACCESS_TOKEN_TYP.to_string());

        let token = encode(&header, &claims, &signing.encoding)?;

        Ok(AccessToken {
            token,
            subject: claims.sub,
            scopes,
            issued_at,
            expires_at,
        })
    }
}

/// Where a validator gets verification keys from.
/// In-process for the auth server, a cached JWKS for a resource server.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// `Ok(None)` means "no trusted key with that kid", which the validator
    /// reports as a bad signature. `Err` means there is no key material at all.
    async fn decoding_key(
        &self,
        kid: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DecodingKey>, ValidationError>;
}

#[async_trait]
impl KeySource for KeyRing {
    async fn decoding_key(
        &self,
        kid: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DecodingKey>, ValidationError> {
        Ok(self.verification_key(kid, now))
    }
}

pub struct JwtTokenValidator {
    keys: Arc<dyn KeySource>,
    validation: Validation,
}

impl JwtTokenValidator {
    pub fn new(keys: Arc<dyn KeySource>, issuer: &str) -> Self {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_issuer(&[issuer]);
        // expiry is checked by hand against the caller's clock, see verify()
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.required_spec_claims = ["sub", "iat", "exp", "iss"]
            .into_iter()
            .map(str::to_string)
            .collect();

        Self { keys, validation }
    }

    /// Structure, signature and expiry. No scope check.
    pub async fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, ValidationError> {
        let header =
            decode_header(token).map_err(|e| ValidationError::MalformedToken(e.to_string()))?;

        // anything but EdDSA (alg=none, HS256 with our public key as the secret, ...)
        // is treated as a forged signature
        if header.alg != Algorithm::EdDSA {
            return Err(ValidationError::InvalidSignature);
        }

        let kid = header
            .kid
            .ok_or_else(|| ValidationError::MalformedToken("missing kid".to_string()))?;

        let key = self
            .keys
            .decoding_key(&kid, now)
            .await?
            .ok_or(ValidationError::InvalidSignature)?;

        let claims = decode::<Claims>(token, &key, &self.validation)
            .map_err(classify)?
            .claims;

        // valid while now < exp
        if now.timestamp() >= claims.exp {
            return Err(ValidationError::Expired);
        }

        Ok(claims)
    }
}

#[async_trait]
impl TokenValidator for JwtTokenValidator {
    async fn validate_token(
        &self,
        token: &str,
        required_scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Principal, ValidationError> {
        let claims = self.verify(token, now).await?;
        let scopes = parse_scope(&claims.scope);

        if let Some(required) = required_scope {
            if !scopes.contains(required) {
                return Err(ValidationError::InsufficientScope(required.to_string()));
            }
        }

        Ok(Principal {
            subject: claims.sub,
            scopes,
        })
    }
}

fn classify(err: jsonwebtoken::errors::Error) -> ValidationError {
    match err.kind() {
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidIssuer
        | ErrorKind::InvalidKeyFormat => ValidationError::InvalidSignature,
        ErrorKind::ExpiredSignature => ValidationError::Expired,
        _ => ValidationError::MalformedToken(err.to_string()),
    }
}
