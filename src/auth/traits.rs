use super::error::{IssueError, ValidationError};
use super::registry::RegisteredClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// OAuth 2.0 grant types a client can be registered for.
/// Only `client_credentials` is ever issued by this server, the others exist so
/// that a registration can say "not this one".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    ClientCredentials,
    AuthorizationCode,
    RefreshToken,
}

impl GrantType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantType::ClientCredentials => "client_credentials",
            GrantType::AuthorizationCode => "authorization_code",
            GrantType::RefreshToken => "refresh_token",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client_credentials" => Ok(GrantType::ClientCredentials),
            "authorization_code" => Ok(GrantType::AuthorizationCode),
            "refresh_token" => Ok(GrantType::RefreshToken),
            other => Err(format!("unsupported grant type: {other}")),
        }
    }
}

/// How a client proves who it is at the token endpoint (RFC 6749 §2.3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    #[default]
    ClientSecretBasic,
    ClientSecretPost,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::ClientSecretBasic => "client_secret_basic",
            AuthMethod::ClientSecretPost => "client_secret_post",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client_secret_basic" => Ok(AuthMethod::ClientSecretBasic),
            "client_secret_post" => Ok(AuthMethod::ClientSecretPost),
            other => Err(format!("unsupported client authentication method: {other}")),
        }
    }
}

/// What a resource server learns about the caller once a token checks out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub subject: String,
    pub scopes: BTreeSet<String>,
}

impl Principal {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.contains(scope)
    }
}

/// A freshly minted token plus the facts that went into it
#[derive(Debug, Clone)]
pub struct AccessToken {
    /// compact JWS, this is what goes on the wire
    pub token: String,
    pub subject: String,
    pub scopes: BTreeSet<String>,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl AccessToken {
    pub fn into_token_response(self) -> TokenResponse {
        TokenResponse {
            expires_in: u64::try_from(self.expires_at - self.issued_at).unwrap_or(0),
            scope: format_scope(&self.scopes),
            access_token: self.token,
            token_type: "Bearer".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: u64, // seconds
    pub scope: String,
}

/// JWT claims, shaped after RFC 9068 (JWT profile for access tokens)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,       // Issuer
    pub sub: String,       // Subject (client_id)
    pub client_id: String, // same as sub for client_credentials
    pub scope: String,     // space separated
    pub iat: i64,          // Issued at
    pub exp: i64,          // Expiration time
    pub jti: String,       // JWT ID (unique identifier)
}

// async_trait my beloved. this shit rocks

/// Authenticates a client at the token endpoint
#[async_trait]
pub trait CredentialValidator {
    async fn authenticate(
        &self,
        client_id: &str,
        client_secret: &str,
        method: AuthMethod,
    ) -> Result<RegisteredClient, IssueError>;
}

/// Mints a signed token for an already-authenticated, already-authorised client
pub trait TokenIssuer {
    fn issue_token(
        &self,
        subject: &str,
        scopes: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<AccessToken, IssueError>;
}

/// Decides whether a presented bearer token is worth honouring
#[async_trait]
pub trait TokenValidator {
    async fn validate_token(
        &self,
        token: &str,
        required_scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Principal, ValidationError>;
}

/// `scope` parameter / claim -> set
pub fn parse_scope(raw: &str) -> BTreeSet<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

pub fn format_scope(scopes: &BTreeSet<String>) -> String {
    scopes.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
}
