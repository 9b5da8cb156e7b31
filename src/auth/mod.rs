mod client_credentials;
mod credentials;
mod error;
mod handlers;
mod jwks;
mod keys;
mod middleware;
mod registry;
mod token;
mod traits;

pub use client_credentials::{RegistryClientValidator, authorize_grant};
pub use credentials::{CredentialStore, HashParams};
pub use error::{IssueError, ValidationError};
pub use handlers::{OAuthAppState, discovery_routes, token_routes};
pub use jwks::JwksCache;
pub use keys::{KeyError, KeyRing};
pub use middleware::{AuthMiddlewareConfig, ScopeRequirement, jwt_auth_middleware, require_scope};
pub use registry::{ClientConfig, ClientRegistry, RegisteredClient, load_clients_file};
pub use token::{JwtTokenIssuer, JwtTokenValidator};
pub use traits::{
    AccessToken, AuthMethod, Claims, CredentialValidator, GrantType, Principal, TokenIssuer,
    TokenValidator, format_scope,
};
#[cfg(test)]
pub use traits::parse_scope;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::JwkSet;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the authorization server, built once in main
#[derive(Clone)]
pub struct AuthConfig {
    /// `iss` claim, also the base URL the endpoints are advertised under
    pub issuer: String,
    pub clients: Vec<ClientConfig>,
    pub token_lifetime: Duration,
    /// how long a rotated-out key keeps verifying
    pub key_grace_period: Duration,
    pub hash_params: HashParams,
}

/// What a client presented at the token endpoint
#[derive(Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub method: AuthMethod,
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("method", &self.method)
            .finish()
    }
}

/// Complete OAuth service: registry, credential checks, key ring, issuing and
/// validation, wired together once at startup
pub struct OAuthService {
    issuer: String,
    registry: Arc<ClientRegistry>,
    keys: Arc<KeyRing>,
    credential_validator: Arc<dyn CredentialValidator + Send + Sync>,
    token_issuer: Arc<dyn TokenIssuer + Send + Sync>,
    token_validator: Arc<JwtTokenValidator>,
}

impl OAuthService {
    pub fn new(config: AuthConfig) -> Result<Self> {
        let store = CredentialStore::new(config.hash_params)
            .context("failed to set up client secret hashing")?;

        let registry = Arc::new(
            ClientRegistry::from_config(config.clients, &store)
                .context("failed to build client registry")?,
        );
        anyhow::ensure!(!registry.is_empty(), "no clients registered");
        tracing::info!("Registered {} clients", registry.len());

        let keys = Arc::new(
            KeyRing::generate(config.key_grace_period).context("failed to generate signing key")?,
        );

        let credential_validator = Arc::new(RegistryClientValidator::new(registry.clone(), store));

        let token_issuer = Arc::new(JwtTokenIssuer::new(
            keys.clone(),
            config.issuer.clone(),
            config.token_lifetime,
        ));

        let token_validator = Arc::new(JwtTokenValidator::new(keys.clone(), &config.issuer));

        Ok(Self {
            issuer: config.issuer,
            registry,
            keys,
            credential_validator,
            token_issuer,
            token_validator,
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn supported_scopes(&self) -> BTreeSet<String> {
        self.registry.all_scopes()
    }

    /// Client-credentials grant: authenticate, authorise, mint
    pub async fn issue(
        &self,
        credentials: &ClientCredentials,
        grant_type: GrantType,
        requested_scopes: &BTreeSet<String>,
    ) -> Result<AccessToken, IssueError> {
        self.issue_at(credentials, grant_type, requested_scopes, Utc::now())
            .await
    }

    pub async fn issue_at(
        &self,
        credentials: &ClientCredentials,
        grant_type: GrantType,
        requested_scopes: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<AccessToken, IssueError> {
        let result = async {
            let client = self.authenticate_client(credentials).await?;
            let scopes = authorize_grant(&client, grant_type, requested_scopes)?;
            self.token_issuer.issue_token(&client.client_id, scopes, now)
        }
        .await;

        // every grant attempt leaves a trail, tokens and secrets never do
        match &result {
            Ok(token) => tracing::info!(
                target: "audit",
                client_id = %credentials.client_id,
                auth_method = %credentials.method,
                grant_type = %grant_type,
                scope = %format_scope(&token.scopes),
                expires_at = token.expires_at,
                outcome = "granted",
                "token grant"
            ),
            Err(e) => tracing::warn!(
                target: "audit",
                client_id = %credentials.client_id,
                auth_method = %credentials.method,
                grant_type = %grant_type,
                requested_scope = %format_scope(requested_scopes),
                outcome = "rejected",
                reason = %e,
                "token grant"
            ),
        }

        result
    }

    pub async fn authenticate_client(
        &self,
        credentials: &ClientCredentials,
    ) -> Result<RegisteredClient, IssueError> {
        self.credential_validator
            .authenticate(
                &credentials.client_id,
                &credentials.client_secret,
                credentials.method,
            )
            .await
    }

    #[cfg(test)]
    pub async fn validate_token(
        &self,
        token: &str,
        required_scope: Option<&str>,
    ) -> Result<Principal, ValidationError> {
        self.token_validator
            .validate_token(token, required_scope, Utc::now())
            .await
    }

    /// Full claims of a live token, for the introspection endpoint
    pub async fn introspect(&self, token: &str) -> Result<Claims, ValidationError> {
        self.token_validator.verify(token, Utc::now()).await
    }

    pub fn jwks(&self) -> JwkSet {
        self.keys.jwks_at(Utc::now())
    }

    pub fn rotate_keys(&self) -> Result<String, KeyError> {
        self.keys.rotate()
    }

    /// Rotate the signing key every `interval`, forever
    pub fn spawn_key_rotation(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = self.rotate_keys() {
                    tracing::error!("Key rotation failed, still signing with the old key: {}", e);
                }
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::collections::HashSet;

    #[tokio::test]
    async fn registered_client_gets_a_working_token() {
        let service = service();
        let token = service
            .issue(
                &basic("golf-client", "golf-secret"),
                GrantType::ClientCredentials,
                &parse_scope("read"),
            )
            .await
            .unwrap();

        let principal = service
            .validate_token(&token.token, Some("read"))
            .await
            .unwrap();
        assert_eq!(principal.subject, "golf-client");

        assert_eq!(
            service.validate_token(&token.token, Some("write")).await,
            Err(ValidationError::InsufficientScope("write".to_string()))
        );
    }

    #[tokio::test]
    async fn wrong_secret_is_indistinguishable_from_unknown_client() {
        let service = service();
        let read = parse_scope("read");

        let unknown = service
            .issue(&basic("caddie", "golf-secret"), GrantType::ClientCredentials, &read)
            .await
            .unwrap_err();
        let wrong = service
            .issue(&basic("golf-client", "bogey"), GrantType::ClientCredentials, &read)
            .await
            .unwrap_err();

        assert_eq!(unknown.error_code(), "invalid_client");
        assert_eq!(unknown.error_code(), wrong.error_code());
        assert_eq!(unknown.status(), wrong.status());
        assert_eq!(unknown.public_description(), wrong.public_description());
    }

    #[tokio::test]
    async fn scope_outside_registration_is_refused() {
        let err = service()
            .issue(
                &basic("golf-client", "golf-secret"),
                GrantType::ClientCredentials,
                &parse_scope("read write"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "invalid_scope");
    }

    #[tokio::test]
    async fn concurrent_issuance_produces_independent_tokens() {
        let service = Arc::new(service());
        let read = parse_scope("read");

        let tasks = (0..16).map(|_| {
            let service = service.clone();
            let read = read.clone();
            async move {
                service
                    .issue(
                        &basic("golf-client", "golf-secret"),
                        GrantType::ClientCredentials,
                        &read,
                    )
                    .await
            }
        });
        let tokens: Vec<AccessToken> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .collect::<Result<_, _>>()
            .unwrap();

        let distinct: HashSet<&str> = tokens.iter().map(|t| t.token.as_str()).collect();
        assert_eq!(distinct.len(), 16);

        for token in &tokens {
            let principal = service
                .validate_token(&token.token, Some("read"))
                .await
                .unwrap();
            assert_eq!(principal.subject, "golf-client");
        }
    }

    #[tokio::test]
    async fn introspection_exposes_claims_of_live_tokens() {
        let service = service();
        let token = service
            .issue(
                &basic("golf-client", "golf-secret"),
                GrantType::ClientCredentials,
                &BTreeSet::new(),
            )
            .await
            .unwrap();

        let claims = service.introspect(&token.token).await.unwrap();
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.client_id, "golf-client");
        assert_eq!(claims.scope, "read");
        assert_eq!(claims.exp - claims.iat, 300);
    }

    #[tokio::test]
    async fn rotation_publishes_both_keys_and_keeps_old_tokens_alive() {
        let service = service();
        let token = service
            .issue(
                &basic("golf-client", "golf-secret"),
                GrantType::ClientCredentials,
                &parse_scope("read"),
            )
            .await
            .unwrap();

        service.rotate_keys().unwrap();
        assert_eq!(service.jwks().keys.len(), 2);
        assert!(service.validate_token(&token.token, Some("read")).await.is_ok());
    }

    #[test]
    fn credentials_debug_hides_the_secret() {
        let printed = format!("{:?}", basic("golf-client", "golf-secret"));
        assert!(printed.contains("golf-client"));
        assert!(!printed.contains("golf-secret"));
    }

    #[test]
    fn bad_client_config_fails_startup() {
        let mut broken = golf_client();
        broken.client_secret = None;
        let result = OAuthService::new(AuthConfig {
            issuer: ISSUER.to_string(),
            clients: vec![broken],
            token_lifetime: Duration::from_secs(300),
            key_grace_period: Duration::from_secs(300),
            hash_params: HashParams {
                memory_kib: 8,
                iterations: 1,
            },
        });
        assert!(result.is_err());
    }
}
