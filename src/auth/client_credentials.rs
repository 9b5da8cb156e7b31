use super::credentials::CredentialStore;
use super::error::{CredentialError, IssueError};
use super::registry::{ClientRegistry, RegisteredClient};
use super::traits::{AuthMethod, CredentialValidator, GrantType, format_scope};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Checks client credentials against the static registry
pub struct RegistryClientValidator {
    registry: Arc<ClientRegistry>,
    store: CredentialStore,
}

impl RegistryClientValidator {
    pub fn new(registry: Arc<ClientRegistry>, store: CredentialStore) -> Self {
        Self { registry, store }
    }
}

#[async_trait]
impl CredentialValidator for RegistryClientValidator {
    async fn authenticate(
        &self,
        client_id: &str,
        client_secret: &str,
        method: AuthMethod,
    ) -> Result<RegisteredClient, IssueError> {
        let client = self.registry.lookup(client_id).cloned();
        let store = self.store.clone();
        let secret = client_secret.to_string();
        let hash = client.as_ref().map(|c| c.secret_hash.clone());

        // argon2 is deliberately slow, keep it off the async workers.
        // unknown ids still pay for a full hash so they can't be told apart by timing
        let secret_ok = tokio::task::spawn_blocking(move || match hash {
            Some(hash) => store.verify(&secret, &hash),
            None => Ok(store.verify_unknown(&secret)),
        })
        .await
        .map_err(CredentialError::from)??;

        let Some(client) = client else {
            return Err(IssueError::ClientNotFound);
        };
        if !secret_ok {
            return Err(IssueError::SecretMismatch);
        }
        if client.auth_method != method {
            return Err(IssueError::AuthMethodNotAllowed {
                used: method.to_string(),
                registered: client.auth_method.to_string(),
            });
        }

        Ok(client)
    }
}

/// Is this client allowed this grant with these scopes?
///
/// Returns the scopes to put in the token. Asking for nothing gets the
/// client's full allowed set. Asking for anything outside it is a hard
/// rejection rather than a silent trim.
pub fn authorize_grant(
    client: &RegisteredClient,
    grant_type: GrantType,
    requested: &BTreeSet<String>,
) -> Result<BTreeSet<String>, IssueError> {
    if !client.grant_types.contains(&grant_type) {
        return Err(IssueError::GrantTypeNotAllowed(grant_type.to_string()));
    }

    if requested.is_empty() {
        return Ok(client.scopes.clone());
    }

    let disallowed: BTreeSet<String> = requested.difference(&client.scopes).cloned().collect();
    if !disallowed.is_empty() {
        return Err(IssueError::ScopeNotAllowed(format_scope(&disallowed)));
    }

    Ok(requested.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::credentials::cheap_store;
    use crate::auth::registry::ClientConfig;
    use crate::auth::traits::parse_scope;

    fn validator() -> RegistryClientValidator {
        let store = cheap_store();
        let registry = ClientRegistry::from_config(
            vec![
                ClientConfig {
                    client_id: "golf-client".to_string(),
                    client_secret: Some("golf-secret".to_string()),
                    client_secret_hash: None,
                    auth_method: AuthMethod::ClientSecretBasic,
                    grant_types: vec![GrantType::ClientCredentials],
                    scopes: vec!["read".to_string()],
                },
                ClientConfig {
                    client_id: "pro-shop".to_string(),
                    client_secret: Some("pro-secret".to_string()),
                    client_secret_hash: None,
                    auth_method: AuthMethod::ClientSecretPost,
                    grant_types: vec![GrantType::ClientCredentials],
                    scopes: vec!["read".to_string(), "write".to_string()],
                },
            ],
            &store,
        )
        .unwrap();
        RegistryClientValidator::new(Arc::new(registry), store)
    }

    #[tokio::test]
    async fn correct_credentials_authenticate() {
        let client = validator()
            .authenticate("golf-client", "golf-secret", AuthMethod::ClientSecretBasic)
            .await
            .unwrap();
        assert_eq!(client.client_id, "golf-client");
    }

    #[tokio::test]
    async fn unknown_client_and_wrong_secret_share_an_error_code() {
        let v = validator();
        let unknown = v
            .authenticate("caddie", "golf-secret", AuthMethod::ClientSecretBasic)
            .await
            .unwrap_err();
        let wrong = v
            .authenticate("golf-client", "nope", AuthMethod::ClientSecretBasic)
            .await
            .unwrap_err();

        assert!(matches!(unknown, IssueError::ClientNotFound));
        assert!(matches!(wrong, IssueError::SecretMismatch));
        assert_eq!(unknown.error_code(), wrong.error_code());
        assert_eq!(unknown.status(), wrong.status());
        assert_eq!(unknown.public_description(), wrong.public_description());
    }

    #[tokio::test]
    async fn registered_auth_method_is_enforced() {
        let err = validator()
            .authenticate("pro-shop", "pro-secret", AuthMethod::ClientSecretBasic)
            .await
            .unwrap_err();
        assert!(matches!(err, IssueError::AuthMethodNotAllowed { .. }));
        assert_eq!(err.error_code(), "invalid_client");
    }

    #[tokio::test]
    async fn grant_and_scope_rules() {
        let v = validator();
        let client = v
            .authenticate("pro-shop", "pro-secret", AuthMethod::ClientSecretPost)
            .await
            .unwrap();

        // nothing requested -> everything allowed
        assert_eq!(
            authorize_grant(&client, GrantType::ClientCredentials, &BTreeSet::new()).unwrap(),
            parse_scope("read write")
        );
        // subset is fine
        assert_eq!(
            authorize_grant(&client, GrantType::ClientCredentials, &parse_scope("write"))
                .unwrap(),
            parse_scope("write")
        );
        // anything outside is refused outright, not trimmed
        let err = authorize_grant(
            &client,
            GrantType::ClientCredentials,
            &parse_scope("read admin"),
        )
        .unwrap_err();
        assert!(matches!(err, IssueError::ScopeNotAllowed(ref s) if s == "admin"));

        let err = authorize_grant(&client, GrantType::AuthorizationCode, &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, IssueError::GrantTypeNotAllowed(_)));
        assert_eq!(err.error_code(), "unauthorized_grant");
    }
}
