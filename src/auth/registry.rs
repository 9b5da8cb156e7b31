use super::credentials::CredentialStore;
use super::error::CredentialError;
use super::traits::{AuthMethod, GrantType};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

/// A client as the server knows it. Built at startup, never mutated after.
#[derive(Clone, Debug)]
pub struct RegisteredClient {
    pub client_id: String,
    pub secret_hash: String,
    pub auth_method: AuthMethod,
    pub grant_types: HashSet<GrantType>,
    pub scopes: BTreeSet<String>,
}

/// Static client definition, as it appears in config (CLI/env or clients file)
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub client_id: String,
    /// plaintext secret, hashed on load
    #[serde(default)]
    pub client_secret: Option<String>,
    /// argon2 PHC string, for when you'd rather not keep plaintext in config
    #[serde(default)]
    pub client_secret_hash: Option<String>,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<GrantType>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_grant_types() -> Vec<GrantType> {
    vec![GrantType::ClientCredentials]
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("client '{0}' is registered more than once")]
    Duplicate(String),

    #[error("client '{0}' has neither client_secret nor client_secret_hash")]
    MissingSecret(String),

    #[error("client '{0}' has an unusable client_secret_hash")]
    BadSecretHash(String),

    #[error("client id cannot be empty")]
    EmptyClientId,

    #[error("failed to read clients file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse clients file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Read a JSON array of [`ClientConfig`]s
pub fn load_clients_file(path: &Path) -> Result<Vec<ClientConfig>, RegistryError> {
    let display = path.display().to_string();
    let raw = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: display.clone(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RegistryError::Parse {
        path: display,
        source,
    })
}

/// Known clients, keyed by client_id.
/// Read-only once built, so lookups need no locking.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, RegisteredClient>,
}

impl ClientRegistry {
    /// Build the registry from static config, hashing any plaintext secrets on the way in
    pub fn from_config(
        configs: Vec<ClientConfig>,
        store: &CredentialStore,
    ) -> Result<Self, RegistryError> {
        let mut clients = HashMap::with_capacity(configs.len());

        for config in configs {
            if config.client_id.is_empty() {
                return Err(RegistryError::EmptyClientId);
            }
            if clients.contains_key(&config.client_id) {
                return Err(RegistryError::Duplicate(config.client_id));
            }

            let secret_hash = match (config.client_secret, config.client_secret_hash) {
                (_, Some(hash)) => {
                    if !CredentialStore::is_valid_hash(&hash) {
                        return Err(RegistryError::BadSecretHash(config.client_id));
                    }
                    hash
                }
                (Some(secret), None) => store.hash(&secret)?,
                (None, None) => return Err(RegistryError::MissingSecret(config.client_id)),
            };

            tracing::info!(
                client_id = %config.client_id,
                auth_method = %config.auth_method,
                scopes = ?config.scopes,
                "registered client"
            );

            let client = RegisteredClient {
                client_id: config.client_id.clone(),
                secret_hash,
                auth_method: config.auth_method,
                grant_types: config.grant_types.into_iter().collect(),
                scopes: config.scopes.into_iter().collect(),
            };
            clients.insert(config.client_id, client);
        }

        Ok(Self { clients })
    }

    pub fn lookup(&self, client_id: &str) -> Option<&RegisteredClient> {
        self.clients.get(client_id)
    }

    /// Union of every registered client's scopes, for discovery metadata
    pub fn all_scopes(&self) -> BTreeSet<String> {
        self.clients
            .values()
            .flat_map(|c| c.scopes.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
