use axum::http::StatusCode;

/// Why a token request was turned down.
///
/// The variants are fine-grained for logs and audit events. What goes back over
/// the wire is [`IssueError::error_code`], which folds the client-authentication
/// failures together so a caller can't tell an unknown id from a bad secret.
#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("client not registered")]
    ClientNotFound,

    #[error("client secret mismatch")]
    SecretMismatch,

    #[error("client authentication method {used} not allowed, registered for {registered}")]
    AuthMethodNotAllowed { used: String, registered: String },

    #[error("grant type {0} not allowed for this client")]
    GrantTypeNotAllowed(String),

    #[error("scope not allowed: {0}")]
    ScopeNotAllowed(String),

    #[error("failed to sign token: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),

    #[error("token expiry is out of range")]
    ExpiryOutOfRange,

    #[error("credential check failed: {0}")]
    Credential(#[from] CredentialError),
}

impl IssueError {
    /// RFC 6749 §5.2 error code
    pub fn error_code(&self) -> &'static str {
        match self {
            IssueError::ClientNotFound
            | IssueError::SecretMismatch
            | IssueError::AuthMethodNotAllowed { .. } => "invalid_client",
            IssueError::GrantTypeNotAllowed(_) => "unauthorized_grant",
            IssueError::ScopeNotAllowed(_) => "invalid_scope",
            IssueError::Signing(_)
            | IssueError::ExpiryOutOfRange
            | IssueError::Credential(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self.error_code() {
            "invalid_client" => StatusCode::UNAUTHORIZED,
            "server_error" => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Description safe to hand back to the caller
    pub fn public_description(&self) -> &'static str {
        match self.error_code() {
            "invalid_client" => "Client authentication failed",
            "unauthorized_grant" => "Client is not authorized for this grant type",
            "invalid_scope" => "Requested scope is not allowed for this client",
            _ => "Failed to issue token",
        }
    }
}

/// Why a presented token was not honoured
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("token expired")]
    Expired,

    #[error("token lacks required scope {0}")]
    InsufficientScope(String),

    /// no verification keys have ever been loaded, so nothing can be trusted
    #[error("no verification keys available")]
    KeysUnavailable,
}

impl ValidationError {
    /// RFC 6750 §3.1 error code
    pub fn error_code(&self) -> &'static str {
        match self {
            ValidationError::InsufficientScope(_) => "insufficient_scope",
            _ => "invalid_token",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ValidationError::InsufficientScope(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Hashing or parsing failure inside the credential store
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("invalid hashing parameters: {0}")]
    Params(String),

    #[error("failed to hash secret: {0}")]
    Hash(String),

    #[error("stored secret hash is not a valid PHC string: {0}")]
    StoredHash(String),

    #[error("secret verification task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
