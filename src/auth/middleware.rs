use super::error::ValidationError;
use super::traits::{Principal, TokenValidator};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::sync::Arc;

// Request pipeline on the resource server, outermost first:
//   jwt_auth_middleware  bearer token -> Principal in request extensions, or 401
//   require_scope        Principal must carry the route's scope, or 403
//   handler              only ever sees a Principal that passed both

#[derive(Clone)]
pub struct AuthMiddlewareConfig {
    pub validator: Arc<dyn TokenValidator + Send + Sync>,
    pub base_url: String,
}

#[derive(Clone)]
pub struct ScopeRequirement {
    pub scope: String,
    pub base_url: String,
}

/// Authenticate: validate the bearer token and stash the caller's identity.
/// Returns WWW-Authenticate header on 401 as required by RFC 6750 / RFC 9728
pub async fn jwt_auth_middleware(
    State(config): State<AuthMiddlewareConfig>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(req.headers()) else {
        tracing::warn!(
            "Missing or invalid Authorization header for {} {}",
            req.method(),
            req.uri()
        );
        return challenge_response(&config.base_url, None);
    };

    let result = config.validator.validate_token(token, None, Utc::now()).await;

    match result {
        Ok(principal) => {
            tracing::debug!("Valid token for client: {}", principal.subject);
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(e) => {
            if e == ValidationError::KeysUnavailable {
                tracing::error!("Rejecting request, no verification keys loaded yet");
            } else {
                tracing::warn!("Invalid bearer token: {}", e);
            }
            challenge_response(&config.base_url, Some(&e))
        }
    }
}

/// Authorize: the authenticated caller must hold `scope`
pub async fn require_scope(
    State(requirement): State<ScopeRequirement>,
    req: Request,
    next: Next,
) -> Response {
    let Some(principal) = req.extensions().get::<Principal>() else {
        // layering mistake, authenticate didn't run before us
        tracing::error!("require_scope reached without an authenticated principal");
        return challenge_response(&requirement.base_url, None);
    };

    if !principal.has_scope(&requirement.scope) {
        tracing::warn!(
            "Client {} lacks scope {} for {}",
            principal.subject,
            requirement.scope,
            req.uri()
        );
        return challenge_response(
            &requirement.base_url,
            Some(&ValidationError::InsufficientScope(requirement.scope.clone())),
        );
    }

    next.run(req).await
}

/// `Authorization: Bearer <token>`, scheme matched case-insensitively
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// 401/403 with a WWW-Authenticate challenge per RFC 6750 §3 and RFC 9728
fn challenge_response(base_url: &str, error: Option<&ValidationError>) -> Response {
    let mut challenge = format!(
        "Bearer realm=\"{}\", resource_metadata=\"{}/.well-known/oauth-protected-resource\"",
        base_url, base_url
    );

    let status = match error {
        Some(err) => {
            challenge.push_str(&format!(", error=\"{}\"", err.error_code()));
            if let ValidationError::InsufficientScope(scope) = err {
                challenge.push_str(&format!(", scope=\"{}\"", scope));
            }
            err.status()
        }
        None => StatusCode::UNAUTHORIZED,
    };

    match challenge.parse::<HeaderValue>() {
        Ok(value) => (status, [(header::WWW_AUTHENTICATE, value)]).into_response(),
        Err(_) => status.into_response(),
    }
}
