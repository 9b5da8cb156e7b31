use super::error::IssueError;
use super::traits::{AuthMethod, GrantType, parse_scope};
use super::{ClientCredentials, OAuthService};
use axum::{
    Form, Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared state for every authorization server handler
#[derive(Clone)]
pub struct OAuthAppState {
    pub oauth_service: Arc<OAuthService>,
}

/// Endpoints that accept client secrets. main puts the strict rate limiter on these.
pub fn token_routes(state: OAuthAppState) -> Router {
    Router::new()
        .route("/oauth2/token", post(oauth_token_handler))
        .route("/oauth2/introspect", post(introspection_handler))
        .with_state(state)
}

/// Public discovery endpoints - nothing secret here
pub fn discovery_routes(state: OAuthAppState) -> Router {
    Router::new()
        .route("/oauth2/jwks", get(jwks_handler))
        .route(
            "/.well-known/oauth-authorization-server",
            get(metadata_handler),
        )
        .with_state(state)
}

/// OAuth 2.0 token request, client_credentials grant
#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub grant_type: Option<String>,
    /// space separated, optional
    pub scope: Option<String>,
    /// only for client_secret_post
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

/// OAuth 2.0 error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_description: Option<String>,
}

/// Handler for POST /oauth2/token
pub async fn oauth_token_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    Form(req): Form<TokenRequest>,
) -> Response {
    let grant_type = match req.grant_type.as_deref() {
        Some(raw) => raw,
        None => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request",
                Some("Missing required parameter: grant_type"),
            );
        }
    };

    tracing::info!("Token request: grant_type={}", grant_type);

    // the other grant types parse, but this server only ever issues client_credentials
    let grant_type = match grant_type.parse::<GrantType>() {
        Ok(GrantType::ClientCredentials) => GrantType::ClientCredentials,
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "unsupported_grant_type",
                Some("Only client_credentials is supported"),
            );
        }
    };

    let credentials = match client_credentials(
        &headers,
        req.client_id.as_deref(),
        req.client_secret.as_deref(),
    ) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let requested_scopes = req.scope.as_deref().map(parse_scope).unwrap_or_default();

    match state
        .oauth_service
        .issue(&credentials, grant_type, &requested_scopes)
        .await
    {
        Ok(token) => {
            tracing::info!(
                "Issued OAuth token via client_credentials for client: {}",
                token.subject
            );
            let mut headers = HeaderMap::new();
            no_store(&mut headers);
            (StatusCode::OK, headers, Json(token.into_token_response())).into_response()
        }
        Err(e) => {
            if e.status().is_server_error() {
                tracing::error!("Failed to issue token: {}", e);
            }
            // Don't leak information about which check failed
            issue_error_response(&e, credentials.method)
        }
    }
}

/// RFC 7662 introspection request
#[derive(Debug, Deserialize)]
pub struct IntrospectionRequest {
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct IntrospectionResponse {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Handler for POST /oauth2/introspect. Any registered client may ask.
pub async fn introspection_handler(
    State(state): State<OAuthAppState>,
    headers: HeaderMap,
    Form(req): Form<IntrospectionRequest>,
) -> Response {
    let credentials = match client_credentials(
        &headers,
        req.client_id.as_deref(),
        req.client_secret.as_deref(),
    ) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    if let Err(e) = state.oauth_service.authenticate_client(&credentials).await {
        tracing::warn!(
            "Introspection refused for client {}: {}",
            credentials.client_id,
            e
        );
        return issue_error_response(&e, credentials.method);
    }

    let Some(token) = req.token else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            Some("Missing required parameter: token"),
        );
    };

    let body = match state.oauth_service.introspect(&token).await {
        Ok(claims) => IntrospectionResponse {
            active: true,
            scope: Some(claims.scope),
            client_id: Some(claims.client_id),
            sub: Some(claims.sub),
            token_type: Some("Bearer".to_string()),
            iat: Some(claims.iat),
            exp: Some(claims.exp),
            iss: Some(claims.iss),
        },
        Err(e) => {
            tracing::debug!("Introspected token is inactive: {}", e);
            IntrospectionResponse::default()
        }
    };

    let mut headers = HeaderMap::new();
    no_store(&mut headers);
    (StatusCode::OK, headers, Json(body)).into_response()
}

/// Work out who the client claims to be (RFC 6749 §2.3.1).
/// Basic auth header or form fields, never both.
fn client_credentials(
    headers: &HeaderMap,
    form_id: Option<&str>,
    form_secret: Option<&str>,
) -> Result<ClientCredentials, Response> {
    let basic = headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            h.split_once(' ')
                .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("basic"))
                .map(|(_, value)| value.trim())
        });

    match (basic, form_id, form_secret) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => Err(error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            Some("Use only one client authentication method"),
        )),
        (Some(encoded), None, None) => decode_basic(encoded).ok_or_else(invalid_client),
        (None, Some(id), Some(secret)) => Ok(ClientCredentials {
            client_id: id.to_string(),
            client_secret: secret.to_string(),
            method: AuthMethod::ClientSecretPost,
        }),
        _ => Err(invalid_client()),
    }
}

/// `base64(urlencode(id) ":" urlencode(secret))`
fn decode_basic(encoded: &str) -> Option<ClientCredentials> {
    let raw = BASE64.decode(encoded).ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let (id, secret) = raw.split_once(':')?;

    let form_decode = |s: &str| {
        urlencoding::decode(&s.replace('+', " "))
            .ok()
            .map(|c| c.into_owned())
    };

    let client_id = form_decode(id)?;
    if client_id.is_empty() {
        return None;
    }

    Some(ClientCredentials {
        client_id,
        client_secret: form_decode(secret)?,
        method: AuthMethod::ClientSecretBasic,
    })
}

/// No usable credentials at all. Challenge for Basic, the method we prefer.
fn invalid_client() -> Response {
    with_basic_challenge(error_response(
        StatusCode::UNAUTHORIZED,
        "invalid_client",
        Some("Client authentication failed"),
    ))
}

/// RFC 6749 §5.2: a 401 carries a challenge only when the client
/// authenticated through the Authorization header
fn issue_error_response(e: &IssueError, method: AuthMethod) -> Response {
    let resp = error_response(e.status(), e.error_code(), Some(e.public_description()));
    if e.status() == StatusCode::UNAUTHORIZED && method == AuthMethod::ClientSecretBasic {
        with_basic_challenge(resp)
    } else {
        resp
    }
}

fn with_basic_challenge(mut resp: Response) -> Response {
    resp.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"clubhouse\""),
    );
    resp
}

fn no_store(headers: &mut HeaderMap) {
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
}

fn error_response(status: StatusCode, error: &str, description: Option<&str>) -> Response {
    let error_resp = ErrorResponse {
        error: error.to_string(),
        error_description: description.map(|s| s.to_string()),
    };

    let mut headers = HeaderMap::new();
    no_store(&mut headers);

    (status, headers, Json(error_resp)).into_response()
}

/// Handler for GET /oauth2/jwks - the public half of every key we still trust
pub async fn jwks_handler(State(state): State<OAuthAppState>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=60"),
    );
    (StatusCode::OK, headers, Json(state.oauth_service.jwks())).into_response()
}

/// Auth server metadata (RFC 8414)
#[derive(Debug, Serialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: String,
    pub token_endpoint: String,
    pub jwks_uri: String,
    pub introspection_endpoint: String,
    pub grant_types_supported: Vec<String>,
    pub token_endpoint_auth_methods_supported: Vec<String>,
    pub introspection_endpoint_auth_methods_supported: Vec<String>,
    pub scopes_supported: Vec<String>,
}

/// Tells clients where things are and what we support
pub async fn metadata_handler(State(state): State<OAuthAppState>) -> Response {
    let base_url = state.oauth_service.issuer();
    let auth_methods = vec![
        AuthMethod::ClientSecretBasic.to_string(),
        AuthMethod::ClientSecretPost.to_string(),
    ];

    let metadata = AuthorizationServerMetadata {
        issuer: base_url.to_string(),
        token_endpoint: format!("{}/oauth2/token", base_url),
        jwks_uri: format!("{}/oauth2/jwks", base_url),
        introspection_endpoint: format!("{}/oauth2/introspect", base_url),
        grant_types_supported: vec![GrantType::ClientCredentials.to_string()],
        token_endpoint_auth_methods_supported: auth_methods.clone(),
        introspection_endpoint_auth_methods_supported: auth_methods,
        scopes_supported: state.oauth_service.supported_scopes().into_iter().collect(),
    };

    tracing::debug!("Serving authorization server metadata");

    (StatusCode::OK, Json(metadata)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::test_support::{ISSUER, service};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> Router {
        let state = OAuthAppState {
            oauth_service: Arc::new(service()),
        };
        discovery_routes(state.clone()).merge(token_routes(state))
    }

    fn basic_header(id: &str, secret: &str) -> String {
        format!("Basic {}", BASE64.encode(format!("{id}:{secret}")))
    }

    fn form(pairs: &[(&str, &str)]) -> String {
        serde_urlencoded::to_string(pairs).unwrap()
    }

    async fn post_form(
        app: Router,
        path: &str,
        authorization: Option<String>,
        body: String,
    ) -> (StatusCode, HeaderMap, Value) {
        let mut req = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some(auth) = authorization {
            req = req.header(header::AUTHORIZATION, auth);
        }
        let resp = app.oneshot(req.body(Body::from(body)).unwrap()).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    async fn get_json(app: Router, path: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn basic_auth_client_gets_a_token() {
        let (status, headers, body) = post_form(
            app(),
            "/oauth2/token",
            Some(basic_header("golf-client", "golf-secret")),
            form(&[("grant_type", "client_credentials"), ("scope", "read")]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert_eq!(body["token_type"], "Bearer");
        assert_eq!(body["expires_in"], 300);
        assert_eq!(body["scope"], "read");
        assert!(body["access_token"].as_str().unwrap().split('.').count() == 3);
    }

    #[tokio::test]
    async fn post_auth_client_gets_a_token() {
        let (status, _, body) = post_form(
            app(),
            "/oauth2/token",
            None,
            form(&[
                ("grant_type", "client_credentials"),
                ("client_id", "pro-shop"),
                ("client_secret", "pro-secret"),
                ("scope", "read write"),
            ]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scope"], "read write");
    }

    #[tokio::test]
    async fn unknown_client_and_wrong_secret_get_identical_responses() {
        let body = form(&[("grant_type", "client_credentials")]);
        let (s1, h1, b1) = post_form(
            app(),
            "/oauth2/token",
            Some(basic_header("caddie", "golf-secret")),
            body.clone(),
        )
        .await;
        let (s2, h2, b2) = post_form(
            app(),
            "/oauth2/token",
            Some(basic_header("golf-client", "bogey")),
            body,
        )
        .await;

        assert_eq!(s1, StatusCode::UNAUTHORIZED);
        assert_eq!(s1, s2);
        assert_eq!(b1, b2);
        assert_eq!(b1["error"], "invalid_client");
        assert_eq!(h1[header::WWW_AUTHENTICATE], h2[header::WWW_AUTHENTICATE]);
    }

    #[tokio::test]
    async fn disallowed_scope_is_invalid_scope() {
        let (status, _, body) = post_form(
            app(),
            "/oauth2/token",
            Some(basic_header("golf-client", "golf-secret")),
            form(&[("grant_type", "client_credentials"), ("scope", "read write")]),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_scope");
    }

    #[tokio::test]
    async fn wrong_auth_method_is_invalid_client() {
        // golf-client is registered for client_secret_basic
        let (status, headers, body) = post_form(
            app(),
            "/oauth2/token",
            None,
            form(&[
                ("grant_type", "client_credentials"),
                ("client_id", "golf-client"),
                ("client_secret", "golf-secret"),
            ]),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_client");
        // credentials came in the form body, so no Basic challenge
        assert!(!headers.contains_key(header::WWW_AUTHENTICATE));
    }

    #[tokio::test]
    async fn missing_credentials_get_a_basic_challenge() {
        let (status, headers, body) = post_form(
            app(),
            "/oauth2/token",
            None,
            form(&[("grant_type", "client_credentials")]),
        )
        .await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_client");
        assert_eq!(
            headers[header::WWW_AUTHENTICATE],
            "Basic realm=\"clubhouse\""
        );
    }

    #[tokio::test]
    async fn other_grant_types_are_unsupported() {
        for grant in ["password", "authorization_code", "refresh_token"] {
            let (status, _, body) = post_form(
                app(),
                "/oauth2/token",
                Some(basic_header("golf-client", "golf-secret")),
                form(&[("grant_type", grant)]),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["error"], "unsupported_grant_type");
        }
    }

    #[tokio::test]
    async fn missing_grant_type_or_credentials() {
        let (status, _, body) = post_form(
            app(),
            "/oauth2/token",
            Some(basic_header("golf-client", "golf-secret")),
            form(&[("scope", "read")]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");

        let (status, _, body) = post_form(
            app(),
            "/oauth2/token",
            None,
            form(&[("grant_type", "client_credentials")]),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_client");
    }

    #[tokio::test]
    async fn two_auth_methods_at_once_is_invalid_request() {
        let (status, _, body) = post_form(
            app(),
            "/oauth2/token",
            Some(basic_header("golf-client", "golf-secret")),
            form(&[
                ("grant_type", "client_credentials"),
                ("client_id", "golf-client"),
                ("client_secret", "golf-secret"),
            ]),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[test]
    fn basic_credentials_are_form_decoded() {
        let encoded = BASE64.encode("golf%20client:s%3Acret+x");
        let creds = decode_basic(&encoded).unwrap();
        assert_eq!(creds.client_id, "golf client");
        assert_eq!(creds.client_secret, "s:cret x");
        assert_eq!(creds.method, AuthMethod::ClientSecretBasic);

        assert!(decode_basic("!!!").is_none());
        assert!(decode_basic(&BASE64.encode("no-colon")).is_none());
        assert!(decode_basic(&BASE64.encode(":secret")).is_none());
    }

    #[tokio::test]
    async fn introspection_reports_live_and_dead_tokens() {
        let app = app();
        let (_, _, issued) = post_form(
            app.clone(),
            "/oauth2/token",
            Some(basic_header("golf-client", "golf-secret")),
            form(&[("grant_type", "client_credentials")]),
        )
        .await;
        let token = issued["access_token"].as_str().unwrap();

        let (status, _, body) = post_form(
            app.clone(),
            "/oauth2/introspect",
            None,
            form(&[
                ("token", token),
                ("client_id", "pro-shop"),
                ("client_secret", "pro-secret"),
            ]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["active"], true);
        assert_eq!(body["sub"], "golf-client");
        assert_eq!(body["scope"], "read");
        assert_eq!(body["iss"], ISSUER);

        let (status, _, body) = post_form(
            app.clone(),
            "/oauth2/introspect",
            None,
            form(&[
                ("token", "not-a-token"),
                ("client_id", "pro-shop"),
                ("client_secret", "pro-secret"),
            ]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"active": false}));
    }

    #[tokio::test]
    async fn introspection_requires_client_authentication() {
        let (status, _, body) = post_form(
            app(),
            "/oauth2/introspect",
            Some(basic_header("golf-client", "wrong")),
            form(&[("token", "whatever")]),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "invalid_client");
    }

    #[tokio::test]
    async fn jwks_and_metadata_are_public() {
        let (status, jwks) = get_json(app(), "/oauth2/jwks").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(jwks["keys"].as_array().unwrap().len(), 1);
        assert_eq!(jwks["keys"][0]["kty"], "OKP");

        let (status, meta) = get_json(app(), "/.well-known/oauth-authorization-server").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(meta["issuer"], ISSUER);
        assert_eq!(meta["token_endpoint"], format!("{ISSUER}/oauth2/token"));
        assert_eq!(meta["jwks_uri"], format!("{ISSUER}/oauth2/jwks"));
        assert_eq!(meta["grant_types_supported"], serde_json::json!(["client_credentials"]));
        assert_eq!(meta["scopes_supported"], serde_json::json!(["read", "write"]));
    }
}
