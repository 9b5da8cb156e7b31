use crate::auth::{
    AuthMiddlewareConfig, Principal, ScopeRequirement, TokenValidator, jwt_auth_middleware,
    require_scope,
};
use axum::{
    Extension, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::sync::Arc;

/// Scope a caller needs to read the catalogue
pub const READ_SCOPE: &str = "read";

#[derive(Debug, Clone, Serialize)]
pub struct Lesson {
    pub title: String,
    pub description: String,
    pub instructor: String,
    pub schedule: NaiveDateTime,
}

// (title, description, instructor, y, m, d, hour, minute)
type LessonRow = (&'static str, &'static str, &'static str, i32, u32, u32, u32, u32);

const CATALOGUE: &[LessonRow] = &[
    (
        "Putting Fundamentals",
        "Grip, stance and reading the green",
        "Grace Park",
        2026, 11, 3, 9, 0,
    ),
    (
        "Driving Range Session",
        "Tee height, swing path and getting more carry off the tee",
        "Tom Watson",
        2026, 11, 4, 14, 30,
    ),
    (
        "Short Game Clinic",
        "Chipping and pitching from tight lies and rough",
        "Grace Park",
        2026, 11, 6, 10, 0,
    ),
    (
        "Bunker Play",
        "Splash shots, plugged lies and fairway bunkers",
        "Annika Lind",
        2026, 11, 10, 16, 0,
    ),
];

fn at(y: i32, m: u32, d: u32, hour: u32, minute: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(y, m, d)?.and_hms_opt(hour, minute, 0)
}

pub fn catalogue() -> Vec<Lesson> {
    CATALOGUE
        .iter()
        .filter_map(|&(title, description, instructor, y, m, d, hour, minute)| {
            Some(Lesson {
                title: title.to_string(),
                description: description.to_string(),
                instructor: instructor.to_string(),
                schedule: at(y, m, d, hour, minute)?,
            })
        })
        .collect()
}

/// Handler for GET /lessons. Only reachable past both auth layers.
pub async fn lessons_handler(Extension(principal): Extension<Principal>) -> Json<Vec<Lesson>> {
    tracing::debug!("Serving lessons to {}", principal.subject);
    Json(catalogue())
}

#[derive(Clone)]
pub struct ResourceState {
    pub base_url: String,
    pub authorization_server: String,
}

/// RFC 9728 protected resource metadata
#[derive(Debug, Serialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
    pub scopes_supported: Vec<String>,
    pub bearer_methods_supported: Vec<String>,
}

/// Where clients look to find out which auth server to ask for a token
pub async fn protected_resource_metadata_handler(State(state): State<ResourceState>) -> Response {
    let metadata = ProtectedResourceMetadata {
        resource: state.base_url,
        authorization_servers: vec![state.authorization_server],
        scopes_supported: vec![READ_SCOPE.to_string()],
        bearer_methods_supported: vec!["header".to_string()],
    };
    (StatusCode::OK, Json(metadata)).into_response()
}

/// The resource server's routes. `/lessons` runs authenticate, then
/// authorize for `read`, then the handler. Metadata is public.
pub fn router(
    validator: Arc<dyn TokenValidator + Send + Sync>,
    base_url: String,
    authorization_server: String,
) -> Router {
    let auth_config = AuthMiddlewareConfig {
        validator,
        base_url: base_url.clone(),
    };
    let read = ScopeRequirement {
        scope: READ_SCOPE.to_string(),
        base_url: base_url.clone(),
    };

    let protected_routes = Router::new()
        .route(
            "/lessons",
            get(lessons_handler).layer(middleware::from_fn_with_state(read, require_scope)),
        )
        .layer(middleware::from_fn_with_state(
            auth_config,
            jwt_auth_middleware,
        ));

    let public_routes = Router::new()
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata_handler),
        )
        .with_state(ResourceState {
            base_url,
            authorization_server,
        });

    public_routes.merge(protected_routes)
}
