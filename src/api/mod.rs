//! REST control plane using Axum.
//!
//! Exposes the runtime surface of the daemon:
//! - `/version` - version string (unauthenticated)
//! - `/alerts` - inspect the pool, post new alerts
//! - `/filters` - list, show, add/replace, enable/disable/inactivate, remove
//! - `/routes` - list, show, replace
//!
//! `X-HTTP-Method-Override` is honoured on POST requests. When an API token
//! is configured, every endpoint except `/version` requires
//! `Authorization: Bearer <token>`.

mod handlers;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::dispatch::Dispatcher;
use crate::pipeline::Pipeline;

/// Maximum accepted request body.
const MAX_JSON_LENGTH: usize = 10 * 1024 * 1024;

/// Shared state for all API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<Pipeline>,
    pub dispatcher: Arc<Dispatcher>,
    pub token: Option<String>,
}

impl ApiState {
    pub fn new(
        pipeline: Arc<Pipeline>,
        dispatcher: Arc<Dispatcher>,
        token: Option<String>,
    ) -> Self {
        Self {
            pipeline,
            dispatcher,
            token: token.filter(|t| !t.is_empty()),
        }
    }
}

/// Create the complete application router.
pub fn create_app(state: ApiState) -> Router {
    Router::new()
        .route("/version", get(handlers::version))
        .route(
            "/alerts",
            get(handlers::get_alerts).post(handlers::post_alert),
        )
        .route("/filters", get(handlers::list_filters))
        .route(
            "/filters/:id",
            get(handlers::show_filter)
                .put(handlers::update_filter)
                .delete(handlers::delete_filter),
        )
        .route("/filters/:id/enable", put(handlers::enable_filter))
        .route("/filters/:id/disable", put(handlers::disable_filter))
        .route("/filters/:id/inactivate", put(handlers::inactivate_filter))
        .route("/routes", get(handlers::list_routes))
        .route(
            "/routes/:id",
            get(handlers::show_route).put(handlers::update_route),
        )
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(middleware::from_fn(method_override))
        .layer(DefaultBodyLimit::max(MAX_JSON_LENGTH))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Rewrite POST requests carrying `X-HTTP-Method-Override` before routing.
async fn method_override(mut request: Request, next: Next) -> Response {
    if request.method() == Method::POST {
        let overridden = request
            .headers()
            .get("x-http-method-override")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Method::from_bytes(s.as_bytes()).ok());
        if let Some(method) = overridden {
            *request.method_mut() = method;
        }
    }
    next.run(request).await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let mut fields = value.split_whitespace();
    match (fields.next(), fields.next(), fields.next()) {
        (Some("Bearer"), Some(token), None) => Some(token),
        _ => None,
    }
}

/// Bearer-token check for everything except `/version`.
async fn authenticate(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.token.as_deref() else {
        return next.run(request).await;
    };

    if request.uri().path() == "/version" {
        return next.run(request).await;
    }

    match bearer_token(request.headers()) {
        Some(token) if token == expected => next.run(request).await,
        Some(_) => ApiError::forbidden("token mismatch").into_response(),
        None => ApiError::forbidden("auth token is required").into_response(),
    }
}

/// API error with a consistent JSON shape.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "not found".to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": { "message": self.message }
        });
        (self.status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn test_state(token: Option<&str>) -> ApiState {
        let pipeline = Arc::new(Pipeline::new());
        let dispatcher = Arc::new(Dispatcher::new(
            std::time::Duration::from_secs(30),
            std::time::Duration::from_secs(30),
            pipeline.clone(),
        ));
        ApiState::new(pipeline, dispatcher, token.map(str::to_string))
    }

    #[tokio::test]
    async fn test_version_without_auth() {
        let app = create_app(test_state(Some("secret")));
        let resp = app
            .oneshot(HttpRequest::get("/version").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_auth_required_when_token_set() {
        let app = create_app(test_state(Some("secret")));
        let resp = app
            .clone()
            .oneshot(HttpRequest::get("/filters").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .clone()
            .oneshot(
                HttpRequest::get("/filters")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .oneshot(
                HttpRequest::get("/filters")
                    .header("authorization", "Bearer secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_no_auth_when_token_empty() {
        let app = create_app(test_state(None));
        let resp = app
            .oneshot(HttpRequest::get("/filters").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_method_override() {
        let app = create_app(test_state(None));
        // POST with an override header reaches the DELETE handler; deleting
        // an absent filter succeeds.
        let resp = app
            .oneshot(
                HttpRequest::post("/filters/ghost")
                    .header("x-http-method-override", "DELETE")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
