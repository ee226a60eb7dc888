//! HTTP router and handlers

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, get, on};
use serde_json::Value;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use super::{engine, mint};
use crate::config::Config;
use crate::keys::KeyMaterial;
use crate::scopes::ScopeRegistry;
use crate::{VERSION, token};

/// Shared application state, immutable for the process lifetime.
pub struct AppState {
    /// Proxy configuration.
    pub config: Config,
    /// Key material for minting and decoding tokens.
    pub keys: KeyMaterial,
    /// Named capability scopes.
    pub scopes: ScopeRegistry,
    /// Upstream HTTP client, connection-pooled and shared by all requests.
    pub http: reqwest::Client,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let proxy_methods = MethodFilter::GET
        .or(MethodFilter::POST)
        .or(MethodFilter::PUT)
        .or(MethodFilter::PATCH)
        .or(MethodFilter::DELETE);

    Router::new()
        .route("/__magictoken", get(identify_handler).post(mint_handler))
        .route("/", on(proxy_methods, proxy_root_handler))
        .route("/{*path}", on(proxy_methods, proxy_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /__magictoken: identification string with version and upstream.
async fn identify_handler(State(state): State<Arc<AppState>>) -> String {
    format!(
        "magic API proxy for {} version {}",
        state.config.api_root, VERSION
    )
}

/// POST /__magictoken: validate the request and mint a magic token.
async fn mint_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let Ok(params) = serde_json::from_slice::<Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "Request must be json").into_response();
    };

    let request = match mint::validate(&state.scopes, &params) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    match token::mint(
        &state.keys,
        &request.upstream_secret,
        request.scopes,
        request.allowed,
    ) {
        Ok(jwt) => ([(CONTENT_TYPE, "application/jwt")], jwt).into_response(),
        Err(e) => {
            error!(error = %e, "Token minting failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to mint token").into_response()
        }
    }
}

/// Catch-all proxy handler for non-root paths.
async fn proxy_handler(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    engine::proxy_request(&state, method, &path, uri.query(), &headers, body).await
}

/// Proxy handler for the origin root.
async fn proxy_root_handler(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    engine::proxy_request(&state, method, "", uri.query(), &headers, body).await
}
