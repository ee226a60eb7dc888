//! Proxy request engine
//!
//! Per-request pipeline: decode the magic token, authorize the method/path
//! pair against its capabilities, substitute the real upstream credential,
//! then relay the request and response as bounded streams. A request moves
//! through `RECEIVED → TOKEN_DECODED → AUTHORIZED → UPSTREAM_CONNECTED →
//! STREAMING → COMPLETE`; failures before streaming map to HTTP errors,
//! failures after the first relayed byte tear the client connection down.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};
use uuid::Uuid;

use super::authorize;
use super::router::AppState;
use super::tee;
use crate::scopes::{ResponseBody, ScopeProvider};
use crate::{headers, queries, token};

/// Upstream responses at or below this many bytes are buffered whole and
/// handed to observers as a materialized stream. Larger responses, and
/// responses without a `Content-Length` at all, go through the fan-out
/// pipeline instead.
pub const STREAMING_THRESHOLD: u64 = 1_000_000;

/// Run one proxied request end to end.
pub async fn proxy_request(
    state: &AppState,
    method: Method,
    path: &str,
    query: Option<&str>,
    request_headers: &HeaderMap,
    body: Body,
) -> Response {
    let request_id = Uuid::new_v4();

    // RECEIVED → TOKEN_DECODED
    let Some(auth) = request_headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
    else {
        return (StatusCode::UNAUTHORIZED, "No authorization token presented").into_response();
    };
    let bearer = auth.strip_prefix("Bearer ").unwrap_or(auth);
    let claims = match token::decode(&state.keys, bearer) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(%request_id, error = %e, "Magic token rejected");
            return (StatusCode::BAD_REQUEST, "Not a valid magic token").into_response();
        }
    };

    // TOKEN_DECODED → AUTHORIZED
    let request_path = format!("/{}", path.trim_start_matches('/'));
    if !authorize::validate_request(&state.scopes, method.as_str(), &request_path, &claims) {
        debug!(%request_id, method = %method, path = %request_path, "Disallowed by capability check");
        return (StatusCode::UNAUTHORIZED, "Disallowed by API proxy").into_response();
    }

    // AUTHORIZED → UPSTREAM_CONNECTED
    let mut upstream_headers = headers::clean_request_headers(
        request_headers,
        &state.config.request_headers_to_clean,
    );
    let Ok(upstream_auth) = HeaderValue::from_str(&format!("Bearer {}", claims.token)) else {
        debug!(%request_id, "Decrypted upstream secret is not a usable header value");
        return (StatusCode::BAD_REQUEST, "Not a valid magic token").into_response();
    };
    upstream_headers.insert(AUTHORIZATION, upstream_auth);

    let mut target = request_path.clone();
    if let Some(query) = query {
        target.push('?');
        target.push_str(query);
    }
    let target = queries::clean_path_queries(&state.config.query_params_to_clean, &target);
    let url = format!(
        "{}/{}",
        state.config.api_root.trim_end_matches('/'),
        target.trim_start_matches('/')
    );

    debug!(%request_id, method = %method, url = %url, "Forwarding upstream");
    let upstream = state
        .http
        .request(method.clone(), &url)
        .headers(upstream_headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .send()
        .await;
    let upstream = match upstream {
        Ok(response) => response,
        Err(e) => {
            warn!(%request_id, url = %url, error = %e, "Upstream request failed");
            return (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response();
        }
    };

    // UPSTREAM_CONNECTED → STREAMING → COMPLETE
    let status = upstream.status();
    let response_headers = headers::clean_response_headers(upstream.headers());
    let content_length = upstream.content_length();
    let observer = scope_observer(state, &claims);

    match content_length {
        Some(length) if length <= STREAMING_THRESHOLD => {
            let body_bytes = match upstream.bytes().await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(%request_id, error = %e, "Upstream body read failed");
                    return (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response();
                }
            };
            if let Some((scope, scope_names)) = observer {
                let reader: ResponseBody = Box::pin(std::io::Cursor::new(body_bytes.clone()));
                spawn_observer(
                    scope,
                    method.as_str().to_string(),
                    request_path,
                    status.as_u16(),
                    scope_names,
                    reader,
                );
            }
            relay(status, response_headers, Body::from(body_bytes))
        }
        _ => {
            if let Some((scope, scope_names)) = observer {
                let fan = tee::fan_out(upstream.bytes_stream(), true);
                if let Some(reader) = fan.observer {
                    spawn_observer(
                        scope,
                        method.as_str().to_string(),
                        request_path,
                        status.as_u16(),
                        scope_names,
                        reader,
                    );
                }
                relay(status, response_headers, Body::from_stream(fan.client))
            } else {
                relay(
                    status,
                    response_headers,
                    Body::from_stream(upstream.bytes_stream()),
                )
            }
        }
    }
}

/// Pick the scope observing this response, if the token names one.
///
/// A token can name several scopes with observers; the response stream has
/// one observer end, so the first observing scope in token order wins and
/// the rest are skipped with a note in the logs.
fn scope_observer(
    state: &AppState,
    claims: &token::Claims,
) -> Option<(Arc<dyn ScopeProvider>, Vec<String>)> {
    let names = claims.scopes.as_ref()?;
    let mut chosen: Option<Arc<dyn ScopeProvider>> = None;
    for name in names {
        let Some(scope) = state.scopes.get(name) else {
            continue;
        };
        if scope.has_response_callback() {
            if chosen.is_none() {
                chosen = Some(Arc::clone(scope));
            } else {
                debug!(scope = %name, "Several observing scopes on one token; extra observer skipped");
            }
        }
    }
    chosen.map(|scope| (scope, names.clone()))
}

/// Fire-and-forget observer invocation. Whatever happens inside the
/// observer, the client response is already on its way.
fn spawn_observer(
    scope: Arc<dyn ScopeProvider>,
    method: String,
    path: String,
    status: u16,
    scope_names: Vec<String>,
    body: ResponseBody,
) {
    tokio::spawn(async move {
        scope
            .on_response(&method, &path, body, status, &scope_names)
            .await;
    });
}

fn relay(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
