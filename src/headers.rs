//! Header sanitization for both proxy directions

use std::collections::HashSet;

use axum::http::HeaderMap;
use axum::http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, HOST, HeaderName,
    TRANSFER_ENCODING,
};

/// Headers never forwarded to the upstream API.
///
/// `Host` and `Content-Length` are re-derived by the upstream client;
/// `Authorization` is replaced with the upstream credential by the engine.
const REQUEST_DROPS: &[HeaderName] = &[HOST, CONTENT_LENGTH, CONNECTION, AUTHORIZATION];

/// Hop-by-hop headers never relayed to the client.
///
/// The relayed body is the decoded stream, so the upstream framing and
/// encoding headers no longer describe it; the HTTP layer re-emits accurate
/// framing.
const RESPONSE_DROPS: &[HeaderName] = &[
    CONTENT_ENCODING,
    TRANSFER_ENCODING,
    CONNECTION,
    CONTENT_LENGTH,
];

/// Sanitize client request headers before forwarding upstream.
///
/// Drops the fixed set plus any name in `extra_drops`, case-insensitively.
/// Everything else is preserved verbatim, including repeated headers.
pub fn clean_request_headers(headers: &HeaderMap, extra_drops: &HashSet<String>) -> HeaderMap {
    let mut cleaned = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if REQUEST_DROPS.contains(name) {
            continue;
        }
        if extra_drops
            .iter()
            .any(|drop| name.as_str().eq_ignore_ascii_case(drop))
        {
            continue;
        }
        cleaned.append(name.clone(), value.clone());
    }
    cleaned
}

/// Sanitize upstream response headers before relaying to the client.
pub fn clean_response_headers(headers: &HeaderMap) -> HeaderMap {
    let mut cleaned = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if RESPONSE_DROPS.contains(name) {
            continue;
        }
        cleaned.append(name.clone(), value.clone());
    }
    cleaned
}
