//! End-to-end proxy tests
//!
//! Every test spins up a stub upstream API and a magicproxy gateway on
//! ephemeral ports, then drives the proxy with a real HTTP client: token
//! minting, credential substitution, capability denial, header and query
//! sanitization, streamed transfers, and the response-observer side channel.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use magicproxy::VERSION;
use magicproxy::config::Config;
use magicproxy::gateway::Gateway;
use magicproxy::scopes::PermissionEntry;

const UPSTREAM_SECRET: &str = "fake_token";
const BIG_CHUNKS: usize = 192;
const BIG_CHUNK_LEN: usize = 16 * 1024;

// ── fixtures ───────────────────────────────────────────────────────────

struct TestKeys {
    _dir: tempfile::TempDir,
    private: PathBuf,
    certificate: PathBuf,
}

fn test_keys() -> &'static TestKeys {
    static KEYS: OnceLock<TestKeys> = OnceLock::new();
    KEYS.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let private = dir.path().join("private.pem");
        let public = dir.path().join("public.pem");
        let certificate = dir.path().join("public.x509.cer");
        magicproxy::keygen::write_key_material(&private, &public, &certificate, "localhost")
            .unwrap();
        TestKeys {
            _dir: dir,
            private,
            certificate,
        }
    })
}

async fn spawn(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn base_config(upstream: SocketAddr) -> Config {
    let keys = test_keys();
    Config {
        api_root: format!("http://{upstream}"),
        private_key_location: Some(keys.private.display().to_string()),
        public_certificate_location: Some(keys.certificate.display().to_string()),
        scopes: HashMap::from([(
            "read_all".to_string(),
            vec![PermissionEntry::Rule("GET /.*".to_string())],
        )]),
        ..Config::default()
    }
}

async fn start_proxy(config: Config) -> SocketAddr {
    let gateway = Gateway::new(config).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, gateway.router()).await.unwrap();
    });
    addr
}

async fn mint(client: &reqwest::Client, proxy: SocketAddr, body: &Value) -> reqwest::Response {
    client
        .post(format!("http://{proxy}/__magictoken"))
        .json(body)
        .send()
        .await
        .unwrap()
}

async fn mint_token(client: &reqwest::Client, proxy: SocketAddr, body: &Value) -> String {
    let response = mint(client, proxy, body).await;
    assert_eq!(response.status(), StatusCode::OK);
    response.text().await.unwrap()
}

// ── stub upstream API ──────────────────────────────────────────────────

fn big_chunk(index: usize) -> Vec<u8> {
    vec![u8::try_from(index % 251).unwrap(); BIG_CHUNK_LEN]
}

fn big_body() -> Vec<u8> {
    (0..BIG_CHUNKS).flat_map(big_chunk).collect()
}

fn small_body() -> Vec<u8> {
    (0..10_240u32).map(|i| u8::try_from(i % 256).unwrap()).collect()
}

fn upstream_router() -> Router {
    async fn check_credential(headers: HeaderMap) -> Response {
        let authorized = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            == Some("Bearer fake_token");
        if authorized {
            (StatusCode::OK, "authorized by API").into_response()
        } else {
            (StatusCode::UNAUTHORIZED, "not authorized by API").into_response()
        }
    }

    async fn echo_headers(headers: HeaderMap) -> Response {
        let mut seen: HashMap<String, String> = HashMap::new();
        for (name, value) in &headers {
            seen.insert(
                name.as_str().to_string(),
                value.to_str().unwrap_or("<binary>").to_string(),
            );
        }
        axum::Json(seen).into_response()
    }

    async fn echo_query(uri: Uri) -> String {
        uri.query().unwrap_or("").to_string()
    }

    async fn echo_body(body: Bytes) -> Response {
        body.to_vec().into_response()
    }

    // Chunked on purpose: no content-length forces the streaming path.
    async fn big() -> Response {
        let chunks = (0..BIG_CHUNKS)
            .map(|i| Ok::<_, std::convert::Infallible>(Bytes::from(big_chunk(i))));
        Response::new(Body::from_stream(futures::stream::iter(chunks)))
    }

    async fn small() -> Vec<u8> {
        small_body()
    }

    Router::new()
        .route("/", get(check_credential).post(check_credential))
        .route("/endpoint", post(check_credential))
        .route("/headers", get(echo_headers))
        .route("/echo-query", get(echo_query))
        .route("/echo-body", post(echo_body))
        .route("/big", get(big))
        .route("/small", get(small))
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
}

// ── identification and minting ─────────────────────────────────────────

#[tokio::test]
async fn identification_endpoint_names_version_and_upstream() {
    let upstream = spawn(upstream_router()).await;
    let proxy = start_proxy(base_config(upstream)).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{proxy}/__magictoken"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.text().await.unwrap();
    assert!(body.contains(VERSION));
    assert!(body.contains(&format!("http://{upstream}")));
}

#[tokio::test]
async fn minting_returns_a_jwt_for_the_allowed_form() {
    let upstream = spawn(upstream_router()).await;
    let proxy = start_proxy(base_config(upstream)).await;
    let client = reqwest::Client::new();

    let response = mint(
        &client,
        proxy,
        &json!({"token": UPSTREAM_SECRET, "allowed": ["GET /.*"]}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/jwt"
    );
    let token = response.text().await.unwrap();
    assert_eq!(token.split('.').count(), 3);
}

#[tokio::test]
async fn minting_rejects_allowed_and_scope_together() {
    let upstream = spawn(upstream_router()).await;
    let proxy = start_proxy(base_config(upstream)).await;
    let client = reqwest::Client::new();

    let response = mint(
        &client,
        proxy,
        &json!({"token": "t", "allowed": ["GET /.*"], "scope": "read_all"}),
    )
    .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(response.text().await.unwrap().contains("not both"));
}

#[tokio::test]
async fn minting_rejects_unrecognized_keys() {
    let upstream = spawn(upstream_router()).await;
    let proxy = start_proxy(base_config(upstream)).await;
    let client = reqwest::Client::new();

    let response = mint(
        &client,
        proxy,
        &json!({"token": "t", "allowed_": ["GET /.*"]}),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = mint(&client, proxy, &json!({"token_": "t"})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = mint(&client, proxy, &json!({})).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ── proxying ───────────────────────────────────────────────────────────

#[tokio::test]
async fn valid_token_reaches_the_upstream_with_the_real_credential() {
    let upstream = spawn(upstream_router()).await;
    let proxy = start_proxy(base_config(upstream)).await;
    let client = reqwest::Client::new();

    let token = mint_token(
        &client,
        proxy,
        &json!({"token": UPSTREAM_SECRET, "allowed": ["GET /.*"]}),
    )
    .await;

    let response = client
        .get(format!("http://{proxy}/"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "authorized by API");
}

#[tokio::test]
async fn upstream_credential_mismatch_is_forwarded_unchanged() {
    let upstream = spawn(upstream_router()).await;
    let proxy = start_proxy(base_config(upstream)).await;
    let client = reqwest::Client::new();

    let token = mint_token(
        &client,
        proxy,
        &json!({"token": "wrong_token", "allowed": ["GET /.*"]}),
    )
    .await;

    let response = client
        .get(format!("http://{proxy}/"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.text().await.unwrap(), "not authorized by API");
}

#[tokio::test]
async fn missing_bad_and_disallowed_tokens_map_to_the_documented_errors() {
    let upstream = spawn(upstream_router()).await;
    let proxy = start_proxy(base_config(upstream)).await;
    let client = reqwest::Client::new();

    // No Authorization header
    let response = client.get(format!("http://{proxy}/")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.text().await.unwrap(),
        "No authorization token presented"
    );

    // Unverifiable token
    let response = client
        .get(format!("http://{proxy}/"))
        .bearer_auth("garbage")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.text().await.unwrap(), "Not a valid magic token");

    // Valid token, capability does not cover the request
    let token = mint_token(
        &client,
        proxy,
        &json!({"token": UPSTREAM_SECRET, "allowed": ["GET /.*"]}),
    )
    .await;
    let response = client
        .post(format!("http://{proxy}/endpoint"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(response.text().await.unwrap(), "Disallowed by API proxy");
}

#[tokio::test]
async fn scope_tokens_authorize_through_the_registry() {
    let upstream = spawn(upstream_router()).await;
    let proxy = start_proxy(base_config(upstream)).await;
    let client = reqwest::Client::new();

    let token = mint_token(
        &client,
        proxy,
        &json!({"token": UPSTREAM_SECRET, "scope": "read_all"}),
    )
    .await;

    let response = client
        .get(format!("http://{proxy}/"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // read_all grants GET only
    let response = client
        .post(format!("http://{proxy}/endpoint"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unreachable_upstream_maps_to_bad_gateway() {
    // Reserve a port, then close it again.
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let proxy = start_proxy(base_config(dead_addr)).await;
    let client = reqwest::Client::new();

    let token = mint_token(
        &client,
        proxy,
        &json!({"token": UPSTREAM_SECRET, "allowed": ["GET /.*"]}),
    )
    .await;

    let response = client
        .get(format!("http://{proxy}/"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

// ── sanitization ───────────────────────────────────────────────────────

#[tokio::test]
async fn request_headers_are_sanitized_and_credential_substituted() {
    let upstream = spawn(upstream_router()).await;
    let mut config = base_config(upstream);
    config.request_headers_to_clean = HashSet::from(["x-internal-trace".to_string()]);
    let proxy = start_proxy(config).await;
    let client = reqwest::Client::new();

    let token = mint_token(
        &client,
        proxy,
        &json!({"token": UPSTREAM_SECRET, "allowed": ["GET /.*"]}),
    )
    .await;

    let response = client
        .get(format!("http://{proxy}/headers"))
        .bearer_auth(&token)
        .header("X-Internal-Trace", "leak")
        .header("X-Custom", "kept")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let seen: HashMap<String, String> = response.json().await.unwrap();
    assert_eq!(seen.get("authorization").unwrap(), "Bearer fake_token");
    assert_eq!(seen.get("x-custom").unwrap(), "kept");
    assert!(!seen.contains_key("x-internal-trace"));
    // The upstream sees its own host, not the proxy's.
    assert_eq!(seen.get("host").unwrap(), &upstream.to_string());
}

#[tokio::test]
async fn configured_query_parameters_are_removed() {
    let upstream = spawn(upstream_router()).await;
    let mut config = base_config(upstream);
    config.query_params_to_clean = HashSet::from(["access_token".to_string()]);
    let proxy = start_proxy(config).await;
    let client = reqwest::Client::new();

    let token = mint_token(
        &client,
        proxy,
        &json!({"token": UPSTREAM_SECRET, "allowed": ["GET /.*"]}),
    )
    .await;

    let response = client
        .get(format!(
            "http://{proxy}/echo-query?a=1&access_token=leaked&b=2"
        ))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    assert_eq!(response.text().await.unwrap(), "a=1&b=2");
}

// ── streaming ──────────────────────────────────────────────────────────

#[tokio::test]
async fn chunked_responses_stream_through_byte_exact() {
    let upstream = spawn(upstream_router()).await;
    let proxy = start_proxy(base_config(upstream)).await;
    let client = reqwest::Client::new();

    let token = mint_token(
        &client,
        proxy,
        &json!({"token": UPSTREAM_SECRET, "allowed": ["GET /.*"]}),
    )
    .await;

    let response = client
        .get(format!("http://{proxy}/big"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let received = response.bytes().await.unwrap();
    assert_eq!(received.as_ref(), big_body().as_slice());
}

#[tokio::test]
async fn large_request_bodies_stream_upstream_and_back() {
    let upstream = spawn(upstream_router()).await;
    let proxy = start_proxy(base_config(upstream)).await;
    let client = reqwest::Client::new();

    let token = mint_token(
        &client,
        proxy,
        &json!({"token": UPSTREAM_SECRET, "allowed": ["POST /.*"]}),
    )
    .await;

    let payload = big_body();
    let response = client
        .post(format!("http://{proxy}/echo-body"))
        .bearer_auth(&token)
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let echoed = response.bytes().await.unwrap();
    assert_eq!(echoed.as_ref(), payload.as_slice());
}

// ── response observers ─────────────────────────────────────────────────

type SinkEvent = (HeaderMap, Vec<u8>);

fn sink_router(tx: mpsc::UnboundedSender<SinkEvent>) -> Router {
    let handler = move |headers: HeaderMap, body: Bytes| {
        let tx = tx.clone();
        async move {
            let _ = tx.send((headers, body.to_vec()));
            StatusCode::OK
        }
    };
    Router::new()
        .route("/observe", post(handler))
        .layer(DefaultBodyLimit::max(64 * 1024 * 1024))
}

fn write_observer_plugin(dir: &std::path::Path, sink: SocketAddr) {
    std::fs::write(
        dir.join("observed.yaml"),
        format!(
            concat!(
                "name: observed\n",
                "permissions:\n",
                "  - \"GET /.*\"\n",
                "on_response:\n",
                "  url: http://{}/observe\n",
            ),
            sink
        ),
    )
    .unwrap();
}

#[tokio::test]
async fn small_responses_reach_the_observer_in_full() {
    let upstream = spawn(upstream_router()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = spawn(sink_router(tx)).await;

    let plugin_dir = tempfile::tempdir().unwrap();
    write_observer_plugin(plugin_dir.path(), sink);

    let mut config = base_config(upstream);
    config.plugins_location = Some(plugin_dir.path().display().to_string());
    let proxy = start_proxy(config).await;
    let client = reqwest::Client::new();

    let token = mint_token(
        &client,
        proxy,
        &json!({"token": UPSTREAM_SECRET, "scope": "observed"}),
    )
    .await;

    let response = client
        .get(format!("http://{proxy}/small"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.bytes().await.unwrap().as_ref(),
        small_body().as_slice()
    );

    let (headers, observed) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("observer was never invoked")
        .unwrap();

    assert_eq!(headers.get("x-magicproxy-method").unwrap(), "GET");
    assert_eq!(headers.get("x-magicproxy-path").unwrap(), "/small");
    assert_eq!(headers.get("x-magicproxy-status").unwrap(), "200");
    assert_eq!(headers.get("x-magicproxy-scopes").unwrap(), "observed");
    assert_eq!(observed, small_body());
}

#[tokio::test]
async fn streamed_responses_reach_the_observer_as_an_ordered_prefix() {
    let upstream = spawn(upstream_router()).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = spawn(sink_router(tx)).await;

    let plugin_dir = tempfile::tempdir().unwrap();
    write_observer_plugin(plugin_dir.path(), sink);

    let mut config = base_config(upstream);
    config.plugins_location = Some(plugin_dir.path().display().to_string());
    let proxy = start_proxy(config).await;
    let client = reqwest::Client::new();

    let token = mint_token(
        &client,
        proxy,
        &json!({"token": UPSTREAM_SECRET, "scope": "observed"}),
    )
    .await;

    let response = client
        .get(format!("http://{proxy}/big"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // The client always gets every byte, observer or not.
    let expected = big_body();
    let received = response.bytes().await.unwrap();
    assert_eq!(received.as_ref(), expected.as_slice());

    // The observer gets an ordered prefix; under backpressure the tail may
    // be shed, but nothing is ever reordered or duplicated.
    let (headers, observed) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("observer was never invoked")
        .unwrap();
    assert_eq!(headers.get("x-magicproxy-path").unwrap(), "/big");
    assert!(!observed.is_empty());
    assert!(observed.len() <= expected.len());
    assert_eq!(observed[..], expected[..observed.len()]);
}
