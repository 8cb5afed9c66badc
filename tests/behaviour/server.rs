//! Server integration tests.
//!
//! These start a real server, send raw TCP traffic, and assert on
//! observable behavior.

use std::net::SocketAddr;
use std::sync::Arc;

use homestead::config::{Config, RateLimit, Server as ServerConfig};
use homestead::inventory::Component;
use homestead::{Catalog, OrdersModule, RateLimiter, server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn catalog() -> Catalog {
    Catalog::new()
        .simple("p1")
        .simple("p2")
        .bundle(
            "bundle1",
            vec![Component::new("p1", 3), Component::new("p2", 1)],
        )
}

struct Options {
    server: ServerConfig,
    rate_limit: Option<RateLimit>,
    orders_limiter: RateLimiter<std::net::IpAddr>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            rate_limit: None,
            orders_limiter: RateLimiter::new(100.0, 10.0).unwrap(),
        }
    }
}

/// Start a server on a random port with the orders module plus `/ping`
/// (GET) and `/panic` (GET).
async fn start_test_server(options: Options) -> server::Server {
    // RUST_LOG=homestead=debug shows request spans for a failing test.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let config = Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..options.server
        },
        rate_limit: options.rate_limit,
    };

    let orders = OrdersModule::new(catalog(), Arc::new(options.orders_limiter)).unwrap();

    let mut router = homestead::Router::new();
    homestead::module::mount(&mut router, &[&orders]);

    router.get("/ping", |_ctx| async move {
        homestead::response::ok(&homestead::json!({ "pong": true }))
    });

    router.get("/panic", |_ctx| async move {
        let empty: Vec<u32> = Vec::new();
        homestead::response::ok(&empty[0])
    });

    server::start(config, router.into_handle())
        .await
        .expect("failed to start test server")
}

/// Send a raw HTTP/1.1 request with `Connection: close` and read the full response.
async fn raw_request(addr: SocketAddr, payload: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("failed to connect");
    stream.write_all(payload).await.expect("failed to write");

    let mut buf = Vec::new();
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        stream.read_to_end(&mut buf),
    )
    .await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn get(addr: SocketAddr, path: &str) -> String {
    let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    raw_request(addr, req.as_bytes()).await
}

async fn post_json(addr: SocketAddr, path: &str, body: &serde_json::Value) -> String {
    let body = body.to_string();
    let req = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    raw_request(addr, req.as_bytes()).await
}

/// Parse the JSON body out of a raw response.
fn json_body(response: &str) -> serde_json::Value {
    let (_, body) = response
        .split_once("\r\n\r\n")
        .unwrap_or_else(|| panic!("no body in response:\n{response}"));
    serde_json::from_str(body).unwrap_or_else(|e| panic!("bad JSON body ({e}):\n{response}"))
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[tokio::test]
async fn requirements_expand_bundles() {
    let server = start_test_server(Options::default()).await;
    let response = post_json(
        server.addr(),
        "/api/orders/requirements",
        &serde_json::json!({
            "items": [
                { "product_id": "p1", "quantity": 5 },
                { "product_id": "bundle1", "quantity": 2 },
                { "product_id": "ghost", "quantity": 9 }
            ]
        }),
    )
    .await;
    server.shutdown().await.unwrap();

    assert!(status_line(&response).contains("200"), "{response}");
    assert_eq!(
        json_body(&response),
        serde_json::json!({ "requirements": { "p1": 11, "p2": 2 } })
    );
}

#[tokio::test]
async fn strict_requirements_reject_unknown_products() {
    let server = start_test_server(Options::default()).await;
    let response = post_json(
        server.addr(),
        "/api/orders/requirements",
        &serde_json::json!({
            "strict": true,
            "items": [{ "product_id": "ghost", "quantity": 1 }]
        }),
    )
    .await;
    server.shutdown().await.unwrap();

    assert!(status_line(&response).contains("404"), "{response}");
    assert!(json_body(&response)["error"].as_str().unwrap().contains("ghost"));
}

#[tokio::test]
async fn zero_quantity_is_a_bad_request() {
    let server = start_test_server(Options::default()).await;
    let response = post_json(
        server.addr(),
        "/api/orders/requirements",
        &serde_json::json!({ "items": [{ "product_id": "p1", "quantity": 0 }] }),
    )
    .await;
    server.shutdown().await.unwrap();

    assert!(status_line(&response).contains("400"), "{response}");
}

#[tokio::test]
async fn requirements_reject_wrong_content_type() {
    let server = start_test_server(Options::default()).await;
    let response = raw_request(
        server.addr(),
        b"POST /api/orders/requirements HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\nContent-Length: 12\r\nConnection: close\r\n\r\n{\"items\":[]}",
    )
    .await;
    server.shutdown().await.unwrap();

    assert!(status_line(&response).contains("415"), "{response}");
}

#[tokio::test]
async fn catalog_lookup() {
    let server = start_test_server(Options::default()).await;
    let found = get(server.addr(), "/api/catalog/bundle1").await;
    let missing = get(server.addr(), "/api/catalog/ghost").await;
    server.shutdown().await.unwrap();

    assert_eq!(
        json_body(&found),
        serde_json::json!({
            "id": "bundle1",
            "kind": "bundle",
            "components": [
                { "product_id": "p1", "quantity": 3 },
                { "product_id": "p2", "quantity": 1 }
            ]
        })
    );
    assert!(status_line(&missing).contains("404"), "{missing}");
}

#[tokio::test]
async fn orders_endpoint_has_its_own_limiter() {
    let server = start_test_server(Options {
        orders_limiter: RateLimiter::new(2.0, 0.001).unwrap(),
        ..Default::default()
    })
    .await;
    let addr = server.addr();
    let body = serde_json::json!({ "items": [{ "product_id": "p1", "quantity": 1 }] });

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let response = post_json(addr, "/api/orders/requirements", &body).await;
        statuses.push(status_line(&response).to_string());
        if response.contains("429") {
            assert!(
                response.to_ascii_lowercase().contains("retry-after"),
                "429 response should include Retry-After header:\n{response}"
            );
        }
    }
    // Other routes are unaffected by the endpoint limiter.
    let ping = get(addr, "/ping").await;
    server.shutdown().await.unwrap();

    assert!(statuses[0].contains("200") && statuses[1].contains("200"), "{statuses:?}");
    assert!(statuses[2].contains("429"), "{statuses:?}");
    assert!(status_line(&ping).contains("200"), "{ping}");
}

// ---------------------------------------------------------------------------
// Server-wide behaviour
// ---------------------------------------------------------------------------

#[tokio::test]
async fn server_rate_limits_by_ip() {
    let server = start_test_server(Options {
        rate_limit: Some(RateLimit::new(3.0, 0.01)),
        ..Default::default()
    })
    .await;
    let addr = server.addr();

    let mut responses = Vec::new();
    for _ in 0..4 {
        responses.push(get(addr, "/ping").await);
    }
    server.shutdown().await.unwrap();

    for response in &responses[..3] {
        assert!(status_line(response).contains("200"), "{response}");
    }
    let limited = &responses[3];
    assert!(status_line(limited).contains("429"), "{limited}");
    assert!(
        limited.to_ascii_lowercase().contains("retry-after"),
        "429 response should include Retry-After header:\n{limited}"
    );
}

#[tokio::test]
async fn server_rejects_oversized_body() {
    let server = start_test_server(Options::default()).await;
    let response = raw_request(
        server.addr(),
        b"POST /api/orders/requirements HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10485760\r\nConnection: close\r\n\r\n",
    )
    .await;
    server.shutdown().await.unwrap();

    assert!(response.contains("413"), "Expected 413, got:\n{response}");
}

#[tokio::test]
async fn server_returns_security_headers() {
    let server = start_test_server(Options::default()).await;
    let response = get(server.addr(), "/ping").await;
    server.shutdown().await.unwrap();

    let lower = response.to_ascii_lowercase();
    for name in [
        "x-content-type-options",
        "x-frame-options",
        "cache-control",
        "content-security-policy",
        "x-request-id",
    ] {
        assert!(lower.contains(name), "Expected {name} header in response:\n{response}");
    }
    assert!(!lower.contains("strict-transport-security"));
}

#[tokio::test]
async fn server_returns_hsts_when_enabled() {
    let server = start_test_server(Options {
        server: ServerConfig {
            hsts: true,
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let response = get(server.addr(), "/ping").await;
    server.shutdown().await.unwrap();

    assert!(
        response
            .to_ascii_lowercase()
            .contains("strict-transport-security"),
        "{response}"
    );
}

#[tokio::test]
async fn server_propagates_client_request_id() {
    let server = start_test_server(Options::default()).await;
    let client_id = "550e8400-e29b-41d4-a716-446655440000";
    let req = format!(
        "GET /ping HTTP/1.1\r\nHost: localhost\r\nX-Request-Id: {client_id}\r\nConnection: close\r\n\r\n"
    );
    let response = raw_request(server.addr(), req.as_bytes()).await;
    server.shutdown().await.unwrap();

    assert!(response.contains(client_id), "{response}");
}

#[tokio::test]
async fn server_cors_allowlist() {
    let server = start_test_server(Options {
        server: ServerConfig {
            cors_origins: vec!["http://allowed.com".to_string()],
            ..Default::default()
        },
        ..Default::default()
    })
    .await;
    let addr = server.addr();

    let allowed = raw_request(
        addr,
        b"GET /ping HTTP/1.1\r\nHost: localhost\r\nOrigin: http://allowed.com\r\nConnection: close\r\n\r\n",
    )
    .await;
    let denied = raw_request(
        addr,
        b"GET /ping HTTP/1.1\r\nHost: localhost\r\nOrigin: http://evil.com\r\nConnection: close\r\n\r\n",
    )
    .await;
    let preflight = raw_request(
        addr,
        b"OPTIONS /api/orders/requirements HTTP/1.1\r\nHost: localhost\r\nOrigin: http://allowed.com\r\nConnection: close\r\n\r\n",
    )
    .await;
    server.shutdown().await.unwrap();

    assert!(allowed.contains("http://allowed.com"), "{allowed}");
    assert!(
        !denied
            .to_ascii_lowercase()
            .contains("access-control-allow-origin"),
        "{denied}"
    );
    assert!(status_line(&preflight).contains("204"), "{preflight}");
    let lower = preflight.to_ascii_lowercase();
    assert!(lower.contains("access-control-allow-methods: post, options"), "{preflight}");
}

#[tokio::test]
async fn server_returns_500_on_handler_panic() {
    let server = start_test_server(Options::default()).await;
    let response = get(server.addr(), "/panic").await;
    server.shutdown().await.unwrap();

    assert!(status_line(&response).contains("500"), "{response}");
    assert!(!response.contains("index out of bounds"), "{response}");
}

#[tokio::test]
async fn unknown_route_and_method() {
    let server = start_test_server(Options::default()).await;
    let missing = get(server.addr(), "/nowhere").await;
    let wrong_method = get(server.addr(), "/api/orders/requirements").await;
    server.shutdown().await.unwrap();

    assert!(status_line(&missing).contains("404"), "{missing}");
    assert!(status_line(&wrong_method).contains("405"), "{wrong_method}");
}
