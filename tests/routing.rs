//! Integration tests for the gateway routing table
//!
//! Each test binds the gateway on an ephemeral port against a temporary
//! static root and (where needed) a mock upstream that echoes the raw
//! request it received, then speaks HTTP/1.1 over a plain TCP stream.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use roost::proxy::{ProxyServer, ProxySettings};
use roost::router::RouteTable;
use roost::upstream::{UpstreamClient, UpstreamConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Create a static root with an SPA shell and a few fixture files
fn fixture_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("create temp dir");
    std::fs::write(dir.path().join("index.html"), "<html>tweets shell</html>").unwrap();
    std::fs::create_dir(dir.path().join("css")).unwrap();
    std::fs::write(dir.path().join("css/app.css"), "body { margin: 0 }").unwrap();
    std::fs::create_dir(dir.path().join("api")).unwrap();
    std::fs::write(dir.path().join("api/docs.html"), "<html>api docs</html>").unwrap();
    dir
}

/// Spawn a mock upstream that answers every request with 200 and the raw
/// request bytes echoed back as the response body
async fn spawn_mock_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                let mut read = 0usize;

                loop {
                    let Ok(n) = stream.read(&mut buf[read..]).await else {
                        return;
                    };
                    if n == 0 {
                        return;
                    }
                    read += n;

                    if let Some(header_end) = find_subsequence(&buf[..read], b"\r\n\r\n") {
                        let body_len = content_length(&buf[..header_end]);
                        let total = header_end + 4 + body_len;
                        while read < total {
                            let Ok(n) = stream.read(&mut buf[read..]).await else {
                                return;
                            };
                            if n == 0 {
                                return;
                            }
                            read += n;
                        }

                        let echoed = &buf[..total];
                        let mut response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            echoed.len()
                        )
                        .into_bytes();
                        response.extend_from_slice(echoed);
                        let _ = stream.write_all(&response).await;
                        return;
                    }
                }
            });
        }
    });

    addr
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn content_length(headers: &[u8]) -> usize {
    let headers = String::from_utf8_lossy(headers).to_lowercase();
    headers
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Bind the gateway on an ephemeral port with the default routing table
async fn spawn_gateway(
    static_root: &Path,
    upstream_addr: SocketAddr,
    settings: ProxySettings,
) -> (SocketAddr, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let upstream = Arc::new(UpstreamClient::new(UpstreamConfig {
        addr: upstream_addr.to_string(),
        request_timeout: Duration::from_secs(5),
        ..UpstreamConfig::default()
    }));

    let server = ProxyServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(RouteTable::default_table()),
        static_root.to_path_buf(),
        upstream,
        settings,
        shutdown_rx,
    )
    .await
    .expect("bind gateway");

    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    (addr, shutdown_tx)
}

/// An upstream address with nothing listening on it
async fn dead_upstream_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Send a raw HTTP/1.1 request and return the full response as a string
async fn http_request(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let raw = format!(
        "GET {} HTTP/1.1\r\nHost: tweets.test\r\nConnection: close\r\n\r\n",
        path
    );
    http_request(addr, &raw).await
}

#[tokio::test]
async fn profile_paths_redirect_to_root() {
    let root = fixture_root();
    let upstream = spawn_mock_upstream().await;
    let (addr, _shutdown) = spawn_gateway(root.path(), upstream, ProxySettings::default()).await;

    for path in ["/profile/alice", "/profile/alice/tweets/42", "/profile/"] {
        let response = http_get(addr, path).await;
        assert!(
            response.starts_with("HTTP/1.1 301"),
            "expected 301 for {path}, got: {response}"
        );
        assert!(
            response.to_lowercase().contains("location: http://tweets.test/"),
            "missing root Location for {path}: {response}"
        );
    }
}

#[tokio::test]
async fn profile_redirect_ignores_method() {
    let root = fixture_root();
    let upstream = spawn_mock_upstream().await;
    let (addr, _shutdown) = spawn_gateway(root.path(), upstream, ProxySettings::default()).await;

    let raw = "POST /profile/alice HTTP/1.1\r\nHost: tweets.test\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi";
    let response = http_request(addr, raw).await;
    assert!(response.starts_with("HTTP/1.1 301"), "got: {response}");
}

#[tokio::test]
async fn index_html_is_served_from_the_root() {
    let root = fixture_root();
    let upstream = spawn_mock_upstream().await;
    let (addr, _shutdown) = spawn_gateway(root.path(), upstream, ProxySettings::default()).await;

    let response = http_get(addr, "/index.html").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("<html>tweets shell</html>"));
}

#[tokio::test]
async fn root_serves_the_index_file() {
    let root = fixture_root();
    let upstream = spawn_mock_upstream().await;
    let (addr, _shutdown) = spawn_gateway(root.path(), upstream, ProxySettings::default()).await;

    let response = http_get(addr, "/").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("<html>tweets shell</html>"));
}

#[tokio::test]
async fn static_prefix_serves_files_from_the_root() {
    let root = fixture_root();
    let upstream = spawn_mock_upstream().await;
    let (addr, _shutdown) = spawn_gateway(root.path(), upstream, ProxySettings::default()).await;

    let response = http_get(addr, "/static/css/app.css").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("body { margin: 0 }"));
    assert!(response.to_lowercase().contains("content-type: text/css"));
}

#[tokio::test]
async fn static_prefix_has_no_upstream_fallback() {
    let root = fixture_root();
    // the mock upstream would answer 200, so a 404 proves no fallback ran
    let upstream = spawn_mock_upstream().await;
    let (addr, _shutdown) = spawn_gateway(root.path(), upstream, ProxySettings::default()).await;

    let response = http_get(addr, "/static/missing.css").await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
    assert!(response.to_lowercase().contains("x-gateway-error: not_found"));
}

#[tokio::test]
async fn api_prefix_serves_existing_static_files_first() {
    let root = fixture_root();
    let upstream = spawn_mock_upstream().await;
    let (addr, _shutdown) = spawn_gateway(root.path(), upstream, ProxySettings::default()).await;

    let response = http_get(addr, "/api/docs.html").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("<html>api docs</html>"));
}

#[tokio::test]
async fn api_requests_are_forwarded_with_forwarding_headers() {
    let root = fixture_root();
    let upstream = spawn_mock_upstream().await;
    let (addr, _shutdown) = spawn_gateway(root.path(), upstream, ProxySettings::default()).await;

    let raw = "POST /api/tweets?page=2 HTTP/1.1\r\nHost: tweets.test\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";
    let response = http_request(addr, raw).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");

    // the mock echoes the raw request it received
    let echoed = response.to_lowercase();
    assert!(echoed.contains("post /api/tweets?page=2"), "echo: {echoed}");
    assert!(echoed.contains("host: tweets.test"), "echo: {echoed}");
    assert!(echoed.contains("x-forwarded-for: 127.0.0.1"), "echo: {echoed}");
    assert!(echoed.contains("x-forwarded-proto: http"), "echo: {echoed}");
    assert!(echoed.contains("x-request-id:"), "echo: {echoed}");
    assert!(echoed.ends_with("hello"), "echo: {echoed}");
}

#[tokio::test]
async fn unreachable_upstream_is_a_gateway_error() {
    let root = fixture_root();
    let upstream = dead_upstream_addr().await;
    let (addr, _shutdown) = spawn_gateway(root.path(), upstream, ProxySettings::default()).await;

    let response = http_get(addr, "/api/tweets").await;
    assert!(response.starts_with("HTTP/1.1 502"), "got: {response}");
    assert!(
        response
            .to_lowercase()
            .contains("x-gateway-error: upstream_unreachable"),
        "got: {response}"
    );
}

#[tokio::test]
async fn oversized_declared_body_is_rejected() {
    let root = fixture_root();
    let upstream = spawn_mock_upstream().await;
    let settings = ProxySettings {
        max_body_bytes: 16,
        ..ProxySettings::default()
    };
    let (addr, _shutdown) = spawn_gateway(root.path(), upstream, settings).await;

    let body = "a".repeat(100);
    let raw = format!(
        "POST /api/tweets HTTP/1.1\r\nHost: tweets.test\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let response = http_request(addr, &raw).await;
    assert!(response.starts_with("HTTP/1.1 413"), "got: {response}");
    assert!(
        response
            .to_lowercase()
            .contains("x-gateway-error: payload_too_large"),
        "got: {response}"
    );
}

#[tokio::test]
async fn shutdown_stops_accepting_connections() {
    let root = fixture_root();
    let upstream = spawn_mock_upstream().await;
    let (addr, shutdown) = spawn_gateway(root.path(), upstream, ProxySettings::default()).await;

    // gateway answers before shutdown
    let response = http_get(addr, "/index.html").await;
    assert!(response.starts_with("HTTP/1.1 200"));

    shutdown.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // after shutdown the listener is gone; a new connection must fail
    assert!(TcpStream::connect(addr).await.is_err());
}
