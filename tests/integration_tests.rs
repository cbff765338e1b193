//! End-to-end tests: real listeners, real localhost backends, real sockets.
//!
//! Each test loads a configuration against ports picked at runtime, brings
//! the listener fabric up on loopback, and drives it with a raw hyper
//! client so the exact wire behavior (headers, bodies, statuses) is
//! observable.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};

use portico::{load, start_on, stop, Listeners};

/// One request as observed by a test backend.
#[derive(Debug, Clone)]
struct Seen {
    method: String,
    uri: String,
    headers: HeaderMap,
    body: Bytes,
}

type Journal = Arc<Mutex<Vec<Seen>>>;

/// Spawn a recording backend that answers 200 with `tag` as the body.
async fn spawn_backend(tag: &'static str) -> (u16, Journal) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let journal: Journal = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&journal);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let seen = Arc::clone(&seen);
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.unwrap().to_bytes();
                        seen.lock().unwrap().push(Seen {
                            method: parts.method.to_string(),
                            uri: parts.uri.to_string(),
                            headers: parts.headers,
                            body,
                        });
                        Ok::<_, std::convert::Infallible>(Response::new(Full::new(
                            Bytes::from_static(tag.as_bytes()),
                        )))
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (port, journal)
}

/// Reserve a port by binding to zero and letting the listener drop.
async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_proxy(config_json: &str) -> Listeners {
    let config = load(config_json).expect("test config must load");
    start_on(config, "127.0.0.1".parse().unwrap()).await
}

struct ClientResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

/// Drive one request over a fresh client connection to the proxy.
async fn send(
    proxy_port: u16,
    method: &str,
    url: &str,
    host: Option<&str>,
    extra_headers: &[(&str, &str)],
    body: &[u8],
) -> ClientResponse {
    let stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let mut builder = Request::builder().method(method).uri(url);
    if let Some(host) = host {
        builder = builder.header("host", host);
    }
    for (name, value) in extra_headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Full::new(Bytes::copy_from_slice(body))).unwrap();

    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    ClientResponse {
        status: parts.status,
        headers: parts.headers,
        body,
    }
}

fn last_seen(journal: &Journal) -> Seen {
    journal.lock().unwrap().last().cloned().expect("backend saw no request")
}

// Scenario A: a bare-string port proxies any host and any path.
#[tokio::test]
async fn simple_proxy_passes_request_and_response_verbatim() {
    let (backend_port, journal) = spawn_backend("backend-a").await;
    let port = free_port().await;
    let listeners =
        start_proxy(&format!(r#"{{"{port}": "http://127.0.0.1:{backend_port}"}}"#)).await;

    let response = send(port, "GET", "/anything", Some("x.y"), &[], b"").await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, Bytes::from_static(b"backend-a"));

    let seen = last_seen(&journal);
    assert_eq!(seen.method, "GET");
    assert_eq!(seen.uri, "/anything");

    stop(listeners).await;
}

// Scenario B: six sequential requests walk a three-target cycle twice.
#[tokio::test]
async fn round_robin_cycles_targets_in_order() {
    let (pa, _) = spawn_backend("a").await;
    let (pb, _) = spawn_backend("b").await;
    let (pc, _) = spawn_backend("c").await;
    let port = free_port().await;
    let config = format!(
        r#"{{"{port}": {{"*": {{"type": "proxy", "to": [
            "http://127.0.0.1:{pa}", "http://127.0.0.1:{pb}", "http://127.0.0.1:{pc}"
        ]}}}}}}"#
    );
    let listeners = start_proxy(&config).await;

    let mut order = Vec::new();
    for _ in 0..6 {
        let response = send(port, "GET", "/", Some("any"), &[], b"").await;
        order.push(String::from_utf8(response.body.to_vec()).unwrap());
    }
    assert_eq!(order, ["a", "b", "c", "a", "b", "c"]);

    stop(listeners).await;
}

// Scenario C: exact path beats the wildcard.
#[tokio::test]
async fn exact_path_beats_wildcard_path() {
    let (api_port, api_journal) = spawn_backend("api").await;
    let (web_port, web_journal) = spawn_backend("web").await;
    let port = free_port().await;
    let config = format!(
        r#"{{"{port}": {{"/api": "http://127.0.0.1:{api_port}", "*": "http://127.0.0.1:{web_port}"}}}}"#
    );
    let listeners = start_proxy(&config).await;

    let response = send(port, "GET", "/api", Some("h"), &[], b"").await;
    assert_eq!(response.body, Bytes::from_static(b"api"));
    let response = send(port, "GET", "/unrelated", Some("h"), &[], b"").await;
    assert_eq!(response.body, Bytes::from_static(b"web"));

    assert_eq!(last_seen(&api_journal).uri, "/api");
    assert_eq!(last_seen(&web_journal).uri, "/unrelated");

    stop(listeners).await;
}

// Scenario D: redirect with strip_prefix; the upstream is never dialed.
#[tokio::test]
async fn redirect_strips_prefix_and_never_dials_upstream() {
    let port = free_port().await;
    let config = format!(
        r#"{{"{port}": {{"*": {{
            "type": "redirect",
            "to": "https://cdn.example.com",
            "strip_prefix": "/static",
            "status": 301
        }}}}}}"#
    );
    let listeners = start_proxy(&config).await;

    let response = send(port, "GET", "/static/img/logo.png", Some("h"), &[], b"").await;
    assert_eq!(response.status, StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response.headers.get("location").unwrap(),
        "https://cdn.example.com/img/logo.png"
    );
    assert!(response.body.is_empty());

    let stats = listeners.gateway().pool().stats().await;
    assert_eq!(stats.misses, 0, "redirects must not open upstream connections");

    stop(listeners).await;
}

// Scenario E: x_forwarded appends to the chain, pass_host keeps Host.
#[tokio::test]
async fn header_policy_applies_x_forwarded_and_pass_host() {
    let (backend_port, journal) = spawn_backend("be").await;
    let port = free_port().await;
    let config = format!(
        r#"{{
            "__defaults": {{"headers": {{"x_forwarded": true, "pass_host": true}}}},
            "{port}": "http://127.0.0.1:{backend_port}"
        }}"#
    );
    let listeners = start_proxy(&config).await;

    let response = send(
        port,
        "GET",
        "/",
        Some("api.example.com"),
        &[("x-forwarded-for", "1.2.3.4, 5.6.7.8")],
        b"",
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);

    let seen = last_seen(&journal);
    assert_eq!(seen.headers.get("host").unwrap(), "api.example.com");
    assert_eq!(
        seen.headers.get("x-forwarded-for").unwrap(),
        "1.2.3.4, 5.6.7.8, 127.0.0.1"
    );
    assert_eq!(seen.headers.get("x-forwarded-host").unwrap(), "api.example.com");
    assert_eq!(seen.headers.get("x-forwarded-proto").unwrap(), "http");

    stop(listeners).await;
}

// Without pass_host the upstream sees its own canonical host.
#[tokio::test]
async fn default_policy_sets_canonical_upstream_host() {
    let (backend_port, journal) = spawn_backend("be").await;
    let port = free_port().await;
    let listeners =
        start_proxy(&format!(r#"{{"{port}": "http://127.0.0.1:{backend_port}"}}"#)).await;

    send(port, "GET", "/", Some("public.example.com"), &[], b"").await;
    let seen = last_seen(&journal);
    assert_eq!(
        seen.headers.get("host").unwrap(),
        &format!("127.0.0.1:{backend_port}")
    );
    assert!(seen.headers.get("x-forwarded-proto").is_none());

    stop(listeners).await;
}

// Scenario F: nothing listening upstream maps to 502.
#[tokio::test]
async fn unavailable_upstream_is_bad_gateway() {
    let dead_port = free_port().await;
    let port = free_port().await;
    let listeners = start_proxy(&format!(r#"{{"{port}": "http://127.0.0.1:{dead_port}"}}"#)).await;

    let response = send(port, "GET", "/", Some("h"), &[], b"").await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert!(String::from_utf8_lossy(&response.body).contains("Bad Gateway"));

    stop(listeners).await;
}

#[tokio::test]
async fn unmatched_route_is_not_found() {
    let (backend_port, _) = spawn_backend("api").await;
    let port = free_port().await;
    let config = format!(
        r#"{{"{port}": {{"hosts": {{"api.example.com": "http://127.0.0.1:{backend_port}"}}}}}}"#
    );
    let listeners = start_proxy(&config).await;

    let response = send(port, "GET", "/", Some("other.example.com"), &[], b"").await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    assert!(String::from_utf8_lossy(&response.body).contains("Not Found"));

    stop(listeners).await;
}

#[tokio::test]
async fn virtual_hosts_route_by_host_header() {
    let (pa, _) = spawn_backend("alpha").await;
    let (pb, _) = spawn_backend("beta").await;
    let port = free_port().await;
    let config = format!(
        r#"{{"{port}": {{"hosts": {{
            "alpha.example.com": "http://127.0.0.1:{pa}",
            "beta.example.com": "http://127.0.0.1:{pb}"
        }}}}}}"#
    );
    let listeners = start_proxy(&config).await;

    let response = send(port, "GET", "/", Some("ALPHA.example.com"), &[], b"").await;
    assert_eq!(response.body, Bytes::from_static(b"alpha"));
    let response = send(port, "GET", "/", Some("beta.example.com:8080"), &[], b"").await;
    assert_eq!(response.body, Bytes::from_static(b"beta"));

    stop(listeners).await;
}

#[tokio::test]
async fn post_bodies_stream_to_the_upstream() {
    let (backend_port, journal) = spawn_backend("be").await;
    let port = free_port().await;
    let listeners =
        start_proxy(&format!(r#"{{"{port}": "http://127.0.0.1:{backend_port}"}}"#)).await;

    let payload = br#"{"kind":"event","size":3}"#;
    let response = send(
        port,
        "POST",
        "/ingest?source=test",
        Some("h"),
        &[("content-type", "application/json")],
        payload,
    )
    .await;
    assert_eq!(response.status, StatusCode::OK);

    let seen = last_seen(&journal);
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.uri, "/ingest?source=test");
    assert_eq!(seen.body, Bytes::copy_from_slice(payload));

    stop(listeners).await;
}

mod rewrites {
    use super::*;

    // An exact re-match forwards the original client URL upstream.
    #[tokio::test]
    async fn exact_rematch_forwards_original_url() {
        let (exact_port, exact_journal) = spawn_backend("exact").await;
        let (wild_port, _) = spawn_backend("wild").await;
        let port = free_port().await;
        let config = format!(
            r#"{{"{port}": {{
                "/old": {{"type": "rewrite", "to": "/app"}},
                "/app/old": "http://127.0.0.1:{exact_port}",
                "*": "http://127.0.0.1:{wild_port}"
            }}}}"#
        );
        let listeners = start_proxy(&config).await;

        let response = send(port, "GET", "/old", Some("h"), &[], b"").await;
        assert_eq!(response.body, Bytes::from_static(b"exact"));
        assert_eq!(last_seen(&exact_journal).uri, "/old");

        stop(listeners).await;
    }

    // A wildcard re-match also forwards the original URL.
    #[tokio::test]
    async fn wildcard_rematch_forwards_original_url() {
        let (wild_port, journal) = spawn_backend("wild").await;
        let port = free_port().await;
        let config = format!(
            r#"{{"{port}": {{
                "/old": {{"type": "rewrite", "to": "/app"}},
                "*": "http://127.0.0.1:{wild_port}"
            }}}}"#
        );
        let listeners = start_proxy(&config).await;

        let response = send(port, "GET", "/old?v=1", Some("h"), &[], b"").await;
        assert_eq!(response.body, Bytes::from_static(b"wild"));
        assert_eq!(last_seen(&journal).uri, "/old?v=1");

        stop(listeners).await;
    }

    // When re-resolution fails, the host's rules are scanned for a proxy
    // and the rewritten URL goes upstream.
    #[tokio::test]
    async fn fallback_scan_forwards_rewritten_url() {
        let (scan_port, journal) = spawn_backend("scan").await;
        let port = free_port().await;
        let config = format!(
            r#"{{"{port}": {{"hosts": {{"app.example.com": {{
                "/old": {{"type": "rewrite", "to": "/app"}},
                "/api": "http://127.0.0.1:{scan_port}"
            }}}}}}}}"#
        );
        let listeners = start_proxy(&config).await;

        let response = send(port, "GET", "/old", Some("app.example.com"), &[], b"").await;
        assert_eq!(response.body, Bytes::from_static(b"scan"));
        assert_eq!(last_seen(&journal).uri, "/app/old");

        stop(listeners).await;
    }

    // A rewrite landing on another rewrite is not followed; the fallback
    // scan handles it with the once-rewritten URL.
    #[tokio::test]
    async fn rewrite_depth_is_capped_at_one() {
        let (wild_port, journal) = spawn_backend("wild").await;
        let port = free_port().await;
        let config = format!(
            r#"{{"{port}": {{
                "/a": {{"type": "rewrite", "to": "/b"}},
                "/b/a": {{"type": "rewrite", "to": "/c"}},
                "*": "http://127.0.0.1:{wild_port}"
            }}}}"#
        );
        let listeners = start_proxy(&config).await;

        let response = send(port, "GET", "/a", Some("h"), &[], b"").await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(last_seen(&journal).uri, "/b/a");

        stop(listeners).await;
    }

    // No proxy rule anywhere in scope: the rewrite dead-ends in a 404.
    #[tokio::test]
    async fn rewrite_without_any_proxy_is_not_found() {
        let port = free_port().await;
        let config = format!(
            r#"{{"{port}": {{
                "/old": {{"type": "rewrite", "to": "/app"}},
                "/login": {{"type": "redirect", "to": "/signin"}}
            }}}}"#
        );
        let listeners = start_proxy(&config).await;

        let response = send(port, "GET", "/old", Some("h"), &[], b"").await;
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        stop(listeners).await;
    }
}

mod tls_termination {
    use super::*;
    use std::io::Write;
    use tokio_rustls::rustls::pki_types::ServerName;
    use tokio_rustls::rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    async fn send_over_tls(
        proxy_port: u16,
        trust: &rcgen::CertifiedKey,
        url: &str,
        host: &str,
    ) -> ClientResponse {
        let mut roots = RootCertStore::empty();
        roots.add(trust.cert.der().clone()).unwrap();
        let client_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(client_config));

        let stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        let server_name = ServerName::try_from("localhost").unwrap();
        let tls_stream = connector.connect(server_name, stream).await.unwrap();

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
            .await
            .unwrap();
        tokio::spawn(conn);

        let request = Request::builder()
            .method("GET")
            .uri(url)
            .header("host", host)
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = sender.send_request(request).await.unwrap();
        let (parts, body) = response.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        ClientResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        }
    }

    #[tokio::test]
    async fn terminates_tls_and_reports_https_proto() {
        let (backend_port, journal) = spawn_backend("secure").await;
        let port = free_port().await;

        let certified =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_file = write_temp(&certified.cert.pem());
        let key_file = write_temp(&certified.key_pair.serialize_pem());

        let config = format!(
            r#"{{
                "__defaults": {{"headers": {{"x_forwarded": true}}}},
                "{port}": {{
                    "tls": {{"cert": {cert:?}, "key": {key:?}}},
                    "*": "http://127.0.0.1:{backend_port}"
                }}
            }}"#,
            cert = cert_file.path(),
            key = key_file.path(),
        );
        let listeners = start_proxy(&config).await;
        assert_eq!(listeners.bound.len(), 1);
        assert!(listeners.bound[0].tls);

        let response = send_over_tls(port, &certified, "/secure", "app.example.com").await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, Bytes::from_static(b"secure"));

        let seen = last_seen(&journal);
        assert_eq!(seen.headers.get("x-forwarded-proto").unwrap(), "https");

        stop(listeners).await;
    }

    #[tokio::test]
    async fn broken_tls_material_skips_only_that_port() {
        let (backend_port, _) = spawn_backend("plain").await;
        let tls_port = free_port().await;
        let plain_port = free_port().await;

        let config = format!(
            r#"{{
                "{tls_port}": {{
                    "tls": {{"cert": "/missing/cert.pem", "key": "/missing/key.pem"}},
                    "*": "http://127.0.0.1:{backend_port}"
                }},
                "{plain_port}": "http://127.0.0.1:{backend_port}"
            }}"#
        );
        let listeners = start_proxy(&config).await;

        assert_eq!(listeners.bound.len(), 1);
        assert_eq!(listeners.bound[0].port, plain_port);
        assert_eq!(listeners.skipped.len(), 1);
        assert_eq!(listeners.skipped[0].port, tls_port);

        let response = send(plain_port, "GET", "/", Some("h"), &[], b"").await;
        assert_eq!(response.status, StatusCode::OK);

        stop(listeners).await;
    }
}

#[tokio::test]
async fn bind_conflict_skips_only_that_port() {
    let (backend_port, _) = spawn_backend("be").await;
    // Occupy a port so the proxy cannot have it.
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken_port = occupied.local_addr().unwrap().port();
    let open_port = free_port().await;

    let config = format!(
        r#"{{
            "{taken_port}": "http://127.0.0.1:{backend_port}",
            "{open_port}": "http://127.0.0.1:{backend_port}"
        }}"#
    );
    let listeners = start_proxy(&config).await;

    assert_eq!(listeners.bound.len(), 1);
    assert_eq!(listeners.bound[0].port, open_port);
    assert_eq!(listeners.skipped.len(), 1);
    assert_eq!(listeners.skipped[0].port, taken_port);

    let response = send(open_port, "GET", "/", Some("h"), &[], b"").await;
    assert_eq!(response.status, StatusCode::OK);

    stop(listeners).await;
}

#[tokio::test]
async fn stop_drains_and_releases_the_port() {
    let (backend_port, _) = spawn_backend("be").await;
    let port = free_port().await;
    let listeners =
        start_proxy(&format!(r#"{{"{port}": "http://127.0.0.1:{backend_port}"}}"#)).await;

    let response = send(port, "GET", "/", Some("h"), &[], b"").await;
    assert_eq!(response.status, StatusCode::OK);

    stop(listeners).await;

    // The port is free again once stop returns.
    assert!(TcpListener::bind(("127.0.0.1", port)).await.is_ok());
}
