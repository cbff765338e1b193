//! Per-request dispatch over the three rule variants.
//!
//! Every accepted request flows through [`Gateway::dispatch`]: derive the
//! host key from the `Host` header, resolve against the routing table, then
//! either stream to an upstream (proxy), answer with a `Location` header
//! (redirect), or re-dispatch under a prefixed path (rewrite). Exactly one
//! response leaves this module per request; upstream failures before any
//! response byte map to `502`, an unmatched route to `404`.

use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, HOST, LOCATION};
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use tracing::{debug, warn};

use crate::balancer::{RoundRobin, RouteKey};
use crate::config::Defaults;
use crate::headers::forwarded_headers;
use crate::pool::UpstreamPool;
use crate::router::{RoutingTable, WILDCARD};
use crate::rules::{Origin, RedirectRule, Rule};
use crate::upstream::ProxyBody;

/// Immutable dispatch state shared by every listener: the routing table,
/// the defaults block, the round-robin cursors, and the upstream pool.
pub struct Gateway {
    table: RoutingTable,
    defaults: Defaults,
    balancer: RoundRobin,
    pool: Arc<UpstreamPool>,
}

impl Gateway {
    pub fn new(table: RoutingTable, defaults: Defaults) -> Self {
        Self {
            table,
            defaults,
            balancer: RoundRobin::new(),
            pool: Arc::new(UpstreamPool::new()),
        }
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Run one request through the rule state machine.
    pub async fn dispatch(
        &self,
        port: u16,
        is_tls: bool,
        client_ip: IpAddr,
        req: Request<Incoming>,
    ) -> Response<ProxyBody> {
        let url = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        let path = req.uri().path().to_string();
        let host = host_key(req.headers());

        let Some(hit) = self.table.resolve(port, &host, &path) else {
            debug!(port, %host, %path, "no route matched");
            return text_response(StatusCode::NOT_FOUND, "Not Found");
        };

        match hit.rule {
            Rule::Proxy(proxy) => {
                let key = RouteKey::new(port, hit.host_key, hit.path_key);
                let target = self.balancer.next(&proxy.targets, &key).clone();
                self.forward(req, &target, &url, client_ip, is_tls).await
            }

            Rule::Redirect(redirect) => redirect_response(redirect, &url),

            Rule::Rewrite(rewrite) => {
                let rewritten_url = format!("{}{}", rewrite.to, url);
                let rewritten_path = format!("{}{}", rewrite.to, path);

                if let Some(second) = self.table.resolve(port, &host, &rewritten_path) {
                    if let Rule::Proxy(proxy) = second.rule {
                        // Re-resolved (exactly or via the path wildcard):
                        // the upstream sees the original client URL.
                        let key = RouteKey::new(port, second.host_key, second.path_key);
                        let target = self.balancer.next(&proxy.targets, &key).clone();
                        return self.forward(req, &target, &url, client_ip, is_tls).await;
                    }
                    // A redirect or a second rewrite is not followed;
                    // fall through to the scan below.
                }

                match self.table.any_proxy(port, &host) {
                    Some(proxy) => {
                        // Fallback scan: first target, and the upstream
                        // sees the rewritten URL.
                        let target = proxy.targets[0].clone();
                        self.forward(req, &target, &rewritten_url, client_ip, is_tls)
                            .await
                    }
                    None => {
                        debug!(port, %host, rewritten = %rewritten_path, "rewrite found no proxy rule");
                        text_response(StatusCode::NOT_FOUND, "Not Found")
                    }
                }
            }
        }
    }

    /// Build and send the upstream request, streaming both bodies.
    async fn forward(
        &self,
        req: Request<Incoming>,
        target: &Origin,
        upstream_url: &str,
        client_ip: IpAddr,
        is_tls: bool,
    ) -> Response<ProxyBody> {
        let (parts, body) = req.into_parts();

        let mut headers = forwarded_headers(&parts.headers, client_ip, is_tls, &self.defaults.headers);
        if !self.defaults.headers.pass_host {
            // HTTP/1.1 requires Host on the wire; with pass_host off the
            // upstream's canonical name goes there.
            if let Ok(value) = HeaderValue::from_str(&target.host_header()) {
                headers.insert(HOST, value);
            }
        }

        let uri: Uri = match upstream_url.parse() {
            Ok(uri) => uri,
            Err(e) => {
                warn!(url = %upstream_url, error = %e, "forwarded URL failed to parse");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        };

        let mut upstream_req = match Request::builder()
            .method(parts.method)
            .uri(uri)
            .body(body.boxed())
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to build upstream request");
                return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
            }
        };
        *upstream_req.headers_mut() = headers;

        match self.pool.request(target, upstream_req).await {
            Ok(response) => {
                // Status, headers, and body stream back verbatim. Errors
                // after this point abort the client stream mid-flight; no
                // status rewrite is possible once bytes have moved.
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                warn!(upstream = %target, error = %e, "upstream request failed");
                text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
            }
        }
    }
}

/// Host key for routing: the `Host` header lowercased with any port
/// stripped, or the wildcard when the header is absent or unreadable.
fn host_key(headers: &HeaderMap) -> String {
    let Some(value) = headers.get(HOST).and_then(|v| v.to_str().ok()) else {
        return WILDCARD.to_string();
    };
    let value = value.trim();

    // Bracketed IPv6 literals carry their colons inside the brackets.
    let host = if let Some(rest) = value.strip_prefix('[') {
        match rest.split_once(']') {
            Some((inside, _)) => format!("[{inside}]"),
            None => value.to_string(),
        }
    } else {
        value.split(':').next().unwrap_or(value).to_string()
    };

    if host.is_empty() {
        WILDCARD.to_string()
    } else {
        host.to_ascii_lowercase()
    }
}

fn redirect_response(rule: &RedirectRule, url: &str) -> Response<ProxyBody> {
    let location = match &rule.strip_prefix {
        Some(prefix) if url.starts_with(prefix.as_str()) => {
            format!("{}{}", rule.to, &url[prefix.len()..])
        }
        _ => rule.to.clone(),
    };

    let status = StatusCode::from_u16(rule.status).unwrap_or(StatusCode::FOUND);
    match Response::builder()
        .status(status)
        .header(LOCATION, location.as_str())
        .body(empty_body())
    {
        Ok(response) => response,
        Err(e) => {
            warn!(location = %location, error = %e, "failed to build redirect response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn text_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(
            Full::new(Bytes::from(message.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .unwrap_or_else(|_| Response::new(empty_body()))
}
