//! Forwarded-header construction.
//!
//! A pure function of the client headers, the client address, the listener
//! scheme, and the defaults block, so it can run before or after target
//! selection without changing the result. Hop-by-hop headers are
//! deliberately passed through untouched; stripping them would change the
//! wire contract existing deployments rely on.

use std::net::IpAddr;

use http::header::{HeaderMap, HeaderValue, HOST};

use crate::config::HeaderDefaults;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Build the header map for the forwarded request.
///
/// With `x_forwarded` set, the client address is appended to any existing
/// `X-Forwarded-For` chain (preserved verbatim, `", "` separator), the
/// original `Host` value is mirrored into `X-Forwarded-Host`, and
/// `X-Forwarded-Proto` reflects the listener scheme. Without it, the three
/// headers are neither injected nor removed.
///
/// With `pass_host` unset, `Host` is removed so the transport can set the
/// upstream's canonical host; otherwise the client value rides along.
pub fn forwarded_headers(
    original: &HeaderMap,
    client_ip: IpAddr,
    is_tls: bool,
    policy: &HeaderDefaults,
) -> HeaderMap {
    let mut headers = original.clone();

    if policy.x_forwarded {
        let chain = match original.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) => format!("{existing}, {client_ip}"),
            None => client_ip.to_string(),
        };
        if let Ok(value) = HeaderValue::from_str(&chain) {
            headers.insert(X_FORWARDED_FOR, value);
        }

        if let Some(host) = original.get(HOST) {
            headers.insert(X_FORWARDED_HOST, host.clone());
        }

        let proto = if is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    }

    if !policy.pass_host {
        headers.remove(HOST);
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_ip() -> IpAddr {
        "10.0.0.9".parse().unwrap()
    }

    fn base_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "api.example.com:8080".parse().unwrap());
        headers.insert("accept", "application/json".parse().unwrap());
        headers
    }

    #[test]
    fn disabled_policy_only_drops_host() {
        let policy = HeaderDefaults::default();
        let out = forwarded_headers(&base_headers(), client_ip(), false, &policy);

        assert!(out.get(HOST).is_none());
        assert!(out.get(X_FORWARDED_FOR).is_none());
        assert!(out.get(X_FORWARDED_PROTO).is_none());
        assert_eq!(out.get("accept").unwrap(), "application/json");
    }

    #[test]
    fn x_forwarded_injects_the_triplet() {
        let policy = HeaderDefaults {
            x_forwarded: true,
            pass_host: true,
        };
        let out = forwarded_headers(&base_headers(), client_ip(), false, &policy);

        assert_eq!(out.get(X_FORWARDED_FOR).unwrap(), "10.0.0.9");
        // X-Forwarded-Host carries the Host value verbatim, port included.
        assert_eq!(out.get(X_FORWARDED_HOST).unwrap(), "api.example.com:8080");
        assert_eq!(out.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(out.get(HOST).unwrap(), "api.example.com:8080");
    }

    #[test]
    fn existing_chain_is_preserved_and_appended() {
        let policy = HeaderDefaults {
            x_forwarded: true,
            pass_host: false,
        };
        let mut headers = base_headers();
        headers.insert(X_FORWARDED_FOR, "1.2.3.4, 5.6.7.8".parse().unwrap());

        let out = forwarded_headers(&headers, client_ip(), false, &policy);
        assert_eq!(
            out.get(X_FORWARDED_FOR).unwrap(),
            "1.2.3.4, 5.6.7.8, 10.0.0.9"
        );
    }

    #[test]
    fn proto_reflects_the_listener() {
        let policy = HeaderDefaults {
            x_forwarded: true,
            pass_host: false,
        };
        let out = forwarded_headers(&base_headers(), client_ip(), true, &policy);
        assert_eq!(out.get(X_FORWARDED_PROTO).unwrap(), "https");
    }

    #[test]
    fn pass_host_keeps_the_client_value() {
        let policy = HeaderDefaults {
            x_forwarded: false,
            pass_host: true,
        };
        let out = forwarded_headers(&base_headers(), client_ip(), false, &policy);
        assert_eq!(out.get(HOST).unwrap(), "api.example.com:8080");
    }

    #[test]
    fn preexisting_forwarded_headers_pass_through_when_disabled() {
        let policy = HeaderDefaults::default();
        let mut headers = base_headers();
        headers.insert(X_FORWARDED_FOR, "1.2.3.4".parse().unwrap());
        headers.insert(X_FORWARDED_PROTO, "https".parse().unwrap());

        let out = forwarded_headers(&headers, client_ip(), false, &policy);
        assert_eq!(out.get(X_FORWARDED_FOR).unwrap(), "1.2.3.4");
        assert_eq!(out.get(X_FORWARDED_PROTO).unwrap(), "https");
    }

    #[test]
    fn hop_by_hop_headers_are_not_stripped() {
        let policy = HeaderDefaults::default();
        let mut headers = base_headers();
        headers.insert("te", "trailers".parse().unwrap());
        headers.insert("upgrade", "h2c".parse().unwrap());

        let out = forwarded_headers(&headers, client_ip(), false, &policy);
        assert_eq!(out.get("te").unwrap(), "trailers");
        assert_eq!(out.get("upgrade").unwrap(), "h2c");
    }

    #[test]
    fn policy_is_a_pure_function() {
        let policy = HeaderDefaults {
            x_forwarded: true,
            pass_host: true,
        };
        let first = forwarded_headers(&base_headers(), client_ip(), true, &policy);
        let second = forwarded_headers(&base_headers(), client_ip(), true, &policy);
        assert_eq!(first, second);
    }
}
