//! The routing rule model.
//!
//! The configuration document is polymorphic: the same slot accepts a bare
//! URL string, a list of URLs, or a tagged rule object. The loader collapses
//! all of that into the closed [`Rule`] union defined here, so the dispatcher
//! never sees a raw shape. A single-origin proxy rule is still a
//! [`ProxyRule`] with a one-element target list.

use std::fmt;

use http::Uri;

/// Redirect status used when the source document does not specify one.
pub const DEFAULT_REDIRECT_STATUS: u16 = 302;

/// Redirect statuses considered semantically valid (307/308 preserve the
/// request method). Other 3xx values are accepted with a warning.
pub const VALID_REDIRECT_STATUSES: [u16; 4] = [301, 302, 307, 308];

/// Upstream URL scheme. Dictates both the dial (plain TCP vs TLS) and the
/// default port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Why an origin URL was rejected. The validator maps these onto its
/// diagnostic codes; the loader just drops the rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginError {
    /// The string does not parse as a URL at all.
    Unparseable,
    /// Scheme is missing or is neither `http` nor `https`.
    UnsupportedScheme(String),
    /// URL parsed but carries no hostname.
    MissingHost,
}

impl fmt::Display for OriginError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OriginError::Unparseable => write!(f, "not a well-formed URL"),
            OriginError::UnsupportedScheme(s) if s.is_empty() => {
                write!(f, "missing scheme (expected http or https)")
            }
            OriginError::UnsupportedScheme(s) => {
                write!(f, "unsupported scheme {s:?} (expected http or https)")
            }
            OriginError::MissingHost => write!(f, "URL has no hostname"),
        }
    }
}

/// One parsed upstream origin: scheme, hostname, and resolved port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Origin {
    /// Parse an origin URL (`http://host[:port]` or `https://host[:port]`).
    /// Any path component is ignored; targets address an origin, not a
    /// sub-path.
    pub fn parse(raw: &str) -> Result<Self, OriginError> {
        let uri: Uri = raw.trim().parse().map_err(|_| OriginError::Unparseable)?;

        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            other => {
                return Err(OriginError::UnsupportedScheme(
                    other.unwrap_or_default().to_string(),
                ))
            }
        };

        let host = uri.host().ok_or(OriginError::MissingHost)?;
        if host.is_empty() {
            return Err(OriginError::MissingHost);
        }

        Ok(Origin {
            scheme,
            host: host.to_ascii_lowercase(),
            port: uri.port_u16().unwrap_or(scheme.default_port()),
        })
    }

    /// `host:port` form used for dialing and as the pool key.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for the upstream `Host` header: the port is omitted when it is
    /// the scheme default, matching what a browser would send.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// Forward to an upstream, cycling through `targets` in order.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyRule {
    /// Non-empty; order defines the round-robin cycle.
    pub targets: Vec<Origin>,
    /// Accepted and preserved from the source document; not acted on.
    pub health_check: Option<serde_json::Value>,
}

/// Answer with an HTTP redirect; the upstream is never contacted.
#[derive(Debug, Clone, PartialEq)]
pub struct RedirectRule {
    /// Absolute URL or path the client is sent to.
    pub to: String,
    /// When set and the request URL starts with this prefix, the remainder
    /// is appended to `to`.
    pub strip_prefix: Option<String>,
    /// Preserved as authored; defaults to 302.
    pub status: u16,
}

/// Prepend a path fragment and re-dispatch against the routing table.
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteRule {
    /// Path fragment beginning with `/`.
    pub to: String,
}

/// The closed rule union. Tagged in source by the `type` field
/// (`proxy` | `redirect` | `rewrite`); absent means `proxy`.
#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Proxy(ProxyRule),
    Redirect(RedirectRule),
    Rewrite(RewriteRule),
}

impl Rule {
    /// Single-target proxy rule, the normalized form of a bare URL string.
    pub fn single_proxy(origin: Origin) -> Self {
        Rule::Proxy(ProxyRule {
            targets: vec![origin],
            health_check: None,
        })
    }

    pub fn as_proxy(&self) -> Option<&ProxyRule> {
        match self {
            Rule::Proxy(p) => Some(p),
            _ => None,
        }
    }
}
