//! Portico - Configuration-Driven Reverse Proxy
//!
//! Portico is an HTTP/HTTPS edge gateway driven entirely by one JSON
//! document: each listening port maps virtual hosts and paths to an
//! upstream (with round-robin balancing), an HTTP redirect, or a path
//! rewrite. There is no plugin surface; the configuration is the program.
//!
//! ## Features
//!
//! - **Declarative routing**: `port → host → path` rules with exact-over-
//!   wildcard precedence, resolved in constant time per request
//! - **Round-robin balancing**: per-route cursors over ordered target lists
//! - **Redirects & rewrites**: `Location` answers with prefix stripping,
//!   and path rewrites re-dispatched without touching the network
//! - **TLS termination**: per-port PEM material via rustls
//! - **Keep-alive pooling**: bounded per-upstream connection reuse
//! - **Validation**: structural, semantic, and shadowing diagnostics with
//!   dotted paths into the offending config node
//!
//! ## Usage
//!
//! ```rust,no_run
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = portico::load(r#"{"8080": "http://127.0.0.1:3000"}"#)?;
//!     let listeners = portico::start(config).await;
//!
//!     tokio::signal::ctrl_c().await?;
//!     portico::stop(listeners).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Portico is a library first; the bundled binary is a thin harness around
//! the three operations above:
//!
//! - `config` - raw JSON to normalized routing table, TLS map, defaults
//! - `validator` - diagnostics over the raw document
//! - `router` - `(port, host, path)` lookup with wildcard fallback
//! - `dispatch` - the per-request proxy / redirect / rewrite machine
//! - `balancer` - round-robin cursor state
//! - `headers` - `X-Forwarded-*` and `Host` policy
//! - `pool` / `upstream` - pooled keep-alive connections to origins
//! - `server` / `tls` - per-port listeners, plain or TLS-terminating

// Configuration surface
pub mod config;
pub mod rules;
pub mod validator;

// Request path
pub mod balancer;
pub mod dispatch;
pub mod headers;
pub mod router;

// Upstream connections
pub mod pool;
pub mod upstream;

// Listener fabric
pub mod server;
pub mod tls;

pub mod error;

// Re-export the exit surface and commonly used types.

/// Core operations
pub use config::{load, load_file};
pub use server::{start, start_on, stop, Listeners};

/// Configuration types
pub use config::{Defaults, HeaderDefaults, ProxyConfig, TlsMaterial};

/// Rules and routing
pub use router::{Resolved, RoutingTable, WILDCARD};
pub use rules::{Origin, ProxyRule, RedirectRule, RewriteRule, Rule};

/// Validation
pub use validator::{validate, validate_str, Code, Diagnostic, ValidationReport};

/// Dispatch and balancing
pub use balancer::{RoundRobin, RouteKey};
pub use dispatch::Gateway;
pub use pool::{PoolStats, UpstreamPool};

/// Errors
pub use error::{ConfigError, TlsError, UpstreamError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "portico");
    }
}
