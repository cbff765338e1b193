//! Error types shared across the gateway.

use thiserror::Error;

use crate::validator::ValidationReport;

/// Errors raised while loading or validating a configuration document.
///
/// Configuration errors are fatal to startup; the embedded
/// [`ValidationReport`] carries the full diagnostic listing for display.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Configuration file could not be found.
    #[error("configuration file not found: {path}")]
    NotFound { path: String },

    /// Configuration file could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Document is not valid JSON.
    #[error("configuration is not valid JSON: {message}")]
    Json { message: String },

    /// Document parsed but failed validation.
    #[error("{}", .report.render())]
    Invalid { report: ValidationReport },
}

/// Errors raised while loading TLS listener material.
///
/// These are bounded to a single port: the listener fabric logs them and
/// skips the port rather than aborting the process.
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("failed to read {kind} from {path}: {source}")]
    Read {
        kind: &'static str,
        path: String,
        source: std::io::Error,
    },

    #[error("no certificates found in {path}")]
    EmptyChain { path: String },

    #[error("no private key found in {path}")]
    NoKey { path: String },

    #[error("TLS configuration rejected: {0}")]
    Config(String),
}

/// Errors raised while establishing or using an upstream connection.
///
/// All of these surface to the client as `502 Bad Gateway` when they occur
/// before any response byte has been forwarded.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("failed to connect to {authority}: {source}")]
    Connect {
        authority: String,
        source: std::io::Error,
    },

    #[error("invalid upstream server name: {host}")]
    ServerName { host: String },

    #[error("TLS handshake with {authority} failed: {message}")]
    Handshake { authority: String, message: String },

    #[error("HTTP handshake with {authority} failed: {source}")]
    HttpHandshake {
        authority: String,
        source: hyper::Error,
    },

    #[error("request to {authority} failed: {source}")]
    Request {
        authority: String,
        source: hyper::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_names_the_path() {
        let err = ConfigError::NotFound {
            path: "/etc/portico.json".to_string(),
        };
        assert!(err.to_string().contains("/etc/portico.json"));
    }

    #[test]
    fn tls_error_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = TlsError::Read {
            kind: "certificate",
            path: "cert.pem".into(),
            source: io,
        };
        let text = err.to_string();
        assert!(text.contains("certificate"));
        assert!(text.contains("cert.pem"));
    }
}
