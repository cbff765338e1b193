//! TLS listener material.
//!
//! Loads PEM-encoded certificate chains and private keys referenced by a
//! port's `tls` block and builds the acceptor for that listener. Material
//! is read once at listener creation; rotation means rebuilding the
//! affected listeners. One certificate per port; SNI-based selection is a
//! known limitation.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::config::TlsMaterial;
use crate::error::TlsError;

/// Build the acceptor for one TLS-terminating listener. The optional CA
/// bundle is appended to the served chain.
pub fn build_acceptor(material: &TlsMaterial) -> Result<TlsAcceptor, TlsError> {
    let mut chain = read_cert_chain(&material.cert)?;
    if let Some(ca) = &material.ca {
        chain.extend(read_cert_chain(ca)?);
    }
    let key = read_private_key(&material.key)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| TlsError::Config(e.to_string()))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Read {
        kind: "certificates",
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Read {
            kind: "certificates",
            path: path.display().to_string(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsError::EmptyChain {
            path: path.display().to_string(),
        });
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|source| TlsError::Read {
        kind: "private key",
        path: path.display().to_string(),
        source,
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Read {
            kind: "private key",
            path: path.display().to_string(),
            source,
        })?
        .ok_or_else(|| TlsError::NoKey {
            path: path.display().to_string(),
        })
}
