//! Establishing upstream HTTP/1.1 connections.
//!
//! One function of the target origin: dial TCP, run the rustls handshake
//! when the origin scheme is `https`, then hand the stream to hyper's
//! client connection. The connection driver is spawned here and owns the
//! pool's socket permit, so the per-upstream concurrency bound is released
//! exactly when the socket closes.

use std::sync::{Arc, OnceLock};

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::UpstreamError;
use crate::rules::{Origin, Scheme};

/// Body type flowing upstream: the client request body, boxed.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Dial an origin and complete the HTTP/1.1 client handshake. Returns the
/// send handle; the connection driver task keeps `permit` alive until the
/// socket is done.
pub(crate) async fn connect(
    origin: &Origin,
    permit: OwnedSemaphorePermit,
) -> Result<SendRequest<ProxyBody>, UpstreamError> {
    let authority = origin.authority();

    let stream = TcpStream::connect(&authority)
        .await
        .map_err(|source| UpstreamError::Connect {
            authority: authority.clone(),
            source,
        })?;

    match origin.scheme {
        Scheme::Http => handshake(TokioIo::new(stream), authority, permit).await,
        Scheme::Https => {
            let connector = TlsConnector::from(client_tls_config());
            let server_name = ServerName::try_from(origin.host.clone()).map_err(|_| {
                UpstreamError::ServerName {
                    host: origin.host.clone(),
                }
            })?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| UpstreamError::Handshake {
                    authority: authority.clone(),
                    message: e.to_string(),
                })?;
            handshake(TokioIo::new(tls_stream), authority, permit).await
        }
    }
}

async fn handshake<T>(
    io: T,
    authority: String,
    permit: OwnedSemaphorePermit,
) -> Result<SendRequest<ProxyBody>, UpstreamError>
where
    T: hyper::rt::Read + hyper::rt::Write + Send + Unpin + 'static,
{
    let (sender, conn) = http1::handshake(io)
        .await
        .map_err(|source| UpstreamError::HttpHandshake {
            authority: authority.clone(),
            source,
        })?;

    tokio::spawn(async move {
        let _socket_permit = permit;
        if let Err(e) = conn.await {
            debug!(upstream = %authority, error = %e, "upstream connection ended");
        }
    });

    Ok(sender)
}

/// Shared client TLS configuration: webpki roots, no client auth, HTTP/1.1
/// only. Built once for the process.
fn client_tls_config() -> Arc<rustls::ClientConfig> {
    static CONFIG: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

            let mut config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            config.alpn_protocols = vec![b"http/1.1".to_vec()];
            Arc::new(config)
        })
        .clone()
}
