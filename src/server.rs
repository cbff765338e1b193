//! The listener fabric.
//!
//! One accept loop per configured port, plain or TLS-terminating per the
//! material map. Failures are bounded to their port: TLS material that
//! fails to load or an address that fails to bind skips that port with an
//! error logged, and the rest come up. [`stop`] cancels the accept loops
//! and drains in-flight requests before returning.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::dispatch::Gateway;
use crate::tls;

/// One successfully bound listener.
#[derive(Debug, Clone)]
pub struct BoundPort {
    pub port: u16,
    pub tls: bool,
    pub addr: SocketAddr,
}

/// A configured port that did not come up, with the reason.
#[derive(Debug, Clone)]
pub struct SkippedPort {
    pub port: u16,
    pub reason: String,
}

/// Handle over the running listener set, returned by [`start`] and
/// consumed by [`stop`].
pub struct Listeners {
    pub bound: Vec<BoundPort>,
    pub skipped: Vec<SkippedPort>,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    sweeper: JoinHandle<()>,
}

impl Listeners {
    /// True when no configured port came up.
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    /// The shared dispatch state, for pool statistics and diagnostics.
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Local address of one bound port, if it came up.
    pub fn local_addr(&self, port: u16) -> Option<SocketAddr> {
        self.bound.iter().find(|b| b.port == port).map(|b| b.addr)
    }
}

/// Bring up every configured port on all interfaces.
pub async fn start(config: ProxyConfig) -> Listeners {
    start_on(config, IpAddr::V4(Ipv4Addr::UNSPECIFIED)).await
}

/// Bring up every configured port on one interface. Ports whose TLS
/// material fails to load or whose address fails to bind are skipped; the
/// remaining ports still come up.
pub async fn start_on(config: ProxyConfig, bind_addr: IpAddr) -> Listeners {
    let ProxyConfig {
        table,
        tls: tls_map,
        defaults,
    } = config;

    let ports = table.ports();
    let gateway = Arc::new(Gateway::new(table, defaults));
    let sweeper = gateway.pool().start_sweeper();
    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    let mut bound = Vec::new();
    let mut skipped = Vec::new();

    for port in ports {
        let acceptor = match tls_map.get(&port) {
            Some(material) => match tls::build_acceptor(material) {
                Ok(acceptor) => Some(acceptor),
                Err(e) => {
                    error!(port, error = %e, "skipping port: TLS material failed to load");
                    skipped.push(SkippedPort {
                        port,
                        reason: e.to_string(),
                    });
                    continue;
                }
            },
            None => None,
        };

        let listener = match TcpListener::bind(SocketAddr::new(bind_addr, port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(port, error = %e, "skipping port: bind failed");
                skipped.push(SkippedPort {
                    port,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let addr = listener
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(bind_addr, port));
        info!(port, tls = acceptor.is_some(), address = %addr, "listener up");
        bound.push(BoundPort {
            port,
            tls: acceptor.is_some(),
            addr,
        });

        tracker.spawn(accept_loop(
            listener,
            acceptor,
            port,
            Arc::clone(&gateway),
            cancel.clone(),
            tracker.clone(),
        ));
    }

    Listeners {
        bound,
        skipped,
        gateway,
        cancel,
        tracker,
        sweeper,
    }
}

/// Cancel the accept loops, drain in-flight requests, and tear down the
/// pool sweeper.
pub async fn stop(listeners: Listeners) {
    info!("shutting down listeners");
    listeners.cancel.cancel();
    listeners.tracker.close();
    listeners.tracker.wait().await;
    listeners.sweeper.abort();
    info!("all listeners drained");
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    port: u16,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(port, error = %e, "accept failed");
                        continue;
                    }
                };
                tracker.spawn(serve_connection(
                    stream,
                    peer,
                    acceptor.clone(),
                    port,
                    Arc::clone(&gateway),
                    cancel.clone(),
                ));
            }
        }
    }
    debug!(port, "accept loop stopped");
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    port: u16,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
) {
    match acceptor {
        Some(acceptor) => {
            // The handshake itself must not outlive shutdown; a client
            // that connects and goes silent would otherwise stall drain.
            let handshake = tokio::select! {
                result = acceptor.accept(stream) => result,
                _ = cancel.cancelled() => return,
            };
            match handshake {
                Ok(tls_stream) => {
                    drive(TokioIo::new(tls_stream), peer, port, true, gateway, cancel).await
                }
                Err(e) => debug!(port, client = %peer, error = %e, "TLS handshake failed"),
            }
        }
        None => drive(TokioIo::new(stream), peer, port, false, gateway, cancel).await,
    }
}

async fn drive<I>(
    io: I,
    peer: SocketAddr,
    port: u16,
    is_tls: bool,
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
) where
    I: hyper::rt::Read + hyper::rt::Write + Send + Unpin + 'static,
{
    let service = service_fn(move |req| {
        let gateway = Arc::clone(&gateway);
        async move {
            Ok::<_, std::convert::Infallible>(
                gateway.dispatch(port, is_tls, peer.ip(), req).await,
            )
        }
    });

    let conn = http1::Builder::new().serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            if let Err(e) = result {
                // Clients hanging up mid-connection are routine.
                let text = e.to_string();
                if !text.contains("connection closed")
                    && !text.contains("broken pipe")
                    && !text.contains("reset by peer")
                {
                    debug!(port, client = %peer, error = %e, "connection error");
                }
            }
        }
        _ = cancel.cancelled() => {
            // Finish the in-flight request, then close.
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                debug!(port, client = %peer, error = %e, "connection ended during drain");
            }
        }
    }
}
