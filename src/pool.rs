//! Keep-alive pooling of upstream connections.
//!
//! One pool per `(scheme, host, port)` origin. Reusing a live HTTP/1.1
//! connection skips the TCP (and TLS) handshake on the hot path; idle
//! retention is bounded and stale handles are discarded, never reused.
//!
//! Limits: at most 100 concurrent sockets per origin (enforced with a
//! semaphore whose permits live as long as the connection driver), at most
//! 10 parked idle handles, 60 second idle timeout. A background sweep
//! evicts expired handles between requests.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::UpstreamError;
use crate::rules::Origin;
use crate::upstream::{self, ProxyBody};

/// Concurrent socket cap per upstream origin.
pub const MAX_SOCKETS_PER_UPSTREAM: usize = 100;
/// Idle handles retained per upstream origin.
pub const MAX_IDLE_PER_UPSTREAM: usize = 10;
/// Idle handles older than this are discarded on checkout or sweep.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct IdleSender {
    sender: SendRequest<ProxyBody>,
    parked_at: Instant,
}

impl IdleSender {
    fn is_stale(&self) -> bool {
        self.sender.is_closed() || self.parked_at.elapsed() > IDLE_TIMEOUT
    }
}

/// Counters for observability; snapshot via [`UpstreamPool::stats`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Requests served over a reused connection.
    pub hits: u64,
    /// Requests that dialed a fresh connection.
    pub misses: u64,
    /// Idle handles discarded as closed or expired.
    pub evictions: u64,
    /// Idle handles currently parked, across all origins.
    pub idle: usize,
}

/// The process-wide upstream pool. Shared by every listener; internally
/// synchronized per call, with no lock held across a dial or a request.
pub struct UpstreamPool {
    idle: Mutex<HashMap<Origin, VecDeque<IdleSender>>>,
    limits: Mutex<HashMap<Origin, Arc<Semaphore>>>,
    stats: Mutex<PoolStats>,
}

impl UpstreamPool {
    pub fn new() -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            limits: Mutex::new(HashMap::new()),
            stats: Mutex::new(PoolStats::default()),
        }
    }

    /// Send one request to the origin over a pooled or fresh connection.
    ///
    /// On success the handle is parked for reuse; hyper hands it back to
    /// the next checkout only once the previous response body is fully
    /// consumed, so keep-alive reuse stays protocol-correct. On failure the
    /// handle is dropped, which closes the socket.
    pub async fn request(
        &self,
        origin: &Origin,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, UpstreamError> {
        let mut sender = self.checkout(origin).await?;

        match sender.send_request(req).await {
            Ok(response) => {
                self.park(origin, sender).await;
                Ok(response)
            }
            Err(source) => Err(UpstreamError::Request {
                authority: origin.authority(),
                source,
            }),
        }
    }

    async fn checkout(&self, origin: &Origin) -> Result<SendRequest<ProxyBody>, UpstreamError> {
        let mut discarded = 0u64;

        let reused = loop {
            let candidate = {
                let mut idle = self.idle.lock().await;
                match idle.get_mut(origin) {
                    Some(queue) => {
                        let mut picked = None;
                        while let Some(entry) = queue.pop_front() {
                            if entry.is_stale() {
                                discarded += 1;
                                continue;
                            }
                            picked = Some(entry.sender);
                            break;
                        }
                        picked
                    }
                    None => None,
                }
            };

            match candidate {
                Some(mut sender) => {
                    // A handle can go bad while parked; readiness is the
                    // final check before we commit to it.
                    if sender.ready().await.is_ok() {
                        break Some(sender);
                    }
                    discarded += 1;
                }
                None => break None,
            }
        };

        if discarded > 0 {
            let mut stats = self.stats.lock().await;
            stats.evictions += discarded;
        }

        if let Some(sender) = reused {
            let mut stats = self.stats.lock().await;
            stats.hits += 1;
            debug!(upstream = %origin.authority(), "reusing pooled connection");
            return Ok(sender);
        }

        let limiter = self.limiter(origin).await;
        let permit = limiter
            .acquire_owned()
            .await
            .expect("upstream socket limiter closed");

        {
            let mut stats = self.stats.lock().await;
            stats.misses += 1;
        }
        debug!(upstream = %origin.authority(), "dialing new connection");
        upstream::connect(origin, permit).await
    }

    async fn park(&self, origin: &Origin, sender: SendRequest<ProxyBody>) {
        if sender.is_closed() {
            return;
        }
        let mut idle = self.idle.lock().await;
        let queue = idle.entry(origin.clone()).or_default();
        if queue.len() >= MAX_IDLE_PER_UPSTREAM {
            debug!(upstream = %origin.authority(), "idle pool full, dropping connection");
            return;
        }
        queue.push_back(IdleSender {
            sender,
            parked_at: Instant::now(),
        });
    }

    async fn limiter(&self, origin: &Origin) -> Arc<Semaphore> {
        let mut limits = self.limits.lock().await;
        limits
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(MAX_SOCKETS_PER_UPSTREAM)))
            .clone()
    }

    /// Evict closed and idle-expired handles across all origins.
    pub async fn sweep(&self) {
        let removed = {
            let mut idle = self.idle.lock().await;
            let mut removed = 0u64;
            for queue in idle.values_mut() {
                let before = queue.len();
                queue.retain(|entry| !entry.is_stale());
                removed += (before - queue.len()) as u64;
            }
            idle.retain(|_, queue| !queue.is_empty());
            removed
        };

        if removed > 0 {
            let mut stats = self.stats.lock().await;
            stats.evictions += removed;
            debug!(removed, "pool sweep evicted stale connections");
        }
    }

    /// Spawn the periodic sweep task. The handle is aborted on shutdown.
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                pool.sweep().await;
            }
        })
    }

    /// Snapshot of the pool counters.
    pub async fn stats(&self) -> PoolStats {
        let idle = self.idle.lock().await;
        let mut stats = self.stats.lock().await;
        stats.idle = idle.values().map(VecDeque::len).sum();
        stats.clone()
    }
}

impl Default for UpstreamPool {
    fn default() -> Self {
        Self::new()
    }
}
