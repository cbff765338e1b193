//! Round-robin upstream selection.
//!
//! Cursors are process-local mutable state kept off the (immutable,
//! shareable) rules, keyed by the route the router actually matched,
//! wildcard included, not by the request's literal host/path. Entries
//! are created lazily on first dispatch and live for the process lifetime.
//! In a multi-worker deployment each worker owns its own cursors; balance
//! across workers is only approximate in aggregate.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::rules::Origin;

/// Identifies one rule slot: the matched `(port, host-key, path-key)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub port: u16,
    pub host: String,
    pub path: String,
}

impl RouteKey {
    pub fn new(port: u16, host: &str, path: &str) -> Self {
        Self {
            port,
            host: host.to_string(),
            path: path.to_string(),
        }
    }
}

/// Per-route rotation state. The load/compute/store sequence runs under
/// one lock, so concurrent `next` calls for the same route observe
/// distinct successive indices.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursors: Mutex<HashMap<RouteKey, usize>>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the next target for a route. A single-target rule never touches
    /// cursor state.
    pub fn next<'a>(&self, targets: &'a [Origin], key: &RouteKey) -> &'a Origin {
        debug_assert!(!targets.is_empty(), "proxy rules always carry >= 1 target");
        if targets.len() == 1 {
            return &targets[0];
        }

        let mut cursors = self.cursors.lock().expect("cursor lock poisoned");
        let slot = cursors.entry(key.clone()).or_insert(0);
        let index = *slot % targets.len();
        *slot = (index + 1) % targets.len();
        &targets[index]
    }

    /// Current cursor position for a route, if one has been created.
    pub fn position(&self, key: &RouteKey) -> Option<usize> {
        self.cursors
            .lock()
            .expect("cursor lock poisoned")
            .get(key)
            .copied()
    }
}
