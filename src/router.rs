//! Route lookup: `(port, host, path) → Rule`.
//!
//! The table is a three-level map built once by the loader and immutable
//! afterwards, so lookups are lock-free. Within each level the wildcard key
//! `"*"` is a fallback, not a pattern: it is consulted only when no exact
//! key matches.

use std::collections::{BTreeSet, HashMap};

use crate::rules::{ProxyRule, Rule};

/// Sentinel key matching any host or any path.
pub const WILDCARD: &str = "*";

type PathMap = HashMap<String, Rule>;
type HostMap = HashMap<String, PathMap>;

/// The result of a successful lookup: the rule plus the keys it was stored
/// under. The matched keys (not the request's literal host/path) identify
/// the route for round-robin cursor state, and whether the path matched
/// exactly drives the rewrite forwarding contract.
#[derive(Debug, Clone, Copy)]
pub struct Resolved<'a> {
    pub rule: &'a Rule,
    pub host_key: &'a str,
    pub path_key: &'a str,
}

impl Resolved<'_> {
    /// True when the path matched its own key rather than the wildcard slot.
    pub fn exact_path(&self) -> bool {
        self.path_key != WILDCARD
    }
}

/// Normalized routing table: `port → host-key → path-key → Rule`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutingTable {
    ports: HashMap<u16, HostMap>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule slot. Later inserts for the same `(port, host, path)`
    /// replace earlier ones, mirroring JSON object key semantics.
    pub(crate) fn insert(&mut self, port: u16, host: &str, path: &str, rule: Rule) {
        self.ports
            .entry(port)
            .or_default()
            .entry(host.to_string())
            .or_default()
            .insert(path.to_string(), rule);
    }

    /// Drop ports that ended up with no usable rule slots.
    pub(crate) fn prune_empty(&mut self) {
        self.ports.retain(|_, hosts| {
            hosts.retain(|_, paths| !paths.is_empty());
            !hosts.is_empty()
        });
    }

    /// Resolve a request to a rule.
    ///
    /// Exact host beats the wildcard host; once a host map is chosen the
    /// same precedence applies to the path, with no second chance at the
    /// wildcard host if the exact host has no matching path.
    pub fn resolve(&self, port: u16, host: &str, path: &str) -> Option<Resolved<'_>> {
        let hosts = self.ports.get(&port)?;

        let (host_key, paths) = match hosts.get_key_value(host) {
            Some((k, v)) => (k.as_str(), v),
            None => hosts
                .get_key_value(WILDCARD)
                .map(|(k, v)| (k.as_str(), v))?,
        };

        let (path_key, rule) = match paths.get_key_value(path) {
            Some((k, v)) => (k.as_str(), v),
            None => paths
                .get_key_value(WILDCARD)
                .map(|(k, v)| (k.as_str(), v))?,
        };

        Some(Resolved {
            rule,
            host_key,
            path_key,
        })
    }

    /// First proxy rule under the given host scope (exact host, else the
    /// wildcard host), used by the rewrite fallback. The wildcard path slot
    /// is preferred when it holds a proxy rule.
    pub(crate) fn any_proxy(&self, port: u16, host: &str) -> Option<&ProxyRule> {
        let hosts = self.ports.get(&port)?;
        let paths = hosts.get(host).or_else(|| hosts.get(WILDCARD))?;

        if let Some(p) = paths.get(WILDCARD).and_then(Rule::as_proxy) {
            return Some(p);
        }
        paths.values().find_map(Rule::as_proxy)
    }

    /// Set union of all path keys across the port's host maps. Used by
    /// external diagnostics and preview tooling, not by the dispatcher.
    pub fn paths(&self, port: u16) -> BTreeSet<&str> {
        self.ports
            .get(&port)
            .into_iter()
            .flat_map(|hosts| hosts.values())
            .flat_map(|paths| paths.keys())
            .map(String::as_str)
            .collect()
    }

    /// True if any host map on the port has the exact path or a wildcard
    /// path slot.
    pub fn has_path(&self, port: u16, path: &str) -> bool {
        self.ports
            .get(&port)
            .map(|hosts| {
                hosts
                    .values()
                    .any(|paths| paths.contains_key(path) || paths.contains_key(WILDCARD))
            })
            .unwrap_or(false)
    }

    /// Configured ports, in ascending order.
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.ports.keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Full view of one port's host map, for serialization and preview.
    pub fn host_map(&self, port: u16) -> Option<&HashMap<String, HashMap<String, Rule>>> {
        self.ports.get(&port)
    }
}
