//! Configuration loading and normalization.
//!
//! The source document is a single JSON object whose keys are listening
//! ports (plus the reserved `__defaults`). Port values are polymorphic: a
//! bare origin URL, an object with virtual hosts under the reserved `hosts`
//! key, or an object whose keys are paths. [`normalize`] collapses every
//! accepted shape into a [`RoutingTable`] of closed [`Rule`] variants, a TLS
//! material map, and the process-global [`Defaults`] block, lifting reserved
//! keys out before any routing iteration.
//!
//! The normalizer is lenient: entries it cannot use are skipped with a
//! warning so the validator can still render a table for diagnostics.
//! [`load`] is strict and fails on any validator error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::router::{RoutingTable, WILDCARD};
use crate::rules::{
    Origin, OriginError, ProxyRule, RedirectRule, RewriteRule, Rule, DEFAULT_REDIRECT_STATUS,
};
use crate::validator;

/// Reserved top-level key holding the defaults block.
pub const DEFAULTS_KEY: &str = "__defaults";
/// Reserved port-level key introducing virtual-host routing.
pub const HOSTS_KEY: &str = "hosts";
/// Reserved port-level key holding TLS material paths.
pub const TLS_KEY: &str = "tls";

/// Header-rewriting policy applied to every forwarded request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderDefaults {
    /// Inject/append the `X-Forwarded-For` / `-Host` / `-Proto` triplet.
    pub x_forwarded: bool,
    /// Preserve the client's `Host` header on the forwarded request instead
    /// of replacing it with the upstream's canonical host.
    pub pass_host: bool,
}

/// Retry policy carried in the defaults block. Accepted and preserved; not
/// enforced by the dispatch engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
}

/// Process-global policy from the `__defaults` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub headers: HeaderDefaults,
    /// Accepted and preserved; not enforced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Accepted and preserved; not enforced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<RetryDefaults>,
}

/// Filesystem paths to PEM material for one TLS-terminating listener.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<PathBuf>,
}

/// The normalized configuration: everything the listener fabric and
/// dispatcher need, constructed once at startup and immutable afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyConfig {
    pub table: RoutingTable,
    pub tls: HashMap<u16, TlsMaterial>,
    pub defaults: Defaults,
}

impl ProxyConfig {
    /// Serialize back to the canonical source form: explicit `hosts` maps,
    /// rule objects with `type` tags, `to` always a sequence for proxies.
    /// Loading the result yields an equal `ProxyConfig` (normalization is
    /// idempotent).
    pub fn to_value(&self) -> Value {
        let mut doc = Map::new();

        if self.defaults != Defaults::default() {
            if let Ok(defaults) = serde_json::to_value(&self.defaults) {
                doc.insert(DEFAULTS_KEY.to_string(), defaults);
            }
        }

        for port in self.table.ports() {
            let mut port_obj = Map::new();
            let mut hosts_obj = Map::new();

            if let Some(hosts) = self.table.host_map(port) {
                let mut host_keys: Vec<&String> = hosts.keys().collect();
                sort_wildcard_last(&mut host_keys);
                for host in host_keys {
                    let paths = &hosts[host];
                    let mut paths_obj = Map::new();
                    let mut path_keys: Vec<&String> = paths.keys().collect();
                    sort_wildcard_last(&mut path_keys);
                    for path in path_keys {
                        paths_obj.insert(path.clone(), rule_to_value(&paths[path]));
                    }
                    hosts_obj.insert(host.clone(), Value::Object(paths_obj));
                }
            }

            port_obj.insert(HOSTS_KEY.to_string(), Value::Object(hosts_obj));
            if let Some(material) = self.tls.get(&port) {
                if let Ok(tls) = serde_json::to_value(material) {
                    port_obj.insert(TLS_KEY.to_string(), tls);
                }
            }
            doc.insert(port.to_string(), Value::Object(port_obj));
        }

        Value::Object(doc)
    }
}

/// Wildcard slots serialize after exact keys, so a reserialized document
/// never trips its own shadowing warnings.
fn sort_wildcard_last(keys: &mut [&String]) {
    keys.sort_by(|a, b| {
        let a_wild = a.as_str() == WILDCARD;
        let b_wild = b.as_str() == WILDCARD;
        a_wild.cmp(&b_wild).then_with(|| a.cmp(b))
    });
}

fn rule_to_value(rule: &Rule) -> Value {
    match rule {
        Rule::Proxy(p) => {
            let targets: Vec<Value> = p
                .targets
                .iter()
                .map(|t| Value::String(t.to_string()))
                .collect();
            let mut obj = json!({ "type": "proxy", "to": targets });
            if let Some(hc) = &p.health_check {
                obj["health_check"] = hc.clone();
            }
            obj
        }
        Rule::Redirect(r) => {
            let mut obj = json!({ "type": "redirect", "to": r.to, "status": r.status });
            if let Some(prefix) = &r.strip_prefix {
                obj["strip_prefix"] = Value::String(prefix.clone());
            }
            obj
        }
        Rule::Rewrite(r) => json!({ "type": "rewrite", "to": r.to }),
    }
}

/// Parse and validate a configuration document. Strict: any validator
/// error fails the load; warnings are logged and tolerated.
pub fn load(source: &str) -> Result<ProxyConfig, ConfigError> {
    let doc: Value = serde_json::from_str(source).map_err(|e| ConfigError::Json {
        message: e.to_string(),
    })?;

    let mut report = validator::validate(&doc);
    if !report.valid() {
        return Err(ConfigError::Invalid { report });
    }
    for diag in &report.warnings {
        warn!(code = %diag.code, path = %diag.path, "{}", diag.message);
    }

    Ok(report.normalized.take().unwrap_or_default())
}

/// [`load`] from a file on disk.
pub fn load_file<P: AsRef<Path>>(path: P) -> Result<ProxyConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.display().to_string(),
        });
    }
    let source = std::fs::read_to_string(path)?;
    load(&source)
}

/// Why a rule object could not be normalized. The loader drops the slot;
/// the validator reports the equivalent diagnostics independently.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RuleShapeError {
    UnknownType(String),
    MissingTo,
    EmptyTarget,
    BadTarget(OriginError),
    RewriteNotRelative,
}

impl std::fmt::Display for RuleShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleShapeError::UnknownType(t) => write!(f, "unknown rule type {t:?}"),
            RuleShapeError::MissingTo => write!(f, "rule is missing the required `to` field"),
            RuleShapeError::EmptyTarget => write!(f, "rule `to` is empty"),
            RuleShapeError::BadTarget(e) => write!(f, "invalid target: {e}"),
            RuleShapeError::RewriteNotRelative => {
                write!(f, "rewrite `to` must be a path beginning with '/'")
            }
        }
    }
}

/// Interpret a top-level key as a listening port. Strictly a decimal
/// integer in `[1, 65535]`.
pub(crate) fn parse_port_key(key: &str) -> Option<u16> {
    if key.is_empty() || !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match key.parse::<u32>() {
        Ok(n) if (1..=65535).contains(&n) => Some(n as u16),
        _ => None,
    }
}

/// Path keys begin with `/` or are exactly the wildcard.
pub(crate) fn is_path_key(key: &str) -> bool {
    key == WILDCARD || key.starts_with('/')
}

/// Normalize one rule slot: a bare URL string, a list of URL strings, or a
/// tagged rule object.
pub(crate) fn rule_from_value(value: &Value) -> Result<Rule, RuleShapeError> {
    match value {
        Value::String(url) => {
            if url.trim().is_empty() {
                return Err(RuleShapeError::EmptyTarget);
            }
            Origin::parse(url)
                .map(Rule::single_proxy)
                .map_err(RuleShapeError::BadTarget)
        }
        Value::Object(obj) => rule_from_object(obj),
        _ => Err(RuleShapeError::MissingTo),
    }
}

fn rule_from_object(obj: &Map<String, Value>) -> Result<Rule, RuleShapeError> {
    let rule_type = match obj.get("type") {
        None => "proxy",
        Some(Value::String(t)) => t.as_str(),
        Some(other) => return Err(RuleShapeError::UnknownType(other.to_string())),
    };

    let to = obj.get("to").ok_or(RuleShapeError::MissingTo)?;

    match rule_type {
        "proxy" => {
            let targets = proxy_targets(to)?;
            Ok(Rule::Proxy(ProxyRule {
                targets,
                health_check: obj.get("health_check").cloned(),
            }))
        }
        "redirect" => {
            let to = to.as_str().ok_or(RuleShapeError::MissingTo)?;
            if to.is_empty() {
                return Err(RuleShapeError::EmptyTarget);
            }
            let status = obj
                .get("status")
                .and_then(Value::as_u64)
                .and_then(|s| u16::try_from(s).ok())
                .unwrap_or(DEFAULT_REDIRECT_STATUS);
            Ok(Rule::Redirect(RedirectRule {
                to: to.to_string(),
                strip_prefix: obj
                    .get("strip_prefix")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                status,
            }))
        }
        "rewrite" => {
            let to = to.as_str().ok_or(RuleShapeError::MissingTo)?;
            if to.is_empty() {
                return Err(RuleShapeError::EmptyTarget);
            }
            if !to.starts_with('/') {
                return Err(RuleShapeError::RewriteNotRelative);
            }
            Ok(Rule::Rewrite(RewriteRule { to: to.to_string() }))
        }
        other => Err(RuleShapeError::UnknownType(other.to_string())),
    }
}

fn proxy_targets(to: &Value) -> Result<Vec<Origin>, RuleShapeError> {
    match to {
        Value::String(url) => {
            if url.trim().is_empty() {
                return Err(RuleShapeError::EmptyTarget);
            }
            Ok(vec![Origin::parse(url).map_err(RuleShapeError::BadTarget)?])
        }
        Value::Array(items) => {
            if items.is_empty() {
                return Err(RuleShapeError::EmptyTarget);
            }
            let mut targets = Vec::with_capacity(items.len());
            for item in items {
                let url = item.as_str().ok_or(RuleShapeError::MissingTo)?;
                if url.trim().is_empty() {
                    return Err(RuleShapeError::EmptyTarget);
                }
                targets.push(Origin::parse(url).map_err(RuleShapeError::BadTarget)?);
            }
            Ok(targets)
        }
        _ => Err(RuleShapeError::MissingTo),
    }
}

/// Lenient raw-to-normalized pass. Entries that cannot be used are skipped
/// with a warning; the validator reports them as diagnostics.
pub(crate) fn normalize(doc: &Value) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    let Some(root) = doc.as_object() else {
        return config;
    };

    for (key, value) in root {
        if key == DEFAULTS_KEY {
            match serde_json::from_value::<Defaults>(value.clone()) {
                Ok(defaults) => config.defaults = defaults,
                Err(e) => warn!(error = %e, "ignoring malformed __defaults block"),
            }
            continue;
        }

        let Some(port) = parse_port_key(key) else {
            warn!(key = %key, "skipping entry: key is not a port in [1, 65535]");
            continue;
        };

        match value {
            Value::String(_) => {
                // Bare origin URL: route any host, any path.
                match rule_from_value(value) {
                    Ok(rule) => config.table.insert(port, WILDCARD, WILDCARD, rule),
                    Err(e) => warn!(port, "skipping port: {e}"),
                }
            }
            Value::Object(obj) => normalize_port_object(&mut config, port, obj),
            _ => warn!(port, "skipping port: value must be a URL string or an object"),
        }
    }

    config.table.prune_empty();
    // A TLS entry is meaningful only for ports that actually route.
    config.tls.retain(|port, _| config.table.contains_port(*port));
    config
}

fn normalize_port_object(config: &mut ProxyConfig, port: u16, obj: &Map<String, Value>) {
    if let Some(tls_value) = obj.get(TLS_KEY) {
        match serde_json::from_value::<TlsMaterial>(tls_value.clone()) {
            Ok(material) => {
                config.tls.insert(port, material);
            }
            Err(e) => warn!(port, error = %e, "ignoring malformed tls block"),
        }
    }

    if let Some(hosts) = obj.get(HOSTS_KEY) {
        let Some(hosts) = hosts.as_object() else {
            warn!(port, "skipping port: `hosts` must be an object");
            return;
        };
        for (host_key, host_config) in hosts {
            if host_key == HOSTS_KEY || host_key == TLS_KEY || host_key == DEFAULTS_KEY {
                warn!(port, host = %host_key, "skipping reserved name used as a host key");
                continue;
            }
            normalize_host(config, port, &host_key.to_ascii_lowercase(), host_config);
        }
    } else {
        // Path-form port: remaining keys are paths under the wildcard host.
        normalize_paths(config, port, WILDCARD, obj);
    }
}

fn normalize_host(config: &mut ProxyConfig, port: u16, host: &str, value: &Value) {
    match value {
        Value::String(_) => match rule_from_value(value) {
            Ok(rule) => config.table.insert(port, host, WILDCARD, rule),
            Err(e) => warn!(port, host, "skipping host: {e}"),
        },
        Value::Object(paths) => normalize_paths(config, port, host, paths),
        _ => warn!(port, host, "skipping host: value must be a URL string or an object"),
    }
}

fn normalize_paths(config: &mut ProxyConfig, port: u16, host: &str, obj: &Map<String, Value>) {
    for (path_key, rule_value) in obj {
        if path_key == HOSTS_KEY || path_key == TLS_KEY || path_key == DEFAULTS_KEY {
            continue;
        }
        if !is_path_key(path_key) {
            warn!(port, host, key = %path_key, "skipping key: paths must begin with '/' or be \"*\"");
            continue;
        }
        match rule_from_value(rule_value) {
            Ok(rule) => {
                if let Rule::Proxy(p) = &rule {
                    if p.health_check.is_some() {
                        debug!(port, host, path = %path_key, "health_check accepted but not enforced");
                    }
                }
                config.table.insert(port, host, path_key, rule);
            }
            Err(e) => warn!(port, host, path = %path_key, "skipping rule: {e}"),
        }
    }
}
