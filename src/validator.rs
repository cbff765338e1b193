//! Structural, semantic, and shadowing diagnostics over the raw document.
//!
//! The validator walks the unparsed JSON independently of the loader, so it
//! can report every problem in one pass even when the loader would simply
//! skip the offending entry. Errors fail a strict [`crate::load`]; warnings
//! are advisory. Diagnostic paths use dotted/bracketed notation sufficient
//! to locate the node (`80.hosts.api.example.com./v1.to[1]`).

use std::fmt;

use serde_json::{Map, Value};

use crate::config::{
    self, is_path_key, parse_port_key, ProxyConfig, DEFAULTS_KEY, HOSTS_KEY, TLS_KEY,
};
use crate::router::WILDCARD;
use crate::rules::{Origin, OriginError, VALID_REDIRECT_STATUSES};

/// Diagnostic codes. Errors fail the load; warnings do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    InvalidJson,
    InvalidPort,
    InvalidUrl,
    InvalidProtocol,
    MissingHostname,
    InvalidRuleType,
    MissingRequiredField,
    EmptyTarget,
    InvalidRedirectStatus,
    ShadowedHost,
    ShadowedPath,
    EmptyConfig,
}

impl Code {
    pub fn as_str(self) -> &'static str {
        match self {
            Code::InvalidJson => "INVALID_JSON",
            Code::InvalidPort => "INVALID_PORT",
            Code::InvalidUrl => "INVALID_URL",
            Code::InvalidProtocol => "INVALID_PROTOCOL",
            Code::MissingHostname => "MISSING_HOSTNAME",
            Code::InvalidRuleType => "INVALID_RULE_TYPE",
            Code::MissingRequiredField => "MISSING_REQUIRED_FIELD",
            Code::EmptyTarget => "EMPTY_TARGET",
            Code::InvalidRedirectStatus => "INVALID_REDIRECT_STATUS",
            Code::ShadowedHost => "SHADOWED_HOST",
            Code::ShadowedPath => "SHADOWED_PATH",
            Code::EmptyConfig => "EMPTY_CONFIG",
        }
    }

    fn is_error(self) -> bool {
        !matches!(
            self,
            Code::InvalidRedirectStatus | Code::ShadowedHost | Code::ShadowedPath | Code::EmptyConfig
        )
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One finding, located by its dotted path into the document.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: Code,
    pub path: String,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] at {}: {}", self.code, self.path, self.message)
        }
    }
}

/// The validator's verdict plus the (leniently) normalized configuration
/// for preview tooling.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
    pub normalized: Option<ProxyConfig>,
}

impl ValidationReport {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Human-readable diagnostic listing, one finding per line.
    pub fn render(&self) -> String {
        let mut out = String::from("configuration failed validation:");
        for diag in &self.errors {
            out.push_str("\n  error ");
            out.push_str(&diag.to_string());
        }
        for diag in &self.warnings {
            out.push_str("\n  warning ");
            out.push_str(&diag.to_string());
        }
        out
    }

    fn push(&mut self, code: Code, path: impl Into<String>, message: impl Into<String>) {
        let diag = Diagnostic {
            code,
            path: path.into(),
            message: message.into(),
        };
        if code.is_error() {
            self.errors.push(diag);
        } else {
            self.warnings.push(diag);
        }
    }
}

/// Validate a raw source string; parse failures surface as `INVALID_JSON`.
pub fn validate_str(source: &str) -> ValidationReport {
    match serde_json::from_str::<Value>(source) {
        Ok(doc) => validate(&doc),
        Err(e) => {
            let mut report = ValidationReport::default();
            report.push(Code::InvalidJson, "", format!("document failed to parse: {e}"));
            report
        }
    }
}

/// Validate a parsed document.
pub fn validate(doc: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();

    let Some(root) = doc.as_object() else {
        report.push(Code::InvalidJson, "", "top-level value must be an object");
        return report;
    };

    let mut port_entries = 0usize;
    for (key, value) in root {
        if key == DEFAULTS_KEY {
            continue;
        }
        port_entries += 1;
        match parse_port_key(key) {
            Some(_) => check_port(&mut report, key, value),
            None => report.push(
                Code::InvalidPort,
                key,
                format!("key {key:?} is not an integer in [1, 65535]"),
            ),
        }
    }

    if port_entries == 0 {
        report.push(Code::EmptyConfig, "", "document contains no port entries");
    }

    report.normalized = Some(config::normalize(doc));
    report
}

fn check_port(report: &mut ValidationReport, port: &str, value: &Value) {
    match value {
        Value::String(url) => check_origin(report, port, url),
        Value::Object(obj) => {
            if let Some(tls) = obj.get(TLS_KEY) {
                check_tls(report, port, tls);
            }
            match obj.get(HOSTS_KEY) {
                Some(Value::Object(hosts)) => check_hosts(report, port, hosts),
                Some(_) => report.push(
                    Code::MissingRequiredField,
                    format!("{port}.hosts"),
                    "`hosts` must be an object mapping host keys to host configs",
                ),
                None => {
                    let scope = port.to_string();
                    check_paths(report, &scope, obj);
                }
            }
        }
        _ => report.push(
            Code::MissingRequiredField,
            port,
            "port entry must be a URL string or an object",
        ),
    }
}

fn check_tls(report: &mut ValidationReport, port: &str, tls: &Value) {
    let Some(obj) = tls.as_object() else {
        report.push(
            Code::MissingRequiredField,
            format!("{port}.tls"),
            "`tls` must be an object with `cert` and `key` paths",
        );
        return;
    };
    for field in ["cert", "key"] {
        if !obj.get(field).map(Value::is_string).unwrap_or(false) {
            report.push(
                Code::MissingRequiredField,
                format!("{port}.tls.{field}"),
                format!("tls block requires a string `{field}` path"),
            );
        }
    }
}

fn check_hosts(report: &mut ValidationReport, port: &str, hosts: &Map<String, Value>) {
    let mut wildcard_seen = false;
    let mut shadow_reported = false;

    for (host_key, host_config) in hosts {
        if host_key == WILDCARD {
            wildcard_seen = true;
        } else if wildcard_seen && !shadow_reported {
            // Exact hosts still win at lookup time, but authors usually
            // intend document order to matter.
            report.push(
                Code::ShadowedHost,
                format!("{port}.{HOSTS_KEY}.*"),
                format!("wildcard host is declared before {host_key:?}"),
            );
            shadow_reported = true;
        }

        let scope = format!("{port}.{HOSTS_KEY}.{host_key}");
        match host_config {
            Value::String(url) => check_origin(report, &scope, url),
            Value::Object(paths) => check_paths(report, &scope, paths),
            _ => report.push(
                Code::MissingRequiredField,
                scope,
                "host entry must be a URL string or an object",
            ),
        }
    }
}

fn check_paths(report: &mut ValidationReport, scope: &str, paths: &Map<String, Value>) {
    let mut wildcard_seen = false;
    let mut shadow_reported = false;

    for (path_key, rule) in paths {
        if path_key == HOSTS_KEY || path_key == TLS_KEY || path_key == DEFAULTS_KEY {
            continue;
        }
        if !is_path_key(path_key) {
            continue;
        }

        if path_key == WILDCARD {
            wildcard_seen = true;
        } else if wildcard_seen && !shadow_reported {
            report.push(
                Code::ShadowedPath,
                format!("{scope}.*"),
                format!("wildcard path is declared before {path_key:?}"),
            );
            shadow_reported = true;
        }

        check_rule(report, &format!("{scope}.{path_key}"), rule);
    }
}

fn check_rule(report: &mut ValidationReport, path: &str, rule: &Value) {
    match rule {
        Value::String(url) => {
            if url.trim().is_empty() {
                report.push(Code::EmptyTarget, path, "target URL is empty");
            } else {
                check_origin(report, path, url);
            }
        }
        Value::Object(obj) => check_rule_object(report, path, obj),
        _ => report.push(
            Code::MissingRequiredField,
            path,
            "rule must be a URL string or a rule object",
        ),
    }
}

fn check_rule_object(report: &mut ValidationReport, path: &str, obj: &Map<String, Value>) {
    let rule_type = match obj.get("type") {
        None => "proxy",
        Some(Value::String(t)) if matches!(t.as_str(), "proxy" | "redirect" | "rewrite") => {
            t.as_str()
        }
        Some(other) => {
            report.push(
                Code::InvalidRuleType,
                format!("{path}.type"),
                format!("`type` must be proxy, redirect, or rewrite, got {other}"),
            );
            return;
        }
    };

    let Some(to) = obj.get("to") else {
        report.push(
            Code::MissingRequiredField,
            path,
            "rule object lacks the required `to` field",
        );
        return;
    };

    match rule_type {
        "proxy" => check_proxy_to(report, path, to),
        "redirect" => {
            check_redirect_to(report, path, to);
            if let Some(status) = obj.get("status") {
                check_redirect_status(report, path, status);
            }
        }
        "rewrite" => check_rewrite_to(report, path, to),
        _ => unreachable!("type narrowed above"),
    }
}

fn check_proxy_to(report: &mut ValidationReport, path: &str, to: &Value) {
    match to {
        Value::String(url) => {
            if url.trim().is_empty() {
                report.push(Code::EmptyTarget, format!("{path}.to"), "target URL is empty");
            } else {
                check_origin(report, &format!("{path}.to"), url);
            }
        }
        Value::Array(items) => {
            if items.is_empty() {
                report.push(Code::EmptyTarget, format!("{path}.to"), "target list is empty");
                return;
            }
            for (i, item) in items.iter().enumerate() {
                let item_path = format!("{path}.to[{i}]");
                match item.as_str() {
                    Some(url) if url.trim().is_empty() => {
                        report.push(Code::EmptyTarget, item_path, "target URL is empty")
                    }
                    Some(url) => check_origin(report, &item_path, url),
                    None => report.push(Code::InvalidUrl, item_path, "target must be a URL string"),
                }
            }
        }
        _ => report.push(
            Code::InvalidUrl,
            format!("{path}.to"),
            "proxy `to` must be a URL string or a list of URL strings",
        ),
    }
}

fn check_redirect_to(report: &mut ValidationReport, path: &str, to: &Value) {
    let Some(to) = to.as_str() else {
        report.push(
            Code::InvalidUrl,
            format!("{path}.to"),
            "redirect `to` must be a string",
        );
        return;
    };
    if to.is_empty() {
        report.push(Code::EmptyTarget, format!("{path}.to"), "redirect target is empty");
        return;
    }
    // Relative paths are allowed for redirects; anything else must be a
    // well-formed http(s) URL.
    if !to.starts_with('/') {
        check_origin(report, &format!("{path}.to"), to);
    }
}

fn check_rewrite_to(report: &mut ValidationReport, path: &str, to: &Value) {
    let Some(to) = to.as_str() else {
        report.push(
            Code::InvalidUrl,
            format!("{path}.to"),
            "rewrite `to` must be a string",
        );
        return;
    };
    if to.is_empty() {
        report.push(Code::EmptyTarget, format!("{path}.to"), "rewrite target is empty");
    } else if !to.starts_with('/') {
        report.push(
            Code::InvalidUrl,
            format!("{path}.to"),
            "rewrite target must be a path beginning with '/'",
        );
    }
}

fn check_redirect_status(report: &mut ValidationReport, path: &str, status: &Value) {
    let valid = status
        .as_u64()
        .and_then(|s| u16::try_from(s).ok())
        .map(|s| VALID_REDIRECT_STATUSES.contains(&s))
        .unwrap_or(false);
    if !valid {
        report.push(
            Code::InvalidRedirectStatus,
            format!("{path}.status"),
            format!("redirect status {status} is not one of 301, 302, 307, 308"),
        );
    }
}

fn check_origin(report: &mut ValidationReport, path: &str, url: &str) {
    match Origin::parse(url) {
        Ok(_) => {}
        Err(OriginError::Unparseable) => report.push(
            Code::InvalidUrl,
            path,
            format!("{url:?} is not a well-formed URL"),
        ),
        Err(OriginError::UnsupportedScheme(scheme)) => report.push(
            Code::InvalidProtocol,
            path,
            if scheme.is_empty() {
                format!("{url:?} has no scheme (expected http or https)")
            } else {
                format!("scheme {scheme:?} is not http or https")
            },
        ),
        Err(OriginError::MissingHost) => report.push(
            Code::MissingHostname,
            path,
            format!("{url:?} has no hostname"),
        ),
    }
}
