//! tsk-config
//!
//! Layered YAML configuration for the sync client.
//!
//! # Pipeline
//! 1. Read YAML documents in order; later documents override earlier ones
//!    (deep merge of mappings, everything else replaced).
//! 2. Convert to JSON and reject literal secrets (`CONFIG_SECRET_DETECTED`).
//!    Config stores env var NAMES only; see [`secrets`].
//! 3. Canonicalize and hash (SHA-256 hex) for provenance.
//! 4. Deserialize into [`ClientConfig`]. Every key has a default, so the empty
//!    document is a valid config.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::time::Duration;

pub mod secrets;

pub use secrets::{resolve_credential, resolve_credential_with, ResolvedCredential};

/// Known secret-like prefixes. If any leaf string value in the effective
/// config starts with one of these, loading aborts with CONFIG_SECRET_DETECTED.
const SECRET_PREFIXES: &[&str] = &[
    "sk-",        // OpenAI style
    "sk_live",    // Stripe live
    "sk_test",    // Stripe test
    "AKIA",       // AWS access key ID
    "-----BEGIN", // PEM private keys
    "ghp_",       // GitHub PAT
    "gho_",       // GitHub OAuth
    "glpat-",     // GitLab PAT
    "xoxb-",      // Slack bot token
    "xoxp-",      // Slack user token
    "eyJ",        // JWT (base64 of '{"')
    "Bearer ",    // pasted Authorization header value
];

/// Wire formats the push transport understands.
pub const WIRE_FORMATS: &[&str] = &["socket_io", "json"];

// ---------------------------------------------------------------------------
// Typed config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// REST root; tasks live under `/api/tasks`.
    pub base_url: String,
    /// In-flight mutations time out into a rollback after this long.
    pub request_timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3001".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

impl ApiConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub url: String,
    /// One of [`WIRE_FORMATS`].
    pub wire_format: String,
    /// 0 disables reconnect.
    pub reconnect_delay_ms: u64,
    pub resync_on_reconnect: bool,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:3001/socket.io/?EIO=4&transport=websocket".to_string(),
            wire_format: "socket_io".to_string(),
            reconnect_delay_ms: 2_000,
            resync_on_reconnect: true,
        }
    }
}

impl PushConfig {
    /// `None` when reconnect is disabled.
    pub fn reconnect_delay(&self) -> Option<Duration> {
        (self.reconnect_delay_ms > 0).then(|| Duration::from_millis(self.reconnect_delay_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Name of the env var holding the bearer credential. Never the value.
    pub token_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: "TSK_TOKEN".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub queue_capacity: usize,
    pub notice_capacity: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            notice_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub api: ApiConfig,
    pub push: PushConfig,
    pub auth: AuthConfig,
    pub engine: EngineSection,
}

impl ClientConfig {
    pub fn from_json(config_json: &Value) -> Result<Self> {
        let cfg: ClientConfig = serde_json::from_value(config_json.clone())
            .context("CONFIG_INVALID: config does not match the expected shape")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let base = self.api.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            bail!("CONFIG_INVALID api.base_url must be an http(s) URL");
        }
        if self.api.request_timeout_ms == 0 {
            bail!("CONFIG_INVALID api.request_timeout_ms must be > 0");
        }
        let push = self.push.url.trim();
        if !(push.starts_with("ws://") || push.starts_with("wss://")) {
            bail!("CONFIG_INVALID push.url must be a ws(s) URL");
        }
        if !WIRE_FORMATS.contains(&self.push.wire_format.as_str()) {
            bail!(
                "CONFIG_INVALID push.wire_format '{}': expected one of {:?}",
                self.push.wire_format,
                WIRE_FORMATS
            );
        }
        if self.auth.token_env.trim().is_empty() {
            bail!("CONFIG_INVALID auth.token_env must name an env var");
        }
        if self.engine.queue_capacity == 0 || self.engine.notice_capacity == 0 {
            bail!("CONFIG_INVALID engine capacities must be > 0");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Unknown-key guard
// ---------------------------------------------------------------------------

/// JSON pointers of every key [`ClientConfig`] reads.
pub const KNOWN_POINTERS: &[&str] = &[
    "/api/base_url",
    "/api/request_timeout_ms",
    "/push/url",
    "/push/wire_format",
    "/push/reconnect_delay_ms",
    "/push/resync_on_reconnect",
    "/auth/token_env",
    "/engine/queue_capacity",
    "/engine/notice_capacity",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownKeyPolicy {
    Warn,
    Fail,
}

/// Leaf pointers nothing reads, typically typos (`push.wire_fromat`).
/// With `Fail`, a non-empty result is an error.
pub fn report_unknown_keys(config_json: &Value, policy: UnknownKeyPolicy) -> Result<Vec<String>> {
    let mut leaves = Vec::new();
    collect_leaf_pointers(config_json, "", &mut leaves);

    let mut unknown: Vec<String> = leaves
        .into_iter()
        .filter(|lp| {
            !KNOWN_POINTERS
                .iter()
                .any(|k| is_prefix_pointer(k, lp) || is_prefix_pointer(lp, k))
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    // The empty document has a single root leaf.
    unknown.retain(|p| !(p == "/" && config_json.as_object().is_some_and(|m| m.is_empty())));

    if policy == UnknownKeyPolicy::Fail && !unknown.is_empty() {
        bail!(
            "CONFIG_UNKNOWN_KEYS: {} unknown config leaf key(s): {:?}",
            unknown.len(),
            unknown.iter().take(12).collect::<Vec<_>>()
        );
    }
    Ok(unknown)
}

/// `"/a/b"` covers `"/a/b"` and `"/a/b/c"` but not `"/a/bc"`.
fn is_prefix_pointer(prefix: &str, leaf: &str) -> bool {
    if leaf == prefix {
        return true;
    }
    leaf.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

fn collect_leaf_pointers(v: &Value, prefix: &str, out: &mut Vec<String>) {
    match v {
        Value::Object(map) if !map.is_empty() => {
            for (k, vv) in map.iter() {
                let next = format!("{}/{}", prefix, escape_pointer_token(k));
                collect_leaf_pointers(vv, &next, out);
            }
        }
        Value::Array(arr) if !arr.is_empty() => {
            for (i, vv) in arr.iter().enumerate() {
                let next = format!("{}/{}", prefix, i);
                collect_leaf_pointers(vv, &next, out);
            }
        }
        _ => {
            let p = if prefix.is_empty() {
                "/".to_string()
            } else {
                prefix.to_string()
            };
            out.push(p);
        }
    }
}

fn escape_pointer_token(s: &str) -> String {
    s.replace('~', "~0").replace('/', "~1")
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_hash: String,
    pub canonical_json: String,
    pub config_json: Value,
    pub config: ClientConfig,
}

pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut docs: Vec<String> = Vec::new();
    for p in paths {
        let raw =
            fs::read_to_string(p).with_context(|| format!("failed to read yaml path: {p}"))?;
        docs.push(raw);
    }

    let doc_refs: Vec<&str> = docs.iter().map(|s| s.as_str()).collect();
    load_layered_yaml_from_strings(&doc_refs)
}

pub fn load_layered_yaml_from_strings(yaml_docs: &[&str]) -> Result<LoadedConfig> {
    let mut merged = serde_json::json!({});
    for raw in yaml_docs {
        // An empty file parses as null; treat it as an empty layer.
        if raw.trim().is_empty() {
            continue;
        }
        let v_yaml: serde_yaml::Value = serde_yaml::from_str(raw).context("invalid yaml")?;
        let v_json = serde_json::to_value(v_yaml).context("yaml->json conversion failed")?;
        if v_json.is_null() {
            continue;
        }
        merged = deep_merge(merged, v_json);
    }

    enforce_no_secret_literals(&merged)?;

    let canonical_json = canonicalize_json(&merged)?;
    let config_hash = sha256_hex(canonical_json.as_bytes());
    let config = ClientConfig::from_json(&merged)?;
    Ok(LoadedConfig {
        config_hash,
        canonical_json,
        config_json: merged,
        config,
    })
}

fn deep_merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut a_map), Value::Object(b_map)) => {
            for (k, b_val) in b_map {
                let a_val = a_map.remove(&k).unwrap_or(Value::Null);
                a_map.insert(k, deep_merge(a_val, b_val));
            }
            Value::Object(a_map)
        }
        (_, b_other) => b_other,
    }
}

/// serde_json's default map is ordered by key, so this is canonical.
fn canonicalize_json(v: &Value) -> Result<String> {
    serde_json::to_string(v).context("canonical json serialize failed")
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn enforce_no_secret_literals(v: &Value) -> Result<()> {
    let mut leaves = Vec::new();
    collect_leaf_pointers(v, "", &mut leaves);

    for ptr in leaves {
        let Some(s) = v.pointer(&ptr).and_then(Value::as_str) else {
            continue;
        };
        if looks_like_secret(s) {
            bail!("CONFIG_SECRET_DETECTED leaf={} value=REDACTED", ptr);
        }
    }
    Ok(())
}

fn looks_like_secret(s: &str) -> bool {
    let t = s.trim_start();
    if t.trim_end().len() < 8 {
        return false;
    }
    SECRET_PREFIXES.iter().any(|p| t.starts_with(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deep_merge_overrides_leaves_and_keeps_siblings() {
        let a = json!({"api": {"base_url": "http://a", "request_timeout_ms": 5}});
        let b = json!({"api": {"base_url": "http://b"}});
        assert_eq!(
            deep_merge(a, b),
            json!({"api": {"base_url": "http://b", "request_timeout_ms": 5}})
        );
    }

    #[test]
    fn prefix_pointer_respects_boundaries() {
        assert!(is_prefix_pointer("/push/url", "/push/url"));
        assert!(is_prefix_pointer("/push", "/push/url"));
        assert!(!is_prefix_pointer("/push/url", "/push/urls"));
    }

    #[test]
    fn secret_prefixes() {
        assert!(looks_like_secret("eyJhbGciOiJIUzI1NiJ9.x.y"));
        assert!(looks_like_secret("Bearer abcdefgh"));
        assert!(!looks_like_secret("TSK_TOKEN"));
        assert!(!looks_like_secret("sk-1"));
    }

    #[test]
    fn reconnect_zero_disables() {
        let mut p = PushConfig::default();
        assert_eq!(p.reconnect_delay(), Some(Duration::from_secs(2)));
        p.reconnect_delay_ms = 0;
        assert_eq!(p.reconnect_delay(), None);
    }
}
