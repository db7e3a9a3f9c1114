//! Stream policy document.
//!
//! The policy is JSON, loaded once at startup. Named retry strategies and
//! named streams are both written as arrays of single-key objects:
//!
//! ```text
//! { "retry": [{ "default": { "backoff": [1000, 2000], ... } }],
//!   "s":     [{ "mintest": { "endpoint": "warmcat.com", ... } }] }
//! ```
//!
//! Overlays are partial documents in the same shape. They are merged field
//! by field into the stream or retry entry of the same name, or appended when
//! no such entry exists. A rejected overlay leaves the policy untouched.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// Policy compiled into the binary.
pub const DEFAULT_POLICY: &str = include_str!("../policy/default.json");

/// Stream probed at the connectivity-check stage.
pub const CAPTIVE_PORTAL_DETECT: &str = "captive_portal_detect";

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("malformed policy document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("policy overlay must be an object whose \"s\"/\"retry\" members are arrays of named objects")]
    OverlayShape,

    #[error("stream {stream:?} refers to unknown retry policy {retry:?}")]
    UnknownRetry { stream: String, retry: String },

    #[error("cannot read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Named backoff / retry strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Delay table in ms; the last entry repeats once the table runs out.
    #[serde(default)]
    pub backoff: Vec<u64>,
    /// Connection retries allowed before the failure is surfaced.
    #[serde(default)]
    pub conceal: u16,
    /// Random extra delay, as a percentage of the table value.
    #[serde(default)]
    pub jitterpc: u8,
    #[serde(default)]
    pub svalidping: u32,
    #[serde(default)]
    pub svalidhup: u32,
}

impl RetryPolicy {
    /// Whether a connection that has already been retried `retries` times may
    /// be retried again.
    #[must_use]
    pub const fn allows_retry(&self, retries: u16) -> bool {
        retries < self.conceal
    }

    /// Delay before retry number `retry` (0-based), including jitter.
    pub fn backoff_ms(&self, retry: u16, rng: &mut impl Rng) -> u64 {
        let base = self
            .backoff
            .get(usize::from(retry))
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or(0);
        let spread = base.saturating_mul(u64::from(self.jitterpc)) / 100;
        if spread == 0 {
            base
        } else {
            base + rng.gen_range(0..=spread)
        }
    }
}

/// One named stream type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamPolicy {
    pub endpoint: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_method")]
    pub http_method: String,
    #[serde(default)]
    pub http_url: String,
    /// Metadata name to HTTP header name, in declaration order.
    #[serde(default, deserialize_with = "named_entries")]
    pub metadata: Vec<(String, String)>,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub opportunistic: bool,
    #[serde(default)]
    pub retry: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub http_expect: Option<u16>,
    #[serde(default)]
    pub http_fail_redirect: bool,
    #[serde(default)]
    pub use_auth: bool,
}

const fn default_port() -> u16 {
    80
}

fn default_protocol() -> String {
    "h1".to_owned()
}

fn default_method() -> String {
    "GET".to_owned()
}

impl StreamPolicy {
    /// Header carrying the metadata item `name`, if the stream declares it.
    #[must_use]
    pub fn header_for(&self, name: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, header)| header.as_str())
    }

    /// Expands `${name}` references in the URL path from `values`.
    ///
    /// Unknown names expand to nothing.
    #[must_use]
    pub fn expand_url(&self, values: &[(String, String)]) -> String {
        let mut out = String::with_capacity(self.http_url.len());
        let mut rest = self.http_url.as_str();
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                out.push_str(&rest[start..]);
                return out;
            };
            let name = &after[..end];
            if let Some((_, v)) = values.iter().find(|(n, _)| n == name) {
                out.push_str(v);
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        out
    }

    /// Whether a response status counts as an assertive success.
    #[must_use]
    pub fn is_success(&self, status: u16) -> bool {
        match self.http_expect {
            Some(expect) => status == expect,
            None => (200..300).contains(&status),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct PolicyDoc {
    #[serde(default)]
    release: String,
    #[serde(default)]
    product: String,
    #[serde(rename = "schema-version", default)]
    schema_version: u32,
    #[serde(default, deserialize_with = "named_entries")]
    retry: Vec<(String, RetryPolicy)>,
    #[serde(rename = "s", default, deserialize_with = "named_entries")]
    streams: Vec<(String, StreamPolicy)>,
}

fn named_entries<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let maps = Vec::<BTreeMap<String, T>>::deserialize(deserializer)?;
    Ok(maps.into_iter().flat_map(BTreeMap::into_iter).collect())
}

/// Loaded policy: the raw document plus its typed view.
#[derive(Debug, Clone)]
pub struct Policy {
    raw: Value,
    doc: PolicyDoc,
}

impl Policy {
    /// Parses the embedded default policy.
    ///
    /// # Errors
    ///
    /// Fails only if the embedded document is malformed.
    pub fn embedded() -> Result<Self, PolicyError> {
        Self::parse(DEFAULT_POLICY)
    }

    /// # Errors
    ///
    /// Returns [`PolicyError::Parse`] for malformed JSON or a bad shape, and
    /// [`PolicyError::UnknownRetry`] when a stream names a missing strategy.
    pub fn parse(text: &str) -> Result<Self, PolicyError> {
        Self::from_value(serde_json::from_str(text)?)
    }

    /// # Errors
    ///
    /// As [`Policy::parse`], plus [`PolicyError::Io`] if the file is unreadable.
    pub fn from_file(path: &Path) -> Result<Self, PolicyError> {
        let text = std::fs::read_to_string(path).map_err(|source| PolicyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    fn from_value(raw: Value) -> Result<Self, PolicyError> {
        let doc: PolicyDoc = serde_json::from_value(raw.clone())?;
        for (stream, policy) in &doc.streams {
            if let Some(retry) = &policy.retry
                && !doc.retry.iter().any(|(n, _)| n == retry)
            {
                return Err(PolicyError::UnknownRetry {
                    stream: stream.clone(),
                    retry: retry.clone(),
                });
            }
        }
        Ok(Self { raw, doc })
    }

    #[must_use]
    pub fn release(&self) -> &str {
        &self.doc.release
    }

    #[must_use]
    pub fn product(&self) -> &str {
        &self.doc.product
    }

    #[must_use]
    pub const fn schema_version(&self) -> u32 {
        self.doc.schema_version
    }

    #[must_use]
    pub fn stream(&self, name: &str) -> Option<&StreamPolicy> {
        self.doc
            .streams
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, s)| s)
    }

    #[must_use]
    pub fn retry(&self, name: &str) -> Option<&RetryPolicy> {
        self.doc
            .retry
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| r)
    }

    /// Retry strategy a stream uses; streams without one never retry.
    #[must_use]
    pub fn retry_for(&self, stream: &StreamPolicy) -> RetryPolicy {
        stream
            .retry
            .as_deref()
            .and_then(|name| self.retry(name))
            .cloned()
            .unwrap_or_default()
    }

    /// Merges a partial policy document into this one.
    ///
    /// # Errors
    ///
    /// Returns an error, leaving the policy unchanged, if the overlay is not
    /// well formed or the merged document no longer validates.
    pub fn apply_overlay(&mut self, overlay: &str) -> Result<(), PolicyError> {
        let Value::Object(overlay) = serde_json::from_str::<Value>(overlay)? else {
            return Err(PolicyError::OverlayShape);
        };
        let mut raw = self.raw.clone();
        let Value::Object(base) = &mut raw else {
            return Err(PolicyError::OverlayShape);
        };
        for (key, value) in overlay {
            if key == "s" || key == "retry" {
                let Value::Array(entries) = value else {
                    return Err(PolicyError::OverlayShape);
                };
                let slot = base
                    .entry(key)
                    .or_insert_with(|| Value::Array(Vec::new()));
                let Value::Array(existing) = slot else {
                    return Err(PolicyError::OverlayShape);
                };
                merge_named(existing, entries)?;
            } else {
                match base.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        *self = Self::from_value(raw)?;
        Ok(())
    }
}

fn merge_named(base: &mut Vec<Value>, overlay: Vec<Value>) -> Result<(), PolicyError> {
    for entry in overlay {
        let Value::Object(named) = entry else {
            return Err(PolicyError::OverlayShape);
        };
        for (name, fields) in named {
            let existing = base
                .iter_mut()
                .find_map(|e| e.as_object_mut().and_then(|o| o.get_mut(&name)));
            match existing {
                Some(slot) => merge_value(slot, fields),
                None => {
                    let mut wrapper = Map::new();
                    wrapper.insert(name, fields);
                    base.push(Value::Object(wrapper));
                }
            }
        }
    }
    Ok(())
}

fn merge_value(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_value(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn embedded_policy_defines_all_stream_types() {
        let policy = Policy::embedded().unwrap();
        assert_eq!(policy.release(), "01234567");
        assert_eq!(policy.schema_version(), 1);
        for name in ["mintest", "mintest-ots", "respmap", CAPTIVE_PORTAL_DETECT] {
            assert!(policy.stream(name).is_some(), "missing {name}");
        }
        let mintest = policy.stream("mintest").unwrap();
        assert_eq!(mintest.header_for("uptag"), Some("X-Upload-Tag:"));
        assert_eq!(policy.retry_for(mintest).conceal, 5);
    }

    #[test]
    fn overlay_merges_fields_into_named_stream() {
        let mut policy = Policy::embedded().unwrap();
        policy
            .apply_overlay(
                r#"{"s": [{"captive_portal_detect": {"endpoint": "google.com", "http_url": "/", "port": 80}}]}"#,
            )
            .unwrap();
        let cpd = policy.stream(CAPTIVE_PORTAL_DETECT).unwrap();
        assert_eq!(cpd.endpoint, "google.com");
        assert_eq!(cpd.http_url, "/");
        // Fields the overlay does not mention survive.
        assert_eq!(cpd.http_expect, Some(204));
        assert!(cpd.http_fail_redirect);
    }

    #[test]
    fn overlay_appends_unknown_stream() {
        let mut policy = Policy::embedded().unwrap();
        policy
            .apply_overlay(r#"{"s": [{"extra": {"endpoint": "example.com", "port": 8080}}]}"#)
            .unwrap();
        assert_eq!(policy.stream("extra").unwrap().port, 8080);
        assert!(policy.stream("mintest").is_some());
    }

    #[test]
    fn rejected_overlay_leaves_policy_unchanged() {
        let mut policy = Policy::embedded().unwrap();
        assert!(matches!(
            policy.apply_overlay(r#"{"s": {"mintest": {}}}"#),
            Err(PolicyError::OverlayShape)
        ));
        assert!(matches!(
            policy.apply_overlay(r#"{"s": [{"mintest": {"retry": "nope"}}]}"#),
            Err(PolicyError::UnknownRetry { .. })
        ));
        assert!(policy.apply_overlay("not json").is_err());
        assert_eq!(policy.stream("mintest").unwrap().retry.as_deref(), Some("default"));
    }

    #[test]
    fn url_expansion_substitutes_metadata() {
        let policy = Policy::embedded().unwrap();
        let mintest = policy.stream("mintest").unwrap();
        let values = vec![("uptag".to_owned(), "myuptag123".to_owned())];
        assert_eq!(mintest.expand_url(&values), "index.html?uptag=myuptag123");
        assert_eq!(mintest.expand_url(&[]), "index.html?uptag=");
    }

    #[test]
    fn backoff_table_repeats_last_entry_and_jitters_upwards() {
        let retry = Policy::embedded()
            .unwrap()
            .retry("default")
            .cloned()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..32 {
            let first = retry.backoff_ms(0, &mut rng);
            assert!((1000..=1200).contains(&first), "{first}");
            let late = retry.backoff_ms(40, &mut rng);
            assert!((10_000..=12_000).contains(&late), "{late}");
        }
        assert!(retry.allows_retry(4));
        assert!(!retry.allows_retry(5));
    }

    #[test]
    fn success_status_follows_http_expect() {
        let policy = Policy::embedded().unwrap();
        let cpd = policy.stream(CAPTIVE_PORTAL_DETECT).unwrap();
        assert!(cpd.is_success(204));
        assert!(!cpd.is_success(200));
        let mut plain = cpd.clone();
        plain.http_expect = None;
        assert!(plain.is_success(201));
        assert!(!plain.is_success(301));
    }
}
