use crate::event::{Event, Source};
use crate::glob::GlobMatcher;
use serde_json::{Map, Value};

pub const REDACTED: &str = "[REDACTED]";
pub const REDACTED_ENDPOINT: &str = "[REDACTED - sensitive endpoint]";

/// Replaces sensitive values before events are stored or broadcast.
///
/// Field matching is case-insensitive on the key name and walks nested
/// mappings and arrays. Inputs are never mutated; every redaction works on
/// a deep clone.
#[derive(Debug, Clone)]
pub struct Redactor {
    fields: Vec<String>,
    url_patterns: Vec<GlobMatcher>,
}

impl Redactor {
    /// Invalid URL patterns are skipped rather than failing construction;
    /// config validation reports them separately.
    pub fn new(fields: &[String], url_patterns: &[String]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_lowercase()).collect(),
            url_patterns: url_patterns
                .iter()
                .filter_map(|p| GlobMatcher::new(p).ok())
                .collect(),
        }
    }

    pub fn is_sensitive_field(&self, key: &str) -> bool {
        let lower = key.to_lowercase();
        self.fields.iter().any(|f| *f == lower)
    }

    pub fn is_sensitive_url(&self, url: &str) -> bool {
        self.url_patterns.iter().any(|p| p.matches_url(url))
    }

    /// Produce the redacted form of an event. The original is untouched.
    pub fn redact_event(&self, event: &Event) -> Event {
        let mut payload = self.redact_map(&event.payload);

        match event.source {
            Source::BrowserNetwork => {
                let sensitive = payload
                    .get("url")
                    .and_then(Value::as_str)
                    .is_some_and(|url| self.is_sensitive_url(url));
                if sensitive {
                    payload.insert("requestBody".into(), Value::String(REDACTED_ENDPOINT.into()));
                    payload.insert("responseBody".into(), Value::String(REDACTED_ENDPOINT.into()));
                }
            }
            Source::BrowserStorage => {
                let sensitive_key = payload
                    .get("key")
                    .and_then(Value::as_str)
                    .is_some_and(|key| self.is_sensitive_field(key));
                if sensitive_key {
                    payload.insert("value".into(), Value::String(REDACTED.into()));
                    if payload.contains_key("previousValue") {
                        payload.insert("previousValue".into(), Value::String(REDACTED.into()));
                    }
                }
            }
            _ => {}
        }

        Event {
            id: event.id.clone(),
            ts: event.ts,
            source: event.source,
            level: event.level,
            payload,
        }
    }

    /// Redact a storage key/value mapping, keeping non-sensitive entries.
    pub fn redact_storage_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                if self.is_sensitive_field(key) {
                    (key.clone(), Value::String(REDACTED.into()))
                } else {
                    (key.clone(), value.clone())
                }
            })
            .collect()
    }

    fn redact_map(&self, map: &Map<String, Value>) -> Map<String, Value> {
        map.iter()
            .map(|(key, value)| {
                if self.is_sensitive_field(key) {
                    (key.clone(), Value::String(REDACTED.into()))
                } else {
                    (key.clone(), self.redact_value(value))
                }
            })
            .collect()
    }

    fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.redact_map(map)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|v| self.redact_value(v)).collect())
            }
            other => other.clone(),
        }
    }
}
