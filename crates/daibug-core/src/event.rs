use crate::error::CoreError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Payloads are always JSON mappings, never scalars or null.
pub type Payload = Map<String, Value>;

/// Closed set of event origins. Dev-server output is tagged by the
/// framework detector; everything else arrives tagged from the browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "vite")]
    Vite,
    #[serde(rename = "next")]
    Next,
    #[serde(rename = "devserver")]
    DevServer,
    #[serde(rename = "browser:console")]
    BrowserConsole,
    #[serde(rename = "browser:network")]
    BrowserNetwork,
    #[serde(rename = "browser:dom")]
    BrowserDom,
    #[serde(rename = "browser:storage")]
    BrowserStorage,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Vite => "vite",
            Source::Next => "next",
            Source::DevServer => "devserver",
            Source::BrowserConsole => "browser:console",
            Source::BrowserNetwork => "browser:network",
            Source::BrowserDom => "browser:dom",
            Source::BrowserStorage => "browser:storage",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = CoreError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "vite" => Ok(Source::Vite),
            "next" => Ok(Source::Next),
            "devserver" => Ok(Source::DevServer),
            "browser:console" => Ok(Source::BrowserConsole),
            "browser:network" => Ok(Source::BrowserNetwork),
            "browser:dom" => Ok(Source::BrowserDom),
            "browser:storage" => Ok(Source::BrowserStorage),
            other => Err(CoreError::InvalidKind(format!("unknown source: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
    Debug,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Debug => "debug",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = CoreError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input {
            "info" => Ok(Level::Info),
            "warn" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "debug" => Ok(Level::Debug),
            other => Err(CoreError::InvalidKind(format!("unknown level: {other}"))),
        }
    }
}

/// One observed occurrence. Immutable once constructed, except for the
/// watch engine's match annotation which happens before the event is
/// stored or broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub ts: i64,
    pub source: Source,
    pub level: Level,
    pub payload: Payload,
}

impl Event {
    /// String value of a payload field, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Integer value of a payload field, if present.
    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }
}

/// A user gesture reported by the browser. Kept in its own bounded ring,
/// never mixed into the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub ts: i64,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
}

/// Registry entry for a connected browser tab. `connected_at` is stable
/// across metadata updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabInfo {
    pub tab_id: String,
    pub url: String,
    pub title: String,
    pub connected_at: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageSnapshot {
    pub ts: i64,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<String>,
    #[serde(default)]
    pub local_storage: Map<String, Value>,
    #[serde(default)]
    pub session_storage: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<String>,
}

/// Monotonic `<prefix>_<13-digit-ms>_<3-digit-seq>` id generator.
///
/// The batching boundary for the sequence suffix is the wall-clock
/// millisecond: the suffix restarts at `_001` when the millisecond
/// advances and increments within it. If more than 999 ids land in one
/// millisecond the timestamp is bumped by 1 ms so lexicographic id order
/// always matches `ts` order.
#[derive(Debug)]
pub struct IdSequence {
    prefix: &'static str,
    last_ms: i64,
    seq: u32,
}

impl IdSequence {
    pub fn new(prefix: &'static str) -> Self {
        Self {
            prefix,
            last_ms: 0,
            seq: 0,
        }
    }

    pub fn next(&mut self) -> (String, i64) {
        self.next_at(Utc::now().timestamp_millis())
    }

    /// Produce the next id as of `now_ms`. The clock is never allowed to
    /// run backwards relative to previously issued ids.
    pub fn next_at(&mut self, now_ms: i64) -> (String, i64) {
        let mut ms = now_ms.max(self.last_ms);
        if ms == self.last_ms {
            self.seq += 1;
            if self.seq > 999 {
                ms += 1;
                self.seq = 1;
            }
        } else {
            self.seq = 1;
        }
        self.last_ms = ms;
        let id = format!("{}_{:013}_{:03}", self.prefix, ms, self.seq);
        (id, ms)
    }
}

/// Builds events with validated kinds and monotonic ids. One factory per
/// hub; event construction is serialized on the hub's ingestion path.
#[derive(Debug)]
pub struct EventFactory {
    ids: IdSequence,
}

impl EventFactory {
    pub fn new() -> Self {
        Self {
            ids: IdSequence::new("evt"),
        }
    }

    /// Construct an event from already-typed parts.
    pub fn create(&mut self, source: Source, level: Level, payload: Payload) -> Event {
        let (id, ts) = self.ids.next();
        Event {
            id,
            ts,
            source,
            level,
            payload,
        }
    }

    /// Construct an event from wire strings and an arbitrary JSON value,
    /// rejecting anything outside the closed model.
    pub fn create_raw(
        &mut self,
        source: &str,
        level: &str,
        payload: Value,
    ) -> Result<Event, CoreError> {
        let source = Source::from_str(source)?;
        let level = Level::from_str(level)?;
        let payload = match payload {
            Value::Object(map) => map,
            other => {
                return Err(CoreError::InvalidKind(format!(
                    "payload must be a mapping, got {other}"
                )))
            }
        };
        Ok(self.create(source, level, payload))
    }
}

impl Default for EventFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn id_sequence_increments_within_one_millisecond() {
        let mut ids = IdSequence::new("evt");
        let (first, ts1) = ids.next_at(1_700_000_000_123);
        let (second, ts2) = ids.next_at(1_700_000_000_123);
        assert_eq!(first, "evt_1700000000123_001");
        assert_eq!(second, "evt_1700000000123_002");
        assert_eq!(ts1, ts2);
    }

    #[test]
    fn id_sequence_resets_when_the_millisecond_advances() {
        let mut ids = IdSequence::new("evt");
        ids.next_at(1_700_000_000_123);
        ids.next_at(1_700_000_000_123);
        let (third, _) = ids.next_at(1_700_000_000_124);
        assert_eq!(third, "evt_1700000000124_001");
    }

    #[test]
    fn id_sequence_never_runs_backwards() {
        let mut ids = IdSequence::new("evt");
        let (_, ts1) = ids.next_at(1_700_000_000_500);
        let (id, ts2) = ids.next_at(1_700_000_000_400);
        assert!(ts2 >= ts1);
        assert_eq!(id, "evt_1700000000500_002");
    }

    #[test]
    fn id_sequence_overflow_bumps_the_timestamp() {
        let mut ids = IdSequence::new("evt");
        for _ in 0..999 {
            ids.next_at(1_700_000_000_000);
        }
        let (overflowed, ts) = ids.next_at(1_700_000_000_000);
        assert_eq!(overflowed, "evt_1700000000001_001");
        assert_eq!(ts, 1_700_000_000_001);
    }

    #[test]
    fn consecutive_ids_sort_lexicographically() {
        let mut ids = IdSequence::new("evt");
        let mut previous = String::new();
        for now in [1_000, 1_000, 1_000, 1_001, 2_000] {
            let (id, _) = ids.next_at(now);
            assert!(id > previous, "{id} should sort after {previous}");
            previous = id;
        }
    }

    #[test]
    fn create_raw_accepts_every_known_kind() {
        let mut factory = EventFactory::new();
        for source in [
            "vite",
            "next",
            "devserver",
            "browser:console",
            "browser:network",
            "browser:dom",
            "browser:storage",
        ] {
            for level in ["info", "warn", "error", "debug"] {
                let event = factory
                    .create_raw(source, level, json!({"message": "hi"}))
                    .expect("valid kind");
                assert_eq!(event.source.as_str(), source);
                assert_eq!(event.level.as_str(), level);
            }
        }
    }

    #[test]
    fn create_raw_rejects_unknown_kinds_and_scalar_payloads() {
        let mut factory = EventFactory::new();
        assert!(matches!(
            factory.create_raw("webpack", "info", json!({})),
            Err(CoreError::InvalidKind(_))
        ));
        assert!(matches!(
            factory.create_raw("vite", "fatal", json!({})),
            Err(CoreError::InvalidKind(_))
        ));
        assert!(matches!(
            factory.create_raw("vite", "info", json!("not a map")),
            Err(CoreError::InvalidKind(_))
        ));
        assert!(matches!(
            factory.create_raw("vite", "info", Value::Null),
            Err(CoreError::InvalidKind(_))
        ));
    }

    #[test]
    fn event_ids_match_the_documented_shape() {
        let mut factory = EventFactory::new();
        let event = factory
            .create_raw("vite", "info", json!({"message": "ready"}))
            .expect("valid event");
        let re = regex::Regex::new(r"^evt_\d{13}_\d{3}$").expect("id regex");
        assert!(re.is_match(&event.id), "unexpected id shape: {}", event.id);
    }

    #[test]
    fn event_serializes_with_wire_field_names() {
        let mut factory = EventFactory::new();
        let event = factory
            .create_raw("browser:network", "warn", json!({"url": "/api"}))
            .expect("valid event");
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["source"], "browser:network");
        assert_eq!(value["level"], "warn");
        assert_eq!(value["payload"]["url"], "/api");
    }
}
