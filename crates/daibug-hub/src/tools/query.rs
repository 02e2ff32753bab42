use super::{arg_bool, arg_i64, arg_str, clamp_limit, error_value, FieldKind, FieldSpec, InputSchema, Tool};
use crate::hub::Hub;
use async_trait::async_trait;
use chrono::Utc;
use daibug_core::event::{Event, Level, Source};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};

const EVENTS_DEFAULT_LIMIT: usize = 50;
const EVENTS_MAX_LIMIT: usize = 500;
const INTERACTIONS_DEFAULT_LIMIT: usize = 50;
const INTERACTIONS_MAX_LIMIT: usize = 200;

pub struct GetEvents {
    hub: Arc<Hub>,
}

impl GetEvents {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for GetEvents {
    fn name(&self) -> &'static str {
        "get_events"
    }

    fn description(&self) -> &'static str {
        "Read recent events from the hub, optionally filtered by source, level, timestamp, or tab"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec {
                name: "source",
                kind: FieldKind::String,
                required: false,
                description: "exact source tag, e.g. browser:console",
            },
            FieldSpec {
                name: "level",
                kind: FieldKind::String,
                required: false,
                description: "exact level: info, warn, error, debug",
            },
            FieldSpec {
                name: "since",
                kind: FieldKind::Integer,
                required: false,
                description: "only events with ts >= since (epoch ms)",
            },
            FieldSpec {
                name: "tab_id",
                kind: FieldKind::String,
                required: false,
                description: "keep events without a tabId or with this tabId",
            },
            FieldSpec {
                name: "limit",
                kind: FieldKind::Integer,
                required: false,
                description: "max events to return (default 50, cap 500)",
            },
        ])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let source = match arg_str(args, "source") {
            Some(raw) => match raw.parse::<Source>() {
                Ok(source) => Some(source),
                Err(err) => return error_value(err.to_string()),
            },
            None => None,
        };
        let level = match arg_str(args, "level") {
            Some(raw) => match raw.parse::<Level>() {
                Ok(level) => Some(level),
                Err(err) => return error_value(err.to_string()),
            },
            None => None,
        };
        let since = arg_i64(args, "since");
        let tab_id = arg_str(args, "tab_id").map(|s| s.to_string());
        let limit = clamp_limit(args, EVENTS_DEFAULT_LIMIT, EVENTS_MAX_LIMIT);

        let mut events = self.hub.events_snapshot().await;
        if let Some(source) = source {
            events.retain(|e| e.source == source);
        }
        if let Some(level) = level {
            events.retain(|e| e.level == level);
        }
        if let Some(since) = since {
            events.retain(|e| e.ts >= since);
        }
        if let Some(tab_id) = &tab_id {
            events.retain(|e| match e.payload_str("tabId") {
                Some(event_tab) => event_tab == tab_id,
                None => true,
            });
        }
        let total = events.len();
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        json!({"events": events, "total": total})
    }
}

/// Network-log reader with a per-tool advancing cursor: each call only
/// returns events newer than the last event it handed out.
pub struct GetNetworkLog {
    hub: Arc<Hub>,
    cursor: Mutex<i64>,
}

impl GetNetworkLog {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            cursor: Mutex::new(0),
        }
    }
}

fn is_successful(event: &Event) -> bool {
    event
        .payload_i64("status")
        .is_some_and(|status| (200..400).contains(&status))
}

#[async_trait]
impl Tool for GetNetworkLog {
    fn name(&self) -> &'static str {
        "get_network_log"
    }

    fn description(&self) -> &'static str {
        "Read network events newer than the previous call, split by success (status 200-399)"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec {
                name: "include_successful",
                kind: FieldKind::Boolean,
                required: false,
                description: "include requests with status 200-399 (default true)",
            },
            FieldSpec {
                name: "include_failed",
                kind: FieldKind::Boolean,
                required: false,
                description: "include everything else (default true)",
            },
        ])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let include_successful = arg_bool(args, "include_successful").unwrap_or(true);
        let include_failed = arg_bool(args, "include_failed").unwrap_or(true);

        let after = *self.cursor.lock().expect("network log cursor");
        let events: Vec<Event> = self
            .hub
            .events_snapshot()
            .await
            .into_iter()
            .filter(|e| e.source == Source::BrowserNetwork)
            .filter(|e| e.ts > after)
            .filter(|e| {
                if is_successful(e) {
                    include_successful
                } else {
                    include_failed
                }
            })
            .collect();

        if let Some(newest) = events.iter().map(|e| e.ts).max() {
            *self.cursor.lock().expect("network log cursor") = newest;
        }
        json!({"events": events, "total": events.len()})
    }
}

pub struct ReplayInteractions {
    hub: Arc<Hub>,
}

impl ReplayInteractions {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for ReplayInteractions {
    fn name(&self) -> &'static str {
        "replay_interactions"
    }

    fn description(&self) -> &'static str {
        "Read recorded user interactions in the order they happened"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![FieldSpec {
            name: "limit",
            kind: FieldKind::Integer,
            required: false,
            description: "max interactions to return (default 50, cap 200)",
        }])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let limit = clamp_limit(args, INTERACTIONS_DEFAULT_LIMIT, INTERACTIONS_MAX_LIMIT);
        let mut interactions = self.hub.interactions_snapshot().await;
        let total = interactions.len();
        if interactions.len() > limit {
            interactions.drain(..interactions.len() - limit);
        }
        json!({"interactions": interactions, "total": total})
    }
}

pub struct ClearEvents {
    hub: Arc<Hub>,
}

impl ClearEvents {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for ClearEvents {
    fn name(&self) -> &'static str {
        "clear_events"
    }

    fn description(&self) -> &'static str {
        "Empty the event ring"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::default()
    }

    async fn call(&self, _args: &Map<String, Value>) -> Value {
        self.hub.clear_events().await;
        json!({"cleared": true, "timestamp": Utc::now().timestamp_millis()})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daibug_core::config::Config;
    use serde_json::json;

    fn hub() -> Arc<Hub> {
        Hub::new(Config::default(), "echo dev".into())
    }

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn get_events_filters_by_source_level_and_tab() {
        let hub = hub();
        hub.ingest_browser_event("browser:console", "error", json!({"message": "boom"}))
            .await
            .expect("ingest");
        hub.ingest_browser_event(
            "browser:network",
            "info",
            json!({"status": 200, "url": "/a", "tabId": "tab-1"}),
        )
        .await
        .expect("ingest");
        hub.ingest_browser_event(
            "browser:network",
            "info",
            json!({"status": 200, "url": "/b", "tabId": "tab-2"}),
        )
        .await
        .expect("ingest");

        let tool = GetEvents::new(hub.clone());
        let out = tool
            .call(&args(json!({"source": "browser:network"})))
            .await;
        assert_eq!(out["total"], 2);

        let out = tool.call(&args(json!({"level": "error"}))).await;
        assert_eq!(out["total"], 1);
        assert_eq!(out["events"][0]["payload"]["message"], "boom");

        // tab filter keeps tabless events plus the matching tab.
        let out = tool.call(&args(json!({"tab_id": "tab-1"}))).await;
        assert_eq!(out["total"], 2);

        let out = tool.call(&args(json!({"source": "smoke-signals"}))).await;
        assert!(out["error"].as_str().expect("error").contains("source"));
    }

    #[tokio::test]
    async fn get_events_limit_defaults_to_50_and_caps_at_500() {
        let hub = hub();
        for n in 0..80 {
            hub.ingest_browser_event("browser:console", "info", json!({"index": n}))
                .await
                .expect("ingest");
        }
        let tool = GetEvents::new(hub.clone());
        let out = tool.call(&Map::new()).await;
        assert_eq!(out["events"].as_array().expect("events").len(), 50);
        assert_eq!(out["total"], 80);
        // The last 50, not the first.
        assert_eq!(out["events"][0]["payload"]["index"], 30);

        let out = tool.call(&args(json!({"limit": 10_000}))).await;
        assert_eq!(out["events"].as_array().expect("events").len(), 80);
    }

    #[tokio::test]
    async fn network_log_cursor_advances_per_call() {
        let hub = hub();
        hub.ingest_browser_event(
            "browser:network",
            "info",
            json!({"status": 200, "url": "/one"}),
        )
        .await
        .expect("ingest");

        let tool = GetNetworkLog::new(hub.clone());
        let first = tool.call(&Map::new()).await;
        assert_eq!(first["total"], 1);

        // Nothing new: empty result, cursor unchanged.
        let second = tool.call(&Map::new()).await;
        assert_eq!(second["total"], 0);

        // The cursor is strictly-greater-than; move past the first event's
        // millisecond before ingesting the next one.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        hub.ingest_browser_event(
            "browser:network",
            "error",
            json!({"status": 500, "url": "/two"}),
        )
        .await
        .expect("ingest");
        let third = tool.call(&Map::new()).await;
        assert_eq!(third["total"], 1);
        assert_eq!(third["events"][0]["payload"]["url"], "/two");
    }

    #[tokio::test]
    async fn network_log_success_split_is_by_status_range() {
        let hub = hub();
        for (status, url) in [(200, "/ok"), (302, "/redirect"), (404, "/missing"), (500, "/err")] {
            hub.ingest_browser_event(
                "browser:network",
                "info",
                json!({"status": status, "url": url}),
            )
            .await
            .expect("ingest");
        }
        // An event with no status counts as failed.
        hub.ingest_browser_event("browser:network", "info", json!({"url": "/pending"}))
            .await
            .expect("ingest");

        let tool = GetNetworkLog::new(hub.clone());
        let out = tool
            .call(&args(json!({"include_failed": false})))
            .await;
        let urls: Vec<&str> = out["events"]
            .as_array()
            .expect("events")
            .iter()
            .map(|e| e["payload"]["url"].as_str().expect("url"))
            .collect();
        assert_eq!(urls, vec!["/ok", "/redirect"]);

        let tool = GetNetworkLog::new(hub.clone());
        let out = tool
            .call(&args(json!({"include_successful": false})))
            .await;
        let urls: Vec<&str> = out["events"]
            .as_array()
            .expect("events")
            .iter()
            .map(|e| e["payload"]["url"].as_str().expect("url"))
            .collect();
        assert_eq!(urls, vec!["/missing", "/err", "/pending"]);
    }

    #[tokio::test]
    async fn replay_interactions_returns_the_ring() {
        let hub = hub();
        for n in 0..3 {
            hub.ingest_interaction(
                "click".into(),
                Some(format!("#button-{n}")),
                None,
                None,
                None,
                None,
            )
            .await;
        }
        let tool = ReplayInteractions::new(hub.clone());
        let out = tool.call(&args(json!({"limit": 2}))).await;
        assert_eq!(out["total"], 3);
        let list = out["interactions"].as_array().expect("interactions");
        assert_eq!(list.len(), 2);
        assert_eq!(list[1]["target"], "#button-2");
    }

    #[tokio::test]
    async fn clear_events_empties_the_ring() {
        let hub = hub();
        hub.ingest_browser_event("browser:console", "info", json!({"message": "x"}))
            .await
            .expect("ingest");
        let tool = ClearEvents::new(hub.clone());
        let out = tool.call(&Map::new()).await;
        assert_eq!(out["cleared"], true);
        assert!(out["timestamp"].is_i64());
        assert!(hub.events_snapshot().await.is_empty());
    }
}
