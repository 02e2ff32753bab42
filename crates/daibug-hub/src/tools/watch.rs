use super::{arg_str, clamp_limit, error_value, FieldKind, FieldSpec, InputSchema, Tool};
use crate::hub::Hub;
use async_trait::async_trait;
use daibug_core::event::{Level, Source};
use daibug_core::watch::WatchConditions;
use serde_json::{json, Map, Value};
use std::sync::Arc;

const WATCHED_DEFAULT_LIMIT: usize = 200;
const WATCHED_MAX_LIMIT: usize = 200;

pub struct AddWatchRule {
    hub: Arc<Hub>,
}

impl AddWatchRule {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

/// Translate snake_case tool arguments into rule conditions.
fn conditions_from_args(args: &Map<String, Value>) -> Result<WatchConditions, String> {
    let status_codes = match args.get("status_codes") {
        Some(Value::Array(items)) => {
            let mut codes = Vec::with_capacity(items.len());
            for item in items {
                match item.as_i64() {
                    Some(code) => codes.push(code),
                    None => return Err("status_codes must contain integers".into()),
                }
            }
            Some(codes)
        }
        _ => None,
    };
    let methods = match args.get("methods") {
        Some(Value::Array(items)) => {
            let mut methods = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(method) => methods.push(method.to_string()),
                    None => return Err("methods must contain strings".into()),
                }
            }
            Some(methods)
        }
        _ => None,
    };
    let levels = match args.get("levels") {
        Some(Value::Array(items)) => {
            let mut levels = Vec::with_capacity(items.len());
            for item in items {
                let Some(raw) = item.as_str() else {
                    return Err("levels must contain strings".into());
                };
                match raw.parse::<Level>() {
                    Ok(level) => levels.push(level),
                    Err(err) => return Err(err.to_string()),
                }
            }
            Some(levels)
        }
        _ => None,
    };
    let payload_contains = match args.get("payload_contains") {
        Some(Value::Object(map)) => Some(map.clone()),
        _ => None,
    };

    Ok(WatchConditions {
        status_codes,
        url_pattern: arg_str(args, "url_pattern").map(|s| s.to_string()),
        methods,
        levels,
        message_contains: arg_str(args, "message_contains").map(|s| s.to_string()),
        payload_contains,
    })
}

#[async_trait]
impl Tool for AddWatchRule {
    fn name(&self) -> &'static str {
        "add_watch_rule"
    }

    fn description(&self) -> &'static str {
        "Add a watch rule; matching events land in the watched-event buffer"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec {
                name: "label",
                kind: FieldKind::String,
                required: true,
                description: "human-readable rule label",
            },
            FieldSpec {
                name: "source",
                kind: FieldKind::String,
                required: false,
                description: "restrict to one source tag",
            },
            FieldSpec {
                name: "status_codes",
                kind: FieldKind::Array,
                required: false,
                description: "HTTP status codes to match",
            },
            FieldSpec {
                name: "url_pattern",
                kind: FieldKind::String,
                required: false,
                description: "URL glob, * and ** supported",
            },
            FieldSpec {
                name: "methods",
                kind: FieldKind::Array,
                required: false,
                description: "HTTP methods to match (case-insensitive)",
            },
            FieldSpec {
                name: "levels",
                kind: FieldKind::Array,
                required: false,
                description: "event levels to match",
            },
            FieldSpec {
                name: "message_contains",
                kind: FieldKind::String,
                required: false,
                description: "case-insensitive message substring",
            },
            FieldSpec {
                name: "payload_contains",
                kind: FieldKind::Object,
                required: false,
                description: "structural partial match on the payload",
            },
        ])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let Some(label) = arg_str(args, "label") else {
            return error_value("missing required field: label");
        };
        let source = match arg_str(args, "source") {
            Some(raw) => match raw.parse::<Source>() {
                Ok(source) => Some(source),
                Err(err) => return error_value(err.to_string()),
            },
            None => None,
        };
        let conditions = match conditions_from_args(args) {
            Ok(conditions) => conditions,
            Err(message) => return error_value(message),
        };
        if conditions.is_empty() {
            return error_value("at least one condition is required");
        }
        match self.hub.add_watch_rule(label, source, conditions).await {
            Ok(rule) => json!({"rule": rule}),
            Err(err) => error_value(err.to_string()),
        }
    }
}

pub struct RemoveWatchRule {
    hub: Arc<Hub>,
}

impl RemoveWatchRule {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for RemoveWatchRule {
    fn name(&self) -> &'static str {
        "remove_watch_rule"
    }

    fn description(&self) -> &'static str {
        "Remove a watch rule by id"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![FieldSpec {
            name: "rule_id",
            kind: FieldKind::String,
            required: true,
            description: "id returned by add_watch_rule",
        }])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let Some(rule_id) = arg_str(args, "rule_id") else {
            return error_value("missing required field: rule_id");
        };
        if self.hub.remove_watch_rule(rule_id).await {
            json!({"removed": true, "ruleId": rule_id})
        } else {
            error_value(format!("no watch rule with id {rule_id}"))
        }
    }
}

pub struct ListWatchRules {
    hub: Arc<Hub>,
}

impl ListWatchRules {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for ListWatchRules {
    fn name(&self) -> &'static str {
        "list_watch_rules"
    }

    fn description(&self) -> &'static str {
        "List all watch rules"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::default()
    }

    async fn call(&self, _args: &Map<String, Value>) -> Value {
        json!({"rules": self.hub.watch_rules().await})
    }
}

pub struct GetWatchedEvents {
    hub: Arc<Hub>,
}

impl GetWatchedEvents {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for GetWatchedEvents {
    fn name(&self) -> &'static str {
        "get_watched_events"
    }

    fn description(&self) -> &'static str {
        "Read matched events, newest first, optionally for one rule"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec {
                name: "limit",
                kind: FieldKind::Integer,
                required: false,
                description: "max entries to return (cap 200)",
            },
            FieldSpec {
                name: "rule_id",
                kind: FieldKind::String,
                required: false,
                description: "only matches for this rule",
            },
        ])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let limit = clamp_limit(args, WATCHED_DEFAULT_LIMIT, WATCHED_MAX_LIMIT);
        let rule_id = arg_str(args, "rule_id").map(|s| s.to_string());
        let mut watched = self.hub.watched_events().await;
        if let Some(rule_id) = &rule_id {
            watched.retain(|w| &w.matched_rule.id == rule_id);
        }
        watched.truncate(limit);
        json!({"events": watched, "total": watched.len()})
    }
}

pub struct ClearWatchedEvents {
    hub: Arc<Hub>,
}

impl ClearWatchedEvents {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for ClearWatchedEvents {
    fn name(&self) -> &'static str {
        "clear_watched_events"
    }

    fn description(&self) -> &'static str {
        "Empty the watched-event buffer"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::default()
    }

    async fn call(&self, _args: &Map<String, Value>) -> Value {
        self.hub.clear_watched_events().await;
        json!({"cleared": true})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daibug_core::config::Config;

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
    async fn add_translates_snake_case_fields_into_conditions() {
        let hub = hub();
        let tool = AddWatchRule::new(hub.clone());
        let out = tool
            .call(&args(json!({
                "label": "auth failures",
                "source": "browser:network",
                "status_codes": [401, 403],
                "url_pattern": "/api/**",
                "methods": ["post"],
            })))
            .await;
        let rule = &out["rule"];
        assert_eq!(rule["label"], "auth failures");
        assert_eq!(rule["source"], "browser:network");
        assert_eq!(rule["conditions"]["statusCodes"], json!([401, 403]));
        assert_eq!(rule["conditions"]["urlPattern"], "/api/**");
        assert_eq!(rule["active"], true);

        let rules = hub.watch_rules().await;
        assert_eq!(rules.len(), 1);
    }

    #[tokio::test]
    async fn add_requires_a_label_and_a_condition() {
        let hub = hub();
        let tool = AddWatchRule::new(hub.clone());

        let out = tool.call(&args(json!({"label": "bare"}))).await;
        assert_eq!(out["error"], "at least one condition is required");

        let out = tool
            .call(&args(json!({"label": "x", "status_codes": ["not a code"]})))
            .await;
        assert!(out["error"].as_str().expect("error").contains("integers"));

        // No side effects from failed calls.
        assert!(hub.watch_rules().await.is_empty());
    }

    #[tokio::test]
    async fn remove_reports_missing_rules_as_errors() {
        let hub = hub();
        let add = AddWatchRule::new(hub.clone());
        let out = add
            .call(&args(json!({"label": "r", "status_codes": [500]})))
            .await;
        let rule_id = out["rule"]["id"].as_str().expect("rule id").to_string();

        let remove = RemoveWatchRule::new(hub.clone());
        let out = remove.call(&args(json!({"rule_id": rule_id}))).await;
        assert_eq!(out["removed"], true);

        let out = remove.call(&args(json!({"rule_id": "rule_gone"}))).await;
        assert!(out["error"].as_str().expect("error").contains("rule_gone"));
    }

    #[tokio::test]
    async fn watched_events_filter_by_rule_and_clear() {
        let hub = hub();
        let first = hub
            .add_watch_rule(
                "errors",
                None,
                WatchConditions {
                    levels: Some(vec![Level::Error]),
                    ..Default::default()
                },
            )
            .await
            .expect("rule");
        hub.add_watch_rule(
            "server errors",
            None,
            WatchConditions {
                status_codes: Some(vec![500]),
                ..Default::default()
            },
        )
        .await
        .expect("rule");

        hub.ingest_browser_event(
            "browser:network",
            "error",
            json!({"status": 500, "url": "/x"}),
        )
        .await
        .expect("ingest");

        let tool = GetWatchedEvents::new(hub.clone());
        let out = tool.call(&Map::new()).await;
        assert_eq!(out["total"], 2);

        let out = tool.call(&args(json!({"rule_id": first.id}))).await;
        assert_eq!(out["total"], 1);
        assert_eq!(out["events"][0]["matchedRule"]["label"], "errors");

        let clear = ClearWatchedEvents::new(hub.clone());
        let out = clear.call(&Map::new()).await;
        assert_eq!(out["cleared"], true);
        assert!(hub.watched_events().await.is_empty());
    }

    #[tokio::test]
    async fn list_returns_defensive_copies() {
        let hub = hub();
        hub.add_watch_rule(
            "r",
            None,
            WatchConditions {
                message_contains: Some("x".into()),
                ..Default::default()
            },
        )
        .await
        .expect("rule");
        let tool = ListWatchRules::new(hub.clone());
        let out = tool.call(&Map::new()).await;
        assert_eq!(out["rules"].as_array().expect("rules").len(), 1);
    }
}
