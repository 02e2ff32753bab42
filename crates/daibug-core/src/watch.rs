use crate::error::CoreError;
use crate::event::{Event, IdSequence, Level, Payload, Source};
use crate::glob::GlobMatcher;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

const WATCHED_CAPACITY: usize = 200;

/// Predicate fields of a watch rule. Unspecified conditions are satisfied
/// by every event; a rule needs at least one specified condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_codes: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub levels: Option<Vec<Level>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_contains: Option<Payload>,
}

impl WatchConditions {
    pub fn is_empty(&self) -> bool {
        self.status_codes.is_none()
            && self.url_pattern.is_none()
            && self.methods.is_none()
            && self.levels.is_none()
            && self.message_contains.is_none()
            && self.payload_contains.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRule {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    pub conditions: WatchConditions,
    pub created_at: i64,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRule {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchedEvent {
    pub event: Event,
    pub matched_rule: MatchedRule,
    pub matched_at: i64,
}

/// Holds watch rules and a newest-first buffer of matched events.
///
/// The engine sees every event the hub ingests; a match annotates the
/// event payload so downstream consumers can see what fired.
#[derive(Debug)]
pub struct WatchEngine {
    rules: Vec<WatchRule>,
    matched: VecDeque<WatchedEvent>,
    ids: IdSequence,
}

impl WatchEngine {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            matched: VecDeque::new(),
            ids: IdSequence::new("rule"),
        }
    }

    pub fn add_rule(
        &mut self,
        label: &str,
        source: Option<Source>,
        conditions: WatchConditions,
    ) -> Result<WatchRule, CoreError> {
        if label.trim().is_empty() {
            return Err(CoreError::InvalidFormat(
                "watch rule label must not be empty".into(),
            ));
        }
        if conditions.is_empty() {
            return Err(CoreError::InvalidFormat(
                "watch rule needs at least one condition".into(),
            ));
        }
        if let Some(pattern) = &conditions.url_pattern {
            GlobMatcher::new(pattern)?;
        }
        let (id, created_at) = self.ids.next();
        let rule = WatchRule {
            id,
            label: label.to_string(),
            source,
            conditions,
            created_at,
            active: true,
        };
        self.rules.push(rule.clone());
        Ok(rule)
    }

    pub fn remove_rule(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        self.rules.len() != before
    }

    pub fn rules(&self) -> Vec<WatchRule> {
        self.rules.clone()
    }

    /// Newest first, capped at 200.
    pub fn matched(&self) -> Vec<WatchedEvent> {
        self.matched.iter().cloned().collect()
    }

    pub fn clear_matched(&mut self) {
        self.matched.clear();
    }

    /// Evaluate one event against every active rule, newest matches first.
    ///
    /// On a match the event payload is annotated with `watched`,
    /// `watchRuleLabel`, and `watchRuleId`; the returned entries are the
    /// ones inserted into the buffer, for callers that mirror it.
    pub fn evaluate(&mut self, event: &mut Event) -> Vec<WatchedEvent> {
        let now = Utc::now().timestamp_millis();
        let mut inserted = Vec::new();
        for rule in &self.rules {
            if !rule.active {
                continue;
            }
            if let Some(source) = rule.source {
                if source != event.source {
                    continue;
                }
            }
            if !conditions_match(&rule.conditions, event) {
                continue;
            }
            event
                .payload
                .insert("watched".into(), Value::Bool(true));
            event
                .payload
                .insert("watchRuleLabel".into(), Value::String(rule.label.clone()));
            event
                .payload
                .insert("watchRuleId".into(), Value::String(rule.id.clone()));
            let entry = WatchedEvent {
                event: event.clone(),
                matched_rule: MatchedRule {
                    id: rule.id.clone(),
                    label: rule.label.clone(),
                },
                matched_at: now,
            };
            self.matched.push_front(entry.clone());
            inserted.push(entry);
        }
        self.matched.truncate(WATCHED_CAPACITY);
        inserted
    }
}

impl Default for WatchEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn conditions_match(conditions: &WatchConditions, event: &Event) -> bool {
    if let Some(codes) = &conditions.status_codes {
        match event.payload_i64("status") {
            Some(status) if codes.contains(&status) => {}
            _ => return false,
        }
    }
    if let Some(pattern) = &conditions.url_pattern {
        let matched = match (GlobMatcher::new(pattern), event.payload_str("url")) {
            (Ok(matcher), Some(url)) => matcher.matches_url(url),
            _ => false,
        };
        if !matched {
            return false;
        }
    }
    if let Some(methods) = &conditions.methods {
        match event.payload_str("method") {
            Some(method) => {
                let upper = method.to_uppercase();
                if !methods.iter().any(|m| m.to_uppercase() == upper) {
                    return false;
                }
            }
            None => return false,
        }
    }
    if let Some(levels) = &conditions.levels {
        if !levels.contains(&event.level) {
            return false;
        }
    }
    if let Some(needle) = &conditions.message_contains {
        match event.payload_str("message") {
            Some(message)
                if message.to_lowercase().contains(&needle.to_lowercase()) => {}
            _ => return false,
        }
    }
    if let Some(expected) = &conditions.payload_contains {
        for (key, want) in expected {
            match event.payload.get(key) {
                Some(have) if partial_match(want, have) => {}
                _ => return false,
            }
        }
    }
    true
}

/// Structural partial match: scalars by equality, arrays by index-wise
/// prefix, mappings recursively.
fn partial_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|a| partial_match(v, a))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() <= have.len()
                && want
                    .iter()
                    .zip(have.iter())
                    .all(|(w, h)| partial_match(w, h))
        }
        (want, have) => want == have,
    }
}
