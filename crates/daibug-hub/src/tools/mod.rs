//! Agent-facing tool surface. Every tool is self-documenting (name,
//! description, input schema) and returns a single JSON fragment; failures
//! come back as `{"error": …}` payloads, never as panics or transport
//! errors.

mod command;
mod query;
mod session;
mod watch;

use crate::hub::Hub;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Declared type of one schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    fn type_name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub description: &'static str,
}

/// Declarative input schema: an object with named optional/required fields.
#[derive(Debug, Clone, Default)]
pub struct InputSchema {
    pub fields: Vec<FieldSpec>,
}

impl InputSchema {
    pub fn new(fields: Vec<FieldSpec>) -> Self {
        Self { fields }
    }

    pub fn to_json(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            properties.insert(
                field.name.to_string(),
                json!({
                    "type": field.kind.type_name(),
                    "description": field.description,
                }),
            );
            if field.required {
                required.push(Value::String(field.name.to_string()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Check presence and types. Required strings must be non-empty.
    pub fn validate(&self, args: &Map<String, Value>) -> Result<(), String> {
        for field in &self.fields {
            match args.get(field.name) {
                None | Some(Value::Null) => {
                    if field.required {
                        return Err(format!("missing required field: {}", field.name));
                    }
                }
                Some(value) => {
                    if !field.kind.accepts(value) {
                        return Err(format!(
                            "field {} must be a {}",
                            field.name,
                            field.kind.type_name()
                        ));
                    }
                    if field.required && field.kind == FieldKind::String {
                        if value.as_str().is_some_and(|s| s.trim().is_empty()) {
                            return Err(format!("field {} must not be empty", field.name));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn schema(&self) -> InputSchema;
    /// Produce the tool's JSON payload. Failures are `{"error": …}` values.
    async fn call(&self, args: &Map<String, Value>) -> Value;
}

pub fn error_value(message: impl Into<String>) -> Value {
    json!({"error": message.into()})
}

/// What the hub exposes; the registry is built from this at startup.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    pub watch: bool,
    pub session: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            watch: true,
            session: true,
        }
    }
}

pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Build the registry over a hub, gated by its capabilities.
    pub fn for_hub(hub: Arc<Hub>) -> Self {
        Self::with_capabilities(hub, Capabilities::default())
    }

    pub fn with_capabilities(hub: Arc<Hub>, capabilities: Capabilities) -> Self {
        let mut tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(query::GetEvents::new(hub.clone())),
            Arc::new(query::GetNetworkLog::new(hub.clone())),
            Arc::new(query::ReplayInteractions::new(hub.clone())),
            Arc::new(query::ClearEvents::new(hub.clone())),
            Arc::new(command::SnapshotDom::new(hub.clone())),
            Arc::new(command::GetComponentState::new(hub.clone())),
            Arc::new(command::CaptureStorage::new(hub.clone())),
            Arc::new(command::EvaluateInBrowser::new(hub.clone())),
        ];
        if capabilities.watch {
            tools.push(Arc::new(watch::AddWatchRule::new(hub.clone())));
            tools.push(Arc::new(watch::RemoveWatchRule::new(hub.clone())));
            tools.push(Arc::new(watch::ListWatchRules::new(hub.clone())));
            tools.push(Arc::new(watch::GetWatchedEvents::new(hub.clone())));
            tools.push(Arc::new(watch::ClearWatchedEvents::new(hub.clone())));
        }
        if capabilities.session {
            tools.push(Arc::new(session::StartSession::new(hub.clone())));
            tools.push(Arc::new(session::StopSession::new(hub.clone())));
            tools.push(Arc::new(session::ExportSession::new(hub.clone())));
            tools.push(Arc::new(session::ImportSession::new()));
            tools.push(Arc::new(session::DiffSessions::new()));
            tools.push(Arc::new(session::GetSessionSummary::new(hub)));
        }
        Self { tools }
    }

    /// Discovery payload: name, description, and input schema per tool.
    pub fn list(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.schema().to_json(),
                })
            })
            .collect()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Invoke one tool. The returned string is the serialized JSON
    /// fragment, error payloads included.
    pub async fn call(&self, name: &str, args: &Value) -> String {
        let result = self.call_value(name, args).await;
        result.to_string()
    }

    pub async fn call_value(&self, name: &str, args: &Value) -> Value {
        let Some(tool) = self.tools.iter().find(|t| t.name() == name) else {
            return error_value(format!("unknown tool: {name}"));
        };
        let empty = Map::new();
        let args = match args {
            Value::Null => &empty,
            Value::Object(map) => map,
            _ => return error_value("arguments must be an object"),
        };
        if let Err(message) = tool.schema().validate(args) {
            return error_value(message);
        }
        tool.call(args).await
    }
}

// Shared argument helpers.

pub(crate) fn arg_str<'a>(args: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

pub(crate) fn arg_i64(args: &Map<String, Value>, name: &str) -> Option<i64> {
    args.get(name).and_then(Value::as_i64)
}

pub(crate) fn arg_bool(args: &Map<String, Value>, name: &str) -> Option<bool> {
    args.get(name).and_then(Value::as_bool)
}

/// Clamp a requested limit into `[1, cap]`, with a default when absent.
pub(crate) fn clamp_limit(args: &Map<String, Value>, default: usize, cap: usize) -> usize {
    match arg_i64(args, "limit") {
        Some(limit) if limit > 0 => (limit as usize).min(cap),
        _ => default.min(cap),
    }
}
