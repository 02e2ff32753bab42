use super::{arg_i64, arg_str, error_value, FieldKind, FieldSpec, InputSchema, Tool};
use crate::hub::Hub;
use async_trait::async_trait;
use chrono::Utc;
use daibug_core::event::Source;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use url::Url;

const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_EVALUATE_TIMEOUT_MS: u64 = 300;
const MAX_COMMAND_TIMEOUT_MS: u64 = 10_000;

const SANDBOX_MESSAGE: &str =
    "Sandbox violation: network requests to non-localhost URLs are not allowed";

static FETCH_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"fetch\s*\(\s*['"]([^'"]+)['"]"#).expect("fetch pattern"));
static OPEN_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\.open\s*\(\s*['"][^'"]*['"]\s*,\s*['"]([^'"]+)['"]"#).expect("open pattern")
});

fn timeout_field() -> FieldSpec {
    FieldSpec {
        name: "timeout",
        kind: FieldKind::Integer,
        required: false,
        description: "wait deadline in milliseconds (cap 10000)",
    }
}

fn resolve_timeout(args: &Map<String, Value>, default_ms: u64) -> u64 {
    match arg_i64(args, "timeout") {
        Some(ms) if ms > 0 => (ms as u64).min(MAX_COMMAND_TIMEOUT_MS),
        _ => default_ms.min(MAX_COMMAND_TIMEOUT_MS),
    }
}

/// Reject expressions that reach for a non-loopback host through `fetch`
/// or `XMLHttpRequest.open`.
fn sandbox_check(expression: &str) -> Result<(), String> {
    let captured = FETCH_URL
        .captures_iter(expression)
        .chain(OPEN_URL.captures_iter(expression))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str());
    for target in captured {
        if let Ok(url) = Url::parse(target) {
            match url.host_str() {
                Some("localhost") | Some("127.0.0.1") | Some("[::1]") | None => {}
                Some(_) => return Err(SANDBOX_MESSAGE.to_string()),
            }
        }
        // Relative targets stay same-origin on the loopback page.
    }
    Ok(())
}

pub struct SnapshotDom {
    hub: Arc<Hub>,
}

impl SnapshotDom {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for SnapshotDom {
    fn name(&self) -> &'static str {
        "snapshot_dom"
    }

    fn description(&self) -> &'static str {
        "Ask the browser for a DOM snapshot and wait for it"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec {
                name: "selector",
                kind: FieldKind::String,
                required: false,
                description: "CSS selector to scope the snapshot",
            },
            timeout_field(),
        ])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let timeout = resolve_timeout(args, DEFAULT_COMMAND_TIMEOUT_MS);
        let mut command = Map::new();
        command.insert("command".into(), Value::String("snapshot_dom".into()));
        if let Some(selector) = arg_str(args, "selector") {
            command.insert("selector".into(), Value::String(selector.to_string()));
        }
        match self
            .hub
            .send_command_and_wait(command, timeout, |event| {
                event.source == Source::BrowserDom
                    && event.payload_str("type") == Some("dom_snapshot")
            })
            .await
        {
            Ok(event) => Value::Object(event.payload),
            Err(err) => error_value(err.to_string()),
        }
    }
}

pub struct GetComponentState {
    hub: Arc<Hub>,
}

impl GetComponentState {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for GetComponentState {
    fn name(&self) -> &'static str {
        "get_component_state"
    }

    fn description(&self) -> &'static str {
        "Ask the browser for the mounted React component tree and wait for it"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![timeout_field()])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let timeout = resolve_timeout(args, DEFAULT_COMMAND_TIMEOUT_MS);
        let mut command = Map::new();
        command.insert("command".into(), Value::String("capture_react".into()));
        match self
            .hub
            .send_command_and_wait(command, timeout, |event| {
                event.source == Source::BrowserDom
                    && matches!(
                        event.payload_str("type"),
                        Some("react_tree") | Some("react-tree")
                    )
            })
            .await
        {
            Ok(event) => Value::Object(event.payload),
            Err(err) => error_value(err.to_string()),
        }
    }
}

pub struct CaptureStorage {
    hub: Arc<Hub>,
}

impl CaptureStorage {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for CaptureStorage {
    fn name(&self) -> &'static str {
        "capture_storage"
    }

    fn description(&self) -> &'static str {
        "Ask the browser for a storage snapshot and wait for it"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![timeout_field()])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let timeout = resolve_timeout(args, DEFAULT_COMMAND_TIMEOUT_MS);
        let mut command = Map::new();
        command.insert("command".into(), Value::String("capture_storage".into()));
        match self
            .hub
            .send_command_and_wait(command, timeout, |event| {
                event.source == Source::BrowserStorage
                    && event.payload_str("type") == Some("storage_snapshot")
            })
            .await
        {
            Ok(event) => Value::Object(event.payload),
            Err(err) => error_value(err.to_string()),
        }
    }
}

pub struct EvaluateInBrowser {
    hub: Arc<Hub>,
    evaluation_seq: AtomicU64,
}

impl EvaluateInBrowser {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            hub,
            evaluation_seq: AtomicU64::new(0),
        }
    }

    fn next_evaluation_id(&self) -> String {
        let seq = self.evaluation_seq.fetch_add(1, Ordering::SeqCst) + 1;
        format!("eval_{}_{seq:03}", Utc::now().timestamp_millis())
    }
}

#[async_trait]
impl Tool for EvaluateInBrowser {
    fn name(&self) -> &'static str {
        "evaluate_in_browser"
    }

    fn description(&self) -> &'static str {
        "Evaluate an expression in the page, restricted to loopback network access"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec {
                name: "expression",
                kind: FieldKind::String,
                required: true,
                description: "JavaScript expression to evaluate",
            },
            timeout_field(),
        ])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let Some(expression) = arg_str(args, "expression") else {
            return error_value("missing required field: expression");
        };
        if let Err(message) = sandbox_check(expression) {
            return error_value(message);
        }
        let timeout = resolve_timeout(args, DEFAULT_EVALUATE_TIMEOUT_MS);
        let evaluation_id = self.next_evaluation_id();

        let mut command = Map::new();
        command.insert("command".into(), Value::String("evaluate".into()));
        command.insert(
            "evaluationId".into(),
            Value::String(evaluation_id.clone()),
        );
        command.insert(
            "expression".into(),
            Value::String(expression.to_string()),
        );

        let wanted = evaluation_id.clone();
        match self
            .hub
            .send_command_and_wait(command, timeout, move |event| {
                event.payload_str("evaluationId") == Some(wanted.as_str())
            })
            .await
        {
            Ok(event) => {
                if let Some(error) = event.payload_str("error") {
                    return error_value(error);
                }
                json!({"result": event.payload.get("result").cloned().unwrap_or(Value::Null)})
            }
            Err(err) => error_value(err.to_string()),
        }
    }
}
