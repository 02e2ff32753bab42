use super::{arg_str, error_value, FieldKind, FieldSpec, InputSchema, Tool};
use crate::hub::Hub;
use async_trait::async_trait;
use daibug_core::diff::diff_sessions;
use daibug_core::session::read_session;
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;

pub struct StartSession {
    hub: Arc<Hub>,
}

impl StartSession {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for StartSession {
    fn name(&self) -> &'static str {
        "start_session"
    }

    fn description(&self) -> &'static str {
        "Clear the event ring and start recording a fresh session"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![FieldSpec {
            name: "label",
            kind: FieldKind::String,
            required: false,
            description: "optional label stored on the session",
        }])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let label = arg_str(args, "label").map(|s| s.to_string());
        let id = self.hub.start_session(label, true).await;
        json!({"started": true, "sessionId": id})
    }
}

pub struct StopSession {
    hub: Arc<Hub>,
}

impl StopSession {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for StopSession {
    fn name(&self) -> &'static str {
        "stop_session"
    }

    fn description(&self) -> &'static str {
        "Stop the active session and return its summary"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::default()
    }

    async fn call(&self, _args: &Map<String, Value>) -> Value {
        match self.hub.stop_session().await {
            Some(summary) => json!({"stopped": true, "summary": summary}),
            None => error_value("no active session"),
        }
    }
}

pub struct ExportSession {
    hub: Arc<Hub>,
}

impl ExportSession {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for ExportSession {
    fn name(&self) -> &'static str {
        "export_session"
    }

    fn description(&self) -> &'static str {
        "Write the active or last session to a JSON file"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![FieldSpec {
            name: "path",
            kind: FieldKind::String,
            required: true,
            description: "destination file path",
        }])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let Some(path) = arg_str(args, "path") else {
            return error_value("missing required field: path");
        };
        match self.hub.export_session(Path::new(path)).await {
            Ok(id) => json!({"exported": true, "path": path, "sessionId": id}),
            Err(err) => error_value(err.to_string()),
        }
    }
}

/// Importing never mutates hub state; the tool only reads the file.
pub struct ImportSession;

impl ImportSession {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for ImportSession {
    fn name(&self) -> &'static str {
        "import_session"
    }

    fn description(&self) -> &'static str {
        "Read a session file and return its identity and summary"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![FieldSpec {
            name: "path",
            kind: FieldKind::String,
            required: true,
            description: "session file to read",
        }])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let Some(path) = arg_str(args, "path") else {
            return error_value("missing required field: path");
        };
        match read_session(Path::new(path)) {
            Ok(session) => json!({
                "sessionId": session.id,
                "exportedAt": session.exported_at,
                "summary": session.summary,
            }),
            Err(err) => error_value(err.to_string()),
        }
    }
}

pub struct DiffSessions;

impl DiffSessions {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Tool for DiffSessions {
    fn name(&self) -> &'static str {
        "diff_sessions"
    }

    fn description(&self) -> &'static str {
        "Compare two session files event-by-event"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::new(vec![
            FieldSpec {
                name: "pathA",
                kind: FieldKind::String,
                required: true,
                description: "baseline session file",
            },
            FieldSpec {
                name: "pathB",
                kind: FieldKind::String,
                required: true,
                description: "session file to compare against the baseline",
            },
        ])
    }

    async fn call(&self, args: &Map<String, Value>) -> Value {
        let (Some(path_a), Some(path_b)) = (arg_str(args, "pathA"), arg_str(args, "pathB")) else {
            return error_value("missing required field: pathA and pathB");
        };
        let a = match read_session(Path::new(path_a)) {
            Ok(session) => session,
            Err(err) => return error_value(err.to_string()),
        };
        let b = match read_session(Path::new(path_b)) {
            Ok(session) => session,
            Err(err) => return error_value(err.to_string()),
        };
        serde_json::to_value(diff_sessions(&a, &b)).unwrap_or_else(|_| json!({}))
    }
}

pub struct GetSessionSummary {
    hub: Arc<Hub>,
}

impl GetSessionSummary {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Tool for GetSessionSummary {
    fn name(&self) -> &'static str {
        "get_session_summary"
    }

    fn description(&self) -> &'static str {
        "Summary of the active or last-stopped session"
    }

    fn schema(&self) -> InputSchema {
        InputSchema::default()
    }

    async fn call(&self, _args: &Map<String, Value>) -> Value {
        let (active, summary) = self.hub.session_view().await;
        match summary {
            Some(summary) => json!({"active": active, "summary": summary}),
            None => error_value("no session recorded"),
        }
    }
}
