use crate::config::Config;
use crate::error::CoreError;
use crate::event::{Event, Interaction, Level, Source, StorageSnapshot};
use crate::redact::Redactor;
use crate::watch::WatchedEvent;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const SESSION_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionEnvironment {
    pub framework: String,
    pub node_version: String,
    pub platform: String,
    pub daibug_version: String,
    pub cmd: String,
    pub started_at: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionSummary {
    pub total_events: usize,
    pub error_count: usize,
    pub warn_count: usize,
    pub network_requests: usize,
    pub failed_requests: usize,
    pub interaction_count: usize,
    pub duration: i64,
    pub top_errors: Vec<String>,
}

/// A time-bounded, serializable, diffable recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub version: String,
    pub id: String,
    pub exported_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub environment: SessionEnvironment,
    pub config: Config,
    pub events: Vec<Event>,
    pub interactions: Vec<Interaction>,
    pub watched_events: Vec<WatchedEvent>,
    pub storage_snapshots: Vec<StorageSnapshot>,
    pub summary: SessionSummary,
}

/// Records events, interactions, watched matches, and storage snapshots
/// from `start` until `stop`. Once stopped the snapshot is frozen; every
/// later read returns the frozen value.
#[derive(Debug)]
pub struct SessionRecorder {
    id: String,
    label: Option<String>,
    environment: SessionEnvironment,
    config: Config,
    events: Vec<Event>,
    interactions: Vec<Interaction>,
    watched_events: Vec<WatchedEvent>,
    storage_snapshots: Vec<StorageSnapshot>,
    active: bool,
    frozen: Option<Session>,
}

impl SessionRecorder {
    /// Start recording. `seed_events` is the content of the hub's event
    /// ring at start time; everything recorded afterwards is appended.
    pub fn start(
        label: Option<String>,
        environment: SessionEnvironment,
        config: Config,
        seed_events: Vec<Event>,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: format!("session_{now}"),
            label,
            environment,
            config,
            events: seed_events,
            interactions: Vec::new(),
            watched_events: Vec::new(),
            storage_snapshots: Vec::new(),
            active: true,
            frozen: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn record_event(&mut self, event: &Event) {
        if self.active {
            self.events.push(event.clone());
        }
    }

    pub fn record_interaction(&mut self, interaction: &Interaction) {
        if self.active {
            self.interactions.push(interaction.clone());
        }
    }

    pub fn record_watched(&mut self, watched: &WatchedEvent) {
        if self.active {
            self.watched_events.push(watched.clone());
        }
    }

    pub fn record_storage(&mut self, snapshot: &StorageSnapshot) {
        if self.active {
            self.storage_snapshots.push(snapshot.clone());
        }
    }

    /// Freeze the recording. Idempotent.
    pub fn stop(&mut self) {
        if self.active {
            self.active = false;
            self.frozen = Some(self.build_snapshot());
        }
    }

    /// Current (live) or frozen session.
    pub fn snapshot(&self) -> Session {
        match &self.frozen {
            Some(frozen) => frozen.clone(),
            None => self.build_snapshot(),
        }
    }

    fn build_snapshot(&self) -> Session {
        let mut events = self.events.clone();
        sort_events(&mut events);
        let summary = compute_summary(&events, &self.interactions);
        Session {
            version: SESSION_VERSION.to_string(),
            id: self.id.clone(),
            exported_at: Utc::now().timestamp_millis(),
            label: self.label.clone(),
            environment: self.environment.clone(),
            config: self.config.clone(),
            events,
            interactions: self.interactions.clone(),
            watched_events: self.watched_events.clone(),
            storage_snapshots: self.storage_snapshots.clone(),
            summary,
        }
    }

    /// Serialize for export. The recorder is the redaction boundary for
    /// exported data: storage snapshot values under sensitive keys are
    /// re-redacted here even if they were captured before the rule existed.
    pub fn export_to_string(&self, redactor: &Redactor) -> String {
        export_session_string(&self.snapshot(), redactor)
    }

    /// Write the export to `path`, creating parent directories.
    pub fn export(&self, path: &Path, redactor: &Redactor) -> Result<(), CoreError> {
        write_session(&self.snapshot(), path, redactor)
    }
}

pub fn export_session_string(session: &Session, redactor: &Redactor) -> String {
    let mut out = session.clone();
    for snapshot in &mut out.storage_snapshots {
        snapshot.local_storage = redactor.redact_storage_map(&snapshot.local_storage);
        snapshot.session_storage = redactor.redact_storage_map(&snapshot.session_storage);
    }
    serde_json::to_string_pretty(&out).unwrap_or_else(|_| "{}".to_string())
}

pub fn write_session(session: &Session, path: &Path, redactor: &Redactor) -> Result<(), CoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, export_session_string(session, redactor))?;
    Ok(())
}

/// Parse and validate a serialized session.
pub fn parse_session(json: &str) -> Result<Session, CoreError> {
    let session: Session =
        serde_json::from_str(json).map_err(|err| CoreError::InvalidFormat(err.to_string()))?;
    if session.version != SESSION_VERSION {
        return Err(CoreError::InvalidFormat(format!(
            "unsupported session version {:?}",
            session.version
        )));
    }
    if session.id.is_empty() {
        return Err(CoreError::InvalidFormat("session id must not be empty".into()));
    }
    Ok(session)
}

pub fn read_session(path: &Path) -> Result<Session, CoreError> {
    let text = fs::read_to_string(path)
        .map_err(|err| CoreError::NotFound(format!("{}: {err}", path.display())))?;
    parse_session(&text)
}

/// Deterministic ordering: by `ts`, ties broken by `id` lexicographically.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by(|a, b| a.ts.cmp(&b.ts).then_with(|| a.id.cmp(&b.id)));
}

/// Summary over already-sorted events.
pub fn compute_summary(events: &[Event], interactions: &[Interaction]) -> SessionSummary {
    let mut error_count = 0;
    let mut warn_count = 0;
    let mut network_requests = 0;
    let mut failed_requests = 0;
    let mut error_messages: HashMap<String, usize> = HashMap::new();

    for event in events {
        match event.level {
            Level::Error => {
                error_count += 1;
                if let Some(message) = event.payload_str("message") {
                    *error_messages.entry(message.to_string()).or_insert(0) += 1;
                }
            }
            Level::Warn => warn_count += 1,
            _ => {}
        }
        if event.source == Source::BrowserNetwork {
            network_requests += 1;
            if event.payload_i64("status").is_some_and(|s| s >= 400) {
                failed_requests += 1;
            }
        }
    }

    let mut ranked: Vec<(String, usize)> = error_messages.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let top_errors = ranked.into_iter().take(5).map(|(msg, _)| msg).collect();

    let duration = match (events.first(), events.last()) {
        (Some(first), Some(last)) => last.ts - first.ts,
        _ => 0,
    };

    SessionSummary {
        total_events: events.len(),
        error_count,
        warn_count,
        network_requests,
        failed_requests,
        interaction_count: interactions.len(),
        duration,
        top_errors,
    }
}

/// Flatten storage snapshots to one key → value map. Later snapshots win;
/// within one snapshot localStorage overrides sessionStorage.
pub fn flatten_storage(snapshots: &[StorageSnapshot]) -> Map<String, Value> {
    let mut out = Map::new();
    for snapshot in snapshots {
        for (key, value) in &snapshot.session_storage {
            out.insert(key.clone(), value.clone());
        }
        for (key, value) in &snapshot.local_storage {
            out.insert(key.clone(), value.clone());
        }
    }
    out
}
