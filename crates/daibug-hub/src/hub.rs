use crate::error::HubError;
use crate::supervisor::{ChildEvent, ChildStream, DevServerSupervisor};
use crate::{http, net, ws};
use axum::extract::ws::Message;
use chrono::Utc;
use daibug_core::config::Config;
use daibug_core::detect::FrameworkDetector;
use daibug_core::event::{
    Event, EventFactory, IdSequence, Interaction, Level, Payload, Source, StorageSnapshot, TabInfo,
};
use daibug_core::glob::GlobMatcher;
use daibug_core::redact::Redactor;
use daibug_core::ring::Ring;
use daibug_core::session::{
    self, Session, SessionEnvironment, SessionRecorder, SessionSummary,
};
use daibug_core::watch::{WatchConditions, WatchEngine, WatchRule, WatchedEvent};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const EVENT_RING_CAPACITY: usize = 500;
pub const INTERACTION_RING_CAPACITY: usize = 200;

const STARTUP_DRAIN_WINDOW: Duration = Duration::from_millis(700);
const STARTUP_DRAIN_POLL: Duration = Duration::from_millis(25);
const BROADCAST_CHANNEL_CAPACITY: usize = 512;

/// Everything mutated per event, behind one lock so id assignment,
/// redaction, watch evaluation, ring insertion, and recording happen
/// atomically per event.
struct PipelineState {
    factory: EventFactory,
    interaction_ids: IdSequence,
    detector: FrameworkDetector,
    events: Ring<Event>,
    interactions: Ring<Interaction>,
    tabs: HashMap<String, TabInfo>,
    watch: WatchEngine,
    recorder: Option<SessionRecorder>,
    last_session: Option<Session>,
}

struct Lifecycle {
    http_port: u16,
    ws_port: u16,
    shutdown_tx: Option<watch::Sender<bool>>,
    http_task: Option<JoinHandle<()>>,
    ws_task: Option<JoinHandle<()>>,
    pump_task: Option<JoinHandle<()>>,
    supervisor: Option<DevServerSupervisor>,
    child_running: Option<Arc<AtomicBool>>,
}

/// The hub: owns every registry, the ingest pipeline, both endpoints,
/// the child supervisor, and the live event broadcast.
pub struct Hub {
    config: Config,
    cmd: String,
    redactor: Redactor,
    ignore_patterns: Vec<GlobMatcher>,
    node_version: String,
    state: Mutex<PipelineState>,
    lifecycle: Mutex<Lifecycle>,
    clients: RwLock<HashMap<u64, mpsc::Sender<Message>>>,
    client_seq: AtomicU64,
    events_tx: broadcast::Sender<Event>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_notify: Notify,
}

impl Hub {
    pub fn new(config: Config, cmd: String) -> Arc<Self> {
        let redactor = Redactor::new(&config.redact.fields, &config.redact.url_patterns);
        let ignore_patterns = config
            .network
            .ignore
            .iter()
            .filter_map(|p| GlobMatcher::new(p).ok())
            .collect();
        let (events_tx, _) = broadcast::channel(BROADCAST_CHANNEL_CAPACITY);
        Arc::new(Self {
            redactor,
            ignore_patterns,
            node_version: detect_node_version(),
            state: Mutex::new(PipelineState {
                factory: EventFactory::new(),
                interaction_ids: IdSequence::new("int"),
                detector: FrameworkDetector::from_command(&cmd),
                events: Ring::new(EVENT_RING_CAPACITY),
                interactions: Ring::new(INTERACTION_RING_CAPACITY),
                tabs: HashMap::new(),
                watch: WatchEngine::new(),
                recorder: None,
                last_session: None,
            }),
            lifecycle: Mutex::new(Lifecycle {
                http_port: 0,
                ws_port: 0,
                shutdown_tx: None,
                http_task: None,
                ws_task: None,
                pump_task: None,
                supervisor: None,
                child_running: None,
            }),
            clients: RwLock::new(HashMap::new()),
            client_seq: AtomicU64::new(0),
            events_tx,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            config,
            cmd,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn redactor(&self) -> &Redactor {
        &self.redactor
    }

    // ------------------------------------------------------------------
    // Lifecycle

    /// Bind both endpoints, spawn the dev command, and wait briefly for
    /// startup output to drain through the pipeline.
    pub async fn start(self: Arc<Self>) -> Result<(), HubError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(HubError::AlreadyStarted);
        }

        let http_listener =
            net::bind_loopback(self.config.hub.http_port, Some(self.config.hub.ws_port)).await?;
        let http_port = http_listener.local_addr()?.port();
        let ws_listener = net::bind_loopback(self.config.hub.ws_port, Some(http_port)).await?;
        let ws_port = ws_listener.local_addr()?.port();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let http_task = tokio::spawn(http::serve(
            http_listener,
            self.clone(),
            shutdown_rx.clone(),
        ));
        let ws_task = tokio::spawn(ws::serve(ws_listener, self.clone(), shutdown_rx));

        {
            let mut st = self.state.lock().await;
            for spec in &self.config.watch {
                if let Err(err) = st.watch.add_rule(&spec.label, spec.source, spec.conditions()) {
                    warn!(event = "config_watch_rule_rejected", label = %spec.label, error = %err);
                }
            }
            if self.config.session.auto_start {
                let seed = st.events.to_vec();
                let environment = self.session_environment(&st);
                st.recorder = Some(SessionRecorder::start(
                    None,
                    environment,
                    self.config.clone(),
                    seed,
                ));
            }
        }

        let (child_tx, child_rx) = mpsc::unbounded_channel();
        let supervisor = DevServerSupervisor::spawn(&self.cmd, child_tx);
        let child_running = supervisor.running_flag();
        let pump_task = tokio::spawn(run_child_pump(self.clone(), child_rx));

        {
            let mut lc = self.lifecycle.lock().await;
            lc.http_port = http_port;
            lc.ws_port = ws_port;
            lc.shutdown_tx = Some(shutdown_tx);
            lc.http_task = Some(http_task);
            lc.ws_task = Some(ws_task);
            lc.pump_task = Some(pump_task);
            lc.supervisor = Some(supervisor);
            lc.child_running = Some(child_running);
        }

        info!(event = "hub_started", http_port, ws_port, cmd = %self.cmd);

        let deadline = tokio::time::Instant::now() + STARTUP_DRAIN_WINDOW;
        loop {
            if !self.state.lock().await.events.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(STARTUP_DRAIN_POLL).await;
        }
        Ok(())
    }

    /// Stop everything. Idempotent after the first call; calling before
    /// `start` is a lifecycle error.
    pub async fn stop(&self) -> Result<(), HubError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(HubError::NotStarted);
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut st = self.state.lock().await;
            if let Some(mut recorder) = st.recorder.take() {
                recorder.stop();
                st.last_session = Some(recorder.snapshot());
            }
        }

        // Cancel outstanding correlated waits.
        self.shutdown_notify.notify_waiters();

        let (shutdown_tx, http_task, ws_task, pump_task, supervisor) = {
            let mut lc = self.lifecycle.lock().await;
            (
                lc.shutdown_tx.take(),
                lc.http_task.take(),
                lc.ws_task.take(),
                lc.pump_task.take(),
                lc.supervisor.take(),
            )
        };

        if let Some(tx) = shutdown_tx {
            let _ = tx.send(true);
        }
        self.clients.write().await.clear();

        if let Some(supervisor) = supervisor {
            supervisor.shutdown().await;
        }
        if let Some(task) = pump_task {
            task.abort();
        }
        for mut task in [http_task, ws_task].into_iter().flatten() {
            // Long-lived WS connections can outlast the graceful window.
            if tokio::time::timeout(Duration::from_secs(2), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        info!(event = "hub_stopped");
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Resolved `(http, ws)` ports after `start`.
    pub async fn ports(&self) -> (u16, u16) {
        let lc = self.lifecycle.lock().await;
        (lc.http_port, lc.ws_port)
    }

    // ------------------------------------------------------------------
    // Ingestion

    /// Shared per-event pipeline. Caller holds the state lock.
    fn run_pipeline(
        &self,
        st: &mut PipelineState,
        source: Source,
        level: Level,
        payload: Payload,
    ) -> Event {
        self.touch_tab(st, &payload);
        let mut event = st.factory.create(source, level, payload);
        event = self.redactor.redact_event(&event);
        let matches = st.watch.evaluate(&mut event);
        st.events.push(event.clone());
        if let Some(recorder) = st.recorder.as_mut() {
            recorder.record_event(&event);
            for matched in &matches {
                recorder.record_watched(matched);
            }
        }
        event
    }

    fn touch_tab(&self, st: &mut PipelineState, payload: &Payload) {
        let Some(tab_id) = payload.get("tabId").and_then(Value::as_str) else {
            return;
        };
        let url = payload.get("url").and_then(Value::as_str);
        let title = payload.get("title").and_then(Value::as_str);
        upsert_tab_entry(&mut st.tabs, tab_id, url, title);
    }

    async fn fan_out(&self, event: &Event) {
        if let Ok(frame) = serde_json::to_value(event) {
            self.broadcast_frame(&frame).await;
        }
        let _ = self.events_tx.send(event.clone());
    }

    /// Ingest one dev-server output line.
    pub async fn ingest_dev_line(&self, text: &str, level: Level) {
        let event = {
            let mut st = self.state.lock().await;
            let source = st.detector.classify_line(text);
            let mut payload = Payload::new();
            payload.insert("message".into(), Value::String(text.to_string()));
            self.run_pipeline(&mut st, source, level, payload)
        };
        self.fan_out(&event).await;
    }

    /// Record a child spawn failure or non-zero exit as an error event.
    pub async fn record_child_failure(&self, message: Option<String>, exit_code: i32) {
        let event = {
            let mut st = self.state.lock().await;
            let source = st.detector.locked().unwrap_or(Source::DevServer);
            let mut payload = Payload::new();
            if let Some(message) = message {
                payload.insert("message".into(), Value::String(message));
            }
            payload.insert("exitCode".into(), json!(exit_code));
            self.run_pipeline(&mut st, source, Level::Error, payload)
        };
        self.fan_out(&event).await;
    }

    /// Ingest a browser event from the WebSocket. Network events honor the
    /// ignore globs and the body-capture policy; returns `None` when the
    /// event was skipped.
    pub async fn ingest_browser_event(
        &self,
        source: &str,
        level: &str,
        payload: Value,
    ) -> Result<Option<Event>, HubError> {
        let source: Source = source.parse().map_err(HubError::Core)?;
        let level: Level = level.parse().map_err(HubError::Core)?;
        let mut payload = match payload {
            Value::Object(map) => map,
            other => {
                return Err(HubError::Core(daibug_core::CoreError::InvalidKind(
                    format!("payload must be a mapping, got {other}"),
                )))
            }
        };

        if source == Source::BrowserNetwork {
            if let Some(url) = payload.get("url").and_then(Value::as_str) {
                if self.ignore_patterns.iter().any(|p| p.matches_url(url)) {
                    debug!(event = "network_event_ignored", url);
                    return Ok(None);
                }
            }
            self.apply_body_policy(&mut payload);
        }

        let event = {
            let mut st = self.state.lock().await;
            let event = self.run_pipeline(&mut st, source, level, payload);
            if source == Source::BrowserStorage {
                self.maybe_record_storage(&mut st, &event);
            }
            event
        };
        self.fan_out(&event).await;
        Ok(Some(event))
    }

    fn apply_body_policy(&self, payload: &mut Payload) {
        if !self.config.network.capture_body {
            payload.remove("requestBody");
            payload.remove("responseBody");
            return;
        }
        let limit = self.config.network.max_body_size as usize;
        for key in ["requestBody", "responseBody"] {
            if let Some(Value::String(body)) = payload.get_mut(key) {
                if body.len() > limit {
                    let mut cut = limit;
                    while !body.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    body.truncate(cut);
                    body.push_str("… [truncated]");
                }
            }
        }
    }

    fn maybe_record_storage(&self, st: &mut PipelineState, event: &Event) {
        if !self.config.session.capture_storage {
            return;
        }
        if event.payload_str("type") != Some("storage_snapshot") {
            return;
        }
        match serde_json::from_value::<StorageSnapshot>(Value::Object(event.payload.clone())) {
            Ok(mut snapshot) => {
                if snapshot.ts == 0 {
                    snapshot.ts = event.ts;
                }
                if let Some(recorder) = st.recorder.as_mut() {
                    recorder.record_storage(&snapshot);
                }
            }
            Err(err) => debug!(event = "storage_snapshot_unparseable", error = %err),
        }
    }

    /// Append a browser interaction to its ring (never the event stream).
    pub async fn ingest_interaction(
        &self,
        kind: String,
        target: Option<String>,
        value: Option<String>,
        url: Option<String>,
        x: Option<f64>,
        y: Option<f64>,
    ) {
        let mut st = self.state.lock().await;
        let (id, ts) = st.interaction_ids.next();
        let interaction = Interaction {
            id,
            ts,
            kind,
            target,
            value,
            url,
            x,
            y,
        };
        st.interactions.push(interaction.clone());
        if let Some(recorder) = st.recorder.as_mut() {
            recorder.record_interaction(&interaction);
        }
    }

    /// Upsert a tab registry entry, preserving its original connect time.
    pub async fn upsert_tab(&self, tab_id: &str, url: &str, title: &str) {
        let mut st = self.state.lock().await;
        upsert_tab_entry(&mut st.tabs, tab_id, Some(url), Some(title));
    }

    // ------------------------------------------------------------------
    // WebSocket client registry

    pub async fn register_client(&self, sender: mpsc::Sender<Message>) -> u64 {
        let id = self.client_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.clients.write().await.insert(id, sender);
        info!(event = "client_connected", client_id = id);
        id
    }

    pub async fn remove_client(&self, id: u64) {
        if self.clients.write().await.remove(&id).is_some() {
            info!(event = "client_disconnected", client_id = id);
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// One-shot console filter command for a newly connected client.
    pub fn console_filter_frame(&self) -> Option<Value> {
        let include = self.config.console.normalized_include();
        (!include.is_empty()).then(|| {
            json!({
                "type": "command",
                "command": "set_console_filter",
                "include": include,
            })
        })
    }

    /// Write one frame to every open client. A client whose queue is full
    /// is dropped rather than awaited; the ingestion path never blocks on
    /// a slow reader.
    pub async fn broadcast_frame(&self, frame: &Value) {
        let text = frame.to_string();
        let mut dropped = Vec::new();
        {
            let clients = self.clients.read().await;
            for (id, sender) in clients.iter() {
                if sender.try_send(Message::Text(text.clone())).is_err() {
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            warn!(event = "slow_client_dropped", client_id = id);
            self.remove_client(id).await;
        }
    }

    /// Broadcast a `{type:"command", …}` frame to all clients.
    pub async fn broadcast_command(&self, command: Map<String, Value>) {
        let mut frame = Map::new();
        frame.insert("type".into(), Value::String("command".into()));
        for (key, value) in command {
            frame.insert(key, value);
        }
        self.broadcast_frame(&Value::Object(frame)).await;
    }

    /// Broadcast a command and wait for the first event `matcher` accepts.
    /// The subscription exists only for the duration of the wait; `stop`
    /// resolves outstanding waits as timeouts.
    pub async fn send_command_and_wait<F>(
        &self,
        command: Map<String, Value>,
        timeout_ms: u64,
        matcher: F,
    ) -> Result<Event, HubError>
    where
        F: Fn(&Event) -> bool,
    {
        if self.is_stopped() {
            return Err(HubError::CommandTimeout(timeout_ms));
        }
        let mut rx = self.events_tx.subscribe();
        self.broadcast_command(command).await;

        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(HubError::CommandTimeout(timeout_ms));
            }
            tokio::select! {
                _ = self.shutdown_notify.notified() => {
                    return Err(HubError::CommandTimeout(timeout_ms));
                }
                received = tokio::time::timeout(remaining, rx.recv()) => match received {
                    Ok(Ok(event)) if matcher(&event) => return Ok(event),
                    Ok(Ok(_)) => continue,
                    Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                        debug!(event = "correlated_wait_lagged", skipped);
                        continue;
                    }
                    Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => {
                        return Err(HubError::CommandTimeout(timeout_ms));
                    }
                },
            }
        }
    }

    /// Live event feed for in-process observers.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Read surface

    pub async fn events_snapshot(&self) -> Vec<Event> {
        self.state.lock().await.events.to_vec()
    }

    pub async fn clear_events(&self) {
        self.state.lock().await.events.clear();
    }

    pub async fn interactions_snapshot(&self) -> Vec<Interaction> {
        self.state.lock().await.interactions.to_vec()
    }

    pub async fn tabs_snapshot(&self) -> Vec<TabInfo> {
        let st = self.state.lock().await;
        let mut tabs: Vec<TabInfo> = st.tabs.values().cloned().collect();
        tabs.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.tab_id.cmp(&b.tab_id)));
        tabs
    }

    pub async fn detected_framework(&self) -> Option<Source> {
        self.state.lock().await.detector.locked()
    }

    pub async fn is_dev_server_running(&self) -> bool {
        let lc = self.lifecycle.lock().await;
        lc.child_running
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    // ------------------------------------------------------------------
    // Watch surface

    pub async fn add_watch_rule(
        &self,
        label: &str,
        source: Option<Source>,
        conditions: WatchConditions,
    ) -> Result<WatchRule, HubError> {
        let mut st = self.state.lock().await;
        st.watch
            .add_rule(label, source, conditions)
            .map_err(HubError::Core)
    }

    pub async fn remove_watch_rule(&self, id: &str) -> bool {
        self.state.lock().await.watch.remove_rule(id)
    }

    pub async fn watch_rules(&self) -> Vec<WatchRule> {
        self.state.lock().await.watch.rules()
    }

    pub async fn watched_events(&self) -> Vec<WatchedEvent> {
        self.state.lock().await.watch.matched()
    }

    pub async fn clear_watched_events(&self) {
        self.state.lock().await.watch.clear_matched();
    }

    // ------------------------------------------------------------------
    // Session surface

    fn session_environment(&self, st: &PipelineState) -> SessionEnvironment {
        SessionEnvironment {
            framework: st
                .detector
                .locked()
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            node_version: self.node_version.clone(),
            platform: std::env::consts::OS.to_string(),
            daibug_version: env!("CARGO_PKG_VERSION").to_string(),
            cmd: self.cmd.clone(),
            started_at: Utc::now().timestamp_millis(),
        }
    }

    /// Start a fresh recording. Any active recorder is stopped and kept as
    /// the last session; `clear_events` empties the ring first so the new
    /// session starts clean.
    pub async fn start_session(&self, label: Option<String>, clear_events: bool) -> String {
        let mut st = self.state.lock().await;
        if let Some(mut recorder) = st.recorder.take() {
            recorder.stop();
            st.last_session = Some(recorder.snapshot());
        }
        if clear_events {
            st.events.clear();
        }
        let seed = st.events.to_vec();
        let environment = self.session_environment(&st);
        let recorder = SessionRecorder::start(label, environment, self.config.clone(), seed);
        let id = recorder.id().to_string();
        st.recorder = Some(recorder);
        info!(event = "session_started", session_id = %id);
        id
    }

    /// Stop the active recorder; returns its summary, or `None` when no
    /// recording was active.
    pub async fn stop_session(&self) -> Option<SessionSummary> {
        let mut st = self.state.lock().await;
        let mut recorder = st.recorder.take()?;
        recorder.stop();
        let snapshot = recorder.snapshot();
        let summary = snapshot.summary.clone();
        info!(event = "session_stopped", session_id = %snapshot.id);
        st.last_session = Some(snapshot);
        Some(summary)
    }

    /// `(active, summary)` for the active or last-stopped session.
    pub async fn session_view(&self) -> (bool, Option<SessionSummary>) {
        let st = self.state.lock().await;
        if let Some(recorder) = st.recorder.as_ref() {
            (true, Some(recorder.snapshot().summary))
        } else {
            (false, st.last_session.as_ref().map(|s| s.summary.clone()))
        }
    }

    /// Export the active or last session to `path`; returns the session id.
    pub async fn export_session(&self, path: &Path) -> Result<String, HubError> {
        let st = self.state.lock().await;
        if let Some(recorder) = st.recorder.as_ref() {
            recorder.export(path, &self.redactor)?;
            return Ok(recorder.id().to_string());
        }
        if let Some(last) = st.last_session.as_ref() {
            session::write_session(last, path, &self.redactor)?;
            return Ok(last.id.clone());
        }
        Err(HubError::Core(daibug_core::CoreError::NotFound(
            "no session to export".into(),
        )))
    }
}

fn upsert_tab_entry(
    tabs: &mut HashMap<String, TabInfo>,
    tab_id: &str,
    url: Option<&str>,
    title: Option<&str>,
) {
    match tabs.get_mut(tab_id) {
        Some(existing) => {
            if let Some(url) = url {
                existing.url = url.to_string();
            }
            if let Some(title) = title {
                existing.title = title.to_string();
            }
        }
        None => {
            tabs.insert(
                tab_id.to_string(),
                TabInfo {
                    tab_id: tab_id.to_string(),
                    url: url.unwrap_or_default().to_string(),
                    title: title.unwrap_or_default().to_string(),
                    connected_at: Utc::now().timestamp_millis(),
                },
            );
        }
    }
}

/// Drain child events into the serialized ingestion path.
async fn run_child_pump(hub: Arc<Hub>, mut rx: mpsc::UnboundedReceiver<ChildEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            ChildEvent::Line { stream, text } => {
                let level = match stream {
                    ChildStream::Stdout => Level::Info,
                    ChildStream::Stderr => Level::Warn,
                };
                hub.ingest_dev_line(&text, level).await;
            }
            ChildEvent::SpawnFailed { message } => {
                hub.record_child_failure(Some(message), 1).await;
            }
            ChildEvent::Exited { code } => {
                hub.record_child_failure(None, code).await;
            }
        }
    }
}

fn detect_node_version() -> String {
    std::process::Command::new("node")
        .arg("--version")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
