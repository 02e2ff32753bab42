use crate::hub::Hub;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use daibug_core::event::{Level, Source};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::warn;

/// Serve the read/control HTTP API until `shutdown` fires.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>, mut shutdown: watch::Receiver<bool>) {
    let app = router(hub);

    let shutdown_signal = async move {
        let _ = shutdown.changed().await;
    };

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    {
        warn!(event = "http_serve_error", error = %err);
    }
}

pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/events", get(get_events))
        .route("/status", get(get_status))
        .route("/ports", get(get_ports))
        .route("/tabs", get(get_tabs))
        .route("/watch-rules", get(get_watch_rules))
        .route("/watched-events", get(get_watched_events))
        .route("/config", get(get_config))
        .route("/session", get(get_session))
        .route("/command", post(post_command))
        .fallback(not_found)
        .with_state(hub)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "not found")
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    source: Option<String>,
    level: Option<String>,
    limit: Option<usize>,
}

async fn get_events(
    State(hub): State<Arc<Hub>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let source = match query.source.as_deref() {
        Some(raw) => match raw.parse::<Source>() {
            Ok(source) => Some(source),
            Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        },
        None => None,
    };
    let level = match query.level.as_deref() {
        Some(raw) => match raw.parse::<Level>() {
            Ok(level) => Some(level),
            Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        },
        None => None,
    };

    let mut events = hub.events_snapshot().await;
    if let Some(source) = source {
        events.retain(|e| e.source == source);
    }
    if let Some(level) = level {
        events.retain(|e| e.level == level);
    }
    let total = events.len();
    if let Some(limit) = query.limit {
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
    }
    Json(json!({"events": events, "total": total})).into_response()
}

async fn get_status(State(hub): State<Arc<Hub>>) -> Response {
    let connected_clients = hub.client_count().await;
    let is_running = hub.is_dev_server_running().await;
    let framework = hub.detected_framework().await.map(|s| s.as_str());
    Json(json!({
        "connectedClients": connected_clients,
        "isDevServerRunning": is_running,
        "detectedFramework": framework,
    }))
    .into_response()
}

async fn get_ports(State(hub): State<Arc<Hub>>) -> Response {
    let (http_port, ws_port) = hub.ports().await;
    Json(json!({"httpPort": http_port, "wsPort": ws_port})).into_response()
}

async fn get_tabs(State(hub): State<Arc<Hub>>) -> Response {
    Json(json!({"tabs": hub.tabs_snapshot().await})).into_response()
}

async fn get_watch_rules(State(hub): State<Arc<Hub>>) -> Response {
    Json(json!({"rules": hub.watch_rules().await})).into_response()
}

async fn get_watched_events(State(hub): State<Arc<Hub>>) -> Response {
    Json(json!({"events": hub.watched_events().await})).into_response()
}

async fn get_config(State(hub): State<Arc<Hub>>) -> Response {
    Json(serde_json::to_value(hub.config()).unwrap_or_else(|_| json!({}))).into_response()
}

async fn get_session(State(hub): State<Arc<Hub>>) -> Response {
    let (active, summary) = hub.session_view().await;
    let mut body = json!({"active": active});
    if let Some(summary) = summary {
        body["summary"] = serde_json::to_value(summary).unwrap_or(Value::Null);
    }
    Json(body).into_response()
}

const BROADCASTABLE_COMMANDS: [&str; 3] = ["snapshot_dom", "capture_react", "capture_storage"];

async fn post_command(State(hub): State<Arc<Hub>>, body: Bytes) -> Response {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid JSON body"),
    };
    let Some(command) = parsed.get("command").and_then(Value::as_str) else {
        return error_response(StatusCode::BAD_REQUEST, "missing command");
    };
    if !BROADCASTABLE_COMMANDS.contains(&command) {
        return error_response(StatusCode::BAD_REQUEST, "unknown command");
    }

    let mut frame = serde_json::Map::new();
    frame.insert("command".into(), Value::String(command.to_string()));
    hub.broadcast_command(frame).await;
    (StatusCode::ACCEPTED, Json(json!({"accepted": true}))).into_response()
}
