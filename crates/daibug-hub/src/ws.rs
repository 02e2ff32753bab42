use crate::hub::Hub;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const CLIENT_QUEUE_CAPACITY: usize = 256;
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Browser-pushed event: `{type:"browser_event", source, level, payload}`.
/// A bare `{source, level, payload}` object is the legacy form.
#[derive(Debug, Deserialize)]
pub struct BrowserEventMsg {
    pub source: String,
    pub level: String,
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserInteractionMsg {
    pub interaction_type: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserTabInfoMsg {
    pub tab_id: String,
    #[serde(default)]
    pub tab_url: String,
    #[serde(default)]
    pub tab_title: String,
}

#[derive(Debug, Deserialize)]
pub struct BrowserStorageMsg {
    pub payload: Value,
}

#[derive(Debug)]
pub enum InboundMessage {
    Event(BrowserEventMsg),
    Interaction(BrowserInteractionMsg),
    TabInfo(BrowserTabInfoMsg),
    Storage(BrowserStorageMsg),
}

/// Demux one inbound frame. Unknown types and unparseable frames are
/// silently dropped (`None`).
pub fn parse_inbound(text: &str) -> Option<InboundMessage> {
    let value: Value = serde_json::from_str(text).ok()?;
    if !value.is_object() {
        return None;
    }
    match value.get("type").and_then(Value::as_str) {
        Some("browser_event") => serde_json::from_value(value).ok().map(InboundMessage::Event),
        Some("browser_interaction") => serde_json::from_value(value)
            .ok()
            .map(InboundMessage::Interaction),
        Some("browser_tab_info") => serde_json::from_value(value)
            .ok()
            .map(InboundMessage::TabInfo),
        Some("browser_storage") => serde_json::from_value(value)
            .ok()
            .map(InboundMessage::Storage),
        Some(_) => None,
        None => {
            // Legacy bare event object.
            let object = value.as_object()?;
            if object.contains_key("source")
                && object.contains_key("level")
                && object.contains_key("payload")
            {
                serde_json::from_value(value).ok().map(InboundMessage::Event)
            } else {
                None
            }
        }
    }
}

/// Serve the WebSocket endpoint until `shutdown` fires. Any path upgrades;
/// non-loopback peers are refused.
pub async fn serve(listener: TcpListener, hub: Arc<Hub>, mut shutdown: watch::Receiver<bool>) {
    let app = Router::new()
        .fallback(ws_handler)
        .with_state(hub);

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
        warn!(event = "ws_serve_error", error = %err);
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    if !addr.ip().is_loopback() {
        warn!(event = "non_loopback_rejected", remote = %addr);
        return axum::http::StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE_CAPACITY);

    let write_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let send = sink.send(message);
            match tokio::time::timeout(WRITE_TIMEOUT, send).await {
                Ok(Ok(())) => {}
                _ => return,
            }
        }
    });

    let client_id = hub.register_client(tx.clone()).await;
    if let Some(frame) = hub.console_filter_frame() {
        let _ = tx.try_send(Message::Text(frame.to_string()));
    }

    while let Some(received) = stream.next().await {
        let message = match received {
            Ok(message) => message,
            Err(err) => {
                debug!(event = "ws_read_error", client_id, error = %err);
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Close(_) => {
                info!(event = "ws_client_close", client_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        dispatch(&hub, &text).await;
    }

    hub.remove_client(client_id).await;
    drop(tx);
    let _ = write_task.await;
}

/// Route one frame into the hub. Failures never close the connection.
async fn dispatch(hub: &Arc<Hub>, text: &str) {
    match parse_inbound(text) {
        Some(InboundMessage::Event(msg)) => {
            if let Err(err) = hub
                .ingest_browser_event(&msg.source, &msg.level, msg.payload)
                .await
            {
                debug!(event = "browser_event_rejected", error = %err);
            }
        }
        Some(InboundMessage::Interaction(msg)) => {
            hub.ingest_interaction(
                msg.interaction_type,
                msg.target,
                msg.value,
                msg.url,
                msg.x,
                msg.y,
            )
            .await;
        }
        Some(InboundMessage::TabInfo(msg)) => {
            hub.upsert_tab(&msg.tab_id, &msg.tab_url, &msg.tab_title).await;
        }
        Some(InboundMessage::Storage(msg)) => {
            if let Err(err) = hub
                .ingest_browser_event("browser:storage", "info", msg.payload)
                .await
            {
                debug!(event = "storage_event_rejected", error = %err);
            }
        }
        None => debug!(event = "ws_frame_dropped"),
    }
}
