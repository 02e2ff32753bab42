//! End-to-end coverage over real loopback sockets: a tungstenite client
//! plays the browser extension, reqwest plays an HTTP reader, and the
//! tool registry plays the agent.

use daibug_core::config::Config;
use daibug_core::watch::WatchConditions;
use daibug_hub::tools::ToolRegistry;
use daibug_hub::Hub;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_hub(http_port: u16, ws_port: u16, mutate: impl FnOnce(&mut Config)) -> Arc<Hub> {
    let mut config = Config::default();
    config.hub.http_port = http_port;
    config.hub.ws_port = ws_port;
    mutate(&mut config);
    let hub = Hub::new(config, "echo dev ready".to_string());
    hub.clone().start().await.expect("hub start");
    hub
}

async fn connect_ws(hub: &Arc<Hub>) -> WsClient {
    let (_, ws_port) = hub.ports().await;
    let (client, _) = connect_async(format!("ws://127.0.0.1:{ws_port}/ws"))
        .await
        .expect("ws connect");
    client
}

async fn http_get(hub: &Arc<Hub>, path: &str) -> Value {
    let (http_port, _) = hub.ports().await;
    reqwest::get(format!("http://127.0.0.1:{http_port}{path}"))
        .await
        .expect("http get")
        .json()
        .await
        .expect("json body")
}

/// Poll an HTTP path until `accept` passes or the deadline expires.
async fn wait_for(hub: &Arc<Hub>, path: &str, accept: impl Fn(&Value) -> bool) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let body = http_get(hub, path).await;
        if accept(&body) {
            return body;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {path}, last body: {body}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Read frames until one satisfies `accept`, skipping everything else
/// (the per-connect console filter one-shot in particular).
async fn next_matching_frame(client: &mut WsClient, accept: impl Fn(&Value) -> bool) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = tokio::time::timeout(remaining, client.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("frame ok");
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).expect("frame json");
            if accept(&value) {
                return value;
            }
        }
    }
}

#[tokio::test]
async fn redacted_login_never_reaches_readers() {
    let hub = start_hub(46110, 46109, |_| {}).await;
    let mut client = connect_ws(&hub).await;

    client
        .send(Message::Text(
            json!({
                "type": "browser_event",
                "source": "browser:network",
                "level": "info",
                "payload": {
                    "url": "/api/login",
                    "method": "POST",
                    "requestBody": {"username": "u@x.com", "password": "s"},
                    "responseBody": {"token": "t"},
                },
            })
            .to_string(),
        ))
        .await
        .expect("send");

    let body = wait_for(&hub, "/events?source=browser:network", |body| {
        body["total"] == 1
    })
    .await;
    let event = &body["events"][0];
    assert_eq!(event["payload"]["requestBody"]["password"], "[REDACTED]");
    assert_eq!(event["payload"]["responseBody"]["token"], "[REDACTED]");
    assert_eq!(event["payload"]["requestBody"]["username"], "u@x.com");
    assert_eq!(event["payload"]["url"], "/api/login");

    hub.stop().await.expect("stop");
}

#[tokio::test]
async fn watch_rule_catches_only_matching_statuses() {
    let hub = start_hub(46120, 46119, |config| {
        config.watch = vec![daibug_core::config::WatchRuleSpec {
            label: "auth failures".into(),
            status_codes: Some(vec![401]),
            url_pattern: Some("/api/**".into()),
            ..Default::default()
        }];
    })
    .await;
    let mut client = connect_ws(&hub).await;

    for status in [401, 200] {
        client
            .send(Message::Text(
                json!({
                    "type": "browser_event",
                    "source": "browser:network",
                    "level": "info",
                    "payload": {"status": status, "url": "/api/user"},
                })
                .to_string(),
            ))
            .await
            .expect("send");
    }

    // Both events land in the ring; exactly one is watched.
    wait_for(&hub, "/events?source=browser:network", |body| {
        body["total"] == 2
    })
    .await;
    let watched = http_get(&hub, "/watched-events").await;
    let entries = watched["events"].as_array().expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["matchedRule"]["label"], "auth failures");
    assert_eq!(entries[0]["event"]["payload"]["status"], 401);
    assert_eq!(entries[0]["event"]["payload"]["watched"], true);

    hub.stop().await.expect("stop");
}

#[tokio::test]
async fn snapshot_dom_round_trips_through_a_browser_client() {
    let hub = start_hub(46130, 46129, |_| {}).await;
    let registry = ToolRegistry::for_hub(hub.clone());
    let mut client = connect_ws(&hub).await;
    // The upgrade task registers the client; broadcast only after that.
    wait_for(&hub, "/status", |body| body["connectedClients"] == 1).await;

    let call = tokio::spawn(async move {
        registry
            .call("snapshot_dom", &json!({"timeout": 5_000}))
            .await
    });

    let command = next_matching_frame(&mut client, |frame| {
        frame["type"] == "command" && frame["command"] == "snapshot_dom"
    })
    .await;
    assert_eq!(command["type"], "command");

    client
        .send(Message::Text(
            json!({
                "type": "browser_event",
                "source": "browser:dom",
                "level": "info",
                "payload": {"type": "dom_snapshot", "nodeCount": 142, "snapshot": "<html/>"},
            })
            .to_string(),
        ))
        .await
        .expect("send");

    let text = call.await.expect("join");
    let result: Value = serde_json::from_str(&text).expect("tool json");
    assert_eq!(result["type"], "dom_snapshot");
    assert_eq!(result["nodeCount"], 142);
    assert_eq!(result["snapshot"], "<html/>");

    hub.stop().await.expect("stop");
}

#[tokio::test]
async fn ports_status_and_tab_registry_report_live_state() {
    let hub = start_hub(46140, 46139, |_| {}).await;

    let ports = http_get(&hub, "/ports").await;
    let (http_port, ws_port) = hub.ports().await;
    assert_eq!(ports["httpPort"], http_port);
    assert_eq!(ports["wsPort"], ws_port);
    assert_ne!(http_port, ws_port);

    let mut client = connect_ws(&hub).await;
    let status = wait_for(&hub, "/status", |body| body["connectedClients"] == 1).await;
    assert!(status["isDevServerRunning"].is_boolean());

    client
        .send(Message::Text(
            json!({
                "type": "browser_tab_info",
                "tabId": "tab-1",
                "tabUrl": "http://localhost:5173/",
                "tabTitle": "App",
            })
            .to_string(),
        ))
        .await
        .expect("send");
    let tabs = wait_for(&hub, "/tabs", |body| {
        body["tabs"].as_array().is_some_and(|t| t.len() == 1)
    })
    .await;
    assert_eq!(tabs["tabs"][0]["tabId"], "tab-1");
    assert_eq!(tabs["tabs"][0]["title"], "App");

    client.close(None).await.expect("close");
    wait_for(&hub, "/status", |body| body["connectedClients"] == 0).await;

    hub.stop().await.expect("stop");
}

#[tokio::test]
async fn event_ring_keeps_the_last_500_of_600() {
    let hub = start_hub(46150, 46149, |_| {}).await;
    // Clear the dev-server startup line so indexes line up exactly.
    hub.clear_events().await;
    for index in 0..600 {
        hub.ingest_browser_event("browser:console", "info", json!({"index": index}))
            .await
            .expect("ingest");
    }

    let body = http_get(&hub, "/events?limit=500").await;
    let events = body["events"].as_array().expect("events");
    assert_eq!(events.len(), 500);
    assert_eq!(events[0]["payload"]["index"], 100);
    assert_eq!(events[499]["payload"]["index"], 599);

    hub.stop().await.expect("stop");
}

#[tokio::test]
async fn command_endpoint_broadcasts_to_clients() {
    let hub = start_hub(46160, 46159, |_| {}).await;
    let mut client = connect_ws(&hub).await;
    let (http_port, _) = hub.ports().await;
    let http = reqwest::Client::new();

    // Give the upgrade task a moment to register the client.
    wait_for(&hub, "/status", |body| body["connectedClients"] == 1).await;

    let response = http
        .post(format!("http://127.0.0.1:{http_port}/command"))
        .json(&json!({"command": "capture_storage"}))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 202);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["accepted"], true);

    let frame = next_matching_frame(&mut client, |frame| {
        frame["type"] == "command" && frame["command"] == "capture_storage"
    })
    .await;
    assert_eq!(frame["command"], "capture_storage");

    let response = http
        .post(format!("http://127.0.0.1:{http_port}/command"))
        .json(&json!({"command": "rm_rf_slash"}))
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 400);

    let response = http
        .post(format!("http://127.0.0.1:{http_port}/command"))
        .body("{nope")
        .send()
        .await
        .expect("post");
    assert_eq!(response.status(), 400);

    hub.stop().await.expect("stop");
}

#[tokio::test]
async fn unknown_paths_get_json_404s() {
    let hub = start_hub(46170, 46169, |_| {}).await;
    let (http_port, _) = hub.ports().await;
    let response = reqwest::get(format!("http://127.0.0.1:{http_port}/nope"))
        .await
        .expect("get");
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["error"], "not found");

    hub.stop().await.expect("stop");
}

#[tokio::test]
async fn legacy_bare_event_frames_are_ingested() {
    let hub = start_hub(46180, 46179, |_| {}).await;
    let mut client = connect_ws(&hub).await;
    client
        .send(Message::Text(
            json!({
                "source": "browser:console",
                "level": "warn",
                "payload": {"message": "legacy client"},
            })
            .to_string(),
        ))
        .await
        .expect("send");

    let body = wait_for(&hub, "/events?source=browser:console", |body| {
        body["total"] == 1
    })
    .await;
    assert_eq!(body["events"][0]["level"], "warn");

    hub.stop().await.expect("stop");
}

#[tokio::test]
async fn double_start_is_rejected_and_stop_is_idempotent() {
    let hub = start_hub(46190, 46189, |_| {}).await;
    assert!(hub.clone().start().await.is_err());
    hub.stop().await.expect("first stop");
    hub.stop().await.expect("second stop");
}

#[tokio::test]
async fn watch_tools_drive_the_live_watch_engine() {
    let hub = start_hub(46200, 46199, |_| {}).await;
    let registry = ToolRegistry::for_hub(hub.clone());

    let added = registry
        .call(
            "add_watch_rule",
            &json!({"label": "server errors", "status_codes": [500]}),
        )
        .await;
    let added: Value = serde_json::from_str(&added).expect("json");
    let rule_id = added["rule"]["id"].as_str().expect("id").to_string();

    hub.ingest_browser_event(
        "browser:network",
        "error",
        json!({"status": 500, "url": "/api/x"}),
    )
    .await
    .expect("ingest");

    let watched = registry
        .call("get_watched_events", &json!({"rule_id": rule_id}))
        .await;
    let watched: Value = serde_json::from_str(&watched).expect("json");
    assert_eq!(watched["total"], 1);

    hub.add_watch_rule(
        "direct",
        None,
        WatchConditions {
            message_contains: Some("boom".into()),
            ..Default::default()
        },
    )
    .await
    .expect("rule");
    let rules = http_get(&hub, "/watch-rules").await;
    assert_eq!(rules["rules"].as_array().expect("rules").len(), 2);

    hub.stop().await.expect("stop");
}
