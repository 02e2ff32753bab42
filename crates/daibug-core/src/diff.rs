use crate::event::{Event, Interaction, Source};
use crate::session::{flatten_storage, sort_events, Session};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFieldDiff {
    pub id: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDiff {
    pub only_in_a: Vec<String>,
    pub only_in_b: Vec<String>,
    pub different: Vec<EventFieldDiff>,
}

impl EventDiff {
    fn is_empty(&self) -> bool {
        self.only_in_a.is_empty() && self.only_in_b.is_empty() && self.different.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionDiff {
    pub only_in_a: Vec<String>,
    pub only_in_b: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_mismatch_index: Option<usize>,
}

impl InteractionDiff {
    fn is_empty(&self) -> bool {
        self.only_in_a.is_empty()
            && self.only_in_b.is_empty()
            && self.first_mismatch_index.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusDifference {
    pub url: String,
    pub status_a: i64,
    pub status_b: i64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDiff {
    pub endpoints_only_in_a: Vec<String>,
    pub endpoints_only_in_b: Vec<String>,
    pub status_differences: Vec<StatusDifference>,
}

impl NetworkDiff {
    fn is_empty(&self) -> bool {
        self.endpoints_only_in_a.is_empty()
            && self.endpoints_only_in_b.is_empty()
            && self.status_differences.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageValueDiff {
    pub key: String,
    pub value_a: Value,
    pub value_b: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDiff {
    pub keys_only_in_a: Vec<String>,
    pub keys_only_in_b: Vec<String>,
    pub value_differences: Vec<StorageValueDiff>,
}

impl StorageDiff {
    fn is_empty(&self) -> bool {
        self.keys_only_in_a.is_empty()
            && self.keys_only_in_b.is_empty()
            && self.value_differences.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub identical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diverges_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDiff {
    pub event_diff: EventDiff,
    pub interaction_diff: InteractionDiff,
    pub network_diff: NetworkDiff,
    pub storage_diff: StorageDiff,
    pub summary: DiffSummary,
}

/// Compare two recorded sessions. Events are matched by id, interactions
/// by id plus positional signature, network endpoints by first-seen
/// status, storage by the flattened key space.
pub fn diff_sessions(a: &Session, b: &Session) -> SessionDiff {
    let mut events_a = a.events.clone();
    let mut events_b = b.events.clone();
    sort_events(&mut events_a);
    sort_events(&mut events_b);

    let event_diff = diff_events(&events_a, &events_b);
    let interaction_diff = diff_interactions(&a.interactions, &b.interactions);
    let network_diff = diff_network(&events_a, &events_b);
    let storage_diff = diff_storage(a, b);

    let identical = event_diff.is_empty()
        && interaction_diff.is_empty()
        && network_diff.is_empty()
        && storage_diff.is_empty();
    let diverges_at = if identical {
        None
    } else {
        divergence_point(&events_a, &events_b)
    };

    SessionDiff {
        event_diff,
        interaction_diff,
        network_diff,
        storage_diff,
        summary: DiffSummary {
            identical,
            diverges_at,
        },
    }
}

fn diff_events(a: &[Event], b: &[Event]) -> EventDiff {
    let index_a: HashMap<&str, &Event> = a.iter().map(|e| (e.id.as_str(), e)).collect();
    let index_b: HashMap<&str, &Event> = b.iter().map(|e| (e.id.as_str(), e)).collect();

    let mut only_in_a: Vec<String> = a
        .iter()
        .filter(|e| !index_b.contains_key(e.id.as_str()))
        .map(|e| e.id.clone())
        .collect();
    let mut only_in_b: Vec<String> = b
        .iter()
        .filter(|e| !index_a.contains_key(e.id.as_str()))
        .map(|e| e.id.clone())
        .collect();
    only_in_a.sort();
    only_in_b.sort();

    let mut different = Vec::new();
    for event_a in a {
        let Some(event_b) = index_b.get(event_a.id.as_str()) else {
            continue;
        };
        let mut fields = Vec::new();
        if event_a.source != event_b.source {
            fields.push("source".to_string());
        }
        if event_a.level != event_b.level {
            fields.push("level".to_string());
        }
        if event_a.ts != event_b.ts {
            fields.push("ts".to_string());
        }
        if event_a.payload != event_b.payload {
            fields.push("payload".to_string());
        }
        if !fields.is_empty() {
            different.push(EventFieldDiff {
                id: event_a.id.clone(),
                fields,
            });
        }
    }

    EventDiff {
        only_in_a,
        only_in_b,
        different,
    }
}

/// Everything that identifies an interaction except its id.
fn interaction_signature(i: &Interaction) -> (&str, Option<&str>, Option<&str>, Option<&str>, Option<f64>, Option<f64>) {
    (
        i.kind.as_str(),
        i.target.as_deref(),
        i.value.as_deref(),
        i.url.as_deref(),
        i.x,
        i.y,
    )
}

fn diff_interactions(a: &[Interaction], b: &[Interaction]) -> InteractionDiff {
    let ids_a: HashMap<&str, ()> = a.iter().map(|i| (i.id.as_str(), ())).collect();
    let ids_b: HashMap<&str, ()> = b.iter().map(|i| (i.id.as_str(), ())).collect();

    let mut only_in_a: Vec<String> = a
        .iter()
        .filter(|i| !ids_b.contains_key(i.id.as_str()))
        .map(|i| i.id.clone())
        .collect();
    let mut only_in_b: Vec<String> = b
        .iter()
        .filter(|i| !ids_a.contains_key(i.id.as_str()))
        .map(|i| i.id.clone())
        .collect();
    only_in_a.sort();
    only_in_b.sort();

    let first_mismatch_index = a
        .iter()
        .zip(b.iter())
        .position(|(ia, ib)| interaction_signature(ia) != interaction_signature(ib));

    InteractionDiff {
        only_in_a,
        only_in_b,
        first_mismatch_index,
    }
}

/// First-seen status per URL over the network events of one session.
fn first_statuses(events: &[Event]) -> BTreeMap<String, i64> {
    let mut out = BTreeMap::new();
    for event in events {
        if event.source != Source::BrowserNetwork {
            continue;
        }
        let (Some(url), Some(status)) = (event.payload_str("url"), event.payload_i64("status"))
        else {
            continue;
        };
        out.entry(url.to_string()).or_insert(status);
    }
    out
}

fn diff_network(a: &[Event], b: &[Event]) -> NetworkDiff {
    let statuses_a = first_statuses(a);
    let statuses_b = first_statuses(b);

    let endpoints_only_in_a = statuses_a
        .keys()
        .filter(|url| !statuses_b.contains_key(*url))
        .cloned()
        .collect();
    let endpoints_only_in_b = statuses_b
        .keys()
        .filter(|url| !statuses_a.contains_key(*url))
        .cloned()
        .collect();

    let status_differences = statuses_a
        .iter()
        .filter_map(|(url, status_a)| {
            let status_b = statuses_b.get(url)?;
            (status_a != status_b).then(|| StatusDifference {
                url: url.clone(),
                status_a: *status_a,
                status_b: *status_b,
            })
        })
        .collect();

    NetworkDiff {
        endpoints_only_in_a,
        endpoints_only_in_b,
        status_differences,
    }
}

fn diff_storage(a: &Session, b: &Session) -> StorageDiff {
    let flat_a = flatten_storage(&a.storage_snapshots);
    let flat_b = flatten_storage(&b.storage_snapshots);

    let mut keys_only_in_a: Vec<String> = flat_a
        .keys()
        .filter(|k| !flat_b.contains_key(*k))
        .cloned()
        .collect();
    let mut keys_only_in_b: Vec<String> = flat_b
        .keys()
        .filter(|k| !flat_a.contains_key(*k))
        .cloned()
        .collect();
    keys_only_in_a.sort();
    keys_only_in_b.sort();

    let mut value_differences: Vec<StorageValueDiff> = flat_a
        .iter()
        .filter_map(|(key, value_a)| {
            let value_b = flat_b.get(key)?;
            (value_a != value_b).then(|| StorageValueDiff {
                key: key.clone(),
                value_a: value_a.clone(),
                value_b: value_b.clone(),
            })
        })
        .collect();
    value_differences.sort_by(|x, y| x.key.cmp(&y.key));

    StorageDiff {
        keys_only_in_a,
        keys_only_in_b,
        value_differences,
    }
}

/// The `ts` where the sorted event sequences first part ways.
fn divergence_point(a: &[Event], b: &[Event]) -> Option<i64> {
    for (event_a, event_b) in a.iter().zip(b.iter()) {
        if event_a != event_b {
            return Some(event_a.ts.min(event_b.ts));
        }
    }
    match (a.len(), b.len()) {
        (la, lb) if la > lb => a.get(lb).map(|e| e.ts),
        (la, lb) if lb > la => b.get(la).map(|e| e.ts),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::event::EventFactory;
    use crate::session::{SessionEnvironment, SessionRecorder};
    use serde_json::json;

    fn session_with_events(events: Vec<Event>) -> Session {
        let mut recorder = SessionRecorder::start(
            None,
            SessionEnvironment::default(),
            Config::default(),
            events,
        );
        recorder.stop();
        recorder.snapshot()
    }

    fn event(id: &str, ts: i64, source: &str, level: &str, payload: serde_json::Value) -> Event {
        let mut e = EventFactory::new()
            .create_raw(source, level, payload)
            .expect("valid event");
        e.id = id.to_string();
        e.ts = ts;
        e
    }

    #[test]
    fn a_session_is_identical_to_itself() {
        let session = session_with_events(vec![
            event("evt_1", 1, "browser:network", "info", json!({"status": 200, "url": "/a"})),
            event("evt_2", 2, "browser:console", "error", json!({"message": "x"})),
        ]);
        let diff = diff_sessions(&session, &session);
        assert!(diff.summary.identical);
        assert!(diff.summary.diverges_at.is_none());
        assert!(diff.event_diff.is_empty());
        assert!(diff.network_diff.is_empty());
        assert!(diff.storage_diff.is_empty());
        assert!(diff.interaction_diff.is_empty());
    }

    #[test]
    fn extra_events_show_up_on_the_right_side() {
        let shared = event("evt_1", 1, "vite", "info", json!({"message": "boot"}));
        let a = session_with_events(vec![
            shared.clone(),
            event("evt_2", 5, "vite", "info", json!({"message": "only a"})),
        ]);
        let b = session_with_events(vec![shared]);
        let diff = diff_sessions(&a, &b);
        assert_eq!(diff.event_diff.only_in_a, vec!["evt_2"]);
        assert!(diff.event_diff.only_in_b.is_empty());
        assert!(!diff.summary.identical);
        // Divergence is the first extra event in the longer sequence.
        assert_eq!(diff.summary.diverges_at, Some(5));
    }

    #[test]
    fn shared_ids_with_changed_fields_are_listed_with_field_names() {
        let a = session_with_events(vec![event(
            "evt_1",
            1,
            "browser:network",
            "info",
            json!({"status": 200, "url": "/x"}),
        )]);
        let b = session_with_events(vec![event(
            "evt_1",
            1,
            "browser:network",
            "error",
            json!({"status": 500, "url": "/x"}),
        )]);
        let diff = diff_sessions(&a, &b);
        assert_eq!(diff.event_diff.different.len(), 1);
        assert_eq!(diff.event_diff.different[0].id, "evt_1");
        assert_eq!(diff.event_diff.different[0].fields, vec!["level", "payload"]);
        assert_eq!(diff.summary.diverges_at, Some(1));
    }

    #[test]
    fn checkout_status_regression_is_reported_per_endpoint() {
        let a = session_with_events(vec![event(
            "evt_a",
            10,
            "browser:network",
            "info",
            json!({"status": 200, "url": "/api/checkout", "method": "POST"}),
        )]);
        let b = session_with_events(vec![event(
            "evt_b",
            11,
            "browser:network",
            "error",
            json!({"status": 500, "url": "/api/checkout", "method": "POST"}),
        )]);
        let diff = diff_sessions(&a, &b);
        assert!(!diff.summary.identical);
        assert_eq!(
            diff.network_diff.status_differences,
            vec![StatusDifference {
                url: "/api/checkout".into(),
                status_a: 200,
                status_b: 500,
            }]
        );
    }

    #[test]
    fn network_diff_uses_first_seen_status_per_url() {
        let a = session_with_events(vec![
            event("evt_1", 1, "browser:network", "info", json!({"status": 200, "url": "/r"})),
            event("evt_2", 2, "browser:network", "info", json!({"status": 500, "url": "/r"})),
        ]);
        let b = session_with_events(vec![event(
            "evt_1",
            1,
            "browser:network",
            "info",
            json!({"status": 200, "url": "/r"}),
        )]);
        let diff = diff_sessions(&a, &b);
        // Same first-seen status, so no status difference even though A
        // later saw a 500.
        assert!(diff.network_diff.status_differences.is_empty());
    }

    #[test]
    fn endpoints_missing_on_one_side_are_reported() {
        let a = session_with_events(vec![event(
            "evt_1",
            1,
            "browser:network",
            "info",
            json!({"status": 200, "url": "/only-a"}),
        )]);
        let b = session_with_events(vec![event(
            "evt_2",
            1,
            "browser:network",
            "info",
            json!({"status": 200, "url": "/only-b"}),
        )]);
        let diff = diff_sessions(&a, &b);
        assert_eq!(diff.network_diff.endpoints_only_in_a, vec!["/only-a"]);
        assert_eq!(diff.network_diff.endpoints_only_in_b, vec!["/only-b"]);
    }

    #[test]
    fn interaction_positional_mismatch_is_located() {
        let click = Interaction {
            id: "int_1".into(),
            ts: 1,
            kind: "click".into(),
            target: Some("#buy".into()),
            value: None,
            url: None,
            x: Some(10.0),
            y: Some(20.0),
        };
        let mut a = session_with_events(Vec::new());
        let mut b = session_with_events(Vec::new());
        a.interactions = vec![click.clone(), click.clone()];
        // Same ids, different signature at index 1.
        let mut b1 = click.clone();
        b1.id = "int_1".into();
        let mut b2 = click.clone();
        b2.id = "int_2".into();
        b2.target = Some("#cancel".into());
        b.interactions = vec![b1, b2];
        // Align ids so only the positional check fires.
        a.interactions[1].id = "int_2".into();

        let diff = diff_sessions(&a, &b);
        assert_eq!(diff.interaction_diff.first_mismatch_index, Some(1));
        assert!(!diff.summary.identical);
    }

    #[test]
    fn storage_diff_flattens_and_compares_values() {
        let mut a = session_with_events(Vec::new());
        let mut b = session_with_events(Vec::new());
        let Value::Object(store_a) = json!({"cart": "3 items", "only-a": "1"}) else {
            unreachable!()
        };
        let Value::Object(store_b) = json!({"cart": "empty", "only-b": "2"}) else {
            unreachable!()
        };
        a.storage_snapshots = vec![crate::event::StorageSnapshot {
            ts: 1,
            url: "/".into(),
            tab_id: None,
            local_storage: store_a,
            session_storage: Default::default(),
            cookies: None,
        }];
        b.storage_snapshots = vec![crate::event::StorageSnapshot {
            ts: 1,
            url: "/".into(),
            tab_id: None,
            local_storage: store_b,
            session_storage: Default::default(),
            cookies: None,
        }];

        let diff = diff_sessions(&a, &b);
        assert_eq!(diff.storage_diff.keys_only_in_a, vec!["only-a"]);
        assert_eq!(diff.storage_diff.keys_only_in_b, vec!["only-b"]);
        assert_eq!(diff.storage_diff.value_differences.len(), 1);
        assert_eq!(diff.storage_diff.value_differences[0].key, "cart");
    }

    #[test]
    fn diff_serializes_with_the_documented_key_names() {
        let a = session_with_events(vec![event(
            "evt_1",
            1,
            "browser:network",
            "info",
            json!({"status": 200, "url": "/api/checkout"}),
        )]);
        let b = session_with_events(vec![event(
            "evt_1",
            1,
            "browser:network",
            "info",
            json!({"status": 500, "url": "/api/checkout"}),
        )]);
        let value = serde_json::to_value(diff_sessions(&a, &b)).expect("serialize");
        assert_eq!(value["summary"]["identical"], false);
        assert_eq!(
            value["networkDiff"]["statusDifferences"][0]["url"],
            "/api/checkout"
        );
        assert_eq!(value["networkDiff"]["statusDifferences"][0]["statusA"], 200);
        assert_eq!(value["networkDiff"]["statusDifferences"][0]["statusB"], 500);
    }
}
