//! Integration tests for channels talking to an in-memory server.

use ghostsync_diff::{operations_from_value, operations_to_value, JsonDiff, ObjectOperationSet};
use ghostsync_engine::{
    ChangeFailure, Channel, ChannelConfig, ChannelDriver, ChannelEvent, ChannelSink, ChannelState,
    FrameSink, GhostStore, MemoryGhostStore, MultiplexSink, SyncPhase,
};
use ghostsync_protocol::{split_channel_prefix, ChangeErrorCode};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Who a server reply goes to.
enum Route {
    Sender,
    All,
}

#[derive(Default)]
struct History {
    versions: Vec<Value>,
    diffs: Vec<ObjectOperationSet>,
}

/// A bucket server that rebases stale changes over the history it has seen.
struct InMemoryServer {
    jd: JsonDiff,
    objects: BTreeMap<String, History>,
    cv: u64,
}

impl InMemoryServer {
    fn new() -> Self {
        Self {
            jd: JsonDiff::default(),
            objects: BTreeMap::new(),
            cv: 0,
        }
    }

    fn seed(&mut self, id: &str, data: Value) {
        let history = self.objects.entry(id.to_string()).or_default();
        if let Some(previous) = history.versions.last() {
            history.diffs.push(self.jd.object_diff(previous, &data));
        }
        history.versions.push(data);
        self.cv += 1;
    }

    fn latest(&self, id: &str) -> Option<(u64, &Value)> {
        let history = self.objects.get(id)?;
        history
            .versions
            .last()
            .map(|data| (history.versions.len() as u64, data))
    }

    fn handle(&mut self, frame: &str) -> Vec<(Route, String)> {
        let (command, payload) = frame.split_once(':').unwrap();
        match command {
            "init" => vec![(Route::Sender, "auth:tester@example.com".to_string())],
            "i" => vec![(Route::Sender, self.index_page())],
            "cv" => Vec::new(),
            "e" => {
                let (id, version) = payload.rsplit_once('.').unwrap();
                let version: usize = version.parse().unwrap();
                let body = self
                    .objects
                    .get(id)
                    .and_then(|h| h.versions.get(version.wrapping_sub(1)))
                    .map_or_else(|| "?".to_string(), Value::to_string);
                vec![(Route::Sender, format!("e:{id}.{version}\n{body}"))]
            }
            "c" => self.apply(serde_json::from_str(payload).unwrap()),
            other => panic!("unexpected command {other}"),
        }
    }

    fn index_page(&self) -> String {
        let index: Vec<Value> = self
            .objects
            .iter()
            .filter_map(|(id, h)| {
                h.versions
                    .last()
                    .map(|d| json!({"id": id, "v": h.versions.len(), "d": d}))
            })
            .collect();
        format!("i:{}", json!({"index": index, "current": self.cv.to_string()}))
    }

    fn apply(&mut self, change: Value) -> Vec<(Route, String)> {
        let jd = self.jd;
        let id = change["id"].as_str().unwrap().to_string();
        let ccid = change["ccid"].as_str().unwrap().to_string();

        if change["o"] == "-" {
            let version = self.objects.remove(&id).map_or(0, |h| h.versions.len() as u64);
            self.cv += 1;
            let record = json!([{"id": id, "o": "-", "cv": self.cv.to_string(), "ccids": [ccid], "ev": version + 1}]);
            return vec![(Route::All, format!("c:{record}"))];
        }

        let history = self.objects.entry(id.clone()).or_default();
        let version = history.versions.len() as u64;
        let current = history.versions.last().cloned().unwrap_or_else(|| json!({}));

        let (diff, data) = if let Some(full) = change.get("d") {
            (jd.object_diff(&current, full), full.clone())
        } else {
            let sv = change["sv"].as_u64().unwrap_or(0);
            if sv > version || (sv == 0 && version > 0) {
                return error_reply(&id, &ccid, 405);
            }
            let mut diff = operations_from_value(&change["v"]).unwrap();
            let mut origin = if sv == 0 {
                json!({})
            } else {
                history.versions[sv as usize - 1].clone()
            };
            for remote in history.diffs.iter().skip(sv.saturating_sub(1) as usize) {
                diff = match jd.transform_object_diff(&diff, remote, &origin) {
                    Ok(diff) => diff,
                    Err(_) => return error_reply(&id, &ccid, 440),
                };
                origin = jd.apply_object_diff(&origin, remote).unwrap();
            }
            match jd.apply_object_diff(&current, &diff) {
                Ok(data) => (diff, data),
                Err(_) => return error_reply(&id, &ccid, 440),
            }
        };
        if diff.is_empty() {
            return error_reply(&id, &ccid, 412);
        }

        if version > 0 {
            history.diffs.push(diff.clone());
        }
        history.versions.push(data);
        self.cv += 1;
        let record = json!([{
            "id": id,
            "o": "M",
            "cv": self.cv.to_string(),
            "ccids": [ccid],
            "sv": (version > 0).then_some(version),
            "ev": version + 1,
            "v": operations_to_value(&diff),
        }]);
        vec![(Route::All, format!("c:{record}"))]
    }
}

fn error_reply(id: &str, ccid: &str, code: u16) -> Vec<(Route, String)> {
    let record = json!([{"id": id, "ccids": [ccid], "error": code}]);
    vec![(Route::Sender, format!("c:{record}"))]
}

/// Clients wired to one server, delivering frames in lockstep.
struct Network {
    server: InMemoryServer,
    clients: Vec<Channel<MemoryGhostStore>>,
}

impl Network {
    fn new(server: InMemoryServer, clients: usize) -> Self {
        let clients = (0..clients)
            .map(|i| {
                Channel::new(
                    ChannelConfig::new("app", "notes", "token").with_client_id(format!("client-{i}")),
                    MemoryGhostStore::new(),
                )
            })
            .collect();
        Self { server, clients }
    }

    fn connect_all(&mut self) {
        for client in &mut self.clients {
            client.connect().unwrap();
        }
        self.pump();
        for client in &mut self.clients {
            assert_eq!(client.state(), ChannelState::Authenticated(SyncPhase::Syncing));
            client.take_events();
        }
    }

    fn pump(&mut self) {
        for _ in 0..100 {
            let mut outbound = Vec::new();
            for (i, client) in self.clients.iter_mut().enumerate() {
                outbound.extend(client.take_frames().into_iter().map(|frame| (i, frame)));
            }
            if outbound.is_empty() {
                return;
            }
            let mut deliveries = Vec::new();
            for (sender, frame) in outbound {
                for (route, reply) in self.server.handle(&frame) {
                    match route {
                        Route::Sender => deliveries.push((sender, reply)),
                        Route::All => {
                            deliveries.extend((0..self.clients.len()).map(|i| (i, reply.clone())))
                        }
                    }
                }
            }
            for (i, frame) in deliveries {
                self.clients[i].handle_message(&frame).unwrap();
            }
        }
        panic!("network did not settle");
    }

    fn ghost(&self, client: usize, id: &str) -> (u64, Value) {
        let ghost = self.clients[client].store().get(id).unwrap();
        (ghost.version, ghost.data)
    }
}

/// A single channel that has authenticated against a stored change version.
fn syncing_channel() -> Channel<MemoryGhostStore> {
    let store = MemoryGhostStore::new();
    store.set_change_version("cv0").unwrap();
    let mut channel = Channel::new(ChannelConfig::new("app", "notes", "token"), store);
    channel.connect().unwrap();
    channel.handle_message("auth:me").unwrap();
    channel.take_frames();
    channel.take_events();
    channel
}

fn sent_record(frames: &[String]) -> Value {
    let frame = frames
        .iter()
        .rev()
        .find(|frame| frame.starts_with("c:"))
        .expect("no change frame");
    serde_json::from_str(&frame[2..]).unwrap()
}

#[test]
fn concurrent_text_edits_converge() {
    let mut server = InMemoryServer::new();
    server.seed("n", json!({"t": "AC"}));
    let mut net = Network::new(server, 2);
    net.connect_all();
    assert_eq!(net.ghost(0, "n"), (1, json!({"t": "AC"})));

    net.clients[0].update("n", json!({"t": "ABC"})).unwrap();
    net.clients[1].update("n", json!({"t": "ACD"})).unwrap();
    net.pump();

    assert_eq!(net.server.latest("n"), Some((3, &json!({"t": "ABCD"}))));
    for client in 0..2 {
        assert_eq!(net.ghost(client, "n"), (3, json!({"t": "ABCD"})));
        assert!(!net.clients[client].local_queue().has_pending("n"));
    }

    let updates: Vec<Value> = net.clients[1]
        .take_events()
        .into_iter()
        .filter_map(|event| match event {
            ChannelEvent::Update { data, .. } => Some(data),
            _ => None,
        })
        .collect();
    assert_eq!(updates, vec![json!({"t": "ABCD"})]);
    assert_eq!(net.clients[1].stats().rebases, 1);
}

#[test]
fn queued_edits_survive_a_remote_change() {
    let mut server = InMemoryServer::new();
    server.seed("n", json!({"a": "x", "b": "y"}));
    let mut net = Network::new(server, 2);
    net.connect_all();

    net.clients[0].update("n", json!({"a": "x1", "b": "y"})).unwrap();
    net.clients[0].update("n", json!({"a": "x2", "b": "y"})).unwrap();
    net.clients[1].update("n", json!({"a": "x", "b": "y1"})).unwrap();
    net.pump();

    let expected = json!({"a": "x2", "b": "y1"});
    assert_eq!(net.server.latest("n"), Some((4, &expected)));
    assert_eq!(net.ghost(0, "n"), (4, expected.clone()));
    assert_eq!(net.ghost(1, "n"), (4, expected));
}

#[test]
fn edits_made_while_one_is_in_flight_are_compressed() {
    let mut server = InMemoryServer::new();
    server.seed("n", json!({"t": "A"}));
    let mut net = Network::new(server, 1);
    net.connect_all();

    net.clients[0].update("n", json!({"t": "AB"})).unwrap();
    net.clients[0].update("n", json!({"t": "ABC"})).unwrap();
    net.clients[0].update("n", json!({"t": "ABCD", "n": 1})).unwrap();
    net.pump();

    // Seed, the first edit, then the remaining two folded into one.
    assert_eq!(net.server.latest("n"), Some((3, &json!({"t": "ABCD", "n": 1}))));
    assert_eq!(net.clients[0].stats().changes_sent, 2);
    assert_eq!(net.clients[0].stats().changes_acknowledged, 2);
}

#[test]
fn at_most_one_change_in_flight_per_object() {
    let mut channel = syncing_channel();
    channel.store().put("n", 1, json!({"t": "A"})).unwrap();

    channel.update("n", json!({"t": "AB"})).unwrap();
    channel.update("n", json!({"t": "ABC"})).unwrap();
    channel.update("other", json!({"x": 1})).unwrap();
    let frames = channel.take_frames();
    assert_eq!(frames.len(), 2);

    let first = sent_record(&frames[..1]);
    assert_eq!(first["id"], "n");
    assert_eq!(first["sv"], 1);
    assert_eq!(channel.local_queue().queued("n").count(), 1);
}

#[test]
fn missing_version_is_fetched_before_applying() {
    let mut channel = syncing_channel();
    channel.store().put("n", 3, json!({"t": "A"})).unwrap();

    channel
        .handle_message(
            r#"c:[{"id": "n", "o": "M", "cv": "cv6", "sv": 5, "ev": 6, "ccids": ["x"], "v": {"t": {"o": "d", "v": "=2\t+D"}}},
                  {"id": "n", "o": "M", "cv": "cv7", "sv": 6, "ev": 7, "ccids": ["y"], "v": {"u": {"o": "+", "v": 1}}}]"#,
        )
        .unwrap();
    assert_eq!(channel.take_frames(), vec!["e:n.5"]);
    assert!(channel.is_awaiting_version("n"));
    assert_eq!(channel.store().get("n").unwrap().version, 3);

    channel.handle_message("e:n.5\n{\"t\": \"AC\"}").unwrap();
    assert!(!channel.is_awaiting_version("n"));
    let ghost = channel.store().get("n").unwrap();
    assert_eq!(ghost.version, 7);
    assert_eq!(ghost.data, json!({"t": "ACD", "u": 1}));
    assert_eq!(channel.store().change_version().unwrap().as_deref(), Some("cv7"));
}

#[test]
fn one_bad_record_does_not_sink_the_batch() {
    let mut channel = syncing_channel();
    channel.store().put("a", 1, json!({"t": "AB"})).unwrap();
    channel.store().put("b", 1, json!({"t": "W"})).unwrap();

    channel
        .handle_message(
            r#"c:[{"id": "a", "o": "M", "cv": "cv1", "sv": 1, "ev": 2, "ccids": ["x"], "v": {"t": {"o": "d", "v": "=9\t+Q"}}},
                  {"id": "b", "o": "M", "cv": "cv2", "sv": 1, "ev": 2, "ccids": ["y"], "v": {"t": {"o": "r", "v": "X"}}},
                  {"id": "a", "o": "M", "cv": "cv3", "sv": 1, "ev": 2, "ccids": ["z"], "v": {"u": {"o": "+", "v": 1}}}]"#,
        )
        .unwrap();

    let b = channel.store().get("b").unwrap();
    assert_eq!((b.version, b.data), (2, json!({"t": "X"})));
    let a = channel.store().get("a").unwrap();
    assert_eq!((a.version, a.data), (2, json!({"t": "AB", "u": 1})));
    assert_eq!(channel.store().change_version().unwrap().as_deref(), Some("cv3"));

    let events = channel.take_events();
    assert_eq!(events.len(), 3);
    assert!(matches!(
        &events[0],
        ChannelEvent::ChangeError { id, failure: ChangeFailure::Inapplicable { .. } } if id == "a"
    ));
}

#[test]
fn malformed_text_delta_is_reported_not_fatal() {
    let mut channel = syncing_channel();
    channel.store().put("n", 1, json!({"t": "AB"})).unwrap();

    channel
        .handle_message(
            r#"c:[{"id": "n", "o": "M", "cv": "cv1", "sv": 1, "ev": 2, "ccids": ["x"], "v": {"t": {"o": "d", "v": "=18446744073709551615\t=3"}}}]"#,
        )
        .unwrap();

    let ghost = channel.store().get("n").unwrap();
    assert_eq!((ghost.version, ghost.data), (1, json!({"t": "AB"})));
    match channel.take_events().as_slice() {
        [ChannelEvent::ChangeError { id, failure: ChangeFailure::Inapplicable { message } }] => {
            assert_eq!(id, "n");
            assert!(message.contains("overflow"), "{message}");
        }
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(channel.store().change_version().unwrap().as_deref(), Some("cv0"));
}

#[test]
fn unknown_version_drops_the_change() {
    let mut channel = syncing_channel();
    channel.store().put("n", 3, json!({"t": "A"})).unwrap();
    channel
        .handle_message(
            r#"c:[{"id": "n", "o": "M", "cv": "cv6", "sv": 5, "ev": 6, "ccids": ["x"], "v": {"t": {"o": "r", "v": "B"}}}]"#,
        )
        .unwrap();
    channel.take_frames();

    channel.handle_message("e:n.5\n?").unwrap();
    assert!(!channel.is_awaiting_version("n"));
    assert_eq!(channel.store().get("n").unwrap().version, 3);
    assert_eq!(
        channel.take_events(),
        vec![ChannelEvent::ChangeError {
            id: "n".into(),
            failure: ChangeFailure::VersionUnavailable { version: 5 },
        }]
    );
}

#[test]
fn catch_up_gives_up_after_repeated_timeouts() {
    let mut channel = syncing_channel();
    channel.store().put("n", 3, json!({"t": "A"})).unwrap();
    channel
        .handle_message(
            r#"c:[{"id": "n", "o": "M", "cv": "cv6", "sv": 5, "ev": 6, "ccids": ["x"], "v": {"t": {"o": "r", "v": "B"}}},
                  {"id": "n", "o": "M", "cv": "cv7", "sv": 3, "ev": 4, "ccids": ["y"], "v": {"t": {"o": "r", "v": "C"}}}]"#,
        )
        .unwrap();
    assert_eq!(channel.take_frames(), vec!["e:n.5"]);

    let start = Instant::now();
    channel.tick(start + Duration::from_secs(11)).unwrap();
    channel.tick(start + Duration::from_secs(22)).unwrap();
    assert_eq!(channel.take_frames(), vec!["e:n.5", "e:n.5"]);
    channel.tick(start + Duration::from_secs(33)).unwrap();
    assert!(channel.take_frames().is_empty());

    // The queue for the object moves on to the next change.
    let ghost = channel.store().get("n").unwrap();
    assert_eq!(ghost.version, 4);
    assert_eq!(ghost.data, json!({"t": "C"}));
    assert!(channel.take_events().iter().any(|event| matches!(
        event,
        ChannelEvent::ChangeError {
            failure: ChangeFailure::VersionTimeout { version: 5, .. },
            ..
        }
    )));
}

#[test]
fn invalid_diff_is_resent_in_full_then_dropped() {
    let mut channel = syncing_channel();
    channel.store().put("n", 1, json!({"t": "A"})).unwrap();
    channel.update("n", json!({"t": "AB"})).unwrap();
    let sent = sent_record(&channel.take_frames());
    let ccid = sent["ccid"].as_str().unwrap().to_string();
    assert!(sent.get("d").is_none());

    let rejection = format!(r#"c:[{{"id": "n", "ccids": ["{ccid}"], "error": 440}}]"#);
    channel.handle_message(&rejection).unwrap();
    let resent = sent_record(&channel.take_frames());
    assert_eq!(resent["ccid"], ccid.as_str());
    assert_eq!(resent["d"], json!({"t": "AB"}));

    channel.handle_message(&rejection).unwrap();
    assert!(channel.take_frames().is_empty());
    assert!(channel.local_queue().sent("n").is_none());
    assert_eq!(
        channel.take_events(),
        vec![ChannelEvent::ChangeDropped {
            id: "n".into(),
            ccid,
            code: ChangeErrorCode::InvalidDiff,
        }]
    );
}

#[test]
fn duplicate_change_counts_as_acknowledged() {
    let mut channel = syncing_channel();
    channel.store().put("n", 1, json!({"t": "A"})).unwrap();
    channel.update("n", json!({"t": "AB"})).unwrap();
    channel.update("n", json!({"t": "ABC"})).unwrap();
    let ccid = sent_record(&channel.take_frames())["ccid"]
        .as_str()
        .unwrap()
        .to_string();

    channel
        .handle_message(&format!(r#"c:[{{"id": "n", "ccids": ["{ccid}"], "error": 409}}]"#))
        .unwrap();
    assert_eq!(
        channel.take_events(),
        vec![ChannelEvent::Acknowledge { id: "n".into(), ccid: ccid.clone() }]
    );
    // The queued edit goes out next.
    let next = sent_record(&channel.take_frames());
    assert_ne!(next["ccid"], ccid.as_str());
}

#[test]
fn other_rejections_are_reported() {
    let mut channel = syncing_channel();
    channel.update("n", json!({"big": "x"})).unwrap();
    let ccid = sent_record(&channel.take_frames())["ccid"]
        .as_str()
        .unwrap()
        .to_string();
    channel
        .handle_message(&format!(r#"c:[{{"id": "n", "ccids": ["{ccid}"], "error": 413}}]"#))
        .unwrap();
    assert_eq!(
        channel.take_events(),
        vec![ChannelEvent::ChangeError {
            id: "n".into(),
            failure: ChangeFailure::Rejected(ChangeErrorCode::DocumentTooLarge),
        }]
    );
    assert!(!channel.local_queue().has_pending("n"));
}

#[test]
fn index_bootstrap_pages_and_prunes() {
    let store = MemoryGhostStore::new();
    store.put("old", 4, json!({"gone": true})).unwrap();
    let config = ChannelConfig::new("app", "notes", "token").with_index_page_size(2);
    let mut channel = Channel::new(config, store);
    channel.connect().unwrap();
    channel.take_frames();

    channel.handle_message("auth:me").unwrap();
    assert_eq!(channel.take_frames(), vec!["i:1:::2"]);
    channel.update("local", json!({"x": 1})).unwrap();
    assert!(channel.take_frames().is_empty());

    channel
        .handle_message(
            r#"i:{"index": [{"id": "a", "v": 1, "d": {"t": "a"}}, {"id": "b", "v": 3, "d": {"t": "b"}}], "mark": "m1"}"#,
        )
        .unwrap();
    assert_eq!(channel.take_frames(), vec!["i:1:m1::2"]);
    assert_eq!(channel.state(), ChannelState::Authenticated(SyncPhase::Indexing));

    channel
        .handle_message(r#"i:{"index": [{"id": "c", "v": 2, "d": {"t": "c"}}], "current": "cv7"}"#)
        .unwrap();
    assert_eq!(channel.state(), ChannelState::Authenticated(SyncPhase::Syncing));
    assert!(channel.store().contains("a"));
    assert!(channel.store().contains("c"));
    assert!(!channel.store().contains("old"));
    assert_eq!(channel.store().change_version().unwrap().as_deref(), Some("cv7"));

    let events = channel.take_events();
    let indexed = events
        .iter()
        .filter(|event| matches!(event, ChannelEvent::Update { indexing: true, .. }))
        .count();
    assert_eq!(indexed, 3);
    assert!(events.contains(&ChannelEvent::Remove { id: "old".into() }));
    assert_eq!(events.last(), Some(&ChannelEvent::Indexed));

    // Held-back edits go out once syncing.
    assert_eq!(sent_record(&channel.take_frames())["id"], "local");
}

#[test]
fn unknown_change_version_triggers_reindex() {
    let mut channel = syncing_channel();
    channel.handle_message("cv:?").unwrap();
    assert_eq!(channel.state(), ChannelState::Authenticated(SyncPhase::Indexing));
    assert_eq!(channel.take_frames(), vec!["i:1:::10"]);
    assert_eq!(channel.store().change_version().unwrap(), None);
}

#[test]
fn remote_remove_discards_local_changes() {
    let mut channel = syncing_channel();
    channel.store().put("n", 2, json!({"t": "A"})).unwrap();
    channel.update("n", json!({"t": "AB"})).unwrap();
    channel.update("n", json!({"t": "ABC"})).unwrap();
    channel.take_frames();

    channel
        .handle_message(r#"c:[{"id": "n", "o": "-", "cv": "cv9", "ev": 3, "ccids": ["someone-else"]}]"#)
        .unwrap();
    assert!(!channel.store().contains("n"));
    assert!(!channel.local_queue().has_pending("n"));
    assert_eq!(channel.take_events(), vec![ChannelEvent::Remove { id: "n".into() }]);
}

#[test]
fn local_remove_round_trip() {
    let mut server = InMemoryServer::new();
    server.seed("n", json!({"t": "A"}));
    let mut net = Network::new(server, 2);
    net.connect_all();

    net.clients[0].remove("n").unwrap();
    net.pump();
    assert!(net.server.latest("n").is_none());
    assert!(!net.clients[0].store().contains("n"));
    assert!(!net.clients[1].store().contains("n"));
    assert!(net.clients[0]
        .take_events()
        .iter()
        .any(|event| matches!(event, ChannelEvent::Acknowledge { .. })));
    assert_eq!(net.clients[1].take_events(), vec![ChannelEvent::Remove { id: "n".into() }]);
}

#[test]
fn unauthorized_channel_stops() {
    let mut channel = Channel::new(ChannelConfig::default(), MemoryGhostStore::new());
    channel.connect().unwrap();
    channel
        .handle_message(r#"auth:{"msg": "Token invalid", "code": 401}"#)
        .unwrap();
    assert_eq!(channel.state(), ChannelState::Unauthorized);
    assert!(channel.handle_message("c:[]").is_err());
    assert!(channel.update("n", json!({})).is_ok());
    assert!(channel.take_frames().iter().all(|frame| frame.starts_with("init:")));
}

#[test]
fn multiplexed_connection_routes_by_prefix() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut channels: Vec<_> = (0..2)
        .map(|i| {
            let store = MemoryGhostStore::new();
            store.set_change_version(&format!("cv{i}")).unwrap();
            let config = ChannelConfig::new("app", format!("bucket-{i}"), "token");
            (Channel::new(config, store), MultiplexSink::new(i, ChannelSink::new(tx.clone())))
        })
        .collect();

    for (channel, sink) in &mut channels {
        channel.connect().unwrap();
        for frame in channel.take_frames() {
            sink.send(frame).unwrap();
        }
    }
    let mut outbound = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        outbound.push(frame);
    }
    assert_eq!(outbound.len(), 2);
    assert!(outbound[0].starts_with("0:init:"));
    assert!(outbound[1].starts_with("1:init:"));

    for inbound in ["1:auth:second", "0:auth:first"] {
        let (index, frame) = split_channel_prefix(inbound).unwrap();
        channels[index].0.handle_message(frame).unwrap();
    }
    assert_eq!(channels[0].0.user(), Some("first"));
    assert_eq!(channels[1].0.user(), Some("second"));
    assert_eq!(channels[1].0.take_frames(), vec!["cv:cv1"]);
}

#[tokio::test]
async fn driver_talks_to_a_server_task() {
    let mut server = InMemoryServer::new();
    server.seed("n", json!({"t": "A"}));

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let channel = Channel::new(ChannelConfig::new("app", "notes", "token"), MemoryGhostStore::new());
    let (driver, handle) = ChannelDriver::new(channel, ChannelSink::new(out_tx), event_tx);
    let task = tokio::spawn(driver.run());

    let server_handle = handle.clone();
    let server_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            for (_, reply) in server.handle(&frame) {
                if server_handle.deliver(reply).await.is_err() {
                    return server;
                }
            }
        }
        server
    });

    handle.connect().await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if event == ChannelEvent::Indexed {
            break;
        }
    }

    handle.update("n", json!({"t": "AB"})).await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        if matches!(event, ChannelEvent::Acknowledge { .. }) {
            break;
        }
    }

    handle.close().await.unwrap();
    let channel = task.await.unwrap().unwrap();
    let ghost = channel.store().get("n").unwrap();
    assert_eq!(ghost.version, 2);
    assert_eq!(ghost.data, json!({"t": "AB"}));

    drop(handle);
    drop(channel);
    let server = server_task.await.unwrap();
    assert_eq!(server.latest("n"), Some((2, &json!({"t": "AB"}))));
}
