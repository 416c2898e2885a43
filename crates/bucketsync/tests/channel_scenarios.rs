//! Channel state machine scenarios, driven frame by frame without a socket.

use std::sync::Arc;
use std::time::Duration;

use bucketsync::bucket::{BucketEvent, BucketShared};
use bucketsync::channel::{Channel, ChannelOptions, ChannelState};
use bucketsync::client::{ClientEvent, OutboundFrame};
use bucketsync::ghost::{GhostStore, MemoryGhostStore};
use bucketsync::protocol::parse_channel_message;
use bucketsync::store::{BucketStore, MemoryBucketStore};
use bucketsync_core::{apply_object_diff, dmp, set_from_value};
use serde_json::{json, Value};
use tokio::sync::mpsc;

struct Harness {
    channel: Channel,
    shared: Arc<BucketShared>,
    outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    events: mpsc::UnboundedReceiver<BucketEvent>,
    client_events: mpsc::UnboundedReceiver<ClientEvent>,
    store: Arc<MemoryBucketStore>,
    ghosts: Arc<MemoryGhostStore>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryBucketStore::new());
    let ghosts = Arc::new(MemoryGhostStore::new());
    let (events_tx, events) = mpsc::unbounded_channel();
    let (outbound_tx, outbound) = mpsc::unbounded_channel();
    let (client_events_tx, client_events) = mpsc::unbounded_channel();
    let shared = Arc::new(BucketShared {
        name: "notes".to_string(),
        store: store.clone() as Arc<dyn BucketStore>,
        events: events_tx,
        resolver: std::sync::Mutex::new(None),
    });
    let opts = ChannelOptions {
        clientid: "client-1".to_string(),
        app_id: "app".to_string(),
        token: "token".to_string(),
        api: "1.1".to_string(),
        library: "bucketsync".to_string(),
        library_version: "0.1.0".to_string(),
        index_page_size: 500,
        send_timeout: Duration::from_secs(8),
    };
    let channel = Channel::new(
        0,
        opts,
        shared.clone(),
        ghosts.clone() as Arc<dyn GhostStore>,
        outbound_tx,
        client_events_tx,
    );
    Harness {
        channel,
        shared,
        outbound,
        events,
        client_events,
        store,
        ghosts,
    }
}

impl Harness {
    async fn feed(&mut self, body: &str) {
        let message = parse_channel_message(body).expect("valid payload");
        self.channel.handle_message(message).await.expect("handled");
    }

    fn next_frame(&mut self) -> OutboundFrame {
        self.outbound.try_recv().expect("expected outbound frame")
    }

    fn no_more_frames(&mut self) {
        assert!(self.outbound.try_recv().is_err(), "unexpected outbound frame");
    }

    fn next_event(&mut self) -> BucketEvent {
        self.events.try_recv().expect("expected bucket event")
    }

    fn drain_events(&mut self) {
        while self.events.try_recv().is_ok() {}
    }

    /// Run the handshake and index download with the given entries.
    async fn connect_with_index(&mut self, entries: Value) {
        self.channel.start().await.unwrap();
        let init = self.next_frame();
        assert!(init.body.starts_with("init:"), "got {}", init.body);
        self.feed("auth:user@example.com").await;
        let index_req = self.next_frame();
        assert_eq!(index_req.body, "i:1::500:");
        let page = json!({"index": entries, "current": "cv-1"});
        self.feed(&format!("i:{page}")).await;
        assert_eq!(self.channel.state(), ChannelState::Ready);
        self.drain_events();
        while self.client_events.try_recv().is_ok() {}
    }

    /// The last outbound change frame, decoded.
    fn sent_change(&mut self) -> Value {
        let frame = self.next_frame();
        let body = frame
            .body
            .strip_prefix("c:")
            .unwrap_or_else(|| panic!("expected change frame, got {}", frame.body));
        serde_json::from_str(body).expect("change frame is JSON")
    }
}

#[tokio::test]
async fn create_then_update_acks_and_advances_ghost() {
    let mut h = harness();
    h.connect_with_index(json!([])).await;

    h.channel
        .local_modify("note-1", json!({"content": "Hi"}))
        .await
        .unwrap();
    let change = h.sent_change();
    assert_eq!(change["o"], "M");
    assert_eq!(change["sv"], 0);
    assert_eq!(change["v"]["content"]["o"], "+");
    assert_eq!(change["v"]["content"]["v"], "Hi");
    let ccid = change["ccid"].as_str().unwrap().to_string();
    assert!(h.channel.has_local_changes());

    h.feed(&format!(
        "c:{}",
        json!({"id": "note-1", "o": "M", "ev": 1, "ccid": ccid})
    ))
    .await;

    assert!(!h.channel.has_local_changes());
    let ghost = h.ghosts.get("note-1").await.unwrap().unwrap();
    assert_eq!(ghost.version, 1);
    assert_eq!(ghost.data, json!({"content": "Hi"}));
}

#[tokio::test]
async fn queued_change_follows_acknowledgment() {
    let mut h = harness();
    h.connect_with_index(json!([])).await;

    h.channel.local_modify("a", json!({"n": 1})).await.unwrap();
    let first = h.sent_change();
    // Queued behind the in-flight change; nothing else goes out yet.
    h.channel.local_modify("a", json!({"n": 2})).await.unwrap();
    h.no_more_frames();

    let ccid = first["ccid"].as_str().unwrap().to_string();
    h.feed(&format!("c:{}", json!({"id": "a", "o": "M", "ev": 1, "ccid": ccid})))
        .await;

    let second = h.sent_change();
    assert_eq!(second["sv"], 1);
    assert_eq!(second["v"]["n"]["o"], "I");
    assert_eq!(second["v"]["n"]["v"], 1);
}

#[tokio::test]
async fn concurrent_text_edit_rebases_and_resends() {
    let mut h = harness();
    h.connect_with_index(json!([{"id": "note-1", "v": 2, "d": {"t": "hello"}}]))
        .await;

    h.channel
        .local_modify("note-1", json!({"t": "hello world"}))
        .await
        .unwrap();
    let sent = h.sent_change();
    assert_eq!(sent["sv"], 2);
    assert_eq!(sent["v"]["t"]["o"], "d");
    let ccid = sent["ccid"].as_str().unwrap().to_string();

    // Another client appended "!" meanwhile.
    let upstream = dmp::make_patch("hello", "hello!");
    h.feed(&format!(
        "c:{}",
        json!({
            "id": "note-1", "o": "M", "sv": 2, "ev": 3, "ccid": "someone-else",
            "v": {"t": {"o": "d", "v": upstream}}
        })
    ))
    .await;

    // Ghost and store took the server state.
    let ghost = h.ghosts.get("note-1").await.unwrap().unwrap();
    assert_eq!(ghost.version, 3);
    assert_eq!(ghost.data, json!({"t": "hello!"}));

    // Our change went out again, rebased onto version 3.
    let resent = h.sent_change();
    assert_eq!(resent["sv"], 3);
    assert_eq!(resent["ccid"].as_str().unwrap(), ccid);
    let ops = set_from_value(&resent["v"]).unwrap();
    let merged = apply_object_diff(&ops, &json!({"t": "hello!"})).unwrap();
    assert_eq!(merged, json!({"t": "hello world!"}));

    // Acknowledgment converges ghost and store on the merged text.
    h.feed(&format!(
        "c:{}",
        json!({"id": "note-1", "o": "M", "ev": 4, "ccid": ccid})
    ))
    .await;
    let ghost = h.ghosts.get("note-1").await.unwrap().unwrap();
    assert_eq!(ghost.data, json!({"t": "hello world!"}));
    let stored = h.store.get("note-1").await.unwrap().unwrap();
    assert_eq!(stored.data, json!({"t": "hello world!"}));
}

#[tokio::test]
async fn concurrent_increments_commute() {
    let mut h = harness();
    h.connect_with_index(json!([{"id": "c1", "v": 1, "d": {"c": 5}}]))
        .await;

    h.channel.local_modify("c1", json!({"c": 7})).await.unwrap();
    let sent = h.sent_change();
    assert_eq!(sent["v"]["c"], json!({"o": "I", "v": 2}));
    let ccid = sent["ccid"].as_str().unwrap().to_string();

    h.feed(&format!(
        "c:{}",
        json!({
            "id": "c1", "o": "M", "sv": 1, "ev": 2, "ccid": "someone-else",
            "v": {"c": {"o": "I", "v": 3}}
        })
    ))
    .await;

    let ghost = h.ghosts.get("c1").await.unwrap().unwrap();
    assert_eq!(ghost.data, json!({"c": 8}));

    let resent = h.sent_change();
    assert_eq!(resent["sv"], 2);
    assert_eq!(resent["v"]["c"], json!({"o": "I", "v": 2}));

    h.feed(&format!("c:{}", json!({"id": "c1", "o": "M", "ev": 3, "ccid": ccid})))
        .await;
    let ghost = h.ghosts.get("c1").await.unwrap().unwrap();
    assert_eq!(ghost.version, 3);
    assert_eq!(ghost.data, json!({"c": 10}));
}

#[tokio::test]
async fn concurrent_replace_upstream_wins() {
    let mut h = harness();
    h.connect_with_index(json!([{"id": "k1", "v": 1, "d": {"k": {"n": 1}}}]))
        .await;

    // Kind change forces a wholesale replace on both sides. The store write
    // mirrors what the bucket facade does before forwarding to the channel.
    h.store.update("k1", json!({"k": "b"}), false).await.unwrap();
    h.channel.local_modify("k1", json!({"k": "b"})).await.unwrap();
    let sent = h.sent_change();
    assert_eq!(sent["v"]["k"]["o"], "r");
    h.drain_events();

    h.feed(&format!(
        "c:{}",
        json!({
            "id": "k1", "o": "M", "sv": 1, "ev": 2, "ccid": "someone-else",
            "v": {"k": {"o": "r", "v": "c"}}
        })
    ))
    .await;

    // Local replace was dropped; the server value stands.
    assert!(!h.channel.has_local_changes());
    let stored = h.store.get("k1").await.unwrap().unwrap();
    assert_eq!(stored.data, json!({"k": "c"}));
    match h.next_event() {
        BucketEvent::Update { id, data, patch, original, .. } => {
            assert_eq!(id, "k1");
            assert_eq!(data, json!({"k": "c"}));
            assert!(patch.is_some());
            assert_eq!(original, Some(json!({"k": "b"})));
        }
        other => panic!("expected update event, got {other:?}"),
    }
    h.no_more_frames();
}

#[tokio::test]
async fn redelivered_change_is_discarded() {
    let mut h = harness();
    h.connect_with_index(json!([{"id": "n1", "v": 3, "d": {"x": 1}}]))
        .await;

    let change = json!({
        "id": "n1", "o": "M", "sv": 3, "ev": 4, "ccid": "someone-else",
        "v": {"x": {"o": "I", "v": 1}}
    })
    .to_string();
    h.feed(&format!("c:{change}")).await;
    let ghost = h.ghosts.get("n1").await.unwrap().unwrap();
    assert_eq!((ghost.version, &ghost.data), (4, &json!({"x": 2})));
    h.drain_events();

    // Same change again after a replay: no events, nothing moves.
    h.feed(&format!("c:{change}")).await;
    assert!(h.events.try_recv().is_err());
    let ghost = h.ghosts.get("n1").await.unwrap().unwrap();
    assert_eq!((ghost.version, &ghost.data), (4, &json!({"x": 2})));
}

#[tokio::test]
async fn reconnect_resends_with_refreshed_source_version() {
    let mut h = harness();
    h.connect_with_index(json!([{"id": "n1", "v": 1, "d": {"x": 1}}]))
        .await;

    h.channel.local_modify("n1", json!({"x": 5})).await.unwrap();
    let sent = h.sent_change();
    assert_eq!(sent["sv"], 1);
    let ccid = sent["ccid"].as_str().unwrap().to_string();

    // The socket dropped; on reconnect the channel re-runs the handshake and
    // resumes from its change-version checkpoint.
    h.channel.start().await.unwrap();
    let init = h.next_frame();
    assert!(init.body.starts_with("init:"));
    h.feed("auth:user@example.com").await;
    let resume = h.next_frame();
    assert_eq!(resume.body, "cv:cv-1");

    let resent = h.sent_change();
    assert_eq!(resent["ccid"].as_str().unwrap(), ccid);
    assert_eq!(resent["sv"], 1);
    assert_eq!(resent["v"]["x"], json!({"o": "I", "v": 4}));

    // The server does not recognize the checkpoint: full reindex.
    h.feed("cv:?").await;
    assert_eq!(h.channel.state(), ChannelState::Indexing);
    let index_req = h.next_frame();
    assert_eq!(index_req.body, "i:1::500:");
}

#[tokio::test]
async fn remote_remove_wins_over_local_edits() {
    let mut h = harness();
    h.connect_with_index(json!([{"id": "n1", "v": 1, "d": {"x": 1}}]))
        .await;

    h.channel.local_modify("n1", json!({"x": 2})).await.unwrap();
    let _sent = h.sent_change();
    h.drain_events();

    h.feed(&format!(
        "c:{}",
        json!({"id": "n1", "o": "-", "ev": 2, "ccid": "someone-else"})
    ))
    .await;

    assert!(h.ghosts.get("n1").await.unwrap().is_none());
    assert!(h.store.get("n1").await.unwrap().is_none());
    assert!(!h.channel.has_local_changes());
    match h.next_event() {
        BucketEvent::Remove { id } => assert_eq!(id, "n1"),
        other => panic!("expected remove event, got {other:?}"),
    }
}

#[tokio::test]
async fn changes_for_unseen_ids_defer_until_index_completes() {
    let mut h = harness();
    h.channel.start().await.unwrap();
    let _init = h.next_frame();
    h.feed("auth:user@example.com").await;
    let _index_req = h.next_frame();

    // A change for an id the index has not delivered yet.
    h.feed(&format!(
        "c:{}",
        json!({
            "id": "late-1", "o": "M", "sv": 1, "ev": 2, "ccid": "someone-else",
            "v": {"x": {"o": "I", "v": 1}}
        })
    ))
    .await;
    assert!(h.ghosts.get("late-1").await.unwrap().is_none());

    let page = json!({
        "index": [{"id": "late-1", "v": 1, "d": {"x": 1}}],
        "current": "cv-5"
    });
    h.feed(&format!("i:{page}")).await;

    // Deferred change applied after the download finished.
    let ghost = h.ghosts.get("late-1").await.unwrap().unwrap();
    assert_eq!((ghost.version, &ghost.data), (2, &json!({"x": 2})));
}

#[tokio::test]
async fn version_mismatch_triggers_full_fetch_and_reset() {
    let mut h = harness();
    h.connect_with_index(json!([{"id": "n1", "v": 1, "d": {"x": 1}}]))
        .await;

    // Source version 3 does not match our ghost at 1.
    h.feed(&format!(
        "c:{}",
        json!({
            "id": "n1", "o": "M", "sv": 3, "ev": 4, "ccid": "someone-else",
            "v": {"x": {"o": "I", "v": 1}}
        })
    ))
    .await;

    let fetch = h.next_frame();
    assert_eq!(fetch.body, "e:n1.4");
    // Ghost untouched until the full object arrives.
    assert_eq!(h.ghosts.get("n1").await.unwrap().unwrap().version, 1);

    h.feed("e:n1.4\n{\"x\":9}").await;
    let ghost = h.ghosts.get("n1").await.unwrap().unwrap();
    assert_eq!((ghost.version, &ghost.data), (4, &json!({"x": 9})));
    assert_eq!(h.store.get("n1").await.unwrap().unwrap().data, json!({"x": 9}));
}

#[tokio::test]
async fn malformed_operations_drop_change_and_resync() {
    let mut h = harness();
    h.connect_with_index(json!([{"id": "n1", "v": 1, "d": {"x": 1}}]))
        .await;
    h.drain_events();

    // Unknown operation tag: the change is dropped and the full object
    // requested instead.
    h.feed(&format!(
        "c:{}",
        json!({
            "id": "n1", "o": "M", "sv": 1, "ev": 2, "ccid": "someone-else",
            "v": {"x": {"o": "??", "v": 1}}
        })
    ))
    .await;

    match h.next_event() {
        BucketEvent::Error { .. } => {}
        other => panic!("expected error event, got {other:?}"),
    }
    let fetch = h.next_frame();
    assert_eq!(fetch.body, "e:n1.2");
    assert_eq!(h.ghosts.get("n1").await.unwrap().unwrap().version, 1);
}

#[tokio::test]
async fn expired_auth_halts_channel() {
    let mut h = harness();
    h.channel.start().await.unwrap();
    let _init = h.next_frame();
    h.feed("auth:expired").await;
    assert_eq!(h.channel.state(), ChannelState::Unauthorized);
    assert!(matches!(
        h.client_events.try_recv(),
        Ok(ClientEvent::Unauthorized)
    ));
    h.no_more_frames();
}

#[tokio::test]
async fn resolver_supplies_original_value() {
    let mut h = harness();
    h.connect_with_index(json!([{"id": "n1", "v": 1, "d": {"x": 1}}]))
        .await;

    {
        let mut resolver = h.shared.resolver.lock().unwrap();
        *resolver = Some(Box::new(|id, _stored| {
            Some(json!({"x": 1, "resolved_for": id}))
        }));
    }

    h.feed(&format!(
        "c:{}",
        json!({
            "id": "n1", "o": "M", "sv": 1, "ev": 2, "ccid": "someone-else",
            "v": {"x": {"o": "I", "v": 1}}
        })
    ))
    .await;

    match h.next_event() {
        BucketEvent::Update { original, .. } => {
            assert_eq!(original, Some(json!({"x": 1, "resolved_for": "n1"})));
        }
        other => panic!("expected update event, got {other:?}"),
    }
}

#[tokio::test]
async fn send_timeout_requeues_and_resends() {
    let mut h = harness();
    h.connect_with_index(json!([])).await;

    h.channel.local_modify("n1", json!({"x": 1})).await.unwrap();
    let first = h.sent_change();

    // Nothing due yet.
    h.channel.check_timeouts().await.unwrap();
    h.no_more_frames();

    tokio::time::pause();
    tokio::time::advance(Duration::from_secs(9)).await;
    h.channel.check_timeouts().await.unwrap();
    let resent = h.sent_change();
    assert_eq!(resent["ccid"], first["ccid"]);
    assert_eq!(resent["sv"], 0);
}

#[tokio::test]
async fn revisions_collect_all_prior_versions() {
    let mut h = harness();
    h.connect_with_index(json!([{"id": "n1", "v": 3, "d": {"x": 3}}]))
        .await;

    let (reply, rx) = tokio::sync::oneshot::channel();
    h.channel.request_revisions("n1", reply).await.unwrap();
    assert_eq!(h.next_frame().body, "e:n1.1");
    assert_eq!(h.next_frame().body, "e:n1.2");

    h.feed("e:n1.2\n{\"x\":2}").await;
    h.feed("e:n1.1\n{\"x\":1}").await;

    let revisions = rx.await.unwrap();
    assert_eq!(revisions.len(), 2);
    assert_eq!(revisions[0].version, 2);
    assert_eq!(revisions[0].data, json!({"x": 2}));
    assert_eq!(revisions[1].version, 1);
}
