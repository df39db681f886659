//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use quire_collab::awareness::Position;
use quire_collab::{AwarenessUpdate, ConnectionState, ServerConfig, ServerMessage, SyncClient, SyncEvent, SyncServer};
use quire_core::{Document, Node, Operation};
use tokio::sync::mpsc::Receiver;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

type Events = Receiver<SyncEvent<Operation>>;

/// Start a server on a free port, return it with its ws:// URL.
async fn start_test_server() -> (Arc<SyncServer<Operation>>, String) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(SyncServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        client_buffer: 64,
        ..ServerConfig::default()
    }));
    let running = server.clone();
    tokio::spawn(async move {
        running.serve(listener).await.unwrap();
    });
    (server, format!("ws://127.0.0.1:{port}"))
}

async fn next_event(events: &mut Events) -> SyncEvent<Operation> {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("event channel open")
}

/// Skip events until one matches.
async fn wait_for(events: &mut Events, pred: impl Fn(&SyncEvent<Operation>) -> bool) -> SyncEvent<Operation> {
    loop {
        let event = next_event(events).await;
        if pred(&event) {
            return event;
        }
    }
}

async fn connect(url: &str, room: &str, name: &str) -> (SyncClient<Operation>, Events) {
    let mut client = SyncClient::new(url, room).with_name(name);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SyncEvent::Connected);
    wait_for(&mut events, |e| matches!(e, SyncEvent::Synced { .. })).await;
    (client, events)
}

/// Poll until the server reports `rooms` rooms holding `clients` clients.
async fn wait_for_status(server: &SyncServer<Operation>, rooms: usize, clients: usize) {
    timeout(Duration::from_secs(2), async {
        loop {
            let status = server.status().await;
            if status.rooms == rooms && status.clients == clients {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registry status settles");
}

#[tokio::test]
async fn test_client_connects_and_receives_sync() {
    let (server, url) = start_test_server().await;

    let mut client = SyncClient::<Operation>::new(&url, "notes").with_name("Alice");
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    assert_eq!(next_event(&mut events).await, SyncEvent::Connected);
    match next_event(&mut events).await {
        SyncEvent::Synced {
            client_id,
            version,
            clients,
            ..
        } => {
            assert_eq!(version, 0);
            assert!(clients.is_empty());
            assert_eq!(client.client_id().await, Some(client_id));
        }
        other => panic!("Expected Synced event, got {other:?}"),
    }
    assert_eq!(client.connection_state().await, ConnectionState::Connected);

    let status = server.status().await;
    assert_eq!(status.rooms, 1);
    assert_eq!(status.clients, 1);
}

#[tokio::test]
async fn test_peer_join_announced_with_name() {
    let (_server, url) = start_test_server().await;
    let (_alice, mut events_a) = connect(&url, "notes", "Alice").await;
    let (bob, _events_b) = connect(&url, "notes", "Bob").await;

    let joined = wait_for(&mut events_a, |e| matches!(e, SyncEvent::PeerJoined(_))).await;
    let SyncEvent::PeerJoined(info) = joined else {
        unreachable!()
    };
    assert_eq!(info.name, "Bob");
    assert_eq!(Some(info.id), bob.client_id().await);
    assert!(info.color.starts_with('#'));
}

#[tokio::test]
async fn test_concurrent_edits_converge_over_network() {
    let (_server, url) = start_test_server().await;
    let (alice, mut events_a) = connect(&url, "doc", "Alice").await;
    let (bob, mut events_b) = connect(&url, "doc", "Bob").await;

    // Both author against version 0 without seeing each other.
    alice
        .send_ops_at(0, vec![Operation::insert_text(vec![0], 5, "X")])
        .await
        .unwrap();
    bob.send_ops_at(0, vec![Operation::insert_text(vec![0], 0, ">> ")])
        .await
        .unwrap();

    let mut docs = Vec::new();
    for events in [&mut events_a, &mut events_b] {
        let mut doc = Document::new(vec![Node::text("hello world")]);
        let mut versions = Vec::new();
        while versions.len() < 2 {
            if let SyncEvent::Ops { version, ops, .. } = next_event(events).await {
                doc.apply_all(&ops).unwrap();
                versions.push(version);
            }
        }
        assert_eq!(versions, vec![1, 2]);
        docs.push(doc);
    }
    assert_eq!(docs[0], docs[1]);
    assert_eq!(docs[0].plain_text(), ">> helloX world");
    assert_eq!(alice.confirmed_version(), 2);
    assert_eq!(bob.confirmed_version(), 2);
}

#[tokio::test]
async fn test_in_flight_guard_clears_on_echo() {
    let (_server, url) = start_test_server().await;
    let (alice, mut events) = connect(&url, "guard", "Alice").await;

    alice
        .send_ops(vec![Operation::insert_text(vec![0], 0, "a")])
        .await
        .unwrap();

    let echo = wait_for(&mut events, |e| matches!(e, SyncEvent::Ops { .. })).await;
    assert!(matches!(echo, SyncEvent::Ops { own: true, version: 1, .. }));
    assert!(!alice.has_pending_submission());

    alice
        .send_ops(vec![Operation::insert_text(vec![0], 1, "b")])
        .await
        .unwrap();
    let echo = wait_for(&mut events, |e| matches!(e, SyncEvent::Ops { .. })).await;
    assert!(matches!(echo, SyncEvent::Ops { version: 2, .. }));
}

#[tokio::test]
async fn test_future_base_gets_rejected_reply() {
    let (server, url) = start_test_server().await;
    let (alice, mut events_a) = connect(&url, "strict", "Alice").await;
    let (_bob, mut events_b) = connect(&url, "strict", "Bob").await;

    alice
        .send_ops_at(7, vec![Operation::insert_text(vec![0], 0, "x")])
        .await
        .unwrap();
    let rejected = wait_for(&mut events_a, |e| matches!(e, SyncEvent::Rejected { .. })).await;
    assert_eq!(
        rejected,
        SyncEvent::Rejected {
            base_version: 7,
            version: 0,
            reason: "future-version".into(),
        }
    );
    assert!(!alice.has_pending_submission());

    // Bob saw nothing from the rejected batch.
    assert!(timeout(Duration::from_millis(200), events_b.recv()).await.is_err());
    assert_eq!(server.stats().await.rejected_submissions, 1);
}

#[tokio::test]
async fn test_rejection_follows_queued_versions() {
    let (_server, url) = start_test_server().await;
    let (alice, mut events_a) = connect(&url, "order", "Alice").await;
    let (bob, mut events_b) = connect(&url, "order", "Bob").await;
    wait_for(&mut events_a, |e| matches!(e, SyncEvent::PeerJoined(_))).await;

    for i in 0..5 {
        alice
            .send_ops(vec![Operation::insert_text(vec![0], i, "a")])
            .await
            .unwrap();
        wait_for(&mut events_a, |e| matches!(e, SyncEvent::Ops { .. })).await;
    }
    bob.send_ops_at(99, vec![Operation::insert_text(vec![0], 0, "b")])
        .await
        .unwrap();

    let mut seen = Vec::new();
    loop {
        match next_event(&mut events_b).await {
            SyncEvent::Ops { version, .. } => seen.push(version),
            SyncEvent::Rejected { version, .. } => {
                assert_eq!(version, 5);
                break;
            }
            SyncEvent::Desynced { .. } => panic!("versions arrived out of order"),
            _ => {}
        }
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    assert_eq!(bob.confirmed_version(), 5);
}

#[tokio::test]
async fn test_awareness_relayed_to_others_only() {
    let (_server, url) = start_test_server().await;
    let (alice, mut events_a) = connect(&url, "presence", "Alice").await;
    let (_bob, mut events_b) = connect(&url, "presence", "Bob").await;
    wait_for(&mut events_a, |e| matches!(e, SyncEvent::PeerJoined(_))).await;

    alice
        .send_awareness(AwarenessUpdate::cursor(Position::new(vec![0], 3)))
        .await
        .unwrap();

    let event = wait_for(&mut events_b, |e| matches!(e, SyncEvent::Awareness(_))).await;
    let SyncEvent::Awareness(state) = event else {
        unreachable!()
    };
    assert_eq!(state.name, "Alice");
    assert_eq!(state.cursor, Some(Position::new(vec![0], 3)));
    assert_eq!(Some(state.client_id), alice.client_id().await);

    assert!(timeout(Duration::from_millis(200), events_a.recv()).await.is_err());
}

#[tokio::test]
async fn test_malformed_frames_are_dropped() {
    let (server, url) = start_test_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}/raw?name=Raw"))
        .await
        .unwrap();

    let first = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let sync = ServerMessage::<Operation>::decode(first.into_data().as_ref()).unwrap();
    assert!(matches!(sync, ServerMessage::Sync { version: 0, .. }));

    ws.send(Message::Text("not json".to_string().into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"ops","ops":[]}"#.to_string().into())).await.unwrap();
    ws.send(Message::Text(r#"{"type":"ops","version":0,"ops":[{"kind":"insert-text","path":[0],"offset":0,"text":"ok"}]}"#.to_string().into()))
        .await
        .unwrap();

    // The connection survives and the valid batch is accepted as version 1.
    let reply = timeout(Duration::from_secs(2), ws.next()).await.unwrap().unwrap().unwrap();
    let msg = ServerMessage::<Operation>::decode(reply.into_data().as_ref()).unwrap();
    assert!(matches!(msg, ServerMessage::Ops { version: 1, .. }));

    let stats = server.stats().await;
    assert_eq!(stats.malformed_messages, 2);
    assert_eq!(stats.total_messages, 3);
}

#[tokio::test]
async fn test_disconnect_leaves_room() {
    let (server, url) = start_test_server().await;
    let (mut alice, _events_a) = connect(&url, "temp", "Alice").await;
    let (_bob, mut events_b) = connect(&url, "temp", "Bob").await;
    let alice_id = alice.client_id().await.unwrap();

    alice.disconnect().await;
    let left = wait_for(&mut events_b, |e| matches!(e, SyncEvent::PeerLeft(_))).await;
    assert_eq!(left, SyncEvent::PeerLeft(alice_id));
    wait_for_status(&server, 1, 1).await;
}

#[tokio::test]
async fn test_last_leave_removes_room() {
    let (server, url) = start_test_server().await;
    {
        let (mut solo, mut events) = connect(&url, "ephemeral", "Solo").await;
        solo.send_ops(vec![Operation::insert_text(vec![0], 0, "x")])
            .await
            .unwrap();
        wait_for(&mut events, |e| matches!(e, SyncEvent::Ops { .. })).await;
        solo.disconnect().await;
    }
    wait_for_status(&server, 0, 0).await;

    let mut again = SyncClient::<Operation>::new(&url, "ephemeral");
    let mut events = again.take_event_rx().unwrap();
    again.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SyncEvent::Connected);
    match next_event(&mut events).await {
        SyncEvent::Synced { version, clients, .. } => {
            assert_eq!(version, 0);
            assert!(clients.is_empty());
        }
        other => panic!("Expected Synced event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (server, url) = start_test_server().await;
    let (one, mut events_one) = connect(&url, "one", "A").await;
    let (_two, mut events_two) = connect(&url, "two", "B").await;

    one.send_ops(vec![Operation::insert_text(vec![0], 0, "1")])
        .await
        .unwrap();
    wait_for(&mut events_one, |e| matches!(e, SyncEvent::Ops { .. })).await;
    assert!(timeout(Duration::from_millis(200), events_two.recv()).await.is_err());

    let status = server.status().await;
    assert_eq!(status.rooms, 2);
    assert_eq!(status.clients, 2);
}
