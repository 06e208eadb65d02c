use super::*;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use uuid::Uuid;

fn spec() -> ChannelSpec {
    ChannelSpec {
        topic: channel_topic(Relation::Tasks),
        relation: Relation::Tasks,
        filter: RowFilter::eq("board_id", "b1"),
    }
}

/// A token source whose session side is already gone.
fn fixed_token(token: &str) -> watch::Receiver<String> {
    watch::channel(token.to_string()).1
}

fn wire(topic: &str, event: &str, payload: Value, msg_ref: Option<&str>) -> String {
    serde_json::to_string(&json!({ "topic": topic, "event": event, "payload": payload, "ref": msg_ref })).unwrap()
}

// =============================================================================
// websocket_url
// =============================================================================

#[test]
fn websocket_url_maps_https_to_wss() {
    let url = websocket_url("https://proj.example.co/", "anon").unwrap();
    assert_eq!(url, "wss://proj.example.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0");
}

#[test]
fn websocket_url_maps_http_to_ws() {
    let url = websocket_url("http://127.0.0.1:54321", "k").unwrap();
    assert_eq!(url, "ws://127.0.0.1:54321/realtime/v1/websocket?apikey=k&vsn=1.0.0");
}

#[test]
fn websocket_url_rejects_other_schemes() {
    assert!(matches!(websocket_url("ftp://x", "k"), Err(BackendError::Config(_))));
}

// =============================================================================
// outgoing messages
// =============================================================================

#[test]
fn join_message_carries_postgres_changes_config() {
    let msg = join_message(&spec(), "token-1", 1);
    assert_eq!(msg.topic, "realtime:tasks-changes");
    assert_eq!(msg.event, "phx_join");
    assert_eq!(msg.msg_ref.as_deref(), Some("1"));
    let change = &msg.payload["config"]["postgres_changes"][0];
    assert_eq!(change["event"], "*");
    assert_eq!(change["schema"], "public");
    assert_eq!(change["table"], "tasks");
    assert_eq!(change["filter"], "board_id=eq.b1");
    assert_eq!(msg.payload["access_token"], "token-1");
}

#[test]
fn access_token_message_targets_channel_topic() {
    let value = serde_json::to_value(access_token_message("realtime:tasks-changes", "token-2", 4)).unwrap();
    assert_eq!(
        value,
        json!({
            "topic": "realtime:tasks-changes",
            "event": "access_token",
            "payload": { "access_token": "token-2" },
            "ref": "4",
        })
    );
}

#[test]
fn heartbeat_message_targets_phoenix_topic() {
    let value = serde_json::to_value(heartbeat_message(7)).unwrap();
    assert_eq!(value, json!({ "topic": "phoenix", "event": "heartbeat", "payload": {}, "ref": "7" }));
}

// =============================================================================
// parse_incoming
// =============================================================================

#[test]
fn parse_change_event_maps_kind() {
    let text = wire(
        "realtime:tasks-changes",
        "postgres_changes",
        json!({ "ids": [1], "data": { "type": "UPDATE", "table": "tasks", "schema": "public" } }),
        None,
    );
    assert_eq!(parse_incoming(&text, "realtime:tasks-changes").unwrap(), Incoming::Change(ChangeKind::Update));
}

#[test]
fn parse_other_topic_is_ignored() {
    let text = wire("realtime:other", "postgres_changes", json!({ "data": { "type": "INSERT" } }), None);
    assert_eq!(parse_incoming(&text, "realtime:tasks-changes").unwrap(), Incoming::Ignored);
}

#[test]
fn parse_join_reply_error_keeps_reason() {
    let text = wire(
        "realtime:tasks-changes",
        "phx_reply",
        json!({ "status": "error", "response": { "reason": "invalid filter" } }),
        Some("1"),
    );
    assert_eq!(
        parse_incoming(&text, "realtime:tasks-changes").unwrap(),
        Incoming::Reply { msg_ref: Some("1".into()), ok: false, reason: Some("invalid filter".into()) }
    );
}

#[test]
fn parse_unknown_change_type_is_ignored() {
    let text = wire("realtime:tasks-changes", "postgres_changes", json!({ "data": { "type": "TRUNCATE" } }), None);
    assert_eq!(parse_incoming(&text, "realtime:tasks-changes").unwrap(), Incoming::Ignored);
}

#[test]
fn parse_garbage_is_parse_error() {
    assert!(matches!(parse_incoming("not json", "t"), Err(BackendError::Parse(_))));
}

#[test]
fn jitter_stays_within_quarter() {
    for _ in 0..50 {
        let d = with_jitter(Duration::from_secs(4));
        assert!(d >= Duration::from_secs(4));
        assert!(d <= Duration::from_secs(5));
    }
}

// =============================================================================
// end-to-end against a mock socket
// =============================================================================

/// Accept one socket, answer the join with `join_status`, then push a
/// malformed frame and one INSERT change. Returns the HTTP-style base URL.
async fn spawn_mock_socket(join_status: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let join = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => break serde_json::from_str::<WireMessage>(text.as_str()).unwrap(),
                Some(Ok(_)) => {}
                _ => return,
            }
        };
        assert_eq!(join.event, "phx_join");

        let reply = wire(
            &join.topic,
            "phx_reply",
            json!({ "status": join_status, "response": { "reason": "denied" } }),
            join.msg_ref.as_deref(),
        );
        ws.send(Message::Text(reply.into())).await.unwrap();
        if join_status != "ok" {
            return;
        }

        ws.send(Message::Text("not json".into())).await.unwrap();
        let change = wire(&join.topic, "postgres_changes", json!({ "data": { "type": "INSERT" } }), None);
        ws.send(Message::Text(change.into())).await.unwrap();

        // Drain until the client leaves.
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn subscribe_delivers_changes_past_malformed_frames() {
    let base_url = spawn_mock_socket("ok").await;
    let client = RealtimeClient::new(&base_url, "anon").unwrap();
    let mut sub = client
        .subscribe(Relation::Tasks, RowFilter::board(Uuid::nil()), fixed_token("anon"))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .expect("change event timed out")
        .expect("feed ended");
    assert_eq!(event, ChangeEvent { relation: Relation::Tasks, kind: ChangeKind::Insert });
}

#[tokio::test]
async fn subscribe_surfaces_rejected_join() {
    let base_url = spawn_mock_socket("error").await;
    let client = RealtimeClient::new(&base_url, "anon").unwrap();
    let err = client
        .subscribe(Relation::Tasks, RowFilter::board(Uuid::nil()), fixed_token("anon"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("join rejected: denied"));
}

#[tokio::test]
async fn subscribe_to_unreachable_socket_fails() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = RealtimeClient::new(&format!("http://{addr}"), "anon").unwrap();
    let err = client
        .subscribe(Relation::UserPresence, RowFilter::board(Uuid::nil()), fixed_token("anon"))
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::Realtime(_)));
}

/// Read text frames until one with `event` arrives.
async fn next_event(ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>, event: &str) -> WireMessage {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let msg: WireMessage = serde_json::from_str(text.as_str()).unwrap();
                if msg.event == event {
                    return msg;
                }
            }
            Some(Ok(_)) => {}
            other => panic!("socket ended waiting for {event}: {other:?}"),
        }
    }
}

#[tokio::test]
async fn token_change_is_pushed_and_used_on_rejoin() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(String, String)>();

    tokio::spawn(async move {
        // First socket: ack the join, wait for the pushed token, then close the channel.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let join = next_event(&mut ws, "phx_join").await;
        seen_tx.send(("join".into(), join.payload["access_token"].as_str().unwrap().into())).unwrap();
        let reply = wire(&join.topic, "phx_reply", json!({ "status": "ok", "response": {} }), join.msg_ref.as_deref());
        ws.send(Message::Text(reply.into())).await.unwrap();

        let update = next_event(&mut ws, "access_token").await;
        seen_tx.send(("push".into(), update.payload["access_token"].as_str().unwrap().into())).unwrap();
        ws.send(Message::Text(wire(&join.topic, "phx_close", json!({}), None).into())).await.unwrap();

        // Second socket: the reconnect.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let join = next_event(&mut ws, "phx_join").await;
        seen_tx.send(("join".into(), join.payload["access_token"].as_str().unwrap().into())).unwrap();
        let reply = wire(&join.topic, "phx_reply", json!({ "status": "ok", "response": {} }), join.msg_ref.as_deref());
        ws.send(Message::Text(reply.into())).await.unwrap();
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    let (token_tx, token_rx) = watch::channel("token-old".to_string());
    let client = RealtimeClient::new(&format!("http://{addr}"), "anon").unwrap();
    let _sub = client.subscribe(Relation::Tasks, RowFilter::board(Uuid::nil()), token_rx).await.unwrap();
    token_tx.send_replace("token-new".to_string());

    let mut seen = Vec::new();
    for _ in 0..3 {
        let next = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .expect("mock socket timed out")
            .expect("mock socket ended");
        seen.push(next);
    }
    assert_eq!(
        seen,
        vec![
            ("join".to_string(), "token-old".to_string()),
            ("push".to_string(), "token-new".to_string()),
            ("join".to_string(), "token-new".to_string()),
        ]
    );
}
