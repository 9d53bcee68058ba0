//! End-to-end gateway tests over real sockets.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use relay_core::{Frame, GatewayConfig, GatewayError, UserId};
use relay_server::{start, ServerHandle};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_gateway() -> ServerHandle {
    let config = GatewayConfig {
        port: 0,
        ..Default::default()
    };
    start(config).await.expect("gateway should bind")
}

async fn connect(port: u16, user: &str) -> WsStream {
    let url = format!("ws://127.0.0.1:{port}/ws?user={user}&isAuthenticated=true");
    let (stream, _) = connect_async(&url).await.expect("connect should succeed");
    stream
}

/// Read text messages until one parses as JSON, skipping protocol-level pings.
async fn next_frame(ws: &mut WsStream) -> Value {
    loop {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("read failed");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

#[tokio::test]
async fn handshake_greets_then_delivers_published_frames() {
    let handle = start_gateway().await;
    let mut ws = connect(handle.port, "u1").await;

    let greeting = next_frame(&mut ws).await;
    assert_eq!(greeting["type"], "connection_established");
    assert_eq!(greeting["user"], "u1");
    assert!(greeting["serverVersion"].is_string());
    assert!(greeting["timestamp"].is_number());

    let user = UserId::new("u1").unwrap();
    let out = handle
        .gateway
        .publish_to(&user, Frame::new("task_update").with_field("status", "running"))
        .unwrap();
    assert_eq!(out.delivered, 1);
    assert!(!out.queued);

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "task_update");
    assert_eq!(frame["status"], "running");
}

#[tokio::test]
async fn frames_published_while_offline_replay_in_order_on_connect() {
    let handle = start_gateway().await;
    let user = UserId::new("u2").unwrap();

    for i in 0..3 {
        let out = handle
            .gateway
            .publish_to(&user, Frame::new("progress").with_field("step", i))
            .unwrap();
        assert!(out.queued);
    }

    let mut ws = connect(handle.port, "u2").await;
    let greeting = next_frame(&mut ws).await;
    assert_eq!(greeting["type"], "connection_established");

    for i in 0..3 {
        let frame = next_frame(&mut ws).await;
        assert_eq!(frame["type"], "progress");
        assert_eq!(frame["step"], i);
    }

    // Replay drained the window; a fresh publish delivers live.
    let out = handle
        .gateway
        .publish_to(&user, Frame::new("progress").with_field("step", 3))
        .unwrap();
    assert_eq!(out.delivered, 1);
    assert_eq!(handle.gateway.stats().pending_frames, 0);
}

#[tokio::test]
async fn two_connections_same_user_both_receive() {
    let handle = start_gateway().await;
    let mut a = connect(handle.port, "u3").await;
    let mut b = connect(handle.port, "u3").await;
    next_frame(&mut a).await;
    next_frame(&mut b).await;

    let user = UserId::new("u3").unwrap();
    let out = handle
        .gateway
        .publish_to(&user, Frame::new("notice"))
        .unwrap();
    assert_eq!(out.delivered, 2);

    assert_eq!(next_frame(&mut a).await["type"], "notice");
    assert_eq!(next_frame(&mut b).await["type"], "notice");
}

#[tokio::test]
async fn clients_reusing_a_connection_id_param_stay_independent() {
    let handle = start_gateway().await;
    // Both sockets present the same client-chosen id; the gateway must key
    // them independently.
    let url = format!(
        "ws://127.0.0.1:{}/ws?user=u8&connectionId=tab-1",
        handle.port
    );
    let (mut a, _) = connect_async(&url).await.unwrap();
    let (mut b, _) = connect_async(&url).await.unwrap();
    next_frame(&mut a).await;
    next_frame(&mut b).await;
    assert_eq!(handle.gateway.stats().connections, 2);

    let user = UserId::new("u8").unwrap();
    let out = handle
        .gateway
        .publish_to(&user, Frame::new("notice").with_field("n", 1))
        .unwrap();
    assert_eq!(out.delivered, 2);
    assert_eq!(next_frame(&mut a).await["n"], 1);
    assert_eq!(next_frame(&mut b).await["n"], 1);

    // Closing one must not unregister the other.
    a.close(None).await.unwrap();
    for _ in 0..100 {
        if handle.gateway.stats().connections == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(handle.gateway.stats().connections, 1);

    let out = handle
        .gateway
        .publish_to(&user, Frame::new("notice").with_field("n", 2))
        .unwrap();
    assert_eq!(out.delivered, 1);
    assert!(!out.queued);
    assert_eq!(next_frame(&mut b).await["n"], 2);
}

#[tokio::test]
async fn upgrade_without_user_is_refused_with_4001() {
    let handle = start_gateway().await;
    let url = format!("ws://127.0.0.1:{}/ws", handle.port);
    let (mut ws, _) = connect_async(&url).await.expect("upgrade itself succeeds");

    let first = next_frame(&mut ws).await;
    assert_eq!(first["type"], "error");
    assert_eq!(first["message"], "Missing user");

    loop {
        match ws.next().await {
            Some(Ok(Message::Close(frame))) => {
                let frame = frame.expect("close should carry a code");
                assert_eq!(u16::from(frame.code), 4001);
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => panic!("expected a close frame"),
        }
    }
}

#[tokio::test]
async fn client_ping_frame_gets_pong_reply() {
    let handle = start_gateway().await;
    let mut ws = connect(handle.port, "u4").await;
    next_frame(&mut ws).await;

    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    let reply = next_frame(&mut ws).await;
    assert_eq!(reply["type"], "pong");
}

#[tokio::test]
async fn malformed_text_gets_error_frame_not_disconnect() {
    let handle = start_gateway().await;
    let mut ws = connect(handle.port, "u5").await;
    next_frame(&mut ws).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    let reply = next_frame(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["message"], "Invalid message format");

    // Connection survives.
    ws.send(Message::Text(r#"{"type":"ping"}"#.into()))
        .await
        .unwrap();
    assert_eq!(next_frame(&mut ws).await["type"], "pong");
}

#[tokio::test]
async fn non_control_frames_surface_on_inbound_channel() {
    let mut handle = start_gateway().await;
    let mut ws = connect(handle.port, "u6").await;
    next_frame(&mut ws).await;

    ws.send(Message::Text(
        r#"{"type":"task_request","action":"summarize"}"#.into(),
    ))
    .await
    .unwrap();

    let (user, frame) = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        handle.inbound.recv(),
    )
    .await
    .expect("timed out waiting for inbound frame")
    .expect("inbound channel open");
    assert_eq!(user.as_str(), "u6");
    assert!(frame.is_kind("task_request"));
    assert_eq!(frame.field("action"), Some(&Value::from("summarize")));
}

#[tokio::test]
async fn shutdown_notifies_clients_and_refuses_publishes() {
    let handle = start_gateway().await;
    let mut ws = connect(handle.port, "u7").await;
    next_frame(&mut ws).await;

    handle.gateway.shutdown().await;

    let user = UserId::new("u7").unwrap();
    let err = handle
        .gateway
        .publish_to(&user, Frame::new("x"))
        .unwrap_err();
    assert!(matches!(err, GatewayError::Shutdown));

    let mut saw_closing = false;
    let mut close_code = None;
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let v: Value = serde_json::from_str(&text).unwrap();
                if v["type"] == "connection_state" && v["state"] == "closing" {
                    saw_closing = true;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                close_code = frame.map(|f| u16::from(f.code));
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => break,
        }
    }
    assert!(saw_closing, "expected a closing connection_state frame");
    assert_eq!(close_code, Some(1001));
}
