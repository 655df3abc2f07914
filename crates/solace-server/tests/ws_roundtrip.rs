//! A live WebSocket session against a served router.

mod common;

use common::Harness;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn send(socket: &mut Socket, value: Value) {
    socket
        .send(WsMessage::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), socket.next())
            .await
            .expect("timed out waiting for websocket message");
        match msg {
            Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
            Some(Ok(WsMessage::Ping(_))) | Some(Ok(WsMessage::Pong(_))) => continue,
            other => panic!("expected text frame, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn session_round_trip_over_websocket() {
    let harness = Harness::new();
    harness.conversation("c1", "ana");
    let addr = harness.serve().await;

    let url = format!("ws://{}/ws?token={}", addr, harness.token("ana"));
    let (mut socket, _) = connect_async(url).await.expect("failed to connect");

    send(&mut socket, json!({ "type": "start", "conversationId": "c1" })).await;
    let started = next_json(&mut socket).await;
    assert_eq!(started["type"], "session_started");
    assert!(started["sessionId"].as_str().is_some());

    send(&mut socket, json!({ "type": "text", "content": "Estou ansiosa" })).await;
    let reply = next_json(&mut socket).await;
    assert_eq!(reply["type"], "reply");
    assert_eq!(
        reply["text"],
        "Entendo. Vamos respirar juntos por um momento."
    );
    assert!(reply["audioRef"].as_str().unwrap().ends_with(".mp3"));
    assert!(reply["durationEstimate"].as_u64().unwrap() > 0);

    send(&mut socket, json!({ "type": "end" })).await;
    let ended = next_json(&mut socket).await;
    assert_eq!(ended["type"], "session_ended");
    assert_eq!(ended["chunksProcessed"], 0);

    assert_eq!(harness.state.sessions.live_count().await, 0);
}

#[tokio::test]
async fn connect_without_valid_token_is_rejected() {
    let harness = Harness::new();
    let addr = harness.serve().await;

    assert!(connect_async(format!("ws://{}/ws", addr)).await.is_err());
    assert!(connect_async(format!("ws://{}/ws?token=forged", addr))
        .await
        .is_err());
    assert_eq!(harness.state.sessions.live_count().await, 0);
}

#[tokio::test]
async fn dropped_connection_ends_the_session() {
    let harness = Harness::new();
    harness.conversation("c1", "ana");
    let addr = harness.serve().await;

    let url = format!("ws://{}/ws?token={}", addr, harness.token("ana"));
    let (mut socket, _) = connect_async(url).await.unwrap();
    send(&mut socket, json!({ "type": "start", "conversationId": "c1" })).await;
    next_json(&mut socket).await;
    assert_eq!(harness.state.sessions.live_count().await, 1);

    drop(socket);

    let mut live = 1;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        live = harness.state.sessions.live_count().await;
        if live == 0 {
            break;
        }
    }
    assert_eq!(live, 0);
}

#[tokio::test]
async fn shutdown_ends_live_sessions() {
    let harness = Harness::new();
    harness.conversation("c1", "ana");
    let addr = harness.serve().await;

    let url = format!("ws://{}/ws?token={}", addr, harness.token("ana"));
    let (mut socket, _) = connect_async(url).await.unwrap();
    send(&mut socket, json!({ "type": "start", "conversationId": "c1" })).await;
    next_json(&mut socket).await;

    harness.shutdown.send(true).unwrap();
    let ended = next_json(&mut socket).await;
    assert_eq!(ended["type"], "session_ended");
    assert_eq!(harness.state.sessions.live_count().await, 0);
}
