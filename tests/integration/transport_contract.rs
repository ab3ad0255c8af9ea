//! The WebSocket protocol as a client sees it.

use crate::helpers::{FakeLlm, FakeTts, Reply, WAIT};
use cadence::config::SpeechConfig;
use cadence::transport::{AppState, SessionEngines, serve};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn start_server(llm: FakeLlm) -> Server {
    let engines = SessionEngines {
        llm: Arc::new(llm),
        tts: Arc::new(FakeTts::new(2)),
        transcriber: None,
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(serve(
        listener,
        AppState::new(SpeechConfig::default(), engines),
        shutdown.clone(),
    ));
    Server { addr, shutdown }
}

/// Connect and consume the `session_info` greeting.
async fn connect(server: &Server) -> (Client, String) {
    let (mut client, _) = connect_async(format!("ws://{}/ws", server.addr))
        .await
        .unwrap();
    let greeting = next_json(&mut client).await;
    assert_eq!(greeting["type"], "session_info");
    assert_eq!(greeting["content"]["status"], "connected");
    let id = greeting["content"]["session_id"].as_str().unwrap().to_owned();
    (client, id)
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .unwrap();
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("no message in time")
            .expect("connection closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Message types up to and including the first of type `last`.
async fn types_until(client: &mut Client, last: &str) -> Vec<Value> {
    let mut seen = Vec::new();
    loop {
        let message = next_json(client).await;
        let done = message["type"] == last;
        seen.push(message);
        if done {
            return seen;
        }
    }
}

#[tokio::test]
async fn reply_messages_arrive_in_protocol_order() {
    let server = start_server(FakeLlm::always(Reply::Tokens(vec![
        "Sure, ",
        "the lights ",
        "are now on. ",
        "Anything else?",
    ])))
    .await;
    let (mut client, _) = connect(&server).await;

    send_json(&mut client, json!({"type": "user_text", "content": "turn on the lights"})).await;
    let seen = types_until(&mut client, "final_assistant_answer").await;

    assert_eq!(seen[0], json!({"type": "final_user_request", "content": "turn on the lights"}));
    assert_eq!(seen[1]["type"], "partial_assistant_answer");
    let quick = seen[1]["content"].as_str().unwrap();
    assert!(quick.starts_with("Sure, the lights are now on."));
    let chunks = &seen[2..seen.len() - 1];
    assert!(!chunks.is_empty());
    for chunk in chunks {
        assert_eq!(chunk["type"], "tts_chunk");
        assert!(!chunk["content"].as_str().unwrap().is_empty());
    }
    assert_eq!(
        seen.last().unwrap()["content"],
        "Sure, the lights are now on. Anything else?"
    );
}

#[tokio::test]
async fn stop_while_playing_interrupts_the_reply() {
    let server = start_server(FakeLlm::always(Reply::Hang(vec![
        "Once upon a time, in a faraway land, ",
    ])))
    .await;
    let (mut client, _) = connect(&server).await;

    send_json(&mut client, json!({"type": "tts_start"})).await;
    send_json(&mut client, json!({"type": "user_text", "content": "tell me a story"})).await;
    types_until(&mut client, "tts_chunk").await;

    send_json(&mut client, json!({"type": "stop"})).await;
    let seen = types_until(&mut client, "tts_interruption").await;
    let types: Vec<&str> = seen.iter().map(|m| m["type"].as_str().unwrap()).collect();
    assert_eq!(types[types.len() - 2], "stop_tts");
    assert!(!types.contains(&"final_assistant_answer"));
}

#[tokio::test]
async fn malformed_input_keeps_the_connection_open() {
    let server = start_server(FakeLlm::always(Reply::Tokens(vec!["Okay."]))).await;
    let (mut client, _) = connect(&server).await;

    client.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    client
        .send(Message::Text("definitely not json".to_owned()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut client).await["type"], "error");

    send_json(&mut client, json!({"type": "set_speed", "speed": 30})).await;
    send_json(&mut client, json!({"type": "ping"})).await;
    assert_eq!(next_json(&mut client).await["type"], "pong");
}

#[tokio::test]
async fn each_connection_has_its_own_session() {
    let server = start_server(FakeLlm::always(Reply::Tokens(vec!["Okay."]))).await;
    let (mut first, first_id) = connect(&server).await;
    let (_second, second_id) = connect(&server).await;
    assert_ne!(first_id, second_id);

    let health: Value = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["sessions"], 2);

    first.close(None).await.unwrap();
    tokio::time::timeout(WAIT, async {
        loop {
            let health: Value = reqwest::get(format!("http://{}/health", server.addr))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if health["sessions"] == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}
