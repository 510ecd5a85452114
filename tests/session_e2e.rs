//! End-to-end session behavior over real WebSockets and real PTYs.

mod common;

use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use common::*;
use futures::{SinkExt, StreamExt};
use ptyhub::codec::{BinaryFrame, SESSION_CLOSED_CODE};
use ptyhub::persist::{RecordStore, SessionRecord};
use serde_json::json;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

#[tokio::test]
async fn exit_code_reaches_every_viewer_in_same_order() {
    let server = TestServer::start(r#"read line; printf 'got %s\n' "$line"; exit 42"#).await;
    let id = new_session_id();

    let mut a = server.viewer(&id, "ada").await;
    let mut b = server.viewer(&id, "bob").await;
    send_input(&mut a, b"hi\r").await;

    let ta = read_until_exit(&mut a).await;
    let tb = read_until_exit(&mut b).await;

    assert!(ta.output_str().contains("got hi"), "viewer a output: {:?}", ta.output_str());
    assert_eq!(ta.output, tb.output, "both viewers see identical output");
    assert_eq!(ta.control.last().unwrap()["code"], 42);
    assert_eq!(tb.control.last().unwrap()["code"], 42);

    server.stop().await;
}

#[tokio::test]
async fn late_viewer_gets_replay_without_gaps() {
    let server = TestServer::start(r#"while read line; do echo "echo:$line"; done"#).await;
    let id = new_session_id();

    let mut a = server.viewer(&id, "ada").await;
    send_input(&mut a, b"first\r").await;
    read_output_until(&mut a, "echo:first").await;

    // Output produced before b attached is replayed to it.
    let mut b = server.viewer(&id, "bob").await;
    read_output_until(&mut b, "echo:first").await;

    send_input(&mut b, b"second\r").await;
    read_output_until(&mut a, "echo:second").await;
    read_output_until(&mut b, "echo:second").await;

    server.stop().await;
}

#[tokio::test]
async fn detaching_one_viewer_leaves_the_other_attached() {
    let server = TestServer::start(r#"while read line; do echo "echo:$line"; done"#).await;
    let id = new_session_id();

    let mut a = server.viewer(&id, "ada").await;
    let mut b = server.viewer(&id, "bob").await;
    send_input(&mut a, b"one\r").await;
    read_output_until(&mut a, "echo:one").await;
    read_output_until(&mut b, "echo:one").await;

    b.close(None).await.unwrap();
    drop(b);

    let uuid = Uuid::parse_str(&id).unwrap();
    let session = server.state.registry.get(&uuid).unwrap();
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while session.viewer_count() != 1 {
        assert!(tokio::time::Instant::now() < deadline, "viewer b never detached");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    send_input(&mut a, b"two\r").await;
    read_output_until(&mut a, "echo:two").await;
    assert!(session.state().is_running());

    server.stop().await;
}

async fn seed_record(server: &TestServer, token: &str) -> String {
    let id = Uuid::new_v4();
    let store = RecordStore::new(server.dir.path().join("state"));
    store
        .save(&SessionRecord {
            id,
            name: "seeded".into(),
            agent: "sh".into(),
            cwd: server.dir.path().join("work").join(id.to_string()),
            yolo: false,
            resume_token: Some(token.into()),
        })
        .await
        .unwrap();
    id.to_string()
}

fn exec_modes(t: &Transcript) -> Vec<String> {
    t.of_type("exec_start")
        .iter()
        .map(|v| v["mode"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn invalid_resume_token_falls_back_to_fresh_start() {
    let server = TestServer::start(r#"echo "mode=$0"; sleep 30"#).await;
    let id = seed_record(&server, "bad").await;

    let mut a = server.viewer(&id, "ada").await;
    let t = read_output_until(&mut a, "mode=fresh").await;
    assert_eq!(exec_modes(&t), vec!["resume", "fresh"]);
    assert!(t.of_type("exit").is_empty(), "fallback is not reported as an error");

    // The fresh token replaces the rejected one once the agent is running.
    let store = RecordStore::new(server.dir.path().join("state"));
    let uuid = Uuid::parse_str(&id).unwrap();
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    loop {
        let record = store.load(&uuid).await.unwrap();
        assert_eq!(record.name, "seeded");
        if record.resume_token.as_deref() != Some("bad") {
            assert!(record.resume_token.is_some());
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "record still holds the rejected token");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    server.stop().await;
}

#[tokio::test]
async fn valid_resume_token_resumes() {
    let server = TestServer::start(r#"echo "mode=$0"; sleep 30"#).await;
    let id = seed_record(&server, "good").await;

    let mut a = server.viewer(&id, "ada").await;
    let t = read_output_until(&mut a, "mode=resume").await;
    assert_eq!(exec_modes(&t), vec!["resume"]);

    server.stop().await;
}

#[tokio::test]
async fn control_messages_fan_out_and_replies_stay_private() {
    let server = TestServer::start("sleep 30").await;
    let id = new_session_id();

    let mut a = server.viewer(&id, "ada").await;
    let mut b = server.viewer(&id, "bob").await;

    send_json(&mut a, json!({"type": "renameSession", "name": "refactor"})).await;
    for ws in [&mut a, &mut b] {
        let t = read_until(ws, |v| v["type"] == "renameSession").await;
        assert_eq!(t.control.last().unwrap()["name"], "refactor");
    }

    send_json(&mut a, json!({"type": "chat", "text": "hello"})).await;
    let t = read_until(&mut b, |v| v["type"] == "chatMsg").await;
    let chat = t.control.last().unwrap();
    assert_eq!(chat["from"], "ada");
    assert_eq!(chat["text"], "hello");
    assert!(chat["ts"].as_u64().unwrap() > 0);

    let data = base64::engine::general_purpose::STANDARD.encode(b"some notes");
    send_json(&mut a, json!({"type": "fileUpload", "filename": "../notes.txt", "data": data})).await;
    let t = read_until(&mut a, |v| v["type"] == "fileUploaded").await;
    let uploaded = t.control.last().unwrap();
    assert_eq!(uploaded["success"], true);
    let path = std::path::PathBuf::from(uploaded["path"].as_str().unwrap());
    assert_eq!(std::fs::read(&path).unwrap(), b"some notes");
    assert!(path.starts_with(server.dir.path().join("work").join(&id)));

    // Anything broadcast would already sit ahead of the pong in b's queue.
    send_json(&mut b, json!({"type": "ping", "payload": 7})).await;
    let t = read_until(&mut b, |v| v["type"] == "pong").await;
    assert_eq!(t.control.last().unwrap()["payload"], 7);
    assert!(t.of_type("fileUploaded").is_empty());

    server.stop().await;
}

#[tokio::test]
async fn binary_resize_reaches_the_pty() {
    let server = TestServer::start("read x; stty size").await;
    let id = new_session_id();

    let mut a = server.viewer(&id, "ada").await;
    read_until(&mut a, |v| v["type"] == "status" && v["process"]["state"] == "running").await;
    let resize = BinaryFrame::Resize { rows: 40, cols: 120 }.encode().unwrap();
    a.send(Message::Binary(resize)).await.unwrap();
    let t = read_until(&mut a, |v| v["type"] == "status" && v["terminal"]["rows"] == 40).await;
    assert_eq!(t.control.last().unwrap()["terminal"]["cols"], 120);

    send_input(&mut a, b"\r").await;
    read_output_until(&mut a, "40 120").await;

    server.stop().await;
}

#[tokio::test]
async fn chunked_input_is_reassembled() {
    let server = TestServer::start(r#"read line; echo "len=${#line}""#).await;
    let id = new_session_id();
    let mut a = server.viewer(&id, "ada").await;

    let line = "x".repeat(300);
    let logical = BinaryFrame::Input(Bytes::from(format!("{line}\r"))).encode().unwrap();
    for fragment in ptyhub::codec::encode_chunks(&logical, 64).unwrap() {
        a.send(Message::Binary(fragment)).await.unwrap();
    }
    // Garbage between messages is dropped without closing the socket.
    a.send(Message::Binary(Bytes::from_static(&[0xFF, 1, 2]))).await.unwrap();
    a.send(Message::Text("not json".into())).await.unwrap();

    read_output_until(&mut a, "len=300").await;
    server.stop().await;
}

#[tokio::test]
async fn http_list_and_close() {
    let server = TestServer::start("sleep 30").await;
    let id = new_session_id();
    let mut a = server.viewer(&id, "ada").await;
    read_until(&mut a, |v| v["type"] == "status" && v["process"]["state"] == "running").await;

    let http = reqwest::Client::new();
    let list: serde_json::Value = http.get(server.http("/sessions")).send().await.unwrap().json().await.unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["id"], id);
    assert_eq!(list[0]["state"], "running");
    assert_eq!(list[0]["viewers"], 1);

    let resp = http.delete(server.http(&format!("/sessions/{id}"))).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);

    let close = loop {
        match tokio::time::timeout(STEP_TIMEOUT, a.next()).await.unwrap() {
            Some(Ok(Message::Close(frame))) => break frame,
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    };
    assert_eq!(close.unwrap().code, CloseCode::from(SESSION_CLOSED_CODE));

    let list: serde_json::Value = http.get(server.http("/sessions")).send().await.unwrap().json().await.unwrap();
    assert!(list.as_array().unwrap().is_empty());

    let resp = http.delete(server.http(&format!("/sessions/{id}"))).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    // A reconnecting viewer does not bring the closed session back.
    let url = server.ws_url(&format!("/sessions/{id}/ws?name=ada"));
    match tokio_tungstenite::connect_async(url).await.unwrap_err() {
        tokio_tungstenite::tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 410),
        other => panic!("expected HTTP error, got {other:?}"),
    }
    assert!(server.state.registry.is_empty());

    server.stop().await;
}

#[tokio::test]
async fn attach_with_unknown_agent_is_rejected() {
    let server = TestServer::start("sleep 30").await;
    let id = new_session_id();
    let url = server.ws_url(&format!("/sessions/{id}/ws?agent=nope"));
    let err = tokio_tungstenite::connect_async(url).await.unwrap_err();
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => assert_eq!(resp.status(), 400),
        other => panic!("expected HTTP error, got {other:?}"),
    }
    server.stop().await;
}
