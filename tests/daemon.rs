//! End-to-end tests for the session daemon over real sockets
//!
//! Run with: cargo test --test daemon

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use browsectl::protocol::{Decoded, FrameCodec, MAX_FRAME_LEN};
use browsectl::session::endpoint::tcp_endpoint;
use browsectl::{Client, Config, Daemon, Endpoint, MemoryEngine, Response};

struct Running {
    endpoint: Endpoint,
    token: CancellationToken,
    handle: JoinHandle<browsectl::Result<()>>,
}

async fn start(engine: MemoryEngine, idle: Duration) -> Running {
    let listener = tcp_endpoint(0).bind().await.unwrap();
    let endpoint = listener.endpoint().unwrap();
    let daemon = Daemon::with_engine("test", Config::default(), Arc::new(engine))
        .unwrap()
        .idle_timeout(idle);
    let token = daemon.shutdown_token();
    let handle = tokio::spawn(daemon.serve(listener, None));
    Running {
        endpoint,
        token,
        handle,
    }
}

async fn next_value(framed: &mut Framed<browsectl::session::BoxStream, FrameCodec>) -> Option<Value> {
    match framed.next().await {
        Some(Ok(Decoded::Message(value))) => Some(value),
        Some(other) => panic!("unexpected frame: {:?}", other),
        None => None,
    }
}

#[tokio::test]
async fn test_navigate_round_trip() {
    let daemon = start(MemoryEngine::new(), Duration::ZERO).await;
    let mut client = Client::connect(&daemon.endpoint).await.unwrap();

    let resp = client
        .request("navigate", json!({"url": "https://example.test"}))
        .await
        .unwrap();
    assert_eq!(
        resp,
        Response::ok("1", json!({"url": "https://example.test", "title": "Example"}))
    );

    daemon.token.cancel();
    daemon.handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_unknown_action_keeps_id() {
    let engine = MemoryEngine::new();
    let daemon = start(engine.clone(), Duration::ZERO).await;
    let mut client = Client::connect(&daemon.endpoint).await.unwrap();

    let resp = client
        .send_value(&json!({"id": "x7", "action": "bogus"}))
        .await
        .unwrap();
    assert_eq!(resp, Response::err("x7", "Unknown action: bogus"));
    assert_eq!(engine.page_count().await, 0);
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let daemon = start(MemoryEngine::new(), Duration::ZERO).await;
    let stream = daemon.endpoint.connect().await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec);

    framed
        .get_mut()
        .write_all(&[5, 0, 0, 0, b'{', b'n', b'o', b'p', b'e'])
        .await
        .unwrap();
    let reply = next_value(&mut framed).await.unwrap();
    assert_eq!(reply["id"], "");
    assert_eq!(reply["success"], false);
    assert!(reply["error"].as_str().unwrap().starts_with("Malformed frame"));

    framed
        .send(json!({"id": "2", "action": "navigate", "url": "https://example.test/login"}))
        .await
        .unwrap();
    let reply = next_value(&mut framed).await.unwrap();
    assert_eq!(reply["id"], "2");
    assert_eq!(reply["data"]["title"], "Login");
}

#[tokio::test]
async fn test_oversize_frame_drops_connection() {
    let daemon = start(MemoryEngine::new(), Duration::ZERO).await;
    let stream = daemon.endpoint.connect().await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec);

    let declared = (MAX_FRAME_LEN as u32 + 1).to_le_bytes();
    framed.get_mut().write_all(&declared).await.unwrap();

    let reply = next_value(&mut framed).await.unwrap();
    assert!(reply["error"].as_str().unwrap().starts_with("Frame too large"));
    assert!(next_value(&mut framed).await.is_none());

    // Other clients are unaffected
    let mut client = Client::connect(&daemon.endpoint).await.unwrap();
    let resp = client.request("launch", Value::Null).await.unwrap();
    assert!(resp.success);
}

#[tokio::test]
async fn test_pipelined_commands_answer_in_order() {
    let daemon = start(MemoryEngine::new(), Duration::ZERO).await;
    let stream = daemon.endpoint.connect().await.unwrap();
    let mut framed = Framed::new(stream, FrameCodec);

    framed
        .send(json!({"id": "a", "action": "navigate", "url": "https://example.test/login"}))
        .await
        .unwrap();
    framed.send(json!({"id": "b", "action": "bogus"})).await.unwrap();
    framed.send(json!({"id": "c", "action": "title"})).await.unwrap();

    let ids: Vec<Value> = vec![
        next_value(&mut framed).await.unwrap()["id"].clone(),
        next_value(&mut framed).await.unwrap()["id"].clone(),
        next_value(&mut framed).await.unwrap()["id"].clone(),
    ];
    assert_eq!(ids, vec![json!("a"), json!("b"), json!("c")]);
}

#[tokio::test]
async fn test_clients_share_one_browser() {
    let daemon = start(MemoryEngine::new(), Duration::ZERO).await;
    let mut first = Client::connect(&daemon.endpoint).await.unwrap();
    let mut second = Client::connect(&daemon.endpoint).await.unwrap();

    first
        .request("navigate", json!({"url": "https://example.test/login"}))
        .await
        .unwrap();
    let resp = second.request("title", Value::Null).await.unwrap();
    assert_eq!(resp.data.unwrap()["title"], "Login");

    let resp = second.request("tab_close", Value::Null).await.unwrap();
    assert_eq!(
        resp.error.as_deref(),
        Some("Cannot close the last tab; close the session instead")
    );
}

#[tokio::test]
async fn test_close_stops_daemon() {
    let engine = MemoryEngine::new();
    let daemon = start(engine.clone(), Duration::ZERO).await;
    let mut client = Client::connect(&daemon.endpoint).await.unwrap();

    client
        .request("navigate", json!({"url": "https://example.test/"}))
        .await
        .unwrap();
    let resp = client.request("close", Value::Null).await.unwrap();
    assert_eq!(resp.data.unwrap()["closed"], true);

    tokio::time::timeout(Duration::from_secs(5), daemon.handle)
        .await
        .expect("daemon did not stop")
        .unwrap()
        .unwrap();
    assert_eq!(engine.page_count().await, 0);
    assert!(!daemon.endpoint.is_live().await);
}

#[tokio::test]
async fn test_idle_daemon_reaps_itself() {
    let engine = MemoryEngine::new();
    let daemon = start(engine.clone(), Duration::from_millis(150)).await;

    let mut client = Client::connect(&daemon.endpoint).await.unwrap();
    client.request("launch", Value::Null).await.unwrap();

    // A connected client keeps it alive
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!daemon.handle.is_finished());

    drop(client);
    tokio::time::timeout(Duration::from_secs(5), daemon.handle)
        .await
        .expect("idle daemon did not exit")
        .unwrap()
        .unwrap();
    // Browser was torn down on the way out
    assert_eq!(engine.page_count().await, 0);
}

#[cfg(unix)]
mod bridge {
    use super::*;

    use browsectl::bridge::peer;
    use browsectl::core::config::{EngineKind, Transport};
    use browsectl::Registry;

    fn bridge_config(dir: &std::path::Path, timeout_secs: u64) -> Config {
        let mut config = Config::default();
        config.daemon.socket_dir = Some(dir.to_path_buf());
        config.daemon.transport = Transport::Auto;
        config.engine.kind = EngineKind::Bridge;
        config.bridge.request_timeout_secs = timeout_secs;
        config
    }

    async fn wait_live(endpoint: &Endpoint) {
        for _ in 0..100 {
            if endpoint.is_live().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never came up", endpoint);
    }

    #[tokio::test]
    async fn test_daemon_drives_bridge_peer() {
        let dir = tempfile::tempdir().unwrap();
        let config = bridge_config(dir.path(), 5);
        let registry = Registry::new(config.clone());
        let daemon = Daemon::new("bridged", config).unwrap();
        let handle = tokio::spawn(daemon.run());

        let endpoint = registry.endpoint("bridged").unwrap();
        wait_live(&endpoint).await;
        assert!(registry.pid_file("bridged").exists());

        // In-process host answering from the memory engine
        let engine = MemoryEngine::new();
        let stream = registry.bridge_endpoint("bridged").unwrap().connect().await.unwrap();
        tokio::spawn(peer::serve(stream, Arc::new(engine.clone())));

        let mut client = Client::connect(&endpoint).await.unwrap();
        let resp = client
            .request("navigate", json!({"url": "https://example.test/login"}))
            .await
            .unwrap();
        assert_eq!(resp.data.unwrap()["title"], "Login");

        let resp = client
            .request("snapshot", json!({"interactive": true}))
            .await
            .unwrap();
        assert!(resp.data.unwrap()["snapshot"]
            .as_str()
            .unwrap()
            .contains("[ref=e1]"));

        let resp = client.request("close", Value::Null).await.unwrap();
        assert!(resp.success, "{:?}", resp.error);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("daemon did not stop")
            .unwrap()
            .unwrap();

        assert!(!registry.pid_file("bridged").exists());
        assert_eq!(engine.page_count().await, 0);
    }

    #[tokio::test]
    async fn test_bridge_without_peer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let config = bridge_config(dir.path(), 1);
        let registry = Registry::new(config.clone());
        let daemon = Daemon::new("lonely", config).unwrap();
        let token = daemon.shutdown_token();
        let handle = tokio::spawn(daemon.run());

        let endpoint = registry.endpoint("lonely").unwrap();
        wait_live(&endpoint).await;

        let mut client = Client::connect(&endpoint).await.unwrap();
        let resp = client
            .request("navigate", json!({"url": "https://example.test/"}))
            .await
            .unwrap();
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("timed out"));

        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(!endpoint.is_live().await);
    }
}
