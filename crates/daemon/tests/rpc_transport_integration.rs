#![cfg(unix)]

use std::time::Duration;

use modelsync_common::protocol::jsonrpc::{Request, RequestId, Response};
use modelsync_common::types::SubscriptionKey;
use modelsync_common::protocol::channels::PushFrame;
use modelsync_daemon::hub::SessionPublisher;
use modelsync_daemon::proxy::{SubscriptionProxy, UnixSocketCaller};
use modelsync_daemon::rpc::methods::RpcServerState;
use modelsync_daemon::rpc::unix::serve_unix_until_shutdown;
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

struct Server {
    _dir: TempDir,
    socket_path: std::path::PathBuf,
    state: RpcServerState,
    shutdown: broadcast::Sender<()>,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

fn start_server() -> Server {
    let dir = TempDir::new().expect("temp dir should be created");
    let socket_path = dir.path().join("daemon.sock");
    let listener = UnixListener::bind(&socket_path).expect("socket should bind");
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let state = RpcServerState::default();
    let task = tokio::spawn(serve_unix_until_shutdown(listener, state.clone(), shutdown_rx));
    Server { _dir: dir, socket_path, state, shutdown, task }
}

#[tokio::test]
async fn concurrent_clients_each_get_their_own_response() {
    let server = start_server();

    let mut clients = Vec::new();
    for client_id in 0_i64..8 {
        let socket_path = server.socket_path.clone();
        clients.push(tokio::spawn(async move {
            let stream = UnixStream::connect(&socket_path).await.expect("client should connect");
            let (read_half, mut write_half) = stream.into_split();
            let request = Request::new("rpc.ping", None, RequestId::Number(client_id));
            let mut encoded = serde_json::to_vec(&request).expect("request should serialize");
            encoded.push(b'\n');
            write_half.write_all(&encoded).await.expect("write should succeed");

            let mut line = String::new();
            BufReader::new(read_half).read_line(&mut line).await.expect("read should succeed");
            serde_json::from_str::<Response>(&line).expect("response should decode")
        }));
    }

    for (expected_id, task) in (0_i64..8).zip(clients) {
        let response = task.await.expect("client task should complete");
        assert_eq!(response.id, RequestId::Number(expected_id));
        assert_eq!(response.result, Some(json!({ "ok": true })));
    }

    server.shutdown.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn unix_proxy_subscribes_against_a_remote_registry_owner() {
    let server = start_server();
    let proxy = SubscriptionProxy::new(std::sync::Arc::new(
        UnixSocketCaller::new(&server.socket_path).with_timeout(Duration::from_secs(2)),
    ));
    let key = SubscriptionKey::new("user", "42");

    proxy.subscribe("s1", "User", Some("42"), "l1", true).await.expect("subscribe should succeed");
    proxy.subscribe("s1", "User", Some("42"), "l1", true).await.expect("resubscribe should succeed");
    let entries = server.state.registry().listeners(&key).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].atomic);

    proxy.unsubscribe("s1", "user", Some("42"), "l1").await.expect("unsubscribe should succeed");
    assert!(server.state.registry().listeners(&key).await.unwrap().is_empty());

    server.shutdown.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn followed_session_receives_owner_pushes_until_the_reader_drops() {
    let server = start_server();
    let proxy = SubscriptionProxy::new(std::sync::Arc::new(
        UnixSocketCaller::new(&server.socket_path).with_timeout(Duration::from_secs(2)),
    ));
    let hub = server.state.hub().expect("in-memory owner has a hub").clone();

    let mut pushes = proxy.follow("s1").await.expect("follow should attach");
    assert!(hub.is_attached("s1"));

    let frame = PushFrame::new("model.update.user.42", json!({ "name": "Ada" }));
    hub.publish("s1", frame.clone()).unwrap();
    let received = tokio::time::timeout(Duration::from_secs(2), pushes.recv())
        .await
        .expect("frame should arrive in time");
    assert_eq!(received, Some(frame));

    drop(pushes);
    for _ in 0..200 {
        if !hub.is_attached("s1") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!hub.is_attached("s1"));

    server.shutdown.send(()).unwrap();
    server.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_method_stops_the_listener() {
    let dir = TempDir::new().unwrap();
    let socket_path = dir.path().join("daemon.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    let state = RpcServerState::default().with_shutdown_notifier(shutdown.clone());
    let task = tokio::spawn(serve_unix_until_shutdown(listener, state, shutdown_rx));

    let caller = UnixSocketCaller::new(&socket_path);
    let result = modelsync_daemon::proxy::RegistryCaller::call(&caller, "daemon.shutdown", json!({}))
        .await
        .expect("shutdown call should succeed");
    assert_eq!(result, json!({ "ok": true }));

    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("listener should stop")
        .unwrap()
        .unwrap();
}
