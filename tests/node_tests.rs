//! End-to-end: the node binary against a WebSocket server in the test.
#![cfg(unix)]

use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use node_worker_types::TaskResult;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

const STEP_TIMEOUT: Duration = Duration::from_secs(20);

async fn next_text(ws: &mut WebSocketStream<tokio::net::TcpStream>) -> String {
    loop {
        let frame = timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .expect("read error");
        if let Message::Text(text) = frame {
            return text;
        }
    }
}

fn wait_with_timeout(child: &mut Child, limit: Duration) -> ExitStatus {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("node did not exit within {limit:?}");
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_node_session_over_websocket() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let config_path = root.join("config.json");
    let config = serde_json::json!({
        "log": {"dir": root.join("logs"), "level": "debug", "filename": "node.log"},
        "backend": {"kind": "mock", "delay_ms": 0},
        "runtime": {
            "poll_interval_ms": 20,
            "handshake_timeout_secs": 10,
            "terminate_grace_secs": 5,
            "lock_dir": root.join("locks"),
        },
    });
    std::fs::write(&config_path, config.to_string()).unwrap();

    let rt = tokio::runtime::Runtime::new().unwrap();
    let listener = rt.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
    let addr = listener.local_addr().unwrap();

    let mut node = Command::new(env!("CARGO_BIN_EXE_node-worker"))
        .arg("--config")
        .arg(&config_path)
        .arg("--node-url")
        .arg(format!("ws://{addr}"))
        .spawn()
        .unwrap();

    // Keep the server side open until the node has exited.
    let ws = rt.block_on(async {
        let (stream, _) = timeout(STEP_TIMEOUT, listener.accept())
            .await
            .expect("node never connected")
            .unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        let hello: serde_json::Value = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(hello["version"], env!("CARGO_PKG_VERSION"));
        ws.send(Message::Text(r#"{"worker_id":"w-7"}"#.to_string()))
            .await
            .unwrap();

        let task = serde_json::json!({
            "task_name": "inference",
            "id": "t1",
            "task_type": 1,
            "model_id": "gpt2",
            "task_args": "{}",
            "output_dir": "out",
        });
        ws.send(Message::Text(task.to_string())).await.unwrap();

        let result: TaskResult = serde_json::from_str(&next_text(&mut ws).await).unwrap();
        assert_eq!(result.task_id_commitment, "t1");
        assert!(result.is_success());
        ws
    });

    // SIGTERM only cancels; the node then shuts its task processes down cleanly.
    let pid = libc::pid_t::try_from(node.id()).unwrap();
    assert_eq!(unsafe { libc::kill(pid, libc::SIGTERM) }, 0);
    let status = wait_with_timeout(&mut node, STEP_TIMEOUT);
    assert!(status.success(), "node exited with {status}");

    drop(ws);
    assert!(root.join("logs").join("node.log").exists());
    let leftover_locks = std::fs::read_dir(root.join("locks")).unwrap().count();
    assert_eq!(leftover_locks, 0);
}

#[test]
fn test_invalid_config_exits_with_error() {
    let status = Command::new(env!("CARGO_BIN_EXE_node-worker"))
        .arg("--config")
        .arg("/nonexistent/node-worker.json")
        .arg("--node-url")
        .arg("http://not-a-websocket")
        .status()
        .unwrap();
    assert!(!status.success());
}

#[test]
fn test_unknown_task_process_kind_is_rejected() {
    let status = Command::new(env!("CARGO_BIN_EXE_node-worker"))
        .args(["--task-process", "training"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}
