//! Scripted duplex task server shared by the socket integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

/// Replies the server sends for one client action (`run-task`, ...).
pub type Script = Arc<dyn Fn(&str, &str) -> Vec<Message> + Send + Sync>;

/// What the server saw on one connection.
#[derive(Debug, Default, Clone)]
pub struct SeenConnection {
    /// `Authorization` header of the upgrade request.
    pub authorization: Option<String>,
    /// Header actions in arrival order.
    pub actions: Vec<String>,
    /// Parsed text frames in arrival order.
    pub frames: Vec<Value>,
    /// Total binary payload received.
    pub binary_bytes: usize,
    /// Number of binary frames received.
    pub binary_frames: usize,
}

/// A local duplex server answering with a script.
pub struct DuplexServer {
    /// `ws://` URL to connect to.
    pub url: String,
    seen: Arc<Mutex<Vec<SeenConnection>>>,
}

impl DuplexServer {
    /// Bind to an ephemeral port and serve every connection with `script`.
    pub async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, Arc::clone(&script), Arc::clone(&seen)));
                }
            });
        }
        Self {
            url: format!("ws://{addr}"),
            seen,
        }
    }

    /// Snapshot of every connection so far.
    pub fn connections(&self) -> Vec<SeenConnection> {
        self.seen.lock().unwrap().clone()
    }

    /// Wait until `n` connections have sent `action`.
    pub async fn wait_for_action(&self, n: usize, action: &str) {
        for _ in 0..200 {
            let count = self
                .connections()
                .iter()
                .filter(|c| c.actions.iter().any(|a| a == action))
                .count();
            if count >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never saw {n} x {action}");
    }
}

async fn serve(stream: TcpStream, script: Script, seen: Arc<Mutex<Vec<SeenConnection>>>) {
    let authorization = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&authorization);
    let callback = move |request: &Request, response: Response| {
        *captured.lock().unwrap() = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Ok::<Response, ErrorResponse>(response)
    };
    let Ok(mut socket) = accept_hdr_async(stream, callback).await else {
        return;
    };

    let index = {
        let mut seen = seen.lock().unwrap();
        seen.push(SeenConnection {
            authorization: authorization.lock().unwrap().clone(),
            ..SeenConnection::default()
        });
        seen.len() - 1
    };

    while let Some(Ok(message)) = socket.next().await {
        let replies = match message {
            Message::Text(text) => {
                let frame: Value = serde_json::from_str(&text).unwrap();
                let action = frame["header"]["action"].as_str().unwrap_or_default().to_owned();
                let task_id = frame["header"]["task_id"].as_str().unwrap_or_default().to_owned();
                {
                    let mut seen = seen.lock().unwrap();
                    seen[index].actions.push(action.clone());
                    seen[index].frames.push(frame);
                }
                script(&action, &task_id)
            }
            Message::Binary(data) => {
                let mut seen = seen.lock().unwrap();
                seen[index].binary_bytes += data.len();
                seen[index].binary_frames += 1;
                Vec::new()
            }
            _ => Vec::new(),
        };
        for reply in replies {
            if socket.send(reply).await.is_err() {
                return;
            }
        }
    }
}

/// A server event frame.
pub fn event(task_id: &str, name: &str) -> Message {
    Message::Text(
        json!({
            "header": { "task_id": task_id, "event": name, "attributes": {} },
            "payload": {},
        })
        .to_string(),
    )
}

/// A `task-failed` frame.
pub fn failed(task_id: &str, code: &str, message: &str) -> Message {
    Message::Text(
        json!({
            "header": {
                "task_id": task_id,
                "event": "task-failed",
                "error_code": code,
                "error_message": message,
            },
            "payload": {},
        })
        .to_string(),
    )
}

/// A recognition `result-generated` frame.
pub fn sentence(task_id: &str, text: &str, sentence_end: bool) -> Message {
    Message::Text(
        json!({
            "header": { "task_id": task_id, "event": "result-generated" },
            "payload": {
                "output": {
                    "sentence": { "text": text, "sentence_end": sentence_end },
                },
            },
        })
        .to_string(),
    )
}
