//! Integration tests for the synthesis session manager against a local
//! duplex server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use aibox::config::CloudConfig;
use aibox::pipeline::messages::{PcmChunk, TtsCommand};
use aibox::pipeline::queue::FlushQueue;
use aibox::pipeline::session::SessionManager;
use aibox::tts::{ConnectionState, TtsSessionManager};
use common::{DuplexServer, Script, event, failed};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

const AUDIO: [u8; 4] = [1, 2, 3, 4];

/// Starts on run-task, answers each chunk with audio, finishes on finish-task.
fn well_behaved() -> Script {
    Arc::new(|action: &str, task_id: &str| match action {
        "run-task" => vec![event(task_id, "task-started")],
        "continue-task" => vec![
            event(task_id, "result-generated"),
            Message::Binary(AUDIO.to_vec()),
        ],
        "finish-task" => vec![event(task_id, "task-finished")],
        _ => Vec::new(),
    })
}

struct Fixture {
    sessions: Arc<SessionManager>,
    pcm: Arc<FlushQueue<PcmChunk>>,
    commands: Arc<FlushQueue<TtsCommand>>,
    tts: Arc<TtsSessionManager>,
}

impl Fixture {
    fn new(url: &str) -> Self {
        let cloud = CloudConfig {
            api_key: "test-key".into(),
            tts_url: url.to_owned(),
            connect_timeout_ms: 1_000,
            started_timeout_ms: 300,
            finish_timeout_ms: 1_000,
            ..CloudConfig::default()
        };
        let sessions = Arc::new(SessionManager::new());
        let pcm = Arc::new(FlushQueue::new(64));
        let tts = Arc::new(TtsSessionManager::new(
            &cloud,
            Arc::clone(&sessions),
            Arc::clone(&pcm),
        ));
        Self {
            sessions,
            pcm,
            commands: Arc::new(FlushQueue::new(16)),
            tts,
        }
    }

    fn spawn(&self) -> JoinHandle<()> {
        let tts = Arc::clone(&self.tts);
        let commands = Arc::clone(&self.commands);
        tokio::spawn(async move { tts.run(&commands, CancellationToken::new()).await })
    }

    async fn finish(&self, handle: JoinHandle<()>) {
        self.commands.close();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    async fn say(&self, session: u64, text: &str) {
        self.commands
            .send(TtsCommand::Speak {
                session,
                text: text.into(),
            })
            .await
            .unwrap();
    }

    async fn end(&self, session: u64) {
        self.commands
            .send(TtsCommand::EndOfTurn { session })
            .await
            .unwrap();
    }

    /// Close the PCM queue and collect what is left.
    async fn queued_pcm(&self) -> Vec<PcmChunk> {
        self.pcm.close();
        let mut out = Vec::new();
        while let Some(chunk) = self.pcm.recv().await {
            out.push(chunk);
        }
        out
    }
}

// ────────────────────────────────────────────────────────────────────────────
// One turn
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn turn_runs_run_continue_finish_then_drains() {
    let server = DuplexServer::start(well_behaved()).await;
    let fx = Fixture::new(&server.url);
    let session = fx.sessions.begin();

    let handle = fx.spawn();
    fx.say(session.id, "你好，").await;
    fx.say(session.id, "我是小瑞。").await;
    fx.end(session.id).await;
    fx.finish(handle).await;

    let connections = server.connections();
    assert_eq!(connections.len(), 1);
    let conn = &connections[0];
    assert_eq!(
        conn.actions,
        vec!["run-task", "continue-task", "continue-task", "finish-task"]
    );
    assert_eq!(conn.authorization.as_deref(), Some("Bearer test-key"));
    assert_eq!(conn.frames[0]["payload"]["parameters"]["format"], "pcm");
    assert_eq!(conn.frames[1]["payload"]["input"]["text"], "你好，");
    let task_id = &conn.frames[0]["header"]["task_id"];
    assert!(conn.frames.iter().all(|f| &f["header"]["task_id"] == task_id));

    let audio = PcmChunk {
        session: session.id,
        data: AUDIO.to_vec(),
    };
    assert_eq!(
        fx.queued_pcm().await,
        vec![audio.clone(), audio, PcmChunk::drain(session.id)]
    );
    assert_eq!(fx.tts.state(), ConnectionState::Idle);
}

#[tokio::test]
async fn consecutive_turns_use_fresh_sockets() {
    let server = DuplexServer::start(well_behaved()).await;
    let fx = Fixture::new(&server.url);

    let handle = fx.spawn();
    let first = fx.sessions.begin();
    fx.say(first.id, "一。").await;
    fx.end(first.id).await;
    server.wait_for_action(1, "finish-task").await;
    // Audio plus the sentinel for the first turn.
    for _ in 0..200 {
        if fx.pcm.len() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let second = fx.sessions.begin();
    fx.say(second.id, "二。").await;
    fx.end(second.id).await;
    fx.finish(handle).await;

    assert_eq!(server.connections().len(), 2);
    let drains: Vec<u64> = fx
        .queued_pcm()
        .await
        .into_iter()
        .filter(PcmChunk::is_drain)
        .map(|c| c.session)
        .collect();
    assert_eq!(drains, vec![first.id, second.id]);
}

// ────────────────────────────────────────────────────────────────────────────
// Failures
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_started_ack_drops_chunk_but_still_drains() {
    let server = DuplexServer::start(Arc::new(|_: &str, _: &str| Vec::new())).await;
    let fx = Fixture::new(&server.url);
    let session = fx.sessions.begin();

    let handle = fx.spawn();
    fx.say(session.id, "你好。").await;
    fx.end(session.id).await;
    fx.finish(handle).await;

    assert_eq!(fx.queued_pcm().await, vec![PcmChunk::drain(session.id)]);
    let connections = server.connections();
    assert_eq!(connections[0].actions, vec!["run-task"]);
}

#[tokio::test]
async fn task_failure_on_start_still_drains() {
    let server = DuplexServer::start(Arc::new(|action: &str, task_id: &str| match action {
        "run-task" => vec![failed(task_id, "InvalidParameter", "unknown voice")],
        _ => Vec::new(),
    }))
    .await;
    let fx = Fixture::new(&server.url);
    let session = fx.sessions.begin();

    let handle = fx.spawn();
    fx.say(session.id, "你好。").await;
    fx.end(session.id).await;
    fx.finish(handle).await;

    assert_eq!(fx.queued_pcm().await, vec![PcmChunk::drain(session.id)]);
}

// ────────────────────────────────────────────────────────────────────────────
// Invalidation
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn new_session_tears_down_the_old_socket() {
    let server = DuplexServer::start(well_behaved()).await;
    let fx = Fixture::new(&server.url);

    let handle = fx.spawn();
    let old = fx.sessions.begin();
    fx.say(old.id, "旧的回答，").await;
    let first = tokio::time::timeout(Duration::from_secs(5), fx.pcm.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.session, old.id);

    let new = fx.sessions.begin();
    fx.say(new.id, "新的回答。").await;
    fx.end(new.id).await;
    fx.finish(handle).await;

    let connections = server.connections();
    assert_eq!(connections.len(), 2);
    assert!(!connections[0].actions.iter().any(|a| a == "finish-task"));
    assert_eq!(
        connections[1].actions,
        vec!["run-task", "continue-task", "finish-task"]
    );
    let rest = fx.queued_pcm().await;
    assert!(rest.iter().all(|c| c.session == new.id));
    assert_eq!(rest.last(), Some(&PcmChunk::drain(new.id)));
}
