//! Integration tests for the streaming generation client against a mock
//! SSE server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use aibox::AssistantError;
use aibox::config::{CloudConfig, LlmConfig};
use aibox::llm::{Directive, LlmStreamer};
use aibox::pipeline::messages::TtsCommand;
use aibox::pipeline::queue::FlushQueue;
use aibox::pipeline::session::SessionManager;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn frame(id: usize, text: &str, finish: &str) -> String {
    let data = json!({
        "output": { "text": text, "finish_reason": finish },
        "request_id": "req-1",
    });
    format!("id:{id}\nevent:result\n:HTTP_STATUS/200\ndata:{data}\n\n")
}

fn sse(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn streamer(server: &MockServer) -> LlmStreamer {
    let cloud = CloudConfig {
        api_key: "test-key".into(),
        llm_url: format!("{}/generation", server.uri()),
        ..CloudConfig::default()
    };
    LlmStreamer::new(&cloud, &LlmConfig::default())
}

async fn drain(queue: &FlushQueue<TtsCommand>) -> Vec<TtsCommand> {
    queue.close();
    let mut out = Vec::new();
    while let Some(command) = queue.recv().await {
        out.push(command);
    }
    out
}

fn spoken(commands: &[TtsCommand]) -> Vec<String> {
    commands
        .iter()
        .filter_map(|c| match c {
            TtsCommand::Speak { text, .. } => Some(text.clone()),
            TtsCommand::EndOfTurn { .. } => None,
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Streaming
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reply_is_chunked_and_tags_are_never_spoken() {
    let server = MockServer::start().await;
    let body = [
        frame(1, "你好，", "null"),
        frame(2, "我是小瑞😀。", "null"),
        frame(3, "给你放首歌[PLA", "null"),
        frame(4, "Y: 晴天]", "stop"),
    ]
    .concat();
    Mock::given(method("POST"))
        .and(path("/generation"))
        .and(header("Authorization", "Bearer test-key"))
        .and(header("X-DashScope-SSE", "enable"))
        .and(body_partial_json(json!({
            "model": "qwen-turbo-latest",
            "parameters": {
                "result_format": "text",
                "incremental_output": true,
                "enable_search": false,
            },
        })))
        .respond_with(sse(body))
        .expect(1)
        .mount(&server)
        .await;

    let sessions = SessionManager::new();
    let session = sessions.begin();
    let queue = FlushQueue::new(16);
    let outcome = streamer(&server)
        .stream("你是谁", false, &session, &queue)
        .await
        .unwrap();

    assert_eq!(outcome.directives, vec![Directive::Play("晴天".into())]);
    assert!(outcome.text.contains("[PLAY: 晴天]"));

    let commands = drain(&queue).await;
    let texts = spoken(&commands);
    assert_eq!(texts, vec!["你好，", "我是小瑞。", "给你放首歌"]);
    assert!(texts.iter().all(|t| !t.contains('[')));
    assert_eq!(
        commands.last(),
        Some(&TtsCommand::EndOfTurn { session: session.id })
    );
    assert!(commands.iter().all(|c| c.session() == session.id));
}

#[tokio::test]
async fn search_questions_use_the_search_model() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({
            "model": "qwen-max",
            "parameters": { "enable_search": true },
        })))
        .respond_with(sse(format!(
            "{}data: [DONE]\n\n",
            frame(1, "今天晴", "null")
        )))
        .expect(1)
        .mount(&server)
        .await;

    let sessions = SessionManager::new();
    let session = sessions.begin();
    let queue = FlushQueue::new(16);
    let outcome = streamer(&server)
        .stream("今天天气怎么样", true, &session, &queue)
        .await
        .unwrap();

    assert_eq!(outcome.text, "今天晴");
    assert!(outcome.directives.is_empty());
    assert_eq!(spoken(&drain(&queue).await), vec!["今天晴"]);
}

#[tokio::test]
async fn stop_directive_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse(frame(1, "好的。[STOP]", "stop")))
        .mount(&server)
        .await;

    let sessions = SessionManager::new();
    let session = sessions.begin();
    let queue = FlushQueue::new(16);
    let outcome = streamer(&server)
        .stream("别放了", false, &session, &queue)
        .await
        .unwrap();

    assert_eq!(outcome.directives, vec![Directive::Stop]);
    assert_eq!(spoken(&drain(&queue).await), vec!["好的。"]);
}

// ────────────────────────────────────────────────────────────────────────────
// Failures
// ────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn http_error_still_ends_the_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let sessions = SessionManager::new();
    let session = sessions.begin();
    let queue = FlushQueue::new(16);
    let err = streamer(&server)
        .stream("你好", false, &session, &queue)
        .await
        .unwrap_err();

    assert!(matches!(err, AssistantError::Llm(ref m) if m.contains("401")));
    assert_eq!(
        drain(&queue).await,
        vec![TtsCommand::EndOfTurn { session: session.id }]
    );
}

#[tokio::test]
async fn error_event_fails_the_stream() {
    let server = MockServer::start().await;
    let body = format!(
        "{}id:2\nevent:error\ndata:{}\n\n",
        frame(1, "你好，", "null"),
        json!({ "code": "Throttling", "message": "rate limited" })
    );
    Mock::given(method("POST"))
        .respond_with(sse(body))
        .mount(&server)
        .await;

    let sessions = SessionManager::new();
    let session = sessions.begin();
    let queue = FlushQueue::new(16);
    let err = streamer(&server)
        .stream("你好", false, &session, &queue)
        .await
        .unwrap_err();

    assert!(matches!(err, AssistantError::Llm(ref m) if m.contains("Throttling")));
    let commands = drain(&queue).await;
    assert_eq!(spoken(&commands), vec!["你好，"]);
    assert_eq!(
        commands.last(),
        Some(&TtsCommand::EndOfTurn { session: session.id })
    );
}

#[tokio::test]
async fn cancelled_session_queues_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(sse(frame(1, "你好。", "stop")))
        .mount(&server)
        .await;

    let sessions = SessionManager::new();
    let session = sessions.begin();
    sessions.cancel_current();
    let queue = FlushQueue::new(16);
    let err = streamer(&server)
        .stream("你好", false, &session, &queue)
        .await
        .unwrap_err();

    assert!(matches!(err, AssistantError::Cancelled));
    assert!(drain(&queue).await.is_empty());
}
