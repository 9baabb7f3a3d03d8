//! Engine session runner
//!
//! Wraps one engine invocation for one turn. Every message is forwarded to
//! the consumer immediately AND appended to the turn buffer inside the same
//! loop iteration; the buffer is then delivered over a oneshot channel
//! unconditionally when the loop ends. Nothing here depends on the consumer
//! fully draining the stream — partial consumption, client disconnect and
//! timeout all still hand the accumulated buffer to discovery.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use relay_core::{EngineMessage, ResultSubtype};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::{Engine, EngineRequest};

const CHANNEL_CAPACITY: usize = 64;

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnStatus {
    /// Engine reported a terminal result message.
    Completed(ResultSubtype),
    /// Wall-clock bound exceeded; the buffer holds whatever arrived first.
    TimedOut,
    /// Engine stream failed or ended without a completion marker.
    Failed(String),
    /// Consumer went away mid-turn.
    Cancelled,
}

#[derive(Debug)]
pub struct TurnOutcome {
    pub buffer: Vec<EngineMessage>,
    pub status: TurnStatus,
}

/// A running turn. `messages` delivers the live stream in FIFO order;
/// `outcome` resolves once the turn ends, carrying the full buffer.
pub struct Session {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub messages: mpsc::Receiver<EngineMessage>,
    pub outcome: oneshot::Receiver<TurnOutcome>,
}

pub struct SessionRunner {
    engine: Arc<dyn Engine>,
}

impl SessionRunner {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Start one turn bounded by `timeout`.
    pub fn start(&self, request: EngineRequest, timeout: std::time::Duration) -> Session {
        let id = format!("sess_{}", Uuid::new_v4().simple());
        let started_at = Utc::now();
        let deadline = Instant::now() + timeout;
        let timeout_secs = timeout.as_secs();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (done_tx, done_rx) = oneshot::channel();

        let mut stream = self.engine.run(request);
        let session_id = id.clone();

        tokio::spawn(async move {
            let mut buffer: Vec<EngineMessage> = Vec::new();
            let mut status: Option<TurnStatus> = None;

            loop {
                match tokio::time::timeout_at(deadline, stream.next()).await {
                    Err(_) => {
                        error!(
                            session_id = %session_id,
                            timeout_secs,
                            buffered = buffer.len(),
                            "engine turn timed out; handing partial buffer to discovery"
                        );
                        status = Some(TurnStatus::TimedOut);
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        error!(session_id = %session_id, error = %e, "engine stream failed");
                        status = Some(TurnStatus::Failed(e.to_string()));
                        break;
                    }
                    Ok(Some(Ok(msg))) => {
                        log_message(&session_id, &msg);
                        if let EngineMessage::Result { subtype } = &msg {
                            status = Some(TurnStatus::Completed(*subtype));
                        }
                        // Buffer before forwarding so a dropped consumer
                        // still leaves the message available to discovery.
                        buffer.push(msg.clone());
                        // The send shares the deadline: a consumer that stops
                        // reading must not stall the turn past its bound.
                        match tokio::time::timeout_at(deadline, tx.send(msg)).await {
                            Err(_) => {
                                error!(
                                    session_id = %session_id,
                                    timeout_secs,
                                    buffered = buffer.len(),
                                    "consumer backpressure exceeded the turn deadline"
                                );
                                status = Some(TurnStatus::TimedOut);
                                break;
                            }
                            Ok(Err(_)) => {
                                info!(session_id = %session_id, "consumer gone, cancelling turn");
                                status = Some(TurnStatus::Cancelled);
                                break;
                            }
                            Ok(Ok(())) => {}
                        }
                    }
                }
            }

            if buffer.is_empty() {
                warn!(
                    session_id = %session_id,
                    "engine yielded ZERO messages for this turn; \
                     possible prompt rejection or engine misconfiguration"
                );
            }

            let status = status.unwrap_or_else(|| {
                warn!(session_id = %session_id, "stream ended without a completion marker");
                TurnStatus::Failed("no completion marker received".to_string())
            });

            let _ = done_tx.send(TurnOutcome { buffer, status });
        });

        Session {
            id,
            started_at,
            messages: rx,
            outcome: done_rx,
        }
    }
}

fn log_message(session_id: &str, msg: &EngineMessage) {
    match msg {
        EngineMessage::Init { session_id: engine_session, tool_servers } => {
            let failed = tool_servers
                .iter()
                .filter(|s| s.status == relay_core::ToolServerStatus::Failed)
                .count();
            if failed > 0 {
                warn!(session_id, engine_session = %engine_session, failed, "tool servers failed to connect");
            } else {
                debug!(session_id, engine_session = %engine_session, servers = tool_servers.len(), "engine session initialized");
            }
        }
        EngineMessage::ToolUse { name, input } if name == "TodoWrite" => {
            if let Some(todos) = input.get("todos").and_then(Value::as_array) {
                let total = todos.len();
                let completed = todos
                    .iter()
                    .filter(|t| t.get("status").and_then(Value::as_str) == Some("completed"))
                    .count();
                debug!(session_id, completed, total, "todo progress update");
            }
        }
        EngineMessage::ToolUse { name, .. } => {
            debug!(session_id, tool = %name, "tool invocation");
        }
        EngineMessage::ToolResult { is_error: true, content } => {
            warn!(
                session_id,
                detail = content.as_deref().unwrap_or(""),
                "tool call failed or was denied by permission policy"
            );
        }
        EngineMessage::Result { subtype } => {
            if subtype.is_success() {
                debug!(session_id, "turn completed");
            } else {
                warn!(session_id, ?subtype, "turn completed with non-success result");
            }
        }
        _ => {}
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::PermissionMode;
    use crate::engine::MessageStream;
    use std::path::PathBuf;
    use std::time::Duration;

    /// Scripted engine for tests: replays a fixed message list, optionally
    /// hanging forever afterwards instead of completing.
    pub(crate) struct ScriptedEngine {
        pub script: Vec<EngineMessage>,
        pub hang_after: bool,
    }

    impl ScriptedEngine {
        pub fn completing(script: Vec<EngineMessage>) -> Self {
            Self { script, hang_after: false }
        }

        pub fn hanging(script: Vec<EngineMessage>) -> Self {
            Self { script, hang_after: true }
        }
    }

    impl Engine for ScriptedEngine {
        fn run(&self, _request: EngineRequest) -> MessageStream {
            let script = self.script.clone();
            let hang = self.hang_after;
            Box::pin(async_stream::stream! {
                for msg in script {
                    yield Ok(msg);
                }
                if hang {
                    futures::future::pending::<()>().await;
                }
            })
        }
    }

    pub(crate) fn request() -> EngineRequest {
        EngineRequest {
            prompt: "Human: hi".to_string(),
            system_prompt: None,
            model: None,
            max_turns: 1,
            cwd: PathBuf::from("."),
            permission_mode: PermissionMode::Manual,
        }
    }

    fn text(s: &str) -> EngineMessage {
        EngineMessage::Text { text: s.to_string() }
    }

    #[tokio::test]
    async fn test_messages_forwarded_in_order() {
        let engine = Arc::new(ScriptedEngine::completing(vec![
            text("a"),
            text("b"),
            EngineMessage::Result { subtype: ResultSubtype::Success },
        ]));
        let runner = SessionRunner::new(engine);
        let mut session = runner.start(request(), Duration::from_secs(5));

        let mut seen = Vec::new();
        while let Some(msg) = session.messages.recv().await {
            if let EngineMessage::Text { text } = msg {
                seen.push(text);
            }
        }
        assert_eq!(seen, vec!["a", "b"]);

        let outcome = session.outcome.await.expect("outcome");
        assert_eq!(outcome.status, TurnStatus::Completed(ResultSubtype::Success));
        assert_eq!(outcome.buffer.len(), 3);
    }

    #[tokio::test]
    async fn test_timeout_preserves_partial_buffer() {
        let engine = Arc::new(ScriptedEngine::hanging(vec![
            text("one"),
            text("two"),
            text("three"),
        ]));
        let runner = SessionRunner::new(engine);
        let mut session = runner.start(request(), Duration::from_millis(100));

        let mut forwarded = 0;
        while session.messages.recv().await.is_some() {
            forwarded += 1;
        }
        assert_eq!(forwarded, 3);

        let outcome = session.outcome.await.expect("outcome");
        assert_eq!(outcome.status, TurnStatus::TimedOut);
        assert_eq!(outcome.buffer.len(), 3, "partial buffer must survive the timeout");
    }

    #[tokio::test]
    async fn test_stream_end_without_result_is_failed() {
        let engine = Arc::new(ScriptedEngine::completing(vec![text("partial")]));
        let runner = SessionRunner::new(engine);
        let mut session = runner.start(request(), Duration::from_secs(5));

        while session.messages.recv().await.is_some() {}
        let outcome = session.outcome.await.expect("outcome");
        assert!(matches!(outcome.status, TurnStatus::Failed(_)));
        assert_eq!(outcome.buffer.len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_consumer_cannot_outlive_deadline() {
        // Consumer never reads: the channel fills, the blocked send hits the
        // deadline, and the turn still ends as a timeout with its buffer.
        let script: Vec<_> = (0..CHANNEL_CAPACITY + 10)
            .map(|i| text(&i.to_string()))
            .collect();
        let engine = Arc::new(ScriptedEngine::hanging(script));
        let runner = SessionRunner::new(engine);
        let session = runner.start(request(), Duration::from_millis(100));

        let outcome = session.outcome.await.expect("outcome");
        assert_eq!(outcome.status, TurnStatus::TimedOut);
        assert_eq!(outcome.buffer.len(), CHANNEL_CAPACITY + 1);
    }

    #[tokio::test]
    async fn test_dropped_consumer_cancels_but_keeps_buffer() {
        let engine = Arc::new(ScriptedEngine::hanging(vec![text("a"), text("b")]));
        let runner = SessionRunner::new(engine);
        let session = runner.start(request(), Duration::from_secs(5));

        drop(session.messages);
        let outcome = session.outcome.await.expect("outcome");
        assert_eq!(outcome.status, TurnStatus::Cancelled);
        assert!(!outcome.buffer.is_empty());
    }

    #[tokio::test]
    async fn test_zero_message_turn_reports_failure() {
        let engine = Arc::new(ScriptedEngine::completing(vec![]));
        let runner = SessionRunner::new(engine);
        let mut session = runner.start(request(), Duration::from_secs(5));

        assert!(session.messages.recv().await.is_none());
        let outcome = session.outcome.await.expect("outcome");
        assert!(outcome.buffer.is_empty());
        assert!(matches!(outcome.status, TurnStatus::Failed(_)));
    }
}
