//! Response formatting
//!
//! Pure builders for the OpenAI wire shapes: streaming chunks (role, content
//! deltas, finish marker) and the non-streaming completion body. The handlers
//! own the actual SSE transport; everything here is side-effect free so the
//! framing can be asserted in tests without a server.

use chrono::Utc;
use relay_core::{
    ChatCompletionChunk, ChatCompletionResponse, Choice, ChoiceMessage, ChunkChoice, ChunkDelta,
    ClaudeMetadata, EngineMessage, FinishReason, Role, Usage,
};
use uuid::Uuid;

/// Returned when a turn produced no assistant text at all; an empty body
/// breaks strict OpenAI clients.
pub const FALLBACK_TEXT: &str = "I'm unable to provide a response at the moment.";

/// SSE event name carrying discovery metadata, emitted between the finish
/// chunk and the `[DONE]` sentinel.
pub const METADATA_EVENT: &str = "x_claude_metadata";

/// Identity shared by every chunk of one streamed response.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub id: String,
    pub created: i64,
    pub model: String,
}

impl StreamContext {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            model: model.to_string(),
        }
    }

    fn chunk(&self, delta: ChunkDelta, finish_reason: Option<FinishReason>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }

    /// First chunk of the stream, announcing the assistant role.
    pub fn role_chunk(&self) -> ChatCompletionChunk {
        self.chunk(
            ChunkDelta {
                role: Some(Role::Assistant),
                content: None,
            },
            None,
        )
    }

    pub fn content_chunk(&self, text: &str) -> ChatCompletionChunk {
        self.chunk(
            ChunkDelta {
                role: None,
                content: Some(text.to_string()),
            },
            None,
        )
    }

    /// Terminal chunk with an empty delta and `finish_reason: stop`.
    pub fn finish_chunk(&self) -> ChatCompletionChunk {
        self.chunk(ChunkDelta::default(), Some(FinishReason::Stop))
    }

    pub fn completion(
        &self,
        content: String,
        prompt: &str,
        metadata: Option<ClaudeMetadata>,
    ) -> ChatCompletionResponse {
        let usage = Usage {
            prompt_tokens: approx_tokens(prompt),
            completion_tokens: approx_tokens(&content),
            total_tokens: approx_tokens(prompt) + approx_tokens(&content),
        };
        ChatCompletionResponse {
            id: self.id.clone(),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: ChoiceMessage {
                    role: Role::Assistant,
                    content,
                },
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: Some(usage),
            x_claude_metadata: metadata,
        }
    }
}

/// Concatenate the text deltas of a turn buffer. Deltas are joined as-is;
/// the engine already includes its own whitespace.
pub fn collect_text(buffer: &[EngineMessage]) -> String {
    let mut out = String::new();
    for msg in buffer {
        if let EngineMessage::Text { text } = msg {
            out.push_str(text);
        }
    }
    out
}

/// Rough token estimate for the usage block; the engine exposes no real
/// token accounting.
fn approx_tokens(s: &str) -> u32 {
    (s.len() as u32 / 4).max(if s.is_empty() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_chunk_shape() {
        let ctx = StreamContext::new("gpt-4");
        let chunk = ctx.role_chunk();
        assert_eq!(chunk.object, "chat.completion.chunk");
        assert_eq!(chunk.choices[0].delta.role, Some(Role::Assistant));
        assert!(chunk.choices[0].delta.content.is_none());
        assert!(chunk.choices[0].finish_reason.is_none());
    }

    #[test]
    fn test_finish_chunk_has_empty_delta_and_stop() {
        let ctx = StreamContext::new("gpt-4");
        let chunk = ctx.finish_chunk();
        assert!(chunk.choices[0].delta.role.is_none());
        assert!(chunk.choices[0].delta.content.is_none());
        assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::Stop));

        let json = serde_json::to_value(&chunk).expect("serialize");
        assert_eq!(json["choices"][0]["delta"], serde_json::json!({}));
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_chunks_share_identity() {
        let ctx = StreamContext::new("gpt-4");
        let a = ctx.role_chunk();
        let b = ctx.content_chunk("hello");
        let c = ctx.finish_chunk();
        assert_eq!(a.id, b.id);
        assert_eq!(b.id, c.id);
        assert_eq!(a.created, c.created);
        assert!(a.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn test_content_chunk_formatting_is_idempotent() {
        let ctx = StreamContext::new("gpt-4");
        let first = serde_json::to_string(&ctx.content_chunk("same")).expect("serialize");
        let second = serde_json::to_string(&ctx.content_chunk("same")).expect("serialize");
        assert_eq!(first, second);
    }

    #[test]
    fn test_completion_omits_metadata_key_when_none() {
        let ctx = StreamContext::new("gpt-4");
        let resp = ctx.completion("hi".to_string(), "Human: hi", None);
        let json = serde_json::to_value(&resp).expect("serialize");
        assert!(json.get("x_claude_metadata").is_none());
        assert_eq!(json["choices"][0]["message"]["content"], "hi");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert_eq!(json["object"], "chat.completion");
    }

    #[test]
    fn test_collect_text_joins_deltas_in_order() {
        let buffer = vec![
            EngineMessage::Text { text: "Hello".to_string() },
            EngineMessage::ToolUse {
                name: "Read".to_string(),
                input: serde_json::json!({}),
            },
            EngineMessage::Text { text: ", world".to_string() },
        ];
        assert_eq!(collect_text(&buffer), "Hello, world");
    }
}
