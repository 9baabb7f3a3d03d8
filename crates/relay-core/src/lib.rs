//! Relay Core - Shared types for the gateway
//!
//! This crate defines the message formats on both sides of the gateway: the
//! engine's native message stream and the OpenAI-compatible wire format,
//! plus the file-discovery record model that rides along as metadata.

pub mod engine;
pub mod error;
pub mod files;
pub mod openai;

pub use engine::{EngineMessage, ResultSubtype, ToolServer, ToolServerStatus};
pub use error::GatewayError;
pub use files::{
    ClaudeMetadata, DiscoveryDiagnostics, DiscoveryMethod, DiscoveryResult, DiscoveryStatus,
    FileRecord,
};
pub use openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice,
    ChoiceMessage, ChunkChoice, ChunkDelta, ErrorBody, ErrorDetail, FinishReason, Role, Usage,
};
