//! # straylight-common
//!
//! Wire dialects, pipeline context, configuration, and the error taxonomy
//! for the straylight proxy core.
//!
//! Three request/response dialects live here:
//! - the message-oriented client dialect ([`messages`]) with typed content
//!   blocks and `tool_use`/`tool_result` linkage;
//! - the OpenAI-family chat-completion dialect ([`chat`]) including the
//!   delta-chunk streaming variant;
//! - the Gemini-native contents/parts dialect ([`generative`]).
//!
//! Alongside them: the per-request [`context::PipelineContext`] (timings,
//! transformations log, write-once routing decision), the consumed
//! [`config::CoreConfig`], and the [`error`] taxonomy whose names are a
//! wire contract.

pub mod chat;
pub mod config;
pub mod context;
pub mod error;
pub mod generative;
pub mod messages;
pub mod payload;

pub use chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole,
    ChatTool, ChatToolCall, ChatUsage, ToolChoice,
};
pub use config::{CoreConfig, KeyStrategy, ProtocolSettings, ProviderFamily, ProviderRecord};
pub use context::{PipelineContext, RoutingCategory, RoutingDecision, StageDirection};
pub use error::{ErrorEnvelope, ErrorKind, ProtocolViolation, ProxyError};
pub use generative::{GenerateRequest, GenerateResponse};
pub use messages::{
    ClientMessage, ClientRole, ClientStopReason, ClientUsage, ContentBlock, MessagesRequest,
    MessagesResponse, ToolDefinition,
};
pub use payload::Payload;
