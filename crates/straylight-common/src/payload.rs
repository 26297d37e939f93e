//! The uniform value threaded through pipeline stages.

use crate::chat::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse};
use crate::generative::{GenerateRequest, GenerateResponse};
use crate::messages::{MessagesRequest, MessagesResponse};

/// A value at some point of its journey through the pipeline.
///
/// Each stage accepts the variants its contract names and rejects the rest
/// with an `UNSUPPORTED_REQUEST_FORMAT` / `UNSUPPORTED_RESPONSE_FORMAT`
/// protocol error.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Client-dialect request (ingress shape).
    ClientRequest(MessagesRequest),
    /// Client-dialect response (egress shape).
    ClientResponse(MessagesResponse),
    /// OpenAI-family request.
    ChatRequest(ChatCompletionRequest),
    /// OpenAI-family non-stream response.
    ChatResponse(ChatCompletionResponse),
    /// Gemini-native request.
    GenerativeRequest(GenerateRequest),
    /// Gemini-native response.
    GenerativeResponse(GenerateResponse),
    /// A streamed response collected as a chunk list.
    Chunks(Vec<ChatCompletionChunk>),
    /// An unshaped upstream body awaiting repair.
    Raw(serde_json::Value),
}

impl Payload {
    /// Short name used in unsupported-format error messages.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::ClientRequest(_) => "client-request",
            Self::ClientResponse(_) => "client-response",
            Self::ChatRequest(_) => "chat-request",
            Self::ChatResponse(_) => "chat-response",
            Self::GenerativeRequest(_) => "generative-request",
            Self::GenerativeResponse(_) => "generative-response",
            Self::Chunks(_) => "chunk-list",
            Self::Raw(_) => "raw",
        }
    }
}
