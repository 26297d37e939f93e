//! OpenAI-family wire shapes.
//!
//! The flat-message chat-completion format: `tools: [{type:"function", ...}]`,
//! `tool_calls` with string-serialized arguments, `usage.*_tokens`, and the
//! delta-chunk streaming variant of the same structure.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use typed_builder::TypedBuilder;

/// Role of an OpenAI-family message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System-level instructions.
    System,
    /// End-user message.
    User,
    /// Model message.
    Assistant,
    /// Tool execution result.
    Tool,
}

/// A function invocation inside a tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFunctionCall {
    /// The function name.
    pub name: String,
    /// Arguments as a JSON-serialized string.
    pub arguments: String,
}

fn default_tool_call_type() -> Cow<'static, str> {
    Cow::Borrowed("function")
}

/// A tool call requested by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatToolCall {
    /// Stable id; referenced by the matching tool message.
    pub id: String,
    /// Tool call type, typically "function".
    #[serde(rename = "type", default = "default_tool_call_type")]
    pub call_type: Cow<'static, str>,
    /// The function to call.
    pub function: ChatFunctionCall,
}

impl ChatToolCall {
    /// Creates a function tool call.
    pub fn function(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: default_tool_call_type(),
            function: ChatFunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// A single OpenAI-family message.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct ChatMessage {
    /// Role of the message author.
    pub role: ChatRole,
    /// Text content (absent for pure tool-call messages).
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Optional author name.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Tool calls requested by the assistant.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<SmallVec<[ChatToolCall; 2]>>,
    /// Id of the tool call this message responds to.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Creates a plain text message.
    pub fn text(role: ChatRole, content: impl Into<String>) -> Self {
        Self::builder().role(role).content(Some(content.into())).build()
    }
}

/// A function definition exposed as a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFunction {
    /// Function name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the parameters.
    pub parameters: serde_json::Value,
}

/// A tool in the OpenAI-family shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTool {
    /// Tool type, always "function".
    #[serde(rename = "type")]
    pub tool_type: String,
    /// The wrapped function definition.
    pub function: ChatFunction,
}

impl ChatTool {
    /// Wraps a function definition in the canonical tool shape.
    #[must_use]
    pub fn function(function: ChatFunction) -> Self {
        Self {
            tool_type: "function".to_string(),
            function,
        }
    }
}

/// Tool selection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    /// Disable tool calling.
    None,
    /// Let the model decide.
    Auto,
    /// Require at least one tool call.
    Required,
}

/// A specific-function tool selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolChoiceFunction {
    /// Always "function".
    #[serde(rename = "type")]
    pub choice_type: String,
    /// The selected function.
    pub function: ToolChoiceFunctionName,
}

/// Name payload of a specific-function selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolChoiceFunctionName {
    /// Function name to force.
    pub name: String,
}

/// Tool choice - a mode string or a specific-function selector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolChoice {
    /// `"none"` / `"auto"` / `"required"`.
    Mode(ToolChoiceMode),
    /// `{"type":"function","function":{"name":...}}`.
    Function(ToolChoiceFunction),
}

impl ToolChoice {
    /// Shorthand for the auto mode.
    #[must_use]
    pub const fn auto() -> Self {
        Self::Mode(ToolChoiceMode::Auto)
    }

    /// Whether this choice disables tool calling.
    #[must_use]
    pub const fn is_none_mode(&self) -> bool {
        matches!(self, Self::Mode(ToolChoiceMode::None))
    }
}

/// Request for a chat completion.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct ChatCompletionRequest {
    /// Model identifier.
    pub model: String,
    /// Conversation messages.
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens to generate.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling threshold.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Top-k sampling (exposed by vLLM-style backends).
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Stop sequences.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    /// Presence penalty.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    /// Frequency penalty.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    /// Repetition penalty (vLLM dialect; derived from `frequency_penalty`).
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repetition_penalty: Option<f32>,
    /// Whether to return logprobs (vLLM-style backends).
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,
    /// End-user identifier.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Whether to stream the response.
    #[builder(default = Some(false))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Tools available for function calling.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ChatTool>>,
    /// Tool selection strategy.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Vendor-specific thinking toggle.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_thinking: Option<bool>,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUsage {
    /// Prompt tokens consumed.
    #[serde(default)]
    pub prompt_tokens: u32,
    /// Completion tokens generated.
    #[serde(default)]
    pub completion_tokens: u32,
    /// Total tokens; `prompt + completion` when both are known.
    #[serde(default)]
    pub total_tokens: u32,
}

/// A single choice from a chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    /// Position of this choice in the response array.
    #[serde(default)]
    pub index: u32,
    /// The generated message.
    pub message: ChatMessage,
    /// Why generation stopped.
    pub finish_reason: Option<String>,
}

/// Response from a chat completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    /// Unique completion id.
    pub id: String,
    /// Object type, "chat.completion".
    pub object: String,
    /// Unix timestamp of creation.
    pub created: u64,
    /// The model that generated the completion.
    pub model: String,
    /// Generated choices.
    pub choices: Vec<ChatChoice>,
    /// Token usage, if reported.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChatUsage>,
}

/// Incremental function-call data in a stream chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatFunctionDelta {
    /// Function name (first chunk for the call only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Argument fragment appended by this chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Incremental tool-call data in a stream chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatToolCallDelta {
    /// Index of this tool call in the accumulated array.
    pub index: u32,
    /// Tool call id (first chunk for the call only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Tool call type (first chunk for the call only).
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    /// Function fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<ChatFunctionDelta>,
}

/// Incremental message delta in a stream chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessageDelta {
    /// Role (first chunk only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ChatRole>,
    /// Content fragment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool call fragments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<SmallVec<[ChatToolCallDelta; 2]>>,
}

/// A single choice inside a stream chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatStreamChoice {
    /// Position of this choice.
    #[serde(default)]
    pub index: u32,
    /// The incremental delta.
    pub delta: ChatMessageDelta,
    /// Finish reason (final chunk only).
    pub finish_reason: Option<String>,
}

/// A chunk of a streamed chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Id of the completion stream (same on every chunk).
    pub id: String,
    /// Object type, "chat.completion.chunk".
    pub object: String,
    /// Unix timestamp of creation.
    pub created: u64,
    /// The model generating the stream.
    pub model: String,
    /// Delta choices.
    pub choices: Vec<ChatStreamChoice>,
    /// Usage (final chunk for some providers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChatUsage>,
}
