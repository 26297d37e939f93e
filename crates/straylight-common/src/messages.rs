//! Client-dialect wire shapes.
//!
//! The client dialect is message-oriented: typed content blocks
//! (`text`, `image`, `tool_use`, `tool_result`), a separate system prompt,
//! and `input_tokens`/`output_tokens` usage accounting.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Role of a client-dialect message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    /// Messages from the end user (also carries tool results).
    User,
    /// Messages from the model.
    Assistant,
    /// Inline system instructions.
    System,
}

/// Image reference carried by an image content block.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImageSource {
    /// URL-referenced image.
    Url {
        /// URL of the image.
        url: String,
    },
    /// Base64-encoded image data.
    Base64 {
        /// Media type (e.g. "image/png").
        media_type: String,
        /// Base64-encoded data.
        data: String,
    },
}

/// Content of a tool result - a plain string or nested blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    /// Simple string content.
    Text(String),
    /// Array of content blocks.
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    /// Flattens the result into a single displayable string.
    #[must_use]
    pub fn flatten_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Typed content blocks appearing in client-dialect messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Text content block.
    Text {
        /// The text content.
        text: String,
    },
    /// Image content block.
    Image {
        /// Image source data.
        source: ImageSource,
    },
    /// Tool invocation requested by the assistant.
    ToolUse {
        /// Stable id; must survive the round trip byte-identical.
        id: String,
        /// Name of the tool to call.
        name: String,
        /// Parsed input arguments.
        input: serde_json::Value,
    },
    /// Result of a prior tool invocation.
    ToolResult {
        /// Id of the `tool_use` block this responds to.
        tool_use_id: String,
        /// Result content.
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultContent>,
        /// Whether the tool execution failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentBlock {
    /// Returns the text of a text block.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Text { text } => Some(text.clone()),
            _ => None,
        }
    }

    /// Whether any text can be extracted from this block.
    #[must_use]
    pub const fn has_extractable_text(&self) -> bool {
        matches!(self, Self::Text { .. } | Self::ToolUse { .. } | Self::ToolResult { .. })
    }
}

/// Message content - a shorthand string or an array of typed blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Simple text content.
    Text(String),
    /// Array of content blocks.
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Whether the content carries nothing renderable.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.trim().is_empty(),
            Self::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

/// A single client-dialect message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Role of the message author.
    pub role: ClientRole,
    /// Message content.
    pub content: MessageContent,
}

impl ClientMessage {
    /// Creates a plain-text message.
    pub fn text(role: ClientRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(content.into()),
        }
    }

    /// Creates a message from content blocks.
    #[must_use]
    pub const fn blocks(role: ClientRole, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }
}

/// A tool definition offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name.
    pub name: String,
    /// Description of what the tool does.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's input.
    pub input_schema: serde_json::Value,
}

/// A client-dialect request envelope.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct MessagesRequest {
    /// Target model label (resolved by the router).
    pub model: String,
    /// Maximum output token budget.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Ordered conversation messages.
    pub messages: Vec<ClientMessage>,
    /// System prompt, hoisted out of the message list.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Tool definitions available to the model.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    /// Sampling temperature.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling threshold.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Stop sequences.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Whether the caller asked for a streamed reply.
    #[builder(default)]
    #[serde(default)]
    pub stream: bool,
    /// Extended thinking request, when the caller wants a reasoning pass.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<serde_json::Value>,
    /// Free-form request metadata.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MessagesRequest {
    /// Rough token estimate used by the long-context routing heuristic.
    #[must_use]
    pub fn estimated_tokens(&self) -> usize {
        let mut chars = self.system.as_deref().map_or(0, str::len);
        for message in &self.messages {
            chars += match &message.content {
                MessageContent::Text(text) => text.len(),
                MessageContent::Blocks(blocks) => blocks
                    .iter()
                    .map(|b| match b {
                        ContentBlock::Text { text } => text.len(),
                        ContentBlock::ToolUse { input, .. } => input.to_string().len(),
                        ContentBlock::ToolResult { content, .. } => {
                            content.as_ref().map_or(0, |c| c.flatten_text().len())
                        }
                        ContentBlock::Image { .. } => 0,
                    })
                    .sum(),
            };
        }
        chars / 4
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStopReason {
    /// Natural end of turn.
    EndTurn,
    /// Output token budget reached.
    MaxTokens,
    /// A stop sequence matched.
    StopSequence,
    /// The model requested a tool invocation.
    ToolUse,
}

/// Token accounting in client-dialect terms.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientUsage {
    /// Tokens consumed by the prompt.
    pub input_tokens: u32,
    /// Tokens generated.
    pub output_tokens: u32,
}

/// A client-dialect response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    /// Unique message id.
    pub id: String,
    /// Object discriminator, always "message".
    #[serde(rename = "type")]
    pub response_type: String,
    /// Always "assistant".
    pub role: String,
    /// Model that produced the reply.
    pub model: String,
    /// Reply content blocks.
    pub content: Vec<ContentBlock>,
    /// Why generation stopped.
    pub stop_reason: Option<ClientStopReason>,
    /// The stop sequence that matched, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    /// Token accounting.
    pub usage: ClientUsage,
}
