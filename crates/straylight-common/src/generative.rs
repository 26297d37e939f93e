//! Gemini-native wire shapes.
//!
//! The nested contents/parts format: `role ∈ {user, model}`, parts carrying
//! `text` or `functionCall`, `functionDeclarations` for tools, a
//! `generationConfig` block, and `usageMetadata` accounting.

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// Role of a content entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentRole {
    /// User turn (also carries function responses).
    User,
    /// Model turn.
    Model,
}

/// A function invocation emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCallPart {
    /// Declared function name.
    pub name: String,
    /// Parsed arguments object.
    #[serde(default)]
    pub args: serde_json::Value,
}

/// A function result sent back to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionResponsePart {
    /// The function that produced this result.
    pub name: String,
    /// Result payload.
    pub response: serde_json::Value,
}

/// One part of a content entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum Part {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// A function call from the model.
    FunctionCall {
        /// The call payload.
        #[serde(rename = "functionCall")]
        function_call: FunctionCallPart,
    },
    /// A function result from the caller.
    FunctionResponse {
        /// The result payload.
        #[serde(rename = "functionResponse")]
        function_response: FunctionResponsePart,
    },
}

/// An ordered turn in the conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    /// Turn role.
    pub role: ContentRole,
    /// Turn parts.
    pub parts: Vec<Part>,
}

/// A declared function the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    /// Function name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the arguments.
    pub parameters: serde_json::Value,
}

/// Tool block carrying function declarations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerativeTool {
    /// Declared functions.
    pub function_declarations: Vec<FunctionDeclaration>,
}

/// Thinking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerativeThinkingConfig {
    /// Token budget for the thinking pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<i32>,
    /// Whether thoughts are returned in the response.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_thoughts: Option<bool>,
}

/// Generation parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// Sampling temperature.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Maximum output tokens.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Nucleus sampling threshold.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Top-k sampling.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    /// Stop sequences.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    /// Thinking configuration.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking_config: Option<GenerativeThinkingConfig>,
}

/// Body of a generate request.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
pub struct GenerateBody {
    /// Ordered conversation turns.
    pub contents: Vec<Content>,
    /// System instruction turn, outside the conversation.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    /// Declared tools.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<GenerativeTool>>,
    /// Generation parameters.
    #[builder(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

/// A project-scoped generate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    /// Target model.
    pub model: String,
    /// Project identifier the request is billed to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    /// The nested request body.
    pub request: GenerateBody,
}

/// Token accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    /// Prompt tokens consumed.
    #[serde(default)]
    pub prompt_token_count: u32,
    /// Candidate tokens generated.
    #[serde(default)]
    pub candidates_token_count: u32,
    /// Total tokens.
    #[serde(default)]
    pub total_token_count: u32,
}

/// A generated candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// The generated content.
    pub content: Content,
    /// Why generation stopped ("STOP", "MAX_TOKENS", ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Response to a generate request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    /// Generated candidates.
    pub candidates: Vec<Candidate>,
    /// Token accounting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<UsageMetadata>,
}
