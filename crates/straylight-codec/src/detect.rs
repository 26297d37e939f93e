//! Structural payload classification.
//!
//! The runner dispatches arbitrary values without an explicit tag, so the
//! codec offers a pure predicate over field presence and types. Detection
//! never inspects model names or other free-form strings.

use serde_json::Value;

/// Formats the detector can recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    /// Message-oriented client-dialect request.
    ClientRequest,
    /// OpenAI-family chat-completion request.
    OpenAiRequest,
    /// OpenAI-family response (non-stream or chunk).
    OpenAiResponse,
    /// Gemini-native generate request.
    GeminiRequest,
    /// None of the above.
    Unknown,
}

/// Classifies an arbitrary JSON value by structure alone.
#[must_use]
pub fn classify(value: &Value) -> PayloadFormat {
    let Some(obj) = value.as_object() else {
        return PayloadFormat::Unknown;
    };

    // Responses: id + object discriminator, or a choices array.
    if obj.get("object").and_then(Value::as_str).is_some_and(|o| {
        o == "chat.completion" || o == "chat.completion.chunk"
    }) {
        return PayloadFormat::OpenAiResponse;
    }
    if obj.get("choices").is_some_and(Value::is_array) && obj.contains_key("id") {
        return PayloadFormat::OpenAiResponse;
    }

    // Gemini: nested request.contents, or bare contents with parts.
    if let Some(request) = obj.get("request").and_then(Value::as_object)
        && request.get("contents").is_some_and(Value::is_array)
    {
        return PayloadFormat::GeminiRequest;
    }
    if let Some(contents) = obj.get("contents").and_then(Value::as_array)
        && contents
            .iter()
            .all(|c| c.get("parts").is_some_and(Value::is_array))
    {
        return PayloadFormat::GeminiRequest;
    }

    let Some(messages) = obj.get("messages").and_then(Value::as_array) else {
        return PayloadFormat::Unknown;
    };

    // Client dialect: block-array content, a hoisted system prompt,
    // stop_sequences, or input_schema-shaped tools.
    let has_block_content = messages
        .iter()
        .any(|m| m.get("content").is_some_and(Value::is_array));
    let has_client_markers = obj.get("system").is_some_and(Value::is_string)
        || obj.contains_key("stop_sequences")
        || obj
            .get("tools")
            .and_then(Value::as_array)
            .and_then(|t| t.first())
            .is_some_and(|t| t.get("input_schema").is_some());
    if has_block_content || has_client_markers {
        return PayloadFormat::ClientRequest;
    }

    // OpenAI request: flat string messages under a model field, tool role
    // messages, function-shaped tools, or penalty parameters.
    let has_openai_markers = messages.iter().any(|m| {
        m.get("role").and_then(Value::as_str) == Some("tool")
            || m.get("tool_call_id").is_some()
            || m.get("tool_calls").is_some()
    }) || obj
        .get("tools")
        .and_then(Value::as_array)
        .and_then(|t| t.first())
        .is_some_and(|t| t.get("function").is_some())
        || obj.contains_key("frequency_penalty")
        || obj.contains_key("presence_penalty")
        || obj.contains_key("stop");
    if has_openai_markers {
        return PayloadFormat::OpenAiRequest;
    }

    if obj.get("model").is_some_and(Value::is_string) {
        // Flat message array with no dialect markers either way; the flat
        // shape is the OpenAI family's.
        return PayloadFormat::OpenAiRequest;
    }

    PayloadFormat::Unknown
}
