//! Stream/non-stream protocol conversion and structural validation.
//!
//! The controller never issues upstream calls. It rewrites stream requests
//! to non-stream, synthesizes chunk sequences from non-stream responses,
//! and aggregates chunk sequences back - the two conversions are exact
//! inverses except that aggregation leaves usage counters zeroed.

use log::debug;
use serde_json::Value;
use smallvec::SmallVec;

use straylight_common::chat::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatChoice,
    ChatFunctionDelta, ChatMessage, ChatMessageDelta, ChatRole, ChatStreamChoice, ChatToolCall,
    ChatToolCallDelta, ChatUsage,
};
use straylight_common::config::ProtocolSettings;
use straylight_common::context::PipelineContext;
use straylight_common::error::{ProtocolViolation, ProxyError};

/// Stage name used in transformation log entries.
const STAGE: &str = "protocol-controller";

/// Maximum number of content-delta slices when synthesizing a stream.
const MAX_CONTENT_SLICES: usize = 10;

/// Pre-configured stream/validation policy. Sealed after construction.
#[derive(Debug, Clone)]
pub struct ProtocolController {
    max_request_size: usize,
    stream_conversion: bool,
    validation: bool,
}

impl ProtocolController {
    /// Builds a controller from the protocol policy knobs.
    #[must_use]
    pub const fn new(settings: &ProtocolSettings) -> Self {
        Self {
            max_request_size: settings.max_request_size,
            stream_conversion: settings.stream_conversion,
            validation: settings.validation,
        }
    }

    /// Whether stream requests are rewritten to non-stream.
    #[must_use]
    pub const fn stream_conversion_enabled(&self) -> bool {
        self.stream_conversion
    }

    fn check_size(&self, value: &Value) -> Result<(), ProxyError> {
        let serialized = serde_json::to_vec(value).map_err(|e| {
            ProxyError::protocol(
                ProtocolViolation::UnsupportedRequestFormat,
                format!("payload failed to serialize: {e}"),
            )
        })?;
        if serialized.len() > self.max_request_size {
            return Err(ProxyError::protocol(
                ProtocolViolation::RequestSizeExceeded,
                format!(
                    "payload is {} bytes; limit is {}",
                    serialized.len(),
                    self.max_request_size
                ),
            ));
        }
        Ok(())
    }

    /// Validates an OpenAI-family request value.
    ///
    /// # Errors
    ///
    /// Returns a protocol error naming the first violation: size limit,
    /// missing/mistyped `model`, missing/mistyped `messages`, a message
    /// with a bad role, or a message with no extractable content.
    pub fn validate_request(&self, value: &Value) -> Result<(), ProxyError> {
        if !self.validation {
            return Ok(());
        }
        self.check_size(value)?;

        match value.get("model") {
            None => {
                return Err(ProxyError::protocol(
                    ProtocolViolation::MissingModel,
                    "request has no model field",
                ));
            }
            Some(model) if !model.is_string() => {
                return Err(ProxyError::protocol(
                    ProtocolViolation::InvalidModelField,
                    "model field must be a string",
                ));
            }
            Some(_) => {}
        }

        let messages = match value.get("messages") {
            None => {
                return Err(ProxyError::protocol(
                    ProtocolViolation::InvalidMessagesField,
                    "request has no messages field",
                ));
            }
            Some(messages) => messages.as_array().ok_or_else(|| {
                ProxyError::protocol(
                    ProtocolViolation::InvalidMessagesField,
                    "messages field must be an array",
                )
            })?,
        };
        if messages.is_empty() {
            return Err(ProxyError::protocol(
                ProtocolViolation::InvalidMessages,
                "messages array is empty",
            ));
        }

        for (i, message) in messages.iter().enumerate() {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("");
            if !matches!(role, "system" | "user" | "assistant" | "tool") {
                return Err(ProxyError::protocol(
                    ProtocolViolation::InvalidMessageRole,
                    format!("message {i} has role '{role}'"),
                ));
            }
            let has_content = match message.get("content") {
                Some(Value::String(s)) => !s.is_empty(),
                Some(Value::Array(blocks)) => !blocks.is_empty(),
                _ => false,
            };
            let has_tool_calls = message
                .get("tool_calls")
                .and_then(Value::as_array)
                .is_some_and(|t| !t.is_empty());
            if !has_content && !has_tool_calls {
                return Err(ProxyError::protocol(
                    ProtocolViolation::EmptyMessageContent,
                    format!("message {i} carries no content"),
                ));
            }
        }

        if let Some(stream) = value.get("stream")
            && !stream.is_boolean()
        {
            return Err(ProxyError::protocol(
                ProtocolViolation::InvalidStreamFlag,
                "stream field must be a boolean",
            ));
        }

        Ok(())
    }

    /// Validates an OpenAI-family response value.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when `id` is missing or `object` is not a
    /// chat-completion discriminator.
    pub fn validate_response(&self, value: &Value) -> Result<(), ProxyError> {
        if !self.validation {
            return Ok(());
        }
        self.check_size(value)?;

        if !value.get("id").is_some_and(Value::is_string) {
            return Err(ProxyError::protocol(
                ProtocolViolation::MissingResponseId,
                "response has no id",
            ));
        }
        let object = value.get("object").and_then(Value::as_str).unwrap_or("");
        if object != "chat.completion" && object != "chat.completion.chunk" {
            return Err(ProxyError::protocol(
                ProtocolViolation::InvalidResponseObject,
                format!("unexpected response object '{object}'"),
            ));
        }
        Ok(())
    }

    /// Rewrites a stream request to non-stream. Pure rewrite; every other
    /// field is preserved.
    #[must_use]
    pub fn to_non_streaming(
        &self,
        request: &ChatCompletionRequest,
        ctx: &mut PipelineContext,
    ) -> ChatCompletionRequest {
        let mut out = request.clone();
        if self.stream_conversion && out.stream == Some(true) {
            out.stream = Some(false);
            ctx.record_transformation(STAGE, "stream_converted", None);
            debug!("stream request collapsed to non-stream");
        }
        out
    }

    /// Expands a non-stream response into the chunk sequence a streaming
    /// client expects.
    ///
    /// Chunk order is contract: one role delta, up to
    /// [`MAX_CONTENT_SLICES`] content deltas whose concatenation equals the
    /// assistant text (last slice absorbs the remainder), a
    /// (header, arguments) chunk pair per tool call at a fixed per-call
    /// index, and a terminator carrying the original finish reason.
    /// Id, created, and model are copied onto every chunk.
    #[must_use]
    pub fn response_to_chunks(&self, response: &ChatCompletionResponse) -> Vec<ChatCompletionChunk> {
        let choice = response.choices.first();
        let text = choice
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or_default();
        let finish_reason = choice.and_then(|c| c.finish_reason.clone());

        let make_chunk = |delta: ChatMessageDelta, finish: Option<String>| ChatCompletionChunk {
            id: response.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: response.created,
            model: response.model.clone(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta,
                finish_reason: finish,
            }],
            usage: None,
        };

        let mut chunks = Vec::new();

        chunks.push(make_chunk(
            ChatMessageDelta {
                role: Some(ChatRole::Assistant),
                ..ChatMessageDelta::default()
            },
            None,
        ));

        for slice in partition_text(text) {
            chunks.push(make_chunk(
                ChatMessageDelta {
                    content: Some(slice),
                    ..ChatMessageDelta::default()
                },
                None,
            ));
        }

        if let Some(tool_calls) = choice.and_then(|c| c.message.tool_calls.as_ref()) {
            for (call_index, call) in tool_calls.iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let index = call_index as u32;
                chunks.push(make_chunk(
                    ChatMessageDelta {
                        tool_calls: Some(
                            vec![ChatToolCallDelta {
                                index,
                                id: Some(call.id.clone()),
                                call_type: Some(call.call_type.to_string()),
                                function: Some(ChatFunctionDelta {
                                    name: Some(call.function.name.clone()),
                                    arguments: None,
                                }),
                            }]
                            .into(),
                        ),
                        ..ChatMessageDelta::default()
                    },
                    None,
                ));
                chunks.push(make_chunk(
                    ChatMessageDelta {
                        tool_calls: Some(
                            vec![ChatToolCallDelta {
                                index,
                                id: None,
                                call_type: None,
                                function: Some(ChatFunctionDelta {
                                    name: None,
                                    arguments: Some(call.function.arguments.clone()),
                                }),
                            }]
                            .into(),
                        ),
                        ..ChatMessageDelta::default()
                    },
                    None,
                ));
            }
        }

        chunks.push(make_chunk(ChatMessageDelta::default(), finish_reason));
        chunks
    }

    /// Rebuilds a non-stream response from a chunk sequence.
    ///
    /// Concatenates text deltas, accumulates per-index tool calls, and
    /// takes the last non-null finish reason. Usage counters are not
    /// reconstructed; they are left zero for the caller to source
    /// elsewhere.
    ///
    /// # Errors
    ///
    /// Returns an `EMPTY_CHUNKS_LIST` protocol error for an empty input.
    pub fn aggregate_chunks(
        &self,
        chunks: &[ChatCompletionChunk],
    ) -> Result<ChatCompletionResponse, ProxyError> {
        let first = chunks.first().ok_or_else(|| {
            ProxyError::protocol(
                ProtocolViolation::EmptyChunksList,
                "cannot aggregate an empty chunk list",
            )
        })?;

        let mut content = String::new();
        let mut role = ChatRole::Assistant;
        let mut finish_reason: Option<String> = None;
        // (id, type, name, arguments) accumulated per tool-call index.
        let mut calls: Vec<(String, String, String, String)> = Vec::new();

        for chunk in chunks {
            let Some(choice) = chunk.choices.first() else {
                continue;
            };
            if let Some(delta_role) = choice.delta.role {
                role = delta_role;
            }
            if let Some(delta_content) = choice.delta.content.as_deref() {
                content.push_str(delta_content);
            }
            if let Some(deltas) = choice.delta.tool_calls.as_ref() {
                for delta in deltas {
                    let slot = delta.index as usize;
                    while calls.len() <= slot {
                        calls.push((String::new(), String::new(), String::new(), String::new()));
                    }
                    let entry = &mut calls[slot];
                    if let Some(id) = delta.id.as_deref() {
                        entry.0.push_str(id);
                    }
                    if let Some(call_type) = delta.call_type.as_deref() {
                        entry.1.push_str(call_type);
                    }
                    if let Some(function) = delta.function.as_ref() {
                        if let Some(name) = function.name.as_deref() {
                            entry.2.push_str(name);
                        }
                        if let Some(arguments) = function.arguments.as_deref() {
                            entry.3.push_str(arguments);
                        }
                    }
                }
            }
            if let Some(reason) = choice.finish_reason.clone() {
                finish_reason = Some(reason);
            }
        }

        let tool_calls: SmallVec<[ChatToolCall; 2]> = calls
            .into_iter()
            .filter(|(id, ..)| !id.is_empty())
            .map(|(id, call_type, name, arguments)| ChatToolCall {
                id,
                call_type: if call_type.is_empty() {
                    "function".into()
                } else {
                    call_type.into()
                },
                function: straylight_common::chat::ChatFunctionCall { name, arguments },
            })
            .collect();

        let message = ChatMessage::builder()
            .role(role)
            .content(if content.is_empty() { None } else { Some(content) })
            .tool_calls(if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            })
            .build();

        Ok(ChatCompletionResponse {
            id: first.id.clone(),
            object: "chat.completion".to_string(),
            created: first.created,
            model: first.model.clone(),
            choices: vec![ChatChoice {
                index: 0,
                message,
                finish_reason,
            }],
            usage: Some(ChatUsage::default()),
        })
    }
}

/// Partitions text into at most [`MAX_CONTENT_SLICES`] roughly equal
/// slices on character boundaries; the last slice absorbs the remainder.
fn partition_text(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    let chars: Vec<char> = text.chars().collect();
    let slice_count = chars.len().min(MAX_CONTENT_SLICES);
    let per_slice = chars.len() / slice_count;

    let mut slices = Vec::with_capacity(slice_count);
    for i in 0..slice_count {
        let start = i * per_slice;
        let end = if i == slice_count - 1 {
            chars.len()
        } else {
            (i + 1) * per_slice
        };
        slices.push(chars[start..end].iter().collect());
    }
    slices
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use serde_json::json;

    fn controller() -> ProtocolController {
        ProtocolController::new(&ProtocolSettings::default())
    }

    fn ctx() -> PipelineContext {
        PipelineContext::new("s", "c")
    }

    fn sample_response(content: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion".to_string(),
            created: 1_700_000_000,
            model: "llama-3.1-8b-instruct".to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage::text(ChatRole::Assistant, content),
                finish_reason: Some("stop".to_string()),
            }],
            usage: None,
        }
    }

    #[test]
    fn test_validate_request_happy_path() {
        let value = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Hello"}],
            "stream": false
        });
        controller().validate_request(&value).unwrap();
    }

    #[test]
    fn test_validate_request_violations() {
        let c = controller();

        let err = c.validate_request(&json!({"messages": []})).unwrap_err();
        assert_eq!(err.code, "MISSING_MODEL");

        let err = c
            .validate_request(&json!({"model": 42, "messages": []}))
            .unwrap_err();
        assert_eq!(err.code, "INVALID_MODEL_FIELD");

        let err = c.validate_request(&json!({"model": "m"})).unwrap_err();
        assert_eq!(err.code, "INVALID_MESSAGES_FIELD");

        let err = c
            .validate_request(&json!({"model": "m", "messages": []}))
            .unwrap_err();
        assert_eq!(err.code, "INVALID_MESSAGES");

        let err = c
            .validate_request(&json!({
                "model": "m",
                "messages": [{"role": "wizard", "content": "x"}]
            }))
            .unwrap_err();
        assert_eq!(err.code, "INVALID_MESSAGE_ROLE");

        let err = c
            .validate_request(&json!({
                "model": "m",
                "messages": [{"role": "user", "content": ""}]
            }))
            .unwrap_err();
        assert_eq!(err.code, "EMPTY_MESSAGE_CONTENT");

        let err = c
            .validate_request(&json!({
                "model": "m",
                "messages": [{"role": "user", "content": "x"}],
                "stream": "yes"
            }))
            .unwrap_err();
        assert_eq!(err.code, "INVALID_STREAM_FLAG");
    }

    #[test]
    fn test_validate_size_guard() {
        let settings = ProtocolSettings {
            max_request_size: 64,
            ..ProtocolSettings::default()
        };
        let c = ProtocolController::new(&settings);
        let value = json!({
            "model": "m",
            "messages": [{"role": "user", "content": "x".repeat(200)}]
        });
        let err = c.validate_request(&value).unwrap_err();
        assert_eq!(err.code, "REQUEST_SIZE_EXCEEDED");
    }

    #[test]
    fn test_validation_toggle_disables_checks() {
        let settings = ProtocolSettings {
            validation: false,
            ..ProtocolSettings::default()
        };
        let c = ProtocolController::new(&settings);
        c.validate_request(&json!({"nonsense": true})).unwrap();
    }

    #[test]
    fn test_validate_response() {
        let c = controller();
        c.validate_response(&json!({"id": "x", "object": "chat.completion"}))
            .unwrap();
        c.validate_response(&json!({"id": "x", "object": "chat.completion.chunk"}))
            .unwrap();

        let err = c
            .validate_response(&json!({"object": "chat.completion"}))
            .unwrap_err();
        assert_eq!(err.code, "MISSING_RESPONSE_ID");

        let err = c
            .validate_response(&json!({"id": "x", "object": "completion"}))
            .unwrap_err();
        assert_eq!(err.code, "INVALID_RESPONSE_OBJECT");
    }

    #[test]
    fn test_to_non_streaming_preserves_fields() {
        let mut context = ctx();
        let request = ChatCompletionRequest::builder()
            .model("m".to_string())
            .messages(vec![ChatMessage::text(ChatRole::User, "hi")])
            .temperature(Some(0.7))
            .stream(Some(true))
            .build();

        let rewritten = controller().to_non_streaming(&request, &mut context);
        assert_eq!(rewritten.stream, Some(false));
        assert_eq!(rewritten.temperature, Some(0.7));
        assert_eq!(rewritten.model, "m");
        assert!(context.has_transformation("stream_converted"));
    }

    #[test]
    fn test_chunk_ordering_contract() {
        let mut response = sample_response("Hi");
        response.choices[0].message.tool_calls = Some(
            vec![ChatToolCall::function("call_1", "get_weather", r#"{"city":"Paris"}"#)].into(),
        );
        response.choices[0].finish_reason = Some("tool_calls".to_string());

        let chunks = controller().response_to_chunks(&response);

        // role, content x2 ("H","i"), tool header, tool args, terminator
        assert_eq!(chunks.len(), 6);
        assert_eq!(chunks[0].choices[0].delta.role, Some(ChatRole::Assistant));
        let text: String = chunks[1..3]
            .iter()
            .filter_map(|c| c.choices[0].delta.content.clone())
            .collect();
        assert_eq!(text, "Hi");
        let header = chunks[3].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(header[0].id.as_deref(), Some("call_1"));
        assert_eq!(
            header[0].function.as_ref().unwrap().name.as_deref(),
            Some("get_weather")
        );
        let args = chunks[4].choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(
            args[0].function.as_ref().unwrap().arguments.as_deref(),
            Some(r#"{"city":"Paris"}"#)
        );
        let terminator = chunks.last().unwrap();
        assert_eq!(
            terminator.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
        for chunk in &chunks {
            assert_eq!(chunk.id, "chatcmpl-1");
            assert_eq!(chunk.created, 1_700_000_000);
            assert_eq!(chunk.model, "llama-3.1-8b-instruct");
            assert_eq!(chunk.object, "chat.completion.chunk");
        }
    }

    #[test]
    fn test_long_text_capped_at_ten_slices() {
        let response = sample_response(&"x".repeat(1000));
        let chunks = controller().response_to_chunks(&response);
        // role + 10 content + terminator
        assert_eq!(chunks.len(), 12);
        let text: String = chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.content.clone())
            .collect();
        assert_eq!(text.len(), 1000);
    }

    #[test]
    fn test_multibyte_text_partitioning() {
        let response = sample_response("héllo wörld ✓ done");
        let chunks = controller().response_to_chunks(&response);
        let text: String = chunks
            .iter()
            .filter_map(|c| c.choices[0].delta.content.clone())
            .collect();
        assert_eq!(text, "héllo wörld ✓ done");
    }

    #[test]
    fn test_stream_bijection() {
        let mut response = sample_response("The capital of France is Paris.");
        response.choices[0].message.tool_calls = Some(
            vec![ChatToolCall::function("call_9", "lookup", r#"{"q":"paris"}"#)].into(),
        );

        let c = controller();
        let chunks = c.response_to_chunks(&response);
        let rebuilt = c.aggregate_chunks(&chunks).unwrap();

        assert_eq!(rebuilt.id, response.id);
        assert_eq!(rebuilt.created, response.created);
        assert_eq!(rebuilt.model, response.model);
        assert_eq!(
            rebuilt.choices[0].message.content,
            response.choices[0].message.content
        );
        assert_eq!(
            rebuilt.choices[0].message.tool_calls,
            response.choices[0].message.tool_calls
        );
        assert_eq!(
            rebuilt.choices[0].finish_reason,
            response.choices[0].finish_reason
        );
        // Usage is not reconstructed.
        assert_eq!(rebuilt.usage, Some(ChatUsage::default()));
    }

    #[test]
    fn test_aggregate_empty_chunks_fails() {
        let err = controller().aggregate_chunks(&[]).unwrap_err();
        assert_eq!(err.code, "EMPTY_CHUNKS_LIST");
    }
}
