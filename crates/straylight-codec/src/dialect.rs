//! Bijective translation between the client dialect and the OpenAI family.
//!
//! Request direction flattens typed content blocks into the flat message
//! array; response direction rebuilds blocks from choice[0]. Tool-call ids
//! pass through byte-identical in both directions - downstream linkage
//! depends on it.

use log::{debug, warn};
use smallvec::SmallVec;

use straylight_common::chat::{
    ChatCompletionRequest, ChatCompletionResponse, ChatFunction, ChatMessage, ChatRole, ChatTool,
    ChatToolCall,
};
use straylight_common::context::PipelineContext;
use straylight_common::error::{ProtocolViolation, ProxyError};
use straylight_common::messages::{
    ClientMessage, ClientRole, ClientStopReason, ClientUsage, ContentBlock, ImageSource,
    MessageContent, MessagesRequest, MessagesResponse,
};

/// Stage name used in transformation log entries.
const STAGE: &str = "dialect-codec";

/// Translates a client-dialect request into the OpenAI-family shape.
///
/// The system prompt becomes a leading system message. Block-array content
/// is walked: text concatenates with newline separators, assistant
/// `tool_use` blocks become `tool_calls`, user `tool_result` blocks become
/// `role:"tool"` messages. Empty messages are dropped; if everything drops,
/// a placeholder user message is synthesized so the upstream sees a
/// well-formed conversation. `max_tokens` passes through untouched - the
/// compat stage owns clamping.
///
/// # Errors
///
/// Returns a validation error when a tool definition has a missing or
/// empty name.
pub fn request_to_chat(
    request: &MessagesRequest,
    target_model: &str,
    ctx: &mut PipelineContext,
) -> Result<ChatCompletionRequest, ProxyError> {
    let mut messages: Vec<ChatMessage> = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = request.system.as_deref()
        && !system.trim().is_empty()
    {
        messages.push(ChatMessage::text(ChatRole::System, system));
    }

    for message in &request.messages {
        convert_message(message, &mut messages, ctx);
    }

    if messages.is_empty() {
        ctx.record_transformation(STAGE, "placeholder_message_synthesized", None);
        messages.push(ChatMessage::text(ChatRole::User, "Hello"));
    }

    let tools = request.tools.as_deref().map(convert_tools).transpose()?;

    debug!(
        "translated client request: {} message(s), {} tool(s)",
        messages.len(),
        tools.as_ref().map_or(0, Vec::len)
    );

    Ok(ChatCompletionRequest::builder()
        .model(target_model.to_string())
        .messages(messages)
        .max_tokens(request.max_tokens)
        .temperature(request.temperature)
        .top_p(request.top_p)
        .stop(request.stop_sequences.clone())
        .stream(Some(request.stream))
        .tools(tools)
        .build())
}

fn convert_message(message: &ClientMessage, out: &mut Vec<ChatMessage>, ctx: &mut PipelineContext) {
    let role = match message.role {
        ClientRole::User => ChatRole::User,
        ClientRole::Assistant => ChatRole::Assistant,
        ClientRole::System => ChatRole::System,
    };

    match &message.content {
        MessageContent::Text(text) => {
            if !text.trim().is_empty() {
                out.push(ChatMessage::text(role, text.clone()));
            }
        }
        MessageContent::Blocks(blocks) => {
            let mut text_parts: Vec<String> = Vec::new();
            let mut tool_calls: SmallVec<[ChatToolCall; 2]> = SmallVec::new();

            for block in blocks {
                match block {
                    ContentBlock::Text { text } => {
                        if !text.is_empty() {
                            text_parts.push(text.clone());
                        }
                    }
                    ContentBlock::Image { source } => {
                        let reference = match source {
                            ImageSource::Url { url } => format!("[Image: {url}]"),
                            ImageSource::Base64 { media_type, .. } => {
                                format!("[Image: inline {media_type}]")
                            }
                        };
                        ctx.record_transformation(STAGE, "image_block_flattened", None);
                        text_parts.push(reference);
                    }
                    ContentBlock::ToolUse { id, name, input } => {
                        let arguments = serde_json::to_string(input).unwrap_or_else(|e| {
                            warn!("tool_use input for '{name}' failed to serialize: {e}");
                            ctx.record_transformation(
                                STAGE,
                                "tool_input_unserializable",
                                Some(id.clone()),
                            );
                            "{}".to_string()
                        });
                        tool_calls.push(ChatToolCall::function(id.clone(), name.clone(), arguments));
                    }
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => {
                        let mut body = content
                            .as_ref()
                            .map(straylight_common::messages::ToolResultContent::flatten_text)
                            .unwrap_or_default();
                        if is_error.unwrap_or(false) {
                            body = format!("Error: {body}");
                        }
                        out.push(
                            ChatMessage::builder()
                                .role(ChatRole::Tool)
                                .content(Some(body))
                                .tool_call_id(Some(tool_use_id.clone()))
                                .build(),
                        );
                    }
                }
            }

            let content = if text_parts.is_empty() {
                None
            } else {
                Some(text_parts.join("\n"))
            };

            if content.is_some() || !tool_calls.is_empty() {
                out.push(
                    ChatMessage::builder()
                        .role(role)
                        .content(content)
                        .tool_calls(if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        })
                        .build(),
                );
            }
        }
    }
}

fn convert_tools(
    tools: &[straylight_common::messages::ToolDefinition],
) -> Result<Vec<ChatTool>, ProxyError> {
    let mut out = Vec::with_capacity(tools.len());
    for tool in tools {
        if tool.name.trim().is_empty() {
            return Err(ProxyError::validation(
                "INVALID_TOOL",
                "tool definition has a missing or empty name",
            )
            .with_param("tools"));
        }
        out.push(ChatTool::function(ChatFunction {
            name: tool.name.clone(),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        }));
    }
    Ok(out)
}

/// Maps an OpenAI-family finish reason onto the client dialect.
#[must_use]
pub fn map_finish_reason(reason: &str) -> ClientStopReason {
    match reason {
        "length" => ClientStopReason::MaxTokens,
        "tool_calls" => ClientStopReason::ToolUse,
        // "stop", "content_filter", and anything unrecognized end the turn.
        _ => ClientStopReason::EndTurn,
    }
}

/// Translates an OpenAI-family response into the client dialect.
///
/// Takes choice[0]. Tool-call arguments are parsed leniently: an empty or
/// malformed arguments string yields `{}` and appends a
/// `tool_args_unparseable` entry to the transformations log rather than
/// failing the response.
///
/// # Errors
///
/// Returns a protocol error when the response carries no choices.
pub fn response_to_messages(
    response: &ChatCompletionResponse,
    ctx: &mut PipelineContext,
) -> Result<MessagesResponse, ProxyError> {
    let choice = response.choices.first().ok_or_else(|| {
        ProxyError::protocol(
            ProtocolViolation::MissingResponseChoices,
            "upstream response carries no choices",
        )
    })?;

    let mut content: Vec<ContentBlock> = Vec::new();

    if let Some(text) = choice.message.content.as_deref()
        && !text.is_empty()
    {
        content.push(ContentBlock::Text {
            text: text.to_string(),
        });
    }

    if let Some(tool_calls) = choice.message.tool_calls.as_ref() {
        for call in tool_calls {
            let input = parse_arguments_leniently(&call.function.arguments, &call.id, ctx);
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.function.name.clone(),
                input,
            });
        }
    }

    let stop_reason = choice.finish_reason.as_deref().map(map_finish_reason);

    let usage = response.usage.map_or_else(ClientUsage::default, |u| ClientUsage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
    });

    Ok(MessagesResponse {
        id: response.id.clone(),
        response_type: "message".to_string(),
        role: "assistant".to_string(),
        model: response.model.clone(),
        content,
        stop_reason,
        stop_sequence: None,
        usage,
    })
}

fn parse_arguments_leniently(
    arguments: &str,
    call_id: &str,
    ctx: &mut PipelineContext,
) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    match serde_json::from_str(arguments) {
        Ok(value) => value,
        Err(e) => {
            warn!("tool call '{call_id}' carries unparseable arguments: {e}");
            ctx.record_transformation(STAGE, "tool_args_unparseable", Some(call_id.to_string()));
            serde_json::Value::Object(serde_json::Map::new())
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use super::*;
    use straylight_common::chat::{ChatChoice, ChatUsage};
    use straylight_common::messages::ToolDefinition;

    fn ctx() -> PipelineContext {
        PipelineContext::new("session", "conversation")
    }

    fn simple_request(messages: Vec<ClientMessage>) -> MessagesRequest {
        MessagesRequest::builder()
            .model("claude-3-5-sonnet".to_string())
            .messages(messages)
            .build()
    }

    #[test]
    fn test_system_prompt_becomes_leading_message() {
        let mut request = simple_request(vec![ClientMessage::text(ClientRole::User, "Hello")]);
        request.system = Some("You are terse.".to_string());

        let chat = request_to_chat(&request, "llama-3.1-8b-instruct", &mut ctx()).unwrap();
        assert_eq!(chat.model, "llama-3.1-8b-instruct");
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, ChatRole::System);
        assert_eq!(chat.messages[0].content.as_deref(), Some("You are terse."));
        assert_eq!(chat.messages[1].role, ChatRole::User);
    }

    #[test]
    fn test_text_blocks_concatenate_with_newlines() {
        let request = simple_request(vec![ClientMessage::blocks(
            ClientRole::User,
            vec![
                ContentBlock::Text { text: "first".to_string() },
                ContentBlock::Text { text: "second".to_string() },
            ],
        )]);

        let chat = request_to_chat(&request, "m", &mut ctx()).unwrap();
        assert_eq!(chat.messages[0].content.as_deref(), Some("first\nsecond"));
    }

    #[test]
    fn test_tool_use_becomes_tool_call() {
        let request = simple_request(vec![ClientMessage::blocks(
            ClientRole::Assistant,
            vec![ContentBlock::ToolUse {
                id: "call_1".to_string(),
                name: "get_weather".to_string(),
                input: serde_json::json!({"city": "Paris"}),
            }],
        )]);

        let chat = request_to_chat(&request, "m", &mut ctx()).unwrap();
        let calls = chat.messages[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.name, "get_weather");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&calls[0].function.arguments).unwrap(),
            serde_json::json!({"city": "Paris"})
        );
    }

    #[test]
    fn test_tool_result_becomes_tool_message() {
        let request = simple_request(vec![ClientMessage::blocks(
            ClientRole::User,
            vec![ContentBlock::ToolResult {
                tool_use_id: "call_1".to_string(),
                content: Some(straylight_common::messages::ToolResultContent::Text(
                    "18 degrees".to_string(),
                )),
                is_error: None,
            }],
        )]);

        let chat = request_to_chat(&request, "m", &mut ctx()).unwrap();
        assert_eq!(chat.messages[0].role, ChatRole::Tool);
        assert_eq!(chat.messages[0].tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(chat.messages[0].content.as_deref(), Some("18 degrees"));
    }

    #[test]
    fn test_all_empty_synthesizes_placeholder() {
        let mut context = ctx();
        let request = simple_request(vec![
            ClientMessage::text(ClientRole::User, "   "),
            ClientMessage::blocks(ClientRole::User, vec![]),
        ]);

        let chat = request_to_chat(&request, "m", &mut context).unwrap();
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].content.as_deref(), Some("Hello"));
        assert!(context.has_transformation("placeholder_message_synthesized"));
    }

    #[test]
    fn test_unnamed_tool_rejected() {
        let mut request = simple_request(vec![ClientMessage::text(ClientRole::User, "hi")]);
        request.tools = Some(vec![ToolDefinition {
            name: "  ".to_string(),
            description: "broken".to_string(),
            input_schema: serde_json::json!({"type": "object"}),
        }]);

        let err = request_to_chat(&request, "m", &mut ctx()).unwrap_err();
        assert_eq!(err.code, "INVALID_TOOL");
    }

    #[test]
    fn test_max_tokens_passes_through_unclamped() {
        let mut request = simple_request(vec![ClientMessage::text(ClientRole::User, "hi")]);
        request.max_tokens = Some(1_000_000);

        let chat = request_to_chat(&request, "m", &mut ctx()).unwrap();
        assert_eq!(chat.max_tokens, Some(1_000_000));
    }

    fn chat_response(message: ChatMessage, finish_reason: &str) -> ChatCompletionResponse {
        ChatCompletionResponse {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion".to_string(),
            created: 1_700_000_000,
            model: "llama-3.1-8b-instruct".to_string(),
            choices: vec![ChatChoice {
                index: 0,
                message,
                finish_reason: Some(finish_reason.to_string()),
            }],
            usage: Some(ChatUsage {
                prompt_tokens: 1,
                completion_tokens: 1,
                total_tokens: 2,
            }),
        }
    }

    #[test]
    fn test_response_text_block() {
        let response = chat_response(ChatMessage::text(ChatRole::Assistant, "Hi"), "stop");
        let reply = response_to_messages(&response, &mut ctx()).unwrap();

        assert_eq!(reply.content.len(), 1);
        assert!(matches!(&reply.content[0], ContentBlock::Text { text } if text == "Hi"));
        assert_eq!(reply.stop_reason, Some(ClientStopReason::EndTurn));
        assert_eq!(reply.usage.input_tokens, 1);
        assert_eq!(reply.usage.output_tokens, 1);
    }

    #[test]
    fn test_response_tool_call_roundtrip() {
        let message = ChatMessage::builder()
            .role(ChatRole::Assistant)
            .tool_calls(Some(
                vec![ChatToolCall::function(
                    "call_1",
                    "get_weather",
                    r#"{"city":"Paris"}"#,
                )]
                .into(),
            ))
            .build();
        let response = chat_response(message, "tool_calls");
        let reply = response_to_messages(&response, &mut ctx()).unwrap();

        assert_eq!(reply.stop_reason, Some(ClientStopReason::ToolUse));
        match &reply.content[0] {
            ContentBlock::ToolUse { id, name, input } => {
                assert_eq!(id, "call_1");
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "Paris");
            }
            other => panic!("expected tool_use block, got {other:?}"),
        }
    }

    #[test]
    fn test_response_lenient_arguments() {
        let mut context = ctx();
        let message = ChatMessage::builder()
            .role(ChatRole::Assistant)
            .tool_calls(Some(
                vec![ChatToolCall::function("call_1", "f", "{not json")].into(),
            ))
            .build();
        let response = chat_response(message, "tool_calls");
        let reply = response_to_messages(&response, &mut context).unwrap();

        match &reply.content[0] {
            ContentBlock::ToolUse { input, .. } => {
                assert_eq!(input, &serde_json::json!({}));
            }
            other => panic!("expected tool_use block, got {other:?}"),
        }
        assert!(context.has_transformation("tool_args_unparseable"));
    }

    #[test]
    fn test_tool_call_ids_link_across_turns() {
        // A full tool turn: the assistant's tool_use id and the user's
        // tool_result reference must survive translation byte-identical
        // and point at each other in the flat message array.
        let request = simple_request(vec![
            ClientMessage::text(ClientRole::User, "weather in Paris?"),
            ClientMessage::blocks(
                ClientRole::Assistant,
                vec![ContentBlock::ToolUse {
                    id: "toolu_abc123".to_string(),
                    name: "get_weather".to_string(),
                    input: serde_json::json!({"city": "Paris"}),
                }],
            ),
            ClientMessage::blocks(
                ClientRole::User,
                vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_abc123".to_string(),
                    content: Some(straylight_common::messages::ToolResultContent::Text(
                        "18C".to_string(),
                    )),
                    is_error: None,
                }],
            ),
        ]);

        let chat = request_to_chat(&request, "m", &mut ctx()).unwrap();

        assert_eq!(chat.messages.len(), 3);
        let call_id = &chat.messages[1].tool_calls.as_ref().unwrap()[0].id;
        assert_eq!(call_id, "toolu_abc123");
        assert_eq!(chat.messages[2].role, ChatRole::Tool);
        assert_eq!(chat.messages[2].tool_call_id.as_deref(), Some("toolu_abc123"));
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(map_finish_reason("stop"), ClientStopReason::EndTurn);
        assert_eq!(map_finish_reason("length"), ClientStopReason::MaxTokens);
        assert_eq!(map_finish_reason("tool_calls"), ClientStopReason::ToolUse);
        assert_eq!(map_finish_reason("content_filter"), ClientStopReason::EndTurn);
        assert_eq!(map_finish_reason("mystery"), ClientStopReason::EndTurn);
    }

    #[test]
    fn test_response_without_choices_fails() {
        let response = ChatCompletionResponse {
            id: "chatcmpl-1".to_string(),
            object: "chat.completion".to_string(),
            created: 0,
            model: "m".to_string(),
            choices: vec![],
            usage: None,
        };
        let err = response_to_messages(&response, &mut ctx()).unwrap_err();
        assert_eq!(err.code, "MISSING_RESPONSE_CHOICES");
    }

    #[test]
    fn test_roundtrip_identity_under_echo() {
        // Echo upstream: text in equals text out; tool ids survive intact.
        let mut context = ctx();
        let request = simple_request(vec![ClientMessage::text(ClientRole::User, "Hello")]);
        let chat = request_to_chat(&request, "claude-3-5-sonnet", &mut context).unwrap();

        let echoed = chat_response(
            ChatMessage::text(
                ChatRole::Assistant,
                chat.messages[0].content.clone().unwrap(),
            ),
            "stop",
        );
        let reply = response_to_messages(&echoed, &mut context).unwrap();
        assert!(matches!(&reply.content[0], ContentBlock::Text { text } if text == "Hello"));
    }
}
