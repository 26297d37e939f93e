//! Gemini-native adapter: chat-completion shape to contents/parts and back.
//!
//! The dialect codec always produces the OpenAI-family shape; this family
//! rewrites it into the nested Gemini request (system instruction hoisted,
//! tool calls as `functionCall` parts, tool results as `functionResponse`
//! parts) and folds candidates back into a canonical chat response.

use chrono::Utc;
use log::warn;
use smallvec::SmallVec;

use straylight_common::chat::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, ChatRole, ChatToolCall,
    ChatUsage,
};
use straylight_common::context::{PipelineContext, RoutingDecision};
use straylight_common::error::{ProtocolViolation, ProxyError};
use straylight_common::generative::{
    Candidate, Content, ContentRole, FunctionCallPart, FunctionDeclaration, FunctionResponsePart,
    GenerateBody, GenerateRequest, GenerateResponse, GenerationConfig, GenerativeThinkingConfig,
    GenerativeTool, Part,
};

use crate::policy::{CompatPolicy, DEFAULT_OUTPUT_CAP};

const PREFIX: &str = "gemini";

/// Rewrites an OpenAI-family request into the Gemini-native shape.
///
/// The mapped model comes off the routing decision (itself parsed from
/// the pipeline id); `maxOutputTokens` is bounded by the configured cap,
/// and a thinking block is attached when the provider config asks for one.
/// The protocol config (endpoint, compatibility tag, processed model) is
/// written to the context metadata for the stages below.
///
/// # Errors
///
/// Infallible today; the signature matches the other families.
pub fn request_to_generative(
    request: &ChatCompletionRequest,
    policy: &CompatPolicy,
    decision: &RoutingDecision,
    ctx: &mut PipelineContext,
) -> Result<GenerateRequest, ProxyError> {
    let mut system_texts: Vec<String> = Vec::new();
    let mut contents: Vec<Content> = Vec::new();

    for message in &request.messages {
        match message.role {
            ChatRole::System => {
                if let Some(text) = message.content.as_deref()
                    && !text.is_empty()
                {
                    system_texts.push(text.to_string());
                }
            }
            ChatRole::User => {
                if let Some(text) = message.content.as_deref()
                    && !text.is_empty()
                {
                    contents.push(Content {
                        role: ContentRole::User,
                        parts: vec![Part::Text { text: text.to_string() }],
                    });
                }
            }
            ChatRole::Assistant => {
                let mut parts: Vec<Part> = Vec::new();
                if let Some(text) = message.content.as_deref()
                    && !text.is_empty()
                {
                    parts.push(Part::Text { text: text.to_string() });
                }
                if let Some(calls) = message.tool_calls.as_ref() {
                    for call in calls {
                        let args = parse_call_arguments(&call.function.arguments, &call.id, ctx);
                        parts.push(Part::FunctionCall {
                            function_call: FunctionCallPart {
                                name: call.function.name.clone(),
                                args,
                            },
                        });
                    }
                }
                if !parts.is_empty() {
                    contents.push(Content {
                        role: ContentRole::Model,
                        parts,
                    });
                }
            }
            ChatRole::Tool => {
                let response = message
                    .content
                    .as_deref()
                    .map_or(serde_json::Value::Null, |text| {
                        serde_json::json!({ "result": text })
                    });
                contents.push(Content {
                    role: ContentRole::User,
                    parts: vec![Part::FunctionResponse {
                        function_response: FunctionResponsePart {
                            // Gemini keys results by function name; the call id
                            // is carried for linkage when folding back.
                            name: message.tool_call_id.clone().unwrap_or_default(),
                            response,
                        },
                    }],
                });
            }
        }
    }

    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(Content {
            role: ContentRole::User,
            parts: vec![Part::Text { text: system_texts.join("\n") }],
        })
    };

    let tools = request.tools.as_ref().map(|tools| {
        vec![GenerativeTool {
            function_declarations: tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.function.name.clone(),
                    description: t.function.description.clone(),
                    parameters: t.function.parameters.clone(),
                })
                .collect(),
        }]
    });

    let cap = policy.output_cap(&decision.mapped_model, DEFAULT_OUTPUT_CAP);
    let max_output_tokens = request.max_tokens.map(|requested| {
        if requested > cap {
            ctx.record_transformation(
                PREFIX,
                format!("{PREFIX}_max_output_tokens_adjusted"),
                Some(format!("{requested} -> {cap}")),
            );
            cap
        } else {
            requested
        }
    });

    let thinking_config = policy.enable_thinking.then(|| GenerativeThinkingConfig {
        thinking_budget: None,
        include_thoughts: Some(true),
    });

    let generation_config = GenerationConfig::builder()
        .temperature(request.temperature)
        .max_output_tokens(max_output_tokens)
        .top_p(request.top_p)
        .top_k(request.top_k)
        .stop_sequences(request.stop.clone())
        .thinking_config(thinking_config)
        .build();

    write_protocol_config(policy, decision, ctx);

    Ok(GenerateRequest {
        model: decision.mapped_model.clone(),
        project: policy.project.clone(),
        request: GenerateBody::builder()
            .contents(contents)
            .system_instruction(system_instruction)
            .tools(tools)
            .generation_config(Some(generation_config))
            .build(),
    })
}

fn parse_call_arguments(
    arguments: &str,
    call_id: &str,
    ctx: &mut PipelineContext,
) -> serde_json::Value {
    if arguments.trim().is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }
    serde_json::from_str(arguments).unwrap_or_else(|e| {
        warn!("tool call '{call_id}' arguments failed to parse for gemini: {e}");
        ctx.record_transformation(PREFIX, "tool_args_unparseable", Some(call_id.to_string()));
        serde_json::Value::Object(serde_json::Map::new())
    })
}

fn write_protocol_config(
    policy: &CompatPolicy,
    decision: &RoutingDecision,
    ctx: &mut PipelineContext,
) {
    ctx.metadata.insert(
        "protocolConfig".to_string(),
        serde_json::json!({
            "endpoint": policy.endpoint,
            "serverCompatibility": policy.server_compatibility,
            "processedModel": decision.mapped_model,
            "keyIndex": decision.key_index,
        }),
    );
}

/// Maps a Gemini finish reason onto the OpenAI-family vocabulary.
fn map_finish_reason(reason: &str, has_calls: bool) -> String {
    if has_calls {
        return "tool_calls".to_string();
    }
    match reason {
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" | "RECITATION" => "content_filter".to_string(),
        _ => "stop".to_string(),
    }
}

/// Folds a Gemini response into the canonical chat-completion shape.
///
/// Tool calls get synthesized ids (`call_<provider>_<timestamp>_<n>`)
/// because the Gemini wire carries none; each synthesis is logged.
///
/// # Errors
///
/// Returns a protocol error when the response carries no candidates.
pub fn response_to_chat(
    response: &GenerateResponse,
    policy: &CompatPolicy,
    decision: &RoutingDecision,
    ctx: &mut PipelineContext,
) -> Result<ChatCompletionResponse, ProxyError> {
    let candidate: &Candidate = response.candidates.first().ok_or_else(|| {
        ProxyError::protocol(
            ProtocolViolation::MissingResponseChoices,
            "gemini response carries no candidates",
        )
    })?;

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: SmallVec<[ChatToolCall; 2]> = SmallVec::new();
    let timestamp = Utc::now().timestamp();

    for part in &candidate.content.parts {
        match part {
            Part::Text { text } => text_parts.push(text.clone()),
            Part::FunctionCall { function_call } => {
                let id = format!(
                    "call_{}_{timestamp}_{}",
                    policy.provider_name,
                    tool_calls.len()
                );
                ctx.record_transformation(
                    PREFIX,
                    format!("{PREFIX}_tool_call_id_synthesized"),
                    Some(id.clone()),
                );
                tool_calls.push(ChatToolCall::function(
                    id,
                    function_call.name.clone(),
                    function_call.args.to_string(),
                ));
            }
            Part::FunctionResponse { .. } => {
                // A model turn never carries function responses; skip.
            }
        }
    }

    let content = if text_parts.is_empty() {
        None
    } else {
        Some(text_parts.join("\n"))
    };
    let has_calls = !tool_calls.is_empty();

    let finish_reason = map_finish_reason(
        candidate.finish_reason.as_deref().unwrap_or("STOP"),
        has_calls,
    );

    let usage = response.usage_metadata.map(|meta| ChatUsage {
        prompt_tokens: meta.prompt_token_count,
        completion_tokens: meta.candidates_token_count,
        total_tokens: if meta.total_token_count == 0 {
            meta.prompt_token_count + meta.candidates_token_count
        } else {
            meta.total_token_count
        },
    });

    let message = ChatMessage::builder()
        .role(ChatRole::Assistant)
        .content(content)
        .tool_calls(has_calls.then_some(tool_calls))
        .build();

    #[allow(clippy::cast_sign_loss)]
    let created = timestamp.max(0) as u64;

    Ok(ChatCompletionResponse {
        id: format!("chatcmpl-{}-{timestamp}", policy.provider_name),
        object: "chat.completion".to_string(),
        created,
        model: decision.mapped_model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message,
            finish_reason: Some(finish_reason),
        }],
        usage,
    })
}
