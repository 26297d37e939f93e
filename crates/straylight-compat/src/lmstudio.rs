//! LM Studio local-server request policy.
//!
//! LM Studio serves whatever model the desktop app has loaded, so virtual
//! labels map onto the first configured model unless an explicit mapping
//! says otherwise. Historical tool traffic is flattened into readable text
//! because loaded models vary wildly in tool-call fidelity.

use log::debug;
use straylight_common::chat::{ChatCompletionRequest, ChatMessage, ChatRole};
use straylight_common::context::{PipelineContext, RoutingDecision};
use straylight_common::error::{ErrorKind, ProxyError};

use crate::policy::{
    CompatPolicy, LMSTUDIO_CAP_CEILING, cap_max_tokens, clamp_temperature, clamp_top_p,
};

const PREFIX: &str = "lmstudio";

/// The virtual labels the router may hand a local pipeline.
const VIRTUAL_LABELS: [&str; 5] = [
    "default",
    "reasoning",
    "longContext",
    "webSearch",
    "background",
];

/// Applies the LM Studio request policy in place.
///
/// # Errors
///
/// Returns `not_found_error` for a label that is neither supported,
/// virtual, nor explicitly mapped; `no_valid_messages` when flattening
/// leaves nothing to send.
pub fn apply(
    request: &mut ChatCompletionRequest,
    policy: &CompatPolicy,
    decision: &RoutingDecision,
    ctx: &mut PipelineContext,
) -> Result<(), ProxyError> {
    let resolved = resolve_model(&request.model, policy, decision)?;
    if resolved != request.model {
        debug!("lmstudio: '{}' resolved to '{resolved}'", request.model);
        ctx.record_transformation(
            PREFIX,
            format!("{PREFIX}_model_mapped"),
            Some(format!("{} -> {resolved}", request.model)),
        );
        request.model = resolved;
    }

    normalize_tools(request, ctx);
    flatten_tool_traffic(request, ctx);

    if request.messages.is_empty() {
        return Err(ProxyError::validation(
            "NO_VALID_MESSAGES",
            "no messages survived lmstudio content filtering",
        ));
    }

    clamp_temperature(request, 0.0, 2.0, PREFIX, ctx);
    clamp_top_p(request, 0.0, 1.0, PREFIX, ctx);

    let default_cap = policy
        .context_length
        .map_or(LMSTUDIO_CAP_CEILING, |context| {
            (context / 4).min(LMSTUDIO_CAP_CEILING)
        });
    let cap = policy.output_cap(&request.model, default_cap);
    cap_max_tokens(request, cap, PREFIX, ctx);

    Ok(())
}

fn resolve_model(
    model: &str,
    policy: &CompatPolicy,
    decision: &RoutingDecision,
) -> Result<String, ProxyError> {
    if policy.supported_models.iter().any(|m| m == model) {
        return Ok(model.to_string());
    }
    if let Some(mapped) = policy.model_mapping.get(model) {
        return Ok(mapped.clone());
    }
    if VIRTUAL_LABELS.contains(&model) || model == decision.original_model {
        // Everything unmapped lands on the first configured model.
        return policy.supported_models.first().cloned().ok_or_else(|| {
            ProxyError::new(
                ErrorKind::NotFoundError,
                "lmstudio provider has no supported models configured",
            )
        });
    }
    Err(ProxyError::new(
        ErrorKind::NotFoundError,
        format!("unknown lmstudio model label '{model}'"),
    )
    .with_param("model"))
}

fn normalize_tools(request: &mut ChatCompletionRequest, ctx: &mut PipelineContext) {
    if let Some(tools) = request.tools.as_mut() {
        for tool in tools {
            if tool.tool_type != "function" {
                tool.tool_type = "function".to_string();
                ctx.record_transformation(PREFIX, format!("{PREFIX}_tool_normalized"), None);
            }
        }
    }
}

/// Renders assistant tool calls and tool results as readable text.
fn flatten_tool_traffic(request: &mut ChatCompletionRequest, ctx: &mut PipelineContext) {
    let mut flattened: Vec<ChatMessage> = Vec::with_capacity(request.messages.len());

    for message in request.messages.drain(..) {
        match message.role {
            ChatRole::Assistant if message.tool_calls.is_some() => {
                let mut parts: Vec<String> = Vec::new();
                if let Some(text) = message.content.as_deref()
                    && !text.is_empty()
                {
                    parts.push(text.to_string());
                }
                if let Some(calls) = message.tool_calls.as_ref() {
                    for call in calls {
                        parts.push(format!(
                            "[Tool Call: {}] {}",
                            call.function.name, call.function.arguments
                        ));
                    }
                }
                ctx.record_transformation(PREFIX, format!("{PREFIX}_tool_call_flattened"), None);
                flattened.push(ChatMessage::text(ChatRole::Assistant, parts.join("\n")));
            }
            ChatRole::Tool => {
                let body = message.content.unwrap_or_default();
                ctx.record_transformation(PREFIX, format!("{PREFIX}_tool_result_flattened"), None);
                flattened.push(ChatMessage::text(
                    ChatRole::User,
                    format!("[Tool Result] {body}"),
                ));
            }
            _ => {
                if message.content.as_deref().is_some_and(|c| !c.is_empty()) {
                    flattened.push(message);
                }
            }
        }
    }

    request.messages = flattened;
}
