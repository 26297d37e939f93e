//! iFlow endpoint request policy.
//!
//! iFlow derives `top_k` from temperature when unset, insists on string
//! tool-call arguments, and authenticates with a configurable header
//! format, so the full protocol-config block is threaded down to the
//! upstream client on the context metadata.

use straylight_common::chat::ChatCompletionRequest;
use straylight_common::context::{PipelineContext, RoutingDecision};
use straylight_common::error::ProxyError;

use crate::policy::{CompatPolicy, cap_max_tokens, clamp_temperature};

const PREFIX: &str = "iflow";

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
fn derive_top_k(temperature: f32, min: u32, max: u32) -> u32 {
    let derived = (temperature * max as f32) as u32;
    derived.clamp(min, max)
}

/// Applies the iFlow request policy in place.
///
/// # Errors
///
/// Infallible for this family; the signature matches the other policies.
pub fn apply(
    request: &mut ChatCompletionRequest,
    policy: &CompatPolicy,
    decision: &RoutingDecision,
    ctx: &mut PipelineContext,
) -> Result<(), ProxyError> {
    let target = if decision.mapped_model.is_empty() {
        policy.supported_models.first().cloned().unwrap_or_default()
    } else {
        decision.mapped_model.clone()
    };
    let target = policy.model_mapping.get(&target).cloned().unwrap_or(target);
    if request.model != target {
        request.model = target;
        ctx.record_transformation(PREFIX, format!("{PREFIX}_model_mapped"), None);
    }

    normalize_tools(request, ctx);

    let limits = policy.param_limits;
    clamp_temperature(
        request,
        limits.temperature_min,
        limits.temperature_max,
        PREFIX,
        ctx,
    );

    if request.top_k.is_none()
        && let Some(temperature) = request.temperature
    {
        let derived = derive_top_k(temperature, limits.top_k_min, limits.top_k_max);
        request.top_k = Some(derived);
        ctx.record_transformation(
            PREFIX,
            format!("{PREFIX}_top_k_derived"),
            Some(derived.to_string()),
        );
    }

    if let Some(cap) = policy
        .max_tokens
        .get(&request.model)
        .copied()
        .or(policy.default_max_tokens)
    {
        cap_max_tokens(request, cap, PREFIX, ctx);
    }

    write_protocol_config(policy, ctx);
    Ok(())
}

/// Ensures every tool is function-shaped and every historical tool call
/// carries string arguments.
fn normalize_tools(request: &mut ChatCompletionRequest, ctx: &mut PipelineContext) {
    if let Some(tools) = request.tools.as_mut() {
        for tool in tools {
            if tool.tool_type != "function" {
                tool.tool_type = "function".to_string();
                ctx.record_transformation(PREFIX, format!("{PREFIX}_tool_normalized"), None);
            }
        }
    }
    for message in &mut request.messages {
        if let Some(calls) = message.tool_calls.as_mut() {
            for call in calls {
                if call.function.arguments.trim().is_empty() {
                    call.function.arguments = "{}".to_string();
                    ctx.record_transformation(
                        PREFIX,
                        format!("{PREFIX}_arguments_defaulted"),
                        Some(call.id.clone()),
                    );
                }
            }
        }
    }
}

/// Threads the frozen protocol config down to the upstream client.
fn write_protocol_config(policy: &CompatPolicy, ctx: &mut PipelineContext) {
    let mut headers = serde_json::Map::new();
    headers.insert(
        policy.auth.header.clone(),
        serde_json::Value::String(policy.auth.format.clone()),
    );
    ctx.metadata.insert(
        "protocolConfig".to_string(),
        serde_json::json!({
            "endpoint": policy.endpoint,
            "timeout": policy.timeout.as_secs(),
            "maxRetries": policy.max_retries,
            "headers": headers,
        }),
    );
}
