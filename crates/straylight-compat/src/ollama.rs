//! Ollama local-server request policy.
//!
//! The backend has no tool support and rejects penalty parameters, so both
//! are removed outright rather than clamped.

use straylight_common::chat::ChatCompletionRequest;
use straylight_common::context::{PipelineContext, RoutingDecision};
use straylight_common::error::ProxyError;

use crate::policy::{CompatPolicy, cap_max_tokens, clamp_temperature, clamp_top_p};

const PREFIX: &str = "ollama";

/// Applies the Ollama request policy in place.
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
    if request.model != decision.mapped_model {
        request.model = decision.mapped_model.clone();
        ctx.record_transformation(PREFIX, format!("{PREFIX}_model_mapped"), None);
    }

    let removed_tools = request.tools.take().is_some();
    let removed_choice = request.tool_choice.take().is_some();
    if removed_tools || removed_choice {
        ctx.record_transformation(PREFIX, format!("{PREFIX}_tools_removed"), None);
    }
    let removed_frequency = request.frequency_penalty.take().is_some();
    let removed_presence = request.presence_penalty.take().is_some();
    if removed_frequency || removed_presence {
        ctx.record_transformation(PREFIX, format!("{PREFIX}_penalties_removed"), None);
    }

    clamp_temperature(request, 0.0, 2.0, PREFIX, ctx);
    clamp_top_p(request, 0.0, 1.0, PREFIX, ctx);
    if let Some(cap) = policy
        .max_tokens
        .get(&request.model)
        .copied()
        .or(policy.default_max_tokens)
    {
        cap_max_tokens(request, cap, PREFIX, ctx);
    }

    Ok(())
}
