//! DeepSeek-style request policy.
//!
//! The endpoint rejects a zero temperature and silently ignores tools
//! unless `tool_choice` is set, so both are nudged here: temperature and
//! top_p get a 0.01 floor, and a missing or "none" tool choice becomes
//! "auto" whenever tools are present.

use straylight_common::chat::{ChatCompletionRequest, ToolChoice};
use straylight_common::context::{PipelineContext, RoutingDecision};
use straylight_common::error::ProxyError;

use crate::policy::{CompatPolicy, DEFAULT_OUTPUT_CAP, cap_max_tokens, clamp_temperature, clamp_top_p};

const PREFIX: &str = "deepseek";

/// Applies the DeepSeek request policy in place.
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

    let has_tools = request.tools.as_ref().is_some_and(|t| !t.is_empty());
    if has_tools {
        let needs_default = request
            .tool_choice
            .as_ref()
            .is_none_or(ToolChoice::is_none_mode);
        if needs_default {
            request.tool_choice = Some(ToolChoice::auto());
            ctx.record_transformation(PREFIX, format!("{PREFIX}_tool_choice_defaulted"), None);
        }
    }

    let cap = policy.output_cap(&request.model, DEFAULT_OUTPUT_CAP);
    cap_max_tokens(request, cap, PREFIX, ctx);
    clamp_temperature(request, 0.01, 2.0, PREFIX, ctx);
    clamp_top_p(request, 0.01, 1.0, PREFIX, ctx);

    Ok(())
}
