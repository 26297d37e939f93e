//! vLLM server request policy.
//!
//! vLLM speaks the OpenAI surface but samples with `repetition_penalty`;
//! the OpenAI-style `frequency_penalty` is rebased onto it. Temperature 0
//! is rejected by some builds, hence the 0.001 floor.

use straylight_common::chat::ChatCompletionRequest;
use straylight_common::context::{PipelineContext, RoutingDecision};
use straylight_common::error::ProxyError;

use crate::policy::{CompatPolicy, cap_max_tokens, clamp_temperature, clamp_top_p};

const PREFIX: &str = "vllm";

/// Applies the vLLM request policy in place.
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

    if let Some(frequency_penalty) = request.frequency_penalty.take() {
        request.repetition_penalty = Some(1.0 + frequency_penalty);
        ctx.record_transformation(
            PREFIX,
            format!("{PREFIX}_repetition_penalty_derived"),
            Some(format!("frequency {frequency_penalty}")),
        );
    }

    clamp_temperature(request, 0.001, 2.0, PREFIX, ctx);
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
