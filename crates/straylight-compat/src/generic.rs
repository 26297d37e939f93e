//! Generic OpenAI-compatible request policy.
//!
//! The baseline the local-server families build on: assert the routed
//! model, clamp sampling parameters into the standard ranges, and bound
//! the output budget by the configured per-model cap.

use straylight_common::chat::ChatCompletionRequest;
use straylight_common::context::{PipelineContext, RoutingDecision};
use straylight_common::error::ProxyError;

use crate::policy::{CompatPolicy, cap_max_tokens, clamp_temperature, clamp_top_p};

const PREFIX: &str = "openai_compat";

/// Applies the generic OpenAI-compatible request policy in place.
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

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use crate::adapter::tests::{decision_for, policy_for};
    use straylight_common::chat::{ChatMessage, ChatRole};
    use straylight_common::config::ProviderFamily;

    #[test]
    fn test_model_asserted_and_params_clamped() {
        let mut ctx = PipelineContext::new("s", "c");
        let policy = policy_for(ProviderFamily::OpenaiCompat);
        let decision = decision_for("openai-compat", "gpt-4o-mini");

        let mut request = ChatCompletionRequest::builder()
            .model("gpt-4o".to_string())
            .messages(vec![ChatMessage::text(ChatRole::User, "hi")])
            .temperature(Some(9.0))
            .top_p(Some(-1.0))
            .build();

        apply(&mut request, &policy, &decision, &mut ctx).unwrap();

        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.temperature, Some(2.0));
        assert_eq!(request.top_p, Some(0.0));
        assert!(ctx.has_transformation("openai_compat_model_mapped"));
    }
}
