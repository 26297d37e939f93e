//! Pre-configured adapter policy and shared clamp helpers.
//!
//! Every knob is fixed when the adapter is built from its provider record;
//! runtime reconfiguration is rejected so a request can never change
//! another request's behavior.

use std::collections::HashMap;
use std::time::Duration;

use straylight_common::chat::ChatCompletionRequest;
use straylight_common::config::{AuthConfig, ParamLimits, ProviderRecord};
use straylight_common::context::PipelineContext;

/// Fallback output cap for capped families with no configured limit.
pub const DEFAULT_OUTPUT_CAP: u32 = 8192;

/// Default per-model cap bound for local LM Studio servers.
pub const LMSTUDIO_CAP_CEILING: u32 = 4096;

/// Everything an adapter is allowed to know, frozen at assembly.
#[derive(Debug, Clone)]
pub struct CompatPolicy {
    /// Configured provider name.
    pub provider_name: String,
    /// Upstream endpoint.
    pub endpoint: String,
    /// Credential header shape.
    pub auth: AuthConfig,
    /// Upstream timeout.
    pub timeout: Duration,
    /// Upstream retry budget.
    pub max_retries: u32,
    /// Models the provider serves.
    pub supported_models: Vec<String>,
    /// Per-model output caps.
    pub max_tokens: HashMap<String, u32>,
    /// Incoming-label to concrete-model mapping.
    pub model_mapping: HashMap<String, String>,
    /// Advertised context window.
    pub context_length: Option<u32>,
    /// Cap used when no per-model entry matches.
    pub default_max_tokens: Option<u32>,
    /// Parameter limits for derived-parameter families.
    pub param_limits: ParamLimits,
    /// Server-compatibility hint.
    pub server_compatibility: Option<String>,
    /// Project identifier for project-scoped endpoints.
    pub project: Option<String>,
    /// Whether a thinking pass is requested.
    pub enable_thinking: bool,
}

impl CompatPolicy {
    /// Freezes a policy from a provider record.
    #[must_use]
    pub fn from_record(record: &ProviderRecord) -> Self {
        Self {
            provider_name: record.name.clone(),
            endpoint: record.base_url.clone(),
            auth: record.auth.clone(),
            timeout: record.timeout(),
            max_retries: record.max_retries,
            supported_models: record.supported_models.clone(),
            max_tokens: record.max_tokens.clone(),
            model_mapping: record.model_mapping.clone(),
            context_length: record.context_length,
            default_max_tokens: record.default_max_tokens,
            param_limits: record.param_limits.unwrap_or_default(),
            server_compatibility: record.server_compatibility.clone(),
            project: record.project.clone(),
            enable_thinking: record.enable_thinking,
        }
    }

    /// Output cap for a model: per-model entry, else the configured
    /// default, else the supplied family fallback.
    #[must_use]
    pub fn output_cap(&self, model: &str, fallback: u32) -> u32 {
        self.max_tokens
            .get(model)
            .copied()
            .or(self.default_max_tokens)
            .unwrap_or(fallback)
    }
}

/// Clamps `temperature` into `[min, max]`, logging when it moves.
pub fn clamp_temperature(
    request: &mut ChatCompletionRequest,
    min: f32,
    max: f32,
    prefix: &str,
    ctx: &mut PipelineContext,
) {
    if let Some(temperature) = request.temperature {
        let clamped = temperature.clamp(min, max);
        if (clamped - temperature).abs() > f32::EPSILON {
            ctx.record_transformation(
                prefix,
                format!("{prefix}_temperature_adjusted"),
                Some(format!("{temperature} -> {clamped}")),
            );
            request.temperature = Some(clamped);
        }
    }
}

/// Clamps `top_p` into `[min, max]`, logging when it moves.
pub fn clamp_top_p(
    request: &mut ChatCompletionRequest,
    min: f32,
    max: f32,
    prefix: &str,
    ctx: &mut PipelineContext,
) {
    if let Some(top_p) = request.top_p {
        let clamped = top_p.clamp(min, max);
        if (clamped - top_p).abs() > f32::EPSILON {
            ctx.record_transformation(
                prefix,
                format!("{prefix}_top_p_adjusted"),
                Some(format!("{top_p} -> {clamped}")),
            );
            request.top_p = Some(clamped);
        }
    }
}

/// Bounds `max_tokens` by `cap`, logging when it shrinks. A missing
/// `max_tokens` is left missing; adapters never invent a budget the
/// client did not ask for.
pub fn cap_max_tokens(
    request: &mut ChatCompletionRequest,
    cap: u32,
    prefix: &str,
    ctx: &mut PipelineContext,
) {
    if let Some(max_tokens) = request.max_tokens
        && max_tokens > cap
    {
        ctx.record_transformation(
            prefix,
            format!("{prefix}_max_tokens_adjusted"),
            Some(format!("{max_tokens} -> {cap}")),
        );
        request.max_tokens = Some(cap);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use straylight_common::chat::{ChatMessage, ChatRole};

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest::builder()
            .model("m".to_string())
            .messages(vec![ChatMessage::text(ChatRole::User, "hi")])
            .temperature(Some(5.0))
            .top_p(Some(3.0))
            .max_tokens(Some(1_000_000))
            .build()
    }

    #[test]
    fn test_clamps_record_transformations() {
        let mut ctx = PipelineContext::new("s", "c");
        let mut req = request();

        clamp_temperature(&mut req, 0.01, 2.0, "deepseek", &mut ctx);
        clamp_top_p(&mut req, 0.01, 1.0, "deepseek", &mut ctx);
        cap_max_tokens(&mut req, 8192, "deepseek", &mut ctx);

        assert_eq!(req.temperature, Some(2.0));
        assert_eq!(req.top_p, Some(1.0));
        assert_eq!(req.max_tokens, Some(8192));
        assert!(ctx.has_transformation("deepseek_temperature_adjusted"));
        assert!(ctx.has_transformation("deepseek_top_p_adjusted"));
        assert!(ctx.has_transformation("deepseek_max_tokens_adjusted"));
    }

    #[test]
    fn test_clamps_are_idempotent() {
        let mut ctx = PipelineContext::new("s", "c");
        let mut req = request();

        clamp_temperature(&mut req, 0.0, 2.0, "x", &mut ctx);
        clamp_top_p(&mut req, 0.0, 1.0, "x", &mut ctx);
        cap_max_tokens(&mut req, 4096, "x", &mut ctx);
        let after_first = req.clone();
        let log_len = ctx.transformations.len();

        clamp_temperature(&mut req, 0.0, 2.0, "x", &mut ctx);
        clamp_top_p(&mut req, 0.0, 1.0, "x", &mut ctx);
        cap_max_tokens(&mut req, 4096, "x", &mut ctx);

        assert_eq!(req.temperature, after_first.temperature);
        assert_eq!(req.top_p, after_first.top_p);
        assert_eq!(req.max_tokens, after_first.max_tokens);
        // A no-op pass adds no log entries.
        assert_eq!(ctx.transformations.len(), log_len);
    }

    #[test]
    fn test_missing_max_tokens_left_missing() {
        let mut ctx = PipelineContext::new("s", "c");
        let mut req = request();
        req.max_tokens = None;
        cap_max_tokens(&mut req, 4096, "x", &mut ctx);
        assert_eq!(req.max_tokens, None);
        assert!(ctx.transformations.is_empty());
    }
}
