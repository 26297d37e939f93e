//! # straylight-router
//!
//! Maps (incoming model label, routing category) onto a concrete pipeline
//! and produces the immutable routing decision the rest of the request
//! rides on.
//!
//! Pipeline ids are a wire contract: dash-separated, `gemini-cli` is a
//! compound provider prefix, and the last segment is the key index
//! prefixed with `key`. Parsing must be bit-exact - tool-call linkage and
//! key selection depend on it.

use std::collections::HashMap;

use log::debug;

use straylight_common::config::{CoreConfig, RouterConfig};
use straylight_common::context::{RoutingCategory, RoutingDecision};
use straylight_common::error::{ErrorKind, ProxyError};
use straylight_common::messages::MessagesRequest;

/// A pipeline id decomposed into its contract segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPipelineId {
    /// Provider segment (`gemini-cli` stays compound).
    pub provider: String,
    /// Model segment.
    pub model: String,
    /// Key index from the trailing `key<N>` segment.
    pub key_index: usize,
}

/// Parses a pipeline id per the contract.
///
/// Non-Gemini ids are `<provider>-<model...>-key<N>` with the model being
/// everything between provider and key segment. Gemini-CLI ids keep the
/// compound `gemini-cli` prefix and take dash-parts `[2..4]` as the model.
///
/// # Errors
///
/// Returns a validation error when any segment is missing or malformed.
pub fn parse_pipeline_id(id: &str) -> Result<ParsedPipelineId, ProxyError> {
    let parts: Vec<&str> = id.split('-').collect();

    let invalid = |detail: &str| {
        ProxyError::validation(
            "INVALID_PIPELINE_ID",
            format!("pipeline id '{id}' {detail}"),
        )
    };

    let last = parts.last().ok_or_else(|| invalid("is empty"))?;
    let key_index: usize = last
        .strip_prefix("key")
        .and_then(|n| n.parse().ok())
        .ok_or_else(|| invalid("does not end in key<N>"))?;

    if parts.len() >= 2 && parts[0] == "gemini" && parts[1] == "cli" {
        if parts.len() < 5 {
            return Err(invalid("is too short for a gemini-cli id"));
        }
        return Ok(ParsedPipelineId {
            provider: "gemini-cli".to_string(),
            model: parts[2..4].join("-"),
            key_index,
        });
    }

    if parts.len() < 3 {
        return Err(invalid("needs provider, model, and key segments"));
    }
    Ok(ParsedPipelineId {
        provider: parts[0].to_string(),
        model: parts[1..parts.len() - 1].join("-"),
        key_index,
    })
}

/// Routing table plus the category classifier.
#[derive(Debug)]
pub struct Router {
    routes: HashMap<(String, RoutingCategory), Vec<String>>,
    long_context_threshold: usize,
}

impl Router {
    /// Builds the router from its configuration table.
    #[must_use]
    pub fn from_config(config: &RouterConfig) -> Self {
        let mut routes = HashMap::new();
        for rule in &config.routes {
            routes.insert((rule.label.clone(), rule.category), rule.pipelines.clone());
        }
        Self {
            routes,
            long_context_threshold: config.long_context_threshold,
        }
    }

    /// Classifies a request into a routing category.
    ///
    /// Explicit `metadata.category` wins, then a thinking ask classifies
    /// as reasoning, then the token-count heuristic as long-context.
    #[must_use]
    pub fn classify(&self, request: &MessagesRequest) -> RoutingCategory {
        if let Some(explicit) = request
            .metadata
            .get("category")
            .and_then(serde_json::Value::as_str)
        {
            match explicit {
                "reasoning" => return RoutingCategory::Reasoning,
                "longContext" => return RoutingCategory::LongContext,
                "webSearch" => return RoutingCategory::WebSearch,
                "background" => return RoutingCategory::Background,
                _ => return RoutingCategory::Default,
            }
        }
        if request.thinking.is_some() {
            return RoutingCategory::Reasoning;
        }
        if request.estimated_tokens() > self.long_context_threshold {
            return RoutingCategory::LongContext;
        }
        RoutingCategory::Default
    }

    /// The eligible pipeline set for a (label, category), falling back to
    /// the label's default-category rule.
    fn eligible(&self, label: &str, category: RoutingCategory) -> Option<(&[String], bool)> {
        if let Some(pipelines) = self.routes.get(&(label.to_string(), category)) {
            return Some((pipelines.as_slice(), false));
        }
        self.routes
            .get(&(label.to_string(), RoutingCategory::Default))
            .map(|pipelines| (pipelines.as_slice(), true))
    }

    /// Computes the routing decision for a request.
    ///
    /// Picks the first pipeline the health view reports healthy from the
    /// eligible set, then resolves provider, model, key, and endpoint off
    /// the pipeline id and the provider record.
    ///
    /// # Errors
    ///
    /// `no_healthy_pipeline` when no rule matches or every eligible
    /// pipeline is unhealthy; a validation error when the chosen pipeline
    /// id or its provider record is malformed.
    pub fn route<F>(
        &self,
        request: &MessagesRequest,
        config: &CoreConfig,
        is_healthy: F,
    ) -> Result<RoutingDecision, ProxyError>
    where
        F: Fn(&str) -> bool,
    {
        let category = self.classify(request);
        let label = request.model.as_str();

        let Some((eligible, fell_back)) = self.eligible(label, category) else {
            return Err(ProxyError::new(
                ErrorKind::NoHealthyPipeline,
                format!("no route configured for model label '{label}'"),
            ));
        };

        let pipeline_id = eligible
            .iter()
            .find(|id| is_healthy(id.as_str()))
            .ok_or_else(|| {
                ProxyError::new(
                    ErrorKind::NoHealthyPipeline,
                    format!(
                        "all {} eligible pipelines for '{label}' ({category}) are unhealthy",
                        eligible.len()
                    ),
                )
            })?;

        let parsed = parse_pipeline_id(pipeline_id)?;

        let record = config
            .providers
            .iter()
            .find(|p| p.name == parsed.provider)
            .ok_or_else(|| {
                ProxyError::validation(
                    "UNKNOWN_PROVIDER",
                    format!(
                        "pipeline '{pipeline_id}' names unconfigured provider '{}'",
                        parsed.provider
                    ),
                )
            })?;

        let api_key = record.keys().get(parsed.key_index).cloned();

        let reasoning = if fell_back {
            format!(
                "label '{label}' classified {category}; no rule for that category, fell back to default; selected '{pipeline_id}'"
            )
        } else {
            format!("label '{label}' classified {category}; selected '{pipeline_id}'")
        };
        debug!("{reasoning}");

        Ok(RoutingDecision {
            original_model: request.model.clone(),
            mapped_model: parsed.model,
            provider_type: record.family.as_str().to_string(),
            provider_name: record.name.clone(),
            pipeline_id: pipeline_id.clone(),
            key_index: parsed.key_index,
            server_compatibility: record.server_compatibility.clone(),
            endpoint: record.base_url.clone(),
            api_key,
            timeout: record.timeout(),
            max_retries: record.max_retries,
            reasoning,
            category,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use straylight_common::messages::{ClientMessage, ClientRole};

    fn config() -> CoreConfig {
        toml::from_str(
            r#"
[[providers]]
name = "lmstudio"
family = "lmstudio"
base_url = "http://localhost:1234/v1"
supported_models = ["llama-3.1-8b-instruct"]

[[providers]]
name = "deepseek"
family = "deepseek"
base_url = "https://api.deepseek.com/v1"
api_keys = ["sk-a", "sk-b"]
supported_models = ["deepseek-chat"]

[[router.routes]]
label = "claude-3-5-sonnet"
pipelines = [
  "lmstudio-llama-3.1-8b-instruct-key0",
  "deepseek-deepseek-chat-key0",
]

[[router.routes]]
label = "claude-3-5-sonnet"
category = "reasoning"
pipelines = ["deepseek-deepseek-chat-key1"]
"#,
        )
        .unwrap()
    }

    fn request(model: &str) -> MessagesRequest {
        MessagesRequest::builder()
            .model(model.to_string())
            .messages(vec![ClientMessage::text(ClientRole::User, "hello")])
            .build()
    }

    #[test]
    fn test_parse_plain_id() {
        let parsed = parse_pipeline_id("lmstudio-llama-3.1-8b-instruct-key0").unwrap();
        assert_eq!(parsed.provider, "lmstudio");
        assert_eq!(parsed.model, "llama-3.1-8b-instruct");
        assert_eq!(parsed.key_index, 0);
    }

    #[test]
    fn test_parse_gemini_cli_id() {
        let parsed = parse_pipeline_id("gemini-cli-gemini-pro-key2").unwrap();
        assert_eq!(parsed.provider, "gemini-cli");
        assert_eq!(parsed.model, "gemini-pro");
        assert_eq!(parsed.key_index, 2);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_pipeline_id("").is_err());
        assert!(parse_pipeline_id("lmstudio-model").is_err());
        assert!(parse_pipeline_id("lmstudio-model-keyx").is_err());
        assert!(parse_pipeline_id("gemini-cli-key0").is_err());
        assert!(parse_pipeline_id("p-key0").is_err());
    }

    #[test]
    fn test_classification() {
        let config = config();
        let router = Router::from_config(&config.router);

        assert_eq!(
            router.classify(&request("claude-3-5-sonnet")),
            RoutingCategory::Default
        );

        let mut thinking = request("claude-3-5-sonnet");
        thinking.thinking = Some(serde_json::json!({"budget_tokens": 1024}));
        assert_eq!(router.classify(&thinking), RoutingCategory::Reasoning);

        let mut long = request("claude-3-5-sonnet");
        long.messages = vec![ClientMessage::text(ClientRole::User, "x".repeat(500_000))];
        assert_eq!(router.classify(&long), RoutingCategory::LongContext);

        let mut explicit = request("claude-3-5-sonnet");
        explicit
            .metadata
            .insert("category".to_string(), serde_json::json!("background"));
        assert_eq!(router.classify(&explicit), RoutingCategory::Background);
    }

    #[test]
    fn test_first_healthy_wins() {
        let config = config();
        let router = Router::from_config(&config.router);

        let decision = router
            .route(&request("claude-3-5-sonnet"), &config, |_| true)
            .unwrap();
        assert_eq!(decision.pipeline_id, "lmstudio-llama-3.1-8b-instruct-key0");
        assert_eq!(decision.provider_name, "lmstudio");
        assert_eq!(decision.mapped_model, "llama-3.1-8b-instruct");
        assert_eq!(decision.category, RoutingCategory::Default);

        // First unhealthy: fall through to the second.
        let decision = router
            .route(&request("claude-3-5-sonnet"), &config, |id| {
                !id.starts_with("lmstudio")
            })
            .unwrap();
        assert_eq!(decision.pipeline_id, "deepseek-deepseek-chat-key0");
        assert_eq!(decision.key_index, 0);
        assert!(decision.api_key.is_some());
    }

    #[test]
    fn test_no_healthy_pipeline() {
        let config = config();
        let router = Router::from_config(&config.router);

        let err = router
            .route(&request("claude-3-5-sonnet"), &config, |_| false)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoHealthyPipeline);

        let err = router
            .route(&request("unrouted-model"), &config, |_| true)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoHealthyPipeline);
    }

    #[test]
    fn test_reasoning_category_routes_to_its_rule() {
        let config = config();
        let router = Router::from_config(&config.router);

        let mut req = request("claude-3-5-sonnet");
        req.thinking = Some(serde_json::json!({"budget_tokens": 2048}));

        let decision = router.route(&req, &config, |_| true).unwrap();
        assert_eq!(decision.pipeline_id, "deepseek-deepseek-chat-key1");
        assert_eq!(decision.key_index, 1);
        assert_eq!(decision.category, RoutingCategory::Reasoning);
    }

    #[test]
    fn test_category_without_rule_falls_back_to_default() {
        let config = config();
        let router = Router::from_config(&config.router);

        let mut req = request("claude-3-5-sonnet");
        req.metadata
            .insert("category".to_string(), serde_json::json!("webSearch"));

        let decision = router.route(&req, &config, |_| true).unwrap();
        assert_eq!(decision.pipeline_id, "lmstudio-llama-3.1-8b-instruct-key0");
        assert!(decision.reasoning.contains("fell back to default"));
    }

    #[test]
    fn test_decision_is_immutable_on_context() {
        use straylight_common::context::PipelineContext;

        let config = config();
        let router = Router::from_config(&config.router);
        let decision = router
            .route(&request("claude-3-5-sonnet"), &config, |_| true)
            .unwrap();

        let mut ctx = PipelineContext::new("s", "c");
        ctx.set_routing(decision.clone()).unwrap();
        assert!(ctx.set_routing(decision).is_err());
    }
}
