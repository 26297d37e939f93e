//! Per-request pipeline context and the routing decision.
//!
//! The context is owned by the runner for the duration of one request and
//! never shared across requests. Every lossy or defaulting rewrite any
//! stage performs must be appended to the transformations log.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, ProxyError};

/// Routing categories a request can classify into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RoutingCategory {
    /// Ordinary chat traffic.
    #[default]
    Default,
    /// Requests carrying an extended-thinking ask.
    Reasoning,
    /// Requests whose prompt exceeds the long-context threshold.
    LongContext,
    /// Requests that want web-search-capable models.
    WebSearch,
    /// Low-priority background traffic.
    Background,
}

impl RoutingCategory {
    /// Wire name of the category.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Reasoning => "reasoning",
            Self::LongContext => "longContext",
            Self::WebSearch => "webSearch",
            Self::Background => "background",
        }
    }
}

impl std::fmt::Display for RoutingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The immutable record identifying which pipeline handles one request.
///
/// Computed once per request by the router; the context enforces the
/// write-once discipline.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Model label the client sent.
    pub original_model: String,
    /// Concrete model the upstream will see.
    pub mapped_model: String,
    /// Provider family tag ("openai-compat", "gemini", ...).
    pub provider_type: String,
    /// Configured provider name.
    pub provider_name: String,
    /// The selected pipeline id (`provider-model-keyN`).
    pub pipeline_id: String,
    /// Which key of the provider's ring this pipeline uses.
    pub key_index: usize,
    /// Server-compatibility hint from the provider record.
    pub server_compatibility: Option<String>,
    /// Upstream endpoint.
    pub endpoint: String,
    /// Credential for this request.
    pub api_key: Option<SecretString>,
    /// Per-request upstream timeout.
    pub timeout: Duration,
    /// Upstream retry budget.
    pub max_retries: u32,
    /// Why the router made this choice.
    pub reasoning: String,
    /// Classified category.
    pub category: RoutingCategory,
}

/// Which way a stage was traversed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageDirection {
    /// Client-to-upstream leg.
    Request,
    /// Upstream-to-client leg.
    Response,
}

/// Elapsed time for one stage traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTiming {
    /// Module id.
    pub module: String,
    /// Traversal direction.
    pub direction: StageDirection,
    /// Elapsed wall-clock time.
    pub elapsed: Duration,
}

/// One entry in the append-only transformations log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transformation {
    /// Module that performed the rewrite.
    pub stage: String,
    /// Short machine-readable kind (`deepseek_max_tokens_adjusted`, ...).
    pub kind: String,
    /// Optional human-readable detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One entry in the append-only errors log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Module that raised the error.
    pub module: String,
    /// Taxonomy category.
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
    /// When the error was recorded.
    pub at: DateTime<Utc>,
}

/// Per-request carrier of identity, timings, and rewrite history.
#[derive(Debug)]
pub struct PipelineContext {
    /// Unique request id.
    pub request_id: Uuid,
    /// When the request entered the core.
    pub started_at: DateTime<Utc>,
    /// Stable per-caller key.
    pub session_key: String,
    /// Stable per-dialogue key inside the session.
    pub conversation_key: String,
    routing: Option<RoutingDecision>,
    /// Ordered per-stage timings.
    pub timings: Vec<StageTiming>,
    /// Append-only record of lossy or defaulting rewrites.
    pub transformations: Vec<Transformation>,
    /// Append-only record of failures.
    pub errors: Vec<ErrorRecord>,
    /// Free-form metadata threading protocol config down the chain.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PipelineContext {
    /// Creates a context for a freshly enqueued request.
    pub fn new(session_key: impl Into<String>, conversation_key: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            started_at: Utc::now(),
            session_key: session_key.into(),
            conversation_key: conversation_key.into(),
            routing: None,
            timings: Vec::new(),
            transformations: Vec::new(),
            errors: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Installs the routing decision. Write-once.
    ///
    /// # Errors
    ///
    /// Returns a `validation_error` if a decision was already installed;
    /// the routing decision is immutable for the remainder of the request.
    pub fn set_routing(&mut self, decision: RoutingDecision) -> Result<(), ProxyError> {
        if self.routing.is_some() {
            return Err(ProxyError::validation(
                "ROUTING_ALREADY_SET",
                "routing decision is immutable once computed",
            ));
        }
        self.routing = Some(decision);
        Ok(())
    }

    /// The routing decision, once computed.
    #[must_use]
    pub const fn routing(&self) -> Option<&RoutingDecision> {
        self.routing.as_ref()
    }

    /// Appends a transformation entry.
    pub fn record_transformation(
        &mut self,
        stage: impl Into<String>,
        kind: impl Into<String>,
        detail: Option<String>,
    ) {
        self.transformations.push(Transformation {
            stage: stage.into(),
            kind: kind.into(),
            detail,
        });
    }

    /// Appends a stage timing.
    pub fn record_timing(
        &mut self,
        module: impl Into<String>,
        direction: StageDirection,
        elapsed: Duration,
    ) {
        self.timings.push(StageTiming {
            module: module.into(),
            direction,
            elapsed,
        });
    }

    /// Appends an error record.
    pub fn record_error(&mut self, error: &ProxyError) {
        self.errors.push(ErrorRecord {
            module: error.module.clone().unwrap_or_else(|| "unknown".to_string()),
            kind: error.kind,
            message: error.message.clone(),
            at: Utc::now(),
        });
    }

    /// Whether the transformations log contains an entry of the given kind.
    #[must_use]
    pub fn has_transformation(&self, kind: &str) -> bool {
        self.transformations.iter().any(|t| t.kind == kind)
    }
}
