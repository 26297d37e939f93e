//! The configuration object the core consumes.
//!
//! The core does not load files; the out-of-scope front-end hands it a
//! deserialized [`CoreConfig`]. `validate()` runs once before assembly,
//! after which every module is sealed.

use std::collections::HashMap;
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::context::RoutingCategory;

/// Provider families the compat layer knows how to speak to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderFamily {
    /// Generic OpenAI-compatible endpoint.
    OpenaiCompat,
    /// DeepSeek-style endpoint (tool_choice defaulting, tight clamps).
    Deepseek,
    /// LM Studio local server.
    Lmstudio,
    /// Ollama local server (no tool support).
    Ollama,
    /// vLLM server (repetition penalty dialect).
    Vllm,
    /// iFlow endpoint (derived top_k, custom auth header).
    Iflow,
    /// Gemini-native JSON endpoint.
    Gemini,
}

impl ProviderFamily {
    /// Stable tag used in pipeline ids and routing decisions.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenaiCompat => "openai-compat",
            Self::Deepseek => "deepseek",
            Self::Lmstudio => "lmstudio",
            Self::Ollama => "ollama",
            Self::Vllm => "vllm",
            Self::Iflow => "iflow",
            Self::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key selection strategy when a provider has multiple keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyStrategy {
    /// Advance a shared cursor per request.
    #[default]
    RoundRobin,
    /// Pick uniformly at random per request.
    Random,
}

/// How credentials are attached to upstream requests.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Header the credential is sent in.
    #[serde(default = "default_auth_header")]
    pub header: String,
    /// Value template; `{key}` is replaced by the credential.
    #[serde(default = "default_auth_format")]
    pub format: String,
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_auth_format() -> String {
    "Bearer {key}".to_string()
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            header: default_auth_header(),
            format: default_auth_format(),
        }
    }
}

impl AuthConfig {
    /// Renders the header value for a concrete key.
    #[must_use]
    pub fn render(&self, key: &str) -> String {
        self.format.replace("{key}", key)
    }
}

/// Sampling-parameter limits a provider enforces.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ParamLimits {
    /// Minimum temperature.
    #[serde(default)]
    pub temperature_min: f32,
    /// Maximum temperature.
    #[serde(default = "default_temperature_max")]
    pub temperature_max: f32,
    /// Minimum derived top_k.
    #[serde(default = "default_top_k_min")]
    pub top_k_min: u32,
    /// Maximum derived top_k.
    #[serde(default = "default_top_k_max")]
    pub top_k_max: u32,
}

const fn default_temperature_max() -> f32 {
    2.0
}

const fn default_top_k_min() -> u32 {
    1
}

const fn default_top_k_max() -> u32 {
    100
}

impl Default for ParamLimits {
    fn default() -> Self {
        Self {
            temperature_min: 0.0,
            temperature_max: default_temperature_max(),
            top_k_min: default_top_k_min(),
            top_k_max: default_top_k_max(),
        }
    }
}

/// One configured upstream provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderRecord {
    /// Unique provider name; the first segment of its pipeline ids.
    pub name: String,
    /// Which compat family speaks to this provider.
    pub family: ProviderFamily,
    /// API base URL.
    pub base_url: String,
    /// Single credential.
    #[serde(default)]
    pub api_key: Option<SecretString>,
    /// Credential set; rotated per `key_strategy`.
    #[serde(default)]
    pub api_keys: Option<Vec<SecretString>>,
    /// Rotation strategy when multiple keys are configured.
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    /// Credential header shape.
    #[serde(default)]
    pub auth: AuthConfig,
    /// Skip the credential probe at startup.
    #[serde(default)]
    pub skip_authentication: bool,
    /// Models this provider serves.
    #[serde(default)]
    pub supported_models: Vec<String>,
    /// Per-model output-token caps.
    #[serde(default)]
    pub max_tokens: HashMap<String, u32>,
    /// Incoming-label to concrete-model mapping.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Server-compatibility hint forwarded on the routing decision.
    #[serde(default)]
    pub server_compatibility: Option<String>,
    /// Advertised context window (drives the LM Studio default cap).
    #[serde(default)]
    pub context_length: Option<u32>,
    /// Upstream timeout in seconds.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Upstream retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Project identifier for project-scoped endpoints.
    #[serde(default)]
    pub project: Option<String>,
    /// Parameter limits (iFlow-style providers).
    #[serde(default)]
    pub param_limits: Option<ParamLimits>,
    /// Output-token cap applied when no per-model cap matches.
    #[serde(default)]
    pub default_max_tokens: Option<u32>,
    /// Ask for a thinking pass where the family supports one.
    #[serde(default)]
    pub enable_thinking: bool,
}

const fn default_timeout_seconds() -> u64 {
    60
}

// Transport-level retries are opt-in; by default only auth-driven key
// rotation retries a request.
const fn default_max_retries() -> u32 {
    0
}

impl ProviderRecord {
    /// The full key set: `api_keys` when present, else the single key.
    #[must_use]
    pub fn keys(&self) -> Vec<SecretString> {
        match (&self.api_keys, &self.api_key) {
            (Some(keys), _) if !keys.is_empty() => keys.clone(),
            (_, Some(key)) => vec![key.clone()],
            _ => Vec::new(),
        }
    }

    /// Upstream timeout as a `Duration`.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Output-token cap for a concrete model, if configured.
    #[must_use]
    pub fn model_cap(&self, model: &str) -> Option<u32> {
        self.max_tokens.get(model).copied()
    }
}

/// One routing rule: (label, category) selects an ordered pipeline-id set.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteRule {
    /// Incoming model label.
    pub label: String,
    /// Category the rule applies to.
    #[serde(default)]
    pub category: RoutingCategory,
    /// Eligible pipeline ids, in preference order.
    pub pipelines: Vec<String>,
}

/// The routing table plus classification knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct RouterConfig {
    /// Routing rules.
    pub routes: Vec<RouteRule>,
    /// Token estimate above which a request classifies as long-context.
    #[serde(default = "default_long_context_threshold")]
    pub long_context_threshold: usize,
}

const fn default_long_context_threshold() -> usize {
    60_000
}

/// Protocol-level policy knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolSettings {
    /// Whether stream requests are collapsed to non-stream.
    #[serde(default = "default_true")]
    pub stream_conversion: bool,
    /// Whether structural validation runs.
    #[serde(default = "default_true")]
    pub validation: bool,
    /// Serialized-payload byte limit.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Worker pool bound.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    /// Per-request deadline in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Retry budget for upstream dispatch.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

const fn default_true() -> bool {
    true
}

const fn default_max_request_size() -> usize {
    10 * 1024 * 1024
}

const fn default_concurrency_limit() -> usize {
    16
}

const fn default_request_timeout() -> u64 {
    300
}

const fn default_retry_delay_ms() -> u64 {
    500
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        Self {
            stream_conversion: true,
            validation: true,
            max_request_size: default_max_request_size(),
            concurrency_limit: default_concurrency_limit(),
            request_timeout_seconds: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl ProtocolSettings {
    /// Per-request deadline as a `Duration`.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// The full configuration object consumed at assembly.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Configured providers.
    pub providers: Vec<ProviderRecord>,
    /// The routing table.
    pub router: RouterConfig,
    /// Protocol policy knobs.
    #[serde(default)]
    pub protocol: ProtocolSettings,
}

impl CoreConfig {
    /// Validates the configuration before assembly.
    ///
    /// # Errors
    ///
    /// Returns a message naming the first problem found: no providers,
    /// duplicate provider names, a provider without credentials or models
    /// where the family requires them, or a route naming no pipelines.
    pub fn validate(&self) -> Result<(), String> {
        if self.providers.is_empty() {
            return Err("no providers defined in configuration".to_string());
        }

        let mut seen = HashMap::new();
        for provider in &self.providers {
            if let Some(existing) = seen.insert(&provider.name, provider.family) {
                return Err(format!(
                    "duplicate provider name '{}' (families: {existing}, {})",
                    provider.name, provider.family
                ));
            }
            if provider.base_url.is_empty() {
                return Err(format!("provider '{}' has an empty base_url", provider.name));
            }
            if provider.supported_models.is_empty() {
                return Err(format!(
                    "provider '{}' declares no supported models",
                    provider.name
                ));
            }
        }

        for rule in &self.router.routes {
            if rule.pipelines.is_empty() {
                return Err(format!(
                    "route for label '{}' category '{}' names no pipelines",
                    rule.label, rule.category
                ));
            }
        }

        Ok(())
    }

    /// Looks up a provider record by name.
    #[must_use]
    pub fn provider(&self, name: &str) -> Option<&ProviderRecord> {
        self.providers.iter().find(|p| p.name == name)
    }
}
