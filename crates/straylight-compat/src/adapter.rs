//! The per-provider compatibility adapter.
//!
//! One adapter per provider family, built once from the provider record
//! and sealed. Dispatch is a tagged-variant match on the family - no
//! inheritance chain, no per-request state.

use log::warn;

use straylight_common::config::{ProviderFamily, ProviderRecord};
use straylight_common::context::{PipelineContext, RoutingDecision};
use straylight_common::error::{ProtocolViolation, ProxyError};
use straylight_common::payload::Payload;

use crate::policy::CompatPolicy;
use crate::{deepseek, errors, gemini, generic, iflow, lmstudio, ollama, repair, vllm};

/// A pre-configured server-compat adapter for one provider family.
#[derive(Debug, Clone)]
pub struct CompatAdapter {
    family: ProviderFamily,
    policy: CompatPolicy,
}

impl CompatAdapter {
    /// Builds the adapter for a provider record. Every policy knob is
    /// frozen here.
    #[must_use]
    pub fn from_record(record: &ProviderRecord) -> Self {
        Self {
            family: record.family,
            policy: CompatPolicy::from_record(record),
        }
    }

    /// The family this adapter speaks.
    #[must_use]
    pub const fn family(&self) -> ProviderFamily {
        self.family
    }

    /// The frozen policy.
    #[must_use]
    pub const fn policy(&self) -> &CompatPolicy {
        &self.policy
    }

    /// Runtime reconfiguration is rejected; the existing configuration is
    /// retained. Reconfiguration is a full rebuild from the config source.
    pub fn configure(&self, _settings: &serde_json::Value) {
        warn!(
            "ignoring runtime configure() on sealed {} adapter for '{}'",
            self.family, self.policy.provider_name
        );
    }

    /// Applies the family's request policy.
    ///
    /// Accepts the OpenAI-family request shape; the Gemini family rewrites
    /// it into the native generative shape, everything else returns the
    /// same shape with parameters clamped and tools normalized.
    ///
    /// # Errors
    ///
    /// Returns an unsupported-format protocol error for any other payload
    /// variant, or whatever the family policy raises.
    pub fn process_request(
        &self,
        payload: Payload,
        decision: &RoutingDecision,
        ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError> {
        let Payload::ChatRequest(mut request) = payload else {
            return Err(ProxyError::protocol(
                ProtocolViolation::UnsupportedRequestFormat,
                format!(
                    "compat adapter expected a chat request, got {}",
                    payload.kind_name()
                ),
            ));
        };

        match self.family {
            ProviderFamily::OpenaiCompat => {
                generic::apply(&mut request, &self.policy, decision, ctx)?;
                Ok(Payload::ChatRequest(request))
            }
            ProviderFamily::Deepseek => {
                deepseek::apply(&mut request, &self.policy, decision, ctx)?;
                Ok(Payload::ChatRequest(request))
            }
            ProviderFamily::Lmstudio => {
                lmstudio::apply(&mut request, &self.policy, decision, ctx)?;
                Ok(Payload::ChatRequest(request))
            }
            ProviderFamily::Ollama => {
                ollama::apply(&mut request, &self.policy, decision, ctx)?;
                Ok(Payload::ChatRequest(request))
            }
            ProviderFamily::Vllm => {
                vllm::apply(&mut request, &self.policy, decision, ctx)?;
                Ok(Payload::ChatRequest(request))
            }
            ProviderFamily::Iflow => {
                iflow::apply(&mut request, &self.policy, decision, ctx)?;
                Ok(Payload::ChatRequest(request))
            }
            ProviderFamily::Gemini => {
                let generative =
                    gemini::request_to_generative(&request, &self.policy, decision, ctx)?;
                Ok(Payload::GenerativeRequest(generative))
            }
        }
    }

    /// Normalizes the upstream's response into a canonical chat
    /// completion, filling missing fields deterministically.
    ///
    /// # Errors
    ///
    /// Returns an unsupported-format protocol error for payload variants
    /// no family produces, or a repair failure.
    pub fn process_response(
        &self,
        payload: Payload,
        decision: &RoutingDecision,
        ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError> {
        let value = match payload {
            // Already canonical; repair is a no-op on it but still runs so
            // the invariants hold regardless of which upstream produced it.
            Payload::ChatResponse(response) => serde_json::to_value(response).map_err(|e| {
                ProxyError::protocol(
                    ProtocolViolation::UnsupportedResponseFormat,
                    format!("response failed to reserialize: {e}"),
                )
            })?,
            Payload::GenerativeResponse(response) => {
                let chat = gemini::response_to_chat(&response, &self.policy, decision, ctx)?;
                return Ok(Payload::ChatResponse(chat));
            }
            Payload::Raw(value) => value,
            other => {
                return Err(ProxyError::protocol(
                    ProtocolViolation::UnsupportedResponseFormat,
                    format!(
                        "compat adapter expected an upstream response, got {}",
                        other.kind_name()
                    ),
                ));
            }
        };

        let mut value = value;

        if self.family == ProviderFamily::Gemini
            && let Ok(generative) =
                serde_json::from_value::<straylight_common::GenerateResponse>(value.clone())
        {
            let chat = gemini::response_to_chat(&generative, &self.policy, decision, ctx)?;
            return Ok(Payload::ChatResponse(chat));
        }

        if self.family == ProviderFamily::Ollama
            && let Some(rewritten) = repair::rewrite_ollama(&value, ctx)
        {
            value = rewritten;
        }

        if self.family == ProviderFamily::Deepseek {
            repair::strip_thinking(&mut value, ctx);
        }

        let response = repair::repair(value, &self.policy.provider_name, ctx)?;
        Ok(Payload::ChatResponse(response))
    }

    /// Normalizes an upstream failure per the family's error policy.
    #[must_use]
    pub fn map_error(&self, error: ProxyError) -> ProxyError {
        errors::normalize(error, &self.policy.provider_name)
    }
}
