//! Concrete stage modules wrapping the codec, protocol, compat, and
//! upstream components behind the uniform module surface.
//!
//! Stage order inside a pipeline is always
//! validator -> dialect codec -> protocol controller -> compat adapter ->
//! upstream client; the response leg traverses the same modules in
//! reverse.

use std::sync::Arc;

use async_trait::async_trait;

use straylight_codec::ProtocolController;
use straylight_common::context::PipelineContext;
use straylight_common::error::{ProtocolViolation, ProxyError};
use straylight_common::payload::Payload;
use straylight_compat::CompatAdapter;
use straylight_upstream::UpstreamClient;

use crate::module::{ModuleCore, ModuleHealth, ModuleIdentity, ModuleKind, PipelineModule};

fn routing_error() -> ProxyError {
    ProxyError::validation(
        "ROUTING_MISSING",
        "pipeline executed without a routing decision on the context",
    )
}

/// Leading stage: structural validation of the ingress request.
pub struct ValidatorStage {
    core: ModuleCore,
    controller: ProtocolController,
}

impl ValidatorStage {
    /// Builds the validator for one pipeline.
    #[must_use]
    pub fn new(pipeline_id: &str, controller: ProtocolController) -> Self {
        Self {
            core: ModuleCore::new(ModuleIdentity::new(
                format!("{pipeline_id}.validator"),
                "Request validator",
                ModuleKind::Validator,
            )),
            controller,
        }
    }
}

#[async_trait]
impl PipelineModule for ValidatorStage {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    async fn process_request(
        &self,
        payload: Payload,
        _ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError> {
        let Payload::ClientRequest(request) = payload else {
            return Err(ProxyError::protocol(
                ProtocolViolation::UnsupportedRequestFormat,
                format!("validator expected a client request, got {}", payload.kind_name()),
            ));
        };
        let value = serde_json::to_value(&request).map_err(|e| {
            ProxyError::protocol(
                ProtocolViolation::UnsupportedRequestFormat,
                format!("request failed to serialize: {e}"),
            )
        })?;
        self.controller.validate_request(&value)?;
        Ok(Payload::ClientRequest(request))
    }
}

/// Second stage: client dialect to OpenAI-family translation.
pub struct CodecStage {
    core: ModuleCore,
}

impl CodecStage {
    /// Builds the codec stage for one pipeline.
    #[must_use]
    pub fn new(pipeline_id: &str) -> Self {
        Self {
            core: ModuleCore::new(ModuleIdentity::new(
                format!("{pipeline_id}.codec"),
                "Dialect codec",
                ModuleKind::DialectCodec,
            )),
        }
    }
}

#[async_trait]
impl PipelineModule for CodecStage {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    async fn process_request(
        &self,
        payload: Payload,
        ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError> {
        let Payload::ClientRequest(request) = payload else {
            return Err(ProxyError::protocol(
                ProtocolViolation::UnsupportedRequestFormat,
                format!("codec expected a client request, got {}", payload.kind_name()),
            ));
        };
        let target_model = ctx
            .routing()
            .map(|d| d.mapped_model.clone())
            .ok_or_else(routing_error)?;
        let chat = straylight_codec::request_to_chat(&request, &target_model, ctx)?;
        Ok(Payload::ChatRequest(chat))
    }

    async fn process_response(
        &self,
        payload: Payload,
        ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError> {
        let Payload::ChatResponse(response) = payload else {
            return Err(ProxyError::protocol(
                ProtocolViolation::UnsupportedResponseFormat,
                format!("codec expected a chat response, got {}", payload.kind_name()),
            ));
        };
        let reply = straylight_codec::response_to_messages(&response, ctx)?;
        Ok(Payload::ClientResponse(reply))
    }
}

/// Third stage: stream collapse on the way out, aggregation and response
/// validation on the way back.
pub struct ProtocolStage {
    core: ModuleCore,
    controller: ProtocolController,
}

impl ProtocolStage {
    /// Builds the protocol stage for one pipeline.
    #[must_use]
    pub fn new(pipeline_id: &str, controller: ProtocolController) -> Self {
        Self {
            core: ModuleCore::new(ModuleIdentity::new(
                format!("{pipeline_id}.protocol"),
                "Protocol controller",
                ModuleKind::ProtocolController,
            )),
            controller,
        }
    }
}

#[async_trait]
impl PipelineModule for ProtocolStage {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    async fn process_request(
        &self,
        payload: Payload,
        ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError> {
        let Payload::ChatRequest(request) = payload else {
            return Err(ProxyError::protocol(
                ProtocolViolation::UnsupportedRequestFormat,
                format!("protocol expected a chat request, got {}", payload.kind_name()),
            ));
        };
        if request.stream == Some(true) {
            ctx.metadata
                .insert("originalStream".to_string(), serde_json::Value::Bool(true));
        }
        let rewritten = self.controller.to_non_streaming(&request, ctx);
        Ok(Payload::ChatRequest(rewritten))
    }

    async fn process_response(
        &self,
        payload: Payload,
        _ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError> {
        let response = match payload {
            Payload::Chunks(chunks) => self.controller.aggregate_chunks(&chunks)?,
            Payload::ChatResponse(response) => response,
            other => {
                return Err(ProxyError::protocol(
                    ProtocolViolation::UnsupportedResponseFormat,
                    format!("protocol expected a response, got {}", other.kind_name()),
                ));
            }
        };
        let value = serde_json::to_value(&response).map_err(|e| {
            ProxyError::protocol(
                ProtocolViolation::UnsupportedResponseFormat,
                format!("response failed to serialize: {e}"),
            )
        })?;
        self.controller.validate_response(&value)?;
        Ok(Payload::ChatResponse(response))
    }
}

/// Fourth stage: provider-specific compatibility.
pub struct CompatStage {
    core: ModuleCore,
    adapter: CompatAdapter,
}

impl CompatStage {
    /// Builds the compat stage for one pipeline.
    #[must_use]
    pub fn new(pipeline_id: &str, adapter: CompatAdapter) -> Self {
        Self {
            core: ModuleCore::new(ModuleIdentity::new(
                format!("{pipeline_id}.compat"),
                "Server-compat adapter",
                ModuleKind::CompatAdapter,
            )),
            adapter,
        }
    }
}

#[async_trait]
impl PipelineModule for CompatStage {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    async fn process_request(
        &self,
        payload: Payload,
        ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError> {
        let decision = ctx.routing().cloned().ok_or_else(routing_error)?;
        self.adapter.process_request(payload, &decision, ctx)
    }

    async fn process_response(
        &self,
        payload: Payload,
        ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError> {
        let decision = ctx.routing().cloned().ok_or_else(routing_error)?;
        self.adapter.process_response(payload, &decision, ctx)
    }

    fn map_error(&self, error: ProxyError) -> ProxyError {
        self.adapter.map_error(error)
    }
}

/// Final stage: HTTPS dispatch to the concrete upstream.
pub struct UpstreamStage {
    core: ModuleCore,
    client: Arc<UpstreamClient>,
}

impl UpstreamStage {
    /// Builds the upstream stage for one pipeline.
    #[must_use]
    pub fn new(pipeline_id: &str, client: Arc<UpstreamClient>) -> Self {
        Self {
            core: ModuleCore::new(ModuleIdentity::new(
                format!("{pipeline_id}.upstream"),
                "Upstream client",
                ModuleKind::UpstreamClient,
            )),
            client,
        }
    }

    /// The shared upstream client.
    #[must_use]
    pub fn client(&self) -> &Arc<UpstreamClient> {
        &self.client
    }
}

#[async_trait]
impl PipelineModule for UpstreamStage {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    async fn start(&self) -> Result<(), ProxyError> {
        self.client.authenticate().await?;
        self.core().set_status(crate::module::ModuleStatus::Running);
        Ok(())
    }

    async fn health_check(&self) -> ModuleHealth {
        if self.status() != crate::module::ModuleStatus::Running {
            return ModuleHealth::Unhealthy;
        }
        if self.client.health_check().await {
            ModuleHealth::Healthy
        } else {
            ModuleHealth::Unhealthy
        }
    }

    async fn process_request(
        &self,
        payload: Payload,
        _ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError> {
        self.client.process(payload).await
    }
}
