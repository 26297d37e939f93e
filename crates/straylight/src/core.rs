//! Core assembly and the ingress entry point.
//!
//! [`ProxyCore::assemble`] turns the consumed configuration into sealed
//! pipelines (one per pipeline id named by the routing table), a shared
//! upstream client per provider, the router, and the flow controller.
//! [`ProxyCore::handle`] is the single ingress: one client-dialect
//! request in, one client-dialect reply or error envelope out.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use straylight_codec::ProtocolController;
use straylight_common::config::CoreConfig;
use straylight_common::context::PipelineContext;
use straylight_common::error::{ErrorEnvelope, ErrorKind, ProtocolViolation, ProxyError};
use straylight_common::messages::{MessagesRequest, MessagesResponse};
use straylight_common::payload::Payload;
use straylight_pipeline::{ModuleRegistry, Pipeline, PipelineEvent};
use straylight_router::{Router, parse_pipeline_id};
use straylight_upstream::UpstreamClient;

use crate::flow::{CancelSignal, FlowController};
use crate::management::{
    ModuleMetricsView, PipelineHealth, PipelineStatsView, PipelineStatusView,
};

/// Cached health probe result for one pipeline.
#[derive(Debug, Clone, Copy)]
struct HealthEntry {
    healthy: bool,
    checked_at: DateTime<Utc>,
    response_time_ms: u64,
}

/// The assembled proxy core.
pub struct ProxyCore {
    config: CoreConfig,
    registry: Arc<ModuleRegistry>,
    router: Router,
    pipelines: HashMap<String, Arc<Pipeline>>,
    pipeline_order: Vec<String>,
    flow: FlowController,
    protocol: ProtocolController,
    health_cache: DashMap<String, HealthEntry>,
    last_reasoning: DashMap<String, String>,
}

impl std::fmt::Debug for ProxyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyCore")
            .field("pipelines", &self.pipeline_order)
            .finish_non_exhaustive()
    }
}

impl ProxyCore {
    /// Assembles the core from a validated configuration.
    ///
    /// One pipeline is built per distinct pipeline id in the routing
    /// table; pipelines pointing at the same provider share one upstream
    /// client (connections and the key-rotation cursor are the shared
    /// state).
    ///
    /// # Errors
    ///
    /// Returns a validation error for a bad configuration, an unparseable
    /// pipeline id, or an id naming an unconfigured provider.
    pub fn assemble(config: CoreConfig) -> Result<Self, ProxyError> {
        config
            .validate()
            .map_err(|message| ProxyError::validation("INVALID_CONFIG", message))?;

        let registry = Arc::new(ModuleRegistry::new());
        let mut upstreams: HashMap<String, Arc<UpstreamClient>> = HashMap::new();
        let mut pipelines: HashMap<String, Arc<Pipeline>> = HashMap::new();
        let mut pipeline_order: Vec<String> = Vec::new();

        for rule in &config.router.routes {
            for pipeline_id in &rule.pipelines {
                if pipelines.contains_key(pipeline_id) {
                    continue;
                }
                let parsed = parse_pipeline_id(pipeline_id)?;
                let record = config.provider(&parsed.provider).ok_or_else(|| {
                    ProxyError::validation(
                        "UNKNOWN_PROVIDER",
                        format!(
                            "routing table names pipeline '{pipeline_id}' for unconfigured provider '{}'",
                            parsed.provider
                        ),
                    )
                })?;

                let upstream = match upstreams.entry(record.name.clone()) {
                    std::collections::hash_map::Entry::Occupied(entry) => Arc::clone(entry.get()),
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        let upstream = Arc::new(UpstreamClient::from_record(record)?);
                        entry.insert(Arc::clone(&upstream));
                        upstream
                    }
                };

                let pipeline = Arc::new(Pipeline::assemble(
                    pipeline_id.clone(),
                    record,
                    &config.protocol,
                    upstream,
                    Arc::clone(&registry),
                ));
                pipeline_order.push(pipeline_id.clone());
                pipelines.insert(pipeline_id.clone(), pipeline);
            }
        }

        info!(
            pipelines = pipeline_order.len(),
            providers = upstreams.len(),
            "assembled proxy core"
        );

        Ok(Self {
            router: Router::from_config(&config.router),
            flow: FlowController::new(config.protocol.concurrency_limit),
            protocol: ProtocolController::new(&config.protocol),
            config,
            registry,
            pipelines,
            pipeline_order,
            health_cache: DashMap::new(),
            last_reasoning: DashMap::new(),
        })
    }

    /// Starts every pipeline in assembly order.
    ///
    /// # Errors
    ///
    /// Propagates the first pipeline start failure (typically a failed
    /// auth probe).
    pub async fn start(&self) -> Result<(), ProxyError> {
        for id in &self.pipeline_order {
            if let Some(pipeline) = self.pipelines.get(id) {
                pipeline.start().await?;
            }
        }
        Ok(())
    }

    /// Stops every pipeline in reverse assembly order.
    pub async fn shutdown(&self) {
        for id in self.pipeline_order.iter().rev() {
            if let Some(pipeline) = self.pipelines.get(id) {
                pipeline.stop().await;
            }
        }
        info!("proxy core shut down");
    }

    /// The single ingress entry.
    ///
    /// Enqueues the request on its conversation, routes it once it
    /// reaches the head, runs the pipeline forward and backward, and
    /// returns the client-dialect reply. A failure at any point produces
    /// exactly one error envelope.
    #[instrument(skip_all, fields(session = %session_key, conversation = %conversation_key))]
    pub async fn handle(
        &self,
        request: MessagesRequest,
        session_key: &str,
        conversation_key: &str,
        cancel: CancelSignal,
        deadline: Option<Duration>,
    ) -> Result<MessagesResponse, ErrorEnvelope> {
        let deadline = deadline.or_else(|| Some(self.config.protocol.request_timeout()));

        let outcome = self
            .flow
            .submit(conversation_key, deadline, cancel, async {
                self.run_pipeline(request, session_key, conversation_key).await
            })
            .await;

        outcome.map_err(|e| {
            warn!(code = %e.code, "request failed");
            ErrorEnvelope::from(&e)
        })
    }

    async fn run_pipeline(
        &self,
        request: MessagesRequest,
        session_key: &str,
        conversation_key: &str,
    ) -> Result<MessagesResponse, ProxyError> {
        let mut ctx = PipelineContext::new(session_key, conversation_key);

        let decision = self.router.route(&request, &self.config, |id| {
            self.pipeline_ready(id)
        })?;
        let pipeline_id = decision.pipeline_id.clone();
        debug!(pipeline = %pipeline_id, reasoning = %decision.reasoning, "routed");
        self.last_reasoning
            .insert(pipeline_id.clone(), decision.reasoning.clone());

        let pipeline = self.pipelines.get(&pipeline_id).ok_or_else(|| {
            ProxyError::new(
                ErrorKind::NoHealthyPipeline,
                format!("routed pipeline '{pipeline_id}' is not assembled"),
            )
        })?;

        ctx.set_routing(decision)?;

        let result = pipeline
            .execute(Payload::ClientRequest(request), &mut ctx)
            .await?;

        match result.payload {
            Payload::ClientResponse(reply) => Ok(reply),
            other => Err(ProxyError::protocol(
                ProtocolViolation::UnsupportedResponseFormat,
                format!("pipeline produced {} instead of a client reply", other.kind_name()),
            )),
        }
    }

    /// Health view the router selects against: the cached probe result
    /// when one exists, else whether the pipeline is started.
    fn pipeline_ready(&self, pipeline_id: &str) -> bool {
        if let Some(entry) = self.health_cache.get(pipeline_id) {
            return entry.healthy;
        }
        self.pipelines
            .get(pipeline_id)
            .is_some_and(|p| p.is_started())
    }

    /// Probes every pipeline and refreshes the health cache.
    pub async fn refresh_health(&self) {
        for (id, pipeline) in &self.pipelines {
            let begun = Instant::now();
            let healthy = pipeline.validate().await;
            let entry = HealthEntry {
                healthy,
                checked_at: Utc::now(),
                response_time_ms: u64::try_from(begun.elapsed().as_millis()).unwrap_or(u64::MAX),
            };
            self.health_cache.insert(id.clone(), entry);
        }
    }

    /// Lists every pipeline with its cached status.
    #[must_use]
    pub fn list_pipelines(&self) -> Vec<PipelineStatusView> {
        self.pipeline_order
            .iter()
            .map(|id| {
                let parsed = parse_pipeline_id(id).ok();
                let cached = self.health_cache.get(id).map(|e| *e.value());
                let started = self
                    .pipelines
                    .get(id)
                    .is_some_and(|p| p.is_started());

                let health = match cached {
                    Some(entry) if entry.healthy => PipelineHealth::Healthy,
                    Some(_) => PipelineHealth::Unhealthy,
                    None if started => PipelineHealth::Healthy,
                    None => PipelineHealth::Unhealthy,
                };

                PipelineStatusView {
                    id: id.clone(),
                    provider: parsed.as_ref().map(|p| p.provider.clone()).unwrap_or_default(),
                    model: parsed.map(|p| p.model).unwrap_or_default(),
                    health,
                    last_check: cached.map(|e| e.checked_at),
                    response_time_ms: cached.map(|e| e.response_time_ms),
                }
            })
            .collect()
    }

    /// Execution stats for one pipeline.
    #[must_use]
    pub fn pipeline_stats(&self, pipeline_id: &str) -> Option<PipelineStatsView> {
        self.registry
            .pipeline_stats(pipeline_id)
            .map(|stats| PipelineStatsView {
                id: pipeline_id.to_string(),
                stats,
                last_reasoning: self
                    .last_reasoning
                    .get(pipeline_id)
                    .map(|r| r.value().clone()),
            })
    }

    /// Recent transformation entries recorded against one pipeline.
    #[must_use]
    pub fn recent_transformations(
        &self,
        pipeline_id: &str,
    ) -> Vec<straylight_common::context::Transformation> {
        self.registry.recent_transformations(pipeline_id)
    }

    /// Metric snapshots for every registered module.
    #[must_use]
    pub fn module_metrics(&self) -> Vec<ModuleMetricsView> {
        let mut views: Vec<ModuleMetricsView> = self
            .registry
            .module_ids()
            .into_iter()
            .filter_map(|id| {
                self.registry.get(&id).map(|module| ModuleMetricsView {
                    metrics: module.metrics(),
                    id,
                })
            })
            .collect();
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// Subscribes to the observability event bus.
    #[must_use]
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.registry.subscribe()
    }

    /// The protocol controller, for edge-side stream re-expansion.
    #[must_use]
    pub const fn protocol_controller(&self) -> &ProtocolController {
        &self.protocol
    }
}
