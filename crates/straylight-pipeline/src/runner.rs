//! Pipeline assembly and execution.
//!
//! A pipeline is a fixed, ordered stage chain for one
//! {provider, model, key-index} tuple. Membership and order are sealed at
//! assembly - the four-stage contract depends on it - so the mutation
//! surface exists only to fail with `pipeline_sealed`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, instrument, warn};

use straylight_codec::ProtocolController;
use straylight_common::config::{ProtocolSettings, ProviderRecord};
use straylight_common::context::{PipelineContext, StageDirection};
use straylight_common::error::{ErrorKind, ProxyError};
use straylight_common::payload::Payload;
use straylight_compat::CompatAdapter;
use straylight_upstream::UpstreamClient;

use crate::events::PipelineEvent;
use crate::module::{ModuleHealth, ModuleStatus, PipelineModule};
use crate::registry::ModuleRegistry;
use crate::stages::{CodecStage, CompatStage, ProtocolStage, UpstreamStage, ValidatorStage};

/// Result of one pipeline execution.
#[derive(Debug)]
pub struct ExecutionResult {
    /// The final client-dialect payload.
    pub payload: Payload,
    /// Always true when this struct is returned; failures are `Err`.
    pub success: bool,
    /// Wall-clock duration of the execution.
    pub duration_ms: u64,
    /// Per-module traversal record, in execution order.
    pub module_results: Vec<ModuleResult>,
}

/// One module traversal within an execution.
#[derive(Debug, Clone)]
pub struct ModuleResult {
    /// The module traversed.
    pub module_id: String,
    /// Traversal direction.
    pub direction: StageDirection,
    /// Elapsed time in microseconds.
    pub elapsed_micros: u64,
}

/// The ordered four-stage request/response processor for one
/// {provider, model, key-index} tuple.
pub struct Pipeline {
    id: String,
    modules: Vec<Arc<dyn PipelineModule>>,
    registry: Arc<ModuleRegistry>,
    started: AtomicBool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("modules", &self.modules.len())
            .field("started", &self.started.load(Ordering::Acquire))
            .finish()
    }
}

impl Pipeline {
    /// Assembles the standard stage chain for one provider pipeline and
    /// registers every module with the registry.
    #[must_use]
    pub fn assemble(
        pipeline_id: impl Into<String>,
        record: &ProviderRecord,
        settings: &ProtocolSettings,
        upstream: Arc<UpstreamClient>,
        registry: Arc<ModuleRegistry>,
    ) -> Self {
        let id = pipeline_id.into();
        let controller = ProtocolController::new(settings);
        let adapter = CompatAdapter::from_record(record);

        let modules: Vec<Arc<dyn PipelineModule>> = vec![
            Arc::new(ValidatorStage::new(&id, controller.clone())),
            Arc::new(CodecStage::new(&id)),
            Arc::new(ProtocolStage::new(&id, controller)),
            Arc::new(CompatStage::new(&id, adapter)),
            Arc::new(UpstreamStage::new(&id, upstream)),
        ];

        for module in &modules {
            registry.register(Arc::clone(module));
        }
        // Adjacent stages are connected for status propagation.
        for pair in modules.windows(2) {
            registry.add_connection(&pair[0].identity().id, &pair[1].identity().id);
            registry.add_connection(&pair[1].identity().id, &pair[0].identity().id);
        }

        Self {
            id,
            modules,
            registry,
            started: AtomicBool::new(false),
        }
    }

    /// The pipeline id (`provider-model-keyN`).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The sealed module chain.
    #[must_use]
    pub fn modules(&self) -> &[Arc<dyn PipelineModule>] {
        &self.modules
    }

    /// Membership is sealed at assembly.
    ///
    /// # Errors
    ///
    /// Always fails with `pipeline_sealed`.
    pub fn add_module(&self, _module: Arc<dyn PipelineModule>) -> Result<(), ProxyError> {
        Err(self.sealed())
    }

    /// Membership is sealed at assembly.
    ///
    /// # Errors
    ///
    /// Always fails with `pipeline_sealed`.
    pub fn remove_module(&self, _module_id: &str) -> Result<(), ProxyError> {
        Err(self.sealed())
    }

    /// Order is sealed at assembly.
    ///
    /// # Errors
    ///
    /// Always fails with `pipeline_sealed`.
    pub fn set_module_order(&self, _order: &[String]) -> Result<(), ProxyError> {
        Err(self.sealed())
    }

    fn sealed(&self) -> ProxyError {
        ProxyError::new(
            ErrorKind::PipelineSealed,
            format!("pipeline '{}' module set is immutable after assembly", self.id),
        )
    }

    /// Starts every module in declaration order.
    ///
    /// # Errors
    ///
    /// Propagates the first module start failure; earlier modules stay
    /// started.
    #[instrument(skip(self), fields(pipeline = %self.id))]
    pub async fn start(&self) -> Result<(), ProxyError> {
        for module in &self.modules {
            module.start().await.map_err(|e| {
                self.registry.emit(PipelineEvent::ModuleError {
                    module_id: module.identity().id.clone(),
                    message: e.message.clone(),
                });
                e.with_module(module.identity().id.clone())
            })?;
            self.registry.emit(PipelineEvent::ModuleStatusChanged {
                module_id: module.identity().id.clone(),
                status: ModuleStatus::Running,
            });
        }
        self.started.store(true, Ordering::Release);
        self.registry.emit(PipelineEvent::PipelineStarted {
            pipeline_id: self.id.clone(),
        });
        debug!("pipeline started");
        Ok(())
    }

    /// Stops every module in reverse declaration order.
    pub async fn stop(&self) {
        self.started.store(false, Ordering::Release);
        for module in self.modules.iter().rev() {
            module.stop().await;
            self.registry.emit(PipelineEvent::ModuleStatusChanged {
                module_id: module.identity().id.clone(),
                status: ModuleStatus::Stopped,
            });
        }
    }

    /// Whether the pipeline currently accepts traffic.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// A pipeline is valid iff every module reports healthy and the
    /// upstream's own health check succeeds (the upstream stage folds the
    /// second condition into its `health_check`).
    pub async fn validate(&self) -> bool {
        if !self.is_started() {
            return false;
        }
        for module in &self.modules {
            if module.health_check().await == ModuleHealth::Unhealthy {
                return false;
            }
        }
        true
    }

    /// Runs a request forward through modules 1..N, then the upstream's
    /// output backward through modules N..1.
    ///
    /// Fail-fast: the first module error halts the execution, is wrapped
    /// with the module id, normalized by the error hooks of the stages
    /// above it, recorded on the context, and propagated. No partial reply
    /// is emitted.
    ///
    /// # Errors
    ///
    /// `module_not_running` before `start()`; otherwise the wrapped module
    /// failure.
    #[instrument(skip_all, fields(pipeline = %self.id, request = %ctx.request_id))]
    pub async fn execute(
        &self,
        input: Payload,
        ctx: &mut PipelineContext,
    ) -> Result<ExecutionResult, ProxyError> {
        if !self.is_started() {
            return Err(ProxyError::new(
                ErrorKind::ModuleNotRunning,
                format!("pipeline '{}' is not started", self.id),
            ));
        }

        let started = Instant::now();
        let mut module_results = Vec::with_capacity(self.modules.len() * 2);
        let mut payload = input;

        for (position, module) in self.modules.iter().enumerate() {
            payload = match self
                .traverse(module, payload, StageDirection::Request, ctx, &mut module_results)
                .await
            {
                Ok(payload) => payload,
                Err(e) => return Err(self.fail(e, position, started, ctx)),
            };
        }

        for (position, module) in self.modules.iter().enumerate().rev() {
            payload = match self
                .traverse(module, payload, StageDirection::Response, ctx, &mut module_results)
                .await
            {
                Ok(payload) => payload,
                Err(e) => return Err(self.fail(e, position, started, ctx)),
            };
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.registry.record_execution(&self.id, duration_ms, true);
        self.registry
            .record_transformations(&self.id, &ctx.transformations);
        self.registry.emit(PipelineEvent::PipelineExecutionCompleted {
            execution_id: ctx.request_id,
            duration_ms,
        });

        Ok(ExecutionResult {
            payload,
            success: true,
            duration_ms,
            module_results,
        })
    }

    async fn traverse(
        &self,
        module: &Arc<dyn PipelineModule>,
        payload: Payload,
        direction: StageDirection,
        ctx: &mut PipelineContext,
        module_results: &mut Vec<ModuleResult>,
    ) -> Result<Payload, ProxyError> {
        let module_id = module.identity().id.clone();
        let begun = Instant::now();
        let outcome = match direction {
            StageDirection::Request => module.process_request(payload, ctx).await,
            StageDirection::Response => module.process_response(payload, ctx).await,
        };
        let elapsed = begun.elapsed();

        module.core().metrics.record(elapsed, outcome.is_ok());
        ctx.record_timing(module_id.clone(), direction, elapsed);
        module_results.push(ModuleResult {
            module_id: module_id.clone(),
            direction,
            elapsed_micros: u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX),
        });

        outcome.map_err(|e| e.with_module(module_id))
    }

    /// Wraps a module failure: error hooks of the stages above the
    /// failing one get to normalize it (the compat adapter rewrites
    /// timeout/connection/authentication phrasings here).
    fn fail(
        &self,
        error: ProxyError,
        failed_at: usize,
        started: Instant,
        ctx: &mut PipelineContext,
    ) -> ProxyError {
        let mut error = error;
        for module in self.modules[..failed_at].iter().rev() {
            error = module.map_error(error);
        }

        ctx.record_error(&error);
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.registry.record_execution(&self.id, duration_ms, false);
        self.registry
            .record_transformations(&self.id, &ctx.transformations);
        self.registry.emit(PipelineEvent::ModuleError {
            module_id: error.module.clone().unwrap_or_default(),
            message: error.message.clone(),
        });
        self.registry.emit(PipelineEvent::PipelineExecutionFailed {
            execution_id: ctx.request_id,
            duration_ms,
            error: error.code.clone(),
        });
        warn!(code = %error.code, "pipeline execution failed");
        error
    }
}
