//! The uniform module surface every pipeline stage exposes.
//!
//! Identity, lifecycle, health, metrics, and a status-only messaging hook.
//! Modules are pre-configured: `configure()` after assembly warns and
//! retains the existing configuration, so a request can never change
//! another request's behavior.

use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use straylight_common::context::PipelineContext;
use straylight_common::error::ProxyError;
use straylight_common::payload::Payload;

/// What a module is, fixed at assembly.
#[derive(Debug, Clone)]
pub struct ModuleIdentity {
    /// Unique module id within the registry.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Stage kind.
    pub kind: ModuleKind,
    /// Module version string.
    pub version: String,
}

impl ModuleIdentity {
    /// Creates an identity with the crate version.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// The stage kinds a pipeline is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// Structural request validation.
    Validator,
    /// Client/OpenAI dialect translation.
    DialectCodec,
    /// Stream conversion and aggregation.
    ProtocolController,
    /// Provider-specific compatibility.
    CompatAdapter,
    /// HTTPS dispatch.
    UpstreamClient,
}

impl ModuleKind {
    /// Stable tag used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validator => "validator",
            Self::DialectCodec => "dialect-codec",
            Self::ProtocolController => "protocol-controller",
            Self::CompatAdapter => "compat-adapter",
            Self::UpstreamClient => "upstream-client",
        }
    }
}

/// Lifecycle state of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModuleStatus {
    /// Built but not started.
    Created = 0,
    /// Accepting traffic.
    Running = 1,
    /// Stopped; traffic is rejected.
    Stopped = 2,
    /// Failed; traffic is rejected.
    Errored = 3,
}

impl ModuleStatus {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Stopped,
            3 => Self::Errored,
            _ => Self::Created,
        }
    }
}

/// Health report from a module's `health_check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleHealth {
    /// Fully operational.
    Healthy,
    /// Operational with elevated error rate.
    Degraded,
    /// Not operational.
    Unhealthy,
}

/// A point-in-time view of a module's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    /// Requests this module has processed (either direction).
    pub requests_processed: u64,
    /// Failures raised by this module.
    pub errors: u64,
    /// Mean processing time in milliseconds.
    pub avg_processing_ms: f64,
    /// Failures divided by requests.
    pub error_rate: f64,
}

/// Guarded per-module counters.
#[derive(Debug, Default)]
pub struct ModuleMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    total_elapsed_micros: AtomicU64,
}

impl ModuleMetrics {
    /// Records one traversal.
    pub fn record(&self, elapsed: Duration, ok: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        #[allow(clippy::cast_possible_truncation)]
        self.total_elapsed_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Current counter values.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let total_micros = self.total_elapsed_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests_processed: requests,
            errors,
            avg_processing_ms: if requests == 0 {
                0.0
            } else {
                total_micros as f64 / requests as f64 / 1000.0
            },
            error_rate: if requests == 0 {
                0.0
            } else {
                errors as f64 / requests as f64
            },
        }
    }
}

/// A status-propagation message between modules.
///
/// Deliberately status-only: module-to-module messaging must never carry
/// request payloads.
#[derive(Debug, Clone)]
pub struct ModuleMessage {
    /// Sender module id.
    pub from: String,
    /// Sender status at send time.
    pub status: ModuleStatus,
    /// Optional human-readable note.
    pub note: Option<String>,
}

/// Shared identity + state every stage embeds.
#[derive(Debug)]
pub struct ModuleCore {
    /// Module identity.
    pub identity: ModuleIdentity,
    status: AtomicU8,
    /// Guarded counters.
    pub metrics: ModuleMetrics,
}

impl ModuleCore {
    /// Creates a core in the `Created` state.
    #[must_use]
    pub fn new(identity: ModuleIdentity) -> Self {
        Self {
            identity,
            status: AtomicU8::new(ModuleStatus::Created as u8),
            metrics: ModuleMetrics::default(),
        }
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> ModuleStatus {
        ModuleStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Transitions the lifecycle status.
    pub fn set_status(&self, status: ModuleStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

/// The uniform surface of a pipeline stage.
///
/// Stages implement `core()` plus their traversal contracts; lifecycle,
/// health, and metrics come from defaults over the embedded
/// [`ModuleCore`].
#[async_trait]
pub trait PipelineModule: Send + Sync {
    /// The embedded identity + state.
    fn core(&self) -> &ModuleCore;

    /// Module identity.
    fn identity(&self) -> &ModuleIdentity {
        &self.core().identity
    }

    /// Current lifecycle status.
    fn status(&self) -> ModuleStatus {
        self.core().status()
    }

    /// Starts the module.
    ///
    /// # Errors
    ///
    /// Stage-specific; the default transition is infallible.
    async fn start(&self) -> Result<(), ProxyError> {
        self.core().set_status(ModuleStatus::Running);
        Ok(())
    }

    /// Stops the module.
    async fn stop(&self) {
        self.core().set_status(ModuleStatus::Stopped);
    }

    /// Resets transient state without destroying the module.
    async fn reset(&self) {
        self.core().set_status(ModuleStatus::Created);
    }

    /// Releases resources ahead of destruction.
    async fn cleanup(&self) {
        self.core().set_status(ModuleStatus::Stopped);
    }

    /// Reports health; the default derives it from status and error rate.
    async fn health_check(&self) -> ModuleHealth {
        match self.status() {
            ModuleStatus::Running => {
                if self.core().metrics.snapshot().error_rate > 0.5 {
                    ModuleHealth::Degraded
                } else {
                    ModuleHealth::Healthy
                }
            }
            _ => ModuleHealth::Unhealthy,
        }
    }

    /// Current counters.
    fn metrics(&self) -> MetricsSnapshot {
        self.core().metrics.snapshot()
    }

    /// Request-direction traversal.
    async fn process_request(
        &self,
        payload: Payload,
        ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError>;

    /// Response-direction traversal; pass-through for stages without a
    /// distinct response contract.
    async fn process_response(
        &self,
        payload: Payload,
        _ctx: &mut PipelineContext,
    ) -> Result<Payload, ProxyError> {
        Ok(payload)
    }

    /// Hook for normalizing an error raised downstream of this stage;
    /// identity by default.
    fn map_error(&self, error: ProxyError) -> ProxyError {
        error
    }

    /// Runtime reconfiguration is rejected on pre-configured modules.
    fn configure(&self, _settings: &serde_json::Value) {
        warn!(
            module = %self.core().identity.id,
            "ignoring runtime configure() on a pre-configured module"
        );
    }

    /// Receives a status message from a connected module.
    fn on_message(&self, _message: &ModuleMessage) {}
}
