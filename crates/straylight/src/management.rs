//! Read-only management views consumed by the out-of-scope CLI/API.

use chrono::{DateTime, Utc};

use straylight_pipeline::PipelineStatsSnapshot;

/// Health bucket shown on the management surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineHealth {
    /// Every module healthy, upstream reachable.
    Healthy,
    /// Operational with elevated error rate.
    Degraded,
    /// Not accepting traffic.
    Unhealthy,
}

/// One row of the pipeline listing.
#[derive(Debug, Clone)]
pub struct PipelineStatusView {
    /// The pipeline id.
    pub id: String,
    /// Provider name parsed from the id.
    pub provider: String,
    /// Concrete model parsed from the id.
    pub model: String,
    /// Cached health bucket.
    pub health: PipelineHealth,
    /// When health was last checked.
    pub last_check: Option<DateTime<Utc>>,
    /// Duration of the last health check in milliseconds.
    pub response_time_ms: Option<u64>,
}

/// Per-pipeline execution stats.
#[derive(Debug, Clone)]
pub struct PipelineStatsView {
    /// The pipeline id.
    pub id: String,
    /// Execution counters.
    pub stats: PipelineStatsSnapshot,
    /// The router's reasoning for the most recent request it sent here.
    pub last_reasoning: Option<String>,
}

/// Per-module metric row.
#[derive(Debug, Clone)]
pub struct ModuleMetricsView {
    /// The module id.
    pub id: String,
    /// Counter snapshot.
    pub metrics: straylight_pipeline::MetricsSnapshot,
}
