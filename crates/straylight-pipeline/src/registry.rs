//! Module registry: ownership, connection graph, event bus, and stats.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use straylight_common::context::Transformation;

use crate::events::PipelineEvent;
use crate::module::{ModuleMessage, PipelineModule};

/// Capacity of the event bus before slow subscribers lose events.
const EVENT_BUS_CAPACITY: usize = 256;

/// Transformation entries retained per pipeline for diagnosis.
const TRANSFORMATION_LOG_CAPACITY: usize = 64;

/// Per-pipeline execution counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    total: AtomicU64,
    success: AtomicU64,
    failure: AtomicU64,
    total_elapsed_ms: AtomicU64,
    last_activity_ms: AtomicU64,
}

/// Point-in-time view of a pipeline's counters.
#[derive(Debug, Clone, Copy)]
pub struct PipelineStatsSnapshot {
    /// Total executions.
    pub total: u64,
    /// Successful executions.
    pub success: u64,
    /// Failed executions.
    pub failure: u64,
    /// Mean execution time in milliseconds.
    pub avg_processing_ms: f64,
    /// When the pipeline last saw traffic.
    pub last_activity: Option<DateTime<Utc>>,
}

impl PipelineStats {
    fn record(&self, duration_ms: u64, ok: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure.fetch_add(1, Ordering::Relaxed);
        }
        self.total_elapsed_ms.fetch_add(duration_ms, Ordering::Relaxed);
        #[allow(clippy::cast_sign_loss)]
        self.last_activity_ms
            .store(Utc::now().timestamp_millis().max(0) as u64, Ordering::Relaxed);
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    fn snapshot(&self) -> PipelineStatsSnapshot {
        let total = self.total.load(Ordering::Relaxed);
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        PipelineStatsSnapshot {
            total,
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            avg_processing_ms: if total == 0 {
                0.0
            } else {
                self.total_elapsed_ms.load(Ordering::Relaxed) as f64 / total as f64
            },
            last_activity: if last == 0 {
                None
            } else {
                DateTime::from_timestamp_millis(last as i64)
            },
        }
    }
}

/// Owns every module, the connection graph between them, and the
/// observability bus.
pub struct ModuleRegistry {
    modules: DashMap<String, Arc<dyn PipelineModule>>,
    connections: DashMap<String, HashSet<String>>,
    stats: DashMap<String, Arc<PipelineStats>>,
    transformations: DashMap<String, VecDeque<Transformation>>,
    events: broadcast::Sender<PipelineEvent>,
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.modules.len())
            .field("connections", &self.connections.len())
            .finish_non_exhaustive()
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            modules: DashMap::new(),
            connections: DashMap::new(),
            stats: DashMap::new(),
            transformations: DashMap::new(),
            events,
        }
    }

    /// Registers a module under its identity id.
    pub fn register(&self, module: Arc<dyn PipelineModule>) {
        let id = module.identity().id.clone();
        debug!(module = %id, "registered module");
        self.modules.insert(id, module);
    }

    /// Looks up a module.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn PipelineModule>> {
        self.modules.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Ids of every registered module.
    #[must_use]
    pub fn module_ids(&self) -> Vec<String> {
        self.modules.iter().map(|e| e.key().clone()).collect()
    }

    /// Adds a directed connection used for status propagation.
    pub fn add_connection(&self, from: &str, to: &str) {
        self.connections
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
    }

    /// Delivers a status message to one connected module.
    ///
    /// Messages to unconnected or unknown targets are dropped with a
    /// warning; status propagation is best-effort by design.
    pub fn send_to_module(&self, message: &ModuleMessage, to: &str) {
        let connected = self
            .connections
            .get(&message.from)
            .is_some_and(|targets| targets.contains(to));
        if !connected {
            warn!(from = %message.from, to, "dropping message to unconnected module");
            return;
        }
        if let Some(target) = self.get(to) {
            target.on_message(message);
        } else {
            warn!(to, "dropping message to unknown module");
        }
    }

    /// Broadcasts a status message to every module connected to the
    /// sender.
    pub fn broadcast_to_modules(&self, message: &ModuleMessage) {
        let targets: Vec<String> = self
            .connections
            .get(&message.from)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        for to in targets {
            if let Some(target) = self.get(&to) {
                target.on_message(message);
            }
        }
    }

    /// Subscribes to the observability bus.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Publishes an event; lost events (no subscribers) are fine.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.events.send(event);
    }

    /// Records an execution against a pipeline's stats.
    pub fn record_execution(&self, pipeline_id: &str, duration_ms: u64, ok: bool) {
        self.stats
            .entry(pipeline_id.to_string())
            .or_default()
            .record(duration_ms, ok);
    }

    /// Stats snapshot for one pipeline.
    #[must_use]
    pub fn pipeline_stats(&self, pipeline_id: &str) -> Option<PipelineStatsSnapshot> {
        self.stats.get(pipeline_id).map(|s| s.snapshot())
    }

    /// Retains a request's transformation entries against its pipeline,
    /// bounded to the most recent [`TRANSFORMATION_LOG_CAPACITY`].
    pub fn record_transformations(&self, pipeline_id: &str, entries: &[Transformation]) {
        if entries.is_empty() {
            return;
        }
        let mut log = self
            .transformations
            .entry(pipeline_id.to_string())
            .or_default();
        for entry in entries {
            if log.len() == TRANSFORMATION_LOG_CAPACITY {
                log.pop_front();
            }
            log.push_back(entry.clone());
        }
    }

    /// The retained transformation entries for one pipeline, oldest
    /// first. Used to identify misbehaving providers after the fact.
    #[must_use]
    pub fn recent_transformations(&self, pipeline_id: &str) -> Vec<Transformation> {
        self.transformations
            .get(pipeline_id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::module::{ModuleCore, ModuleIdentity, ModuleKind, ModuleStatus};
    use straylight_common::context::PipelineContext;
    use straylight_common::error::ProxyError;
    use straylight_common::payload::Payload;

    struct RecordingModule {
        core: ModuleCore,
        seen: Mutex<Vec<String>>,
    }

    impl RecordingModule {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                core: ModuleCore::new(ModuleIdentity::new(id, id, ModuleKind::Validator)),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PipelineModule for RecordingModule {
        fn core(&self) -> &ModuleCore {
            &self.core
        }

        async fn process_request(
            &self,
            payload: Payload,
            _ctx: &mut PipelineContext,
        ) -> Result<Payload, ProxyError> {
            Ok(payload)
        }

        fn on_message(&self, message: &ModuleMessage) {
            self.seen.lock().unwrap().push(message.from.clone());
        }
    }

    fn message(from: &str) -> ModuleMessage {
        ModuleMessage {
            from: from.to_string(),
            status: ModuleStatus::Running,
            note: None,
        }
    }

    #[test]
    fn test_send_requires_connection() {
        let registry = ModuleRegistry::new();
        let a = RecordingModule::new("a");
        let b = RecordingModule::new("b");
        registry.register(a);
        registry.register(Arc::clone(&b) as Arc<dyn PipelineModule>);

        // Not connected yet: dropped.
        registry.send_to_module(&message("a"), "b");
        assert!(b.seen.lock().unwrap().is_empty());

        registry.add_connection("a", "b");
        registry.send_to_module(&message("a"), "b");
        assert_eq!(b.seen.lock().unwrap().as_slice(), ["a"]);
    }

    #[test]
    fn test_broadcast_reaches_connected_only() {
        let registry = ModuleRegistry::new();
        let b = RecordingModule::new("b");
        let c = RecordingModule::new("c");
        registry.register(RecordingModule::new("a"));
        registry.register(Arc::clone(&b) as Arc<dyn PipelineModule>);
        registry.register(Arc::clone(&c) as Arc<dyn PipelineModule>);
        registry.add_connection("a", "b");

        registry.broadcast_to_modules(&message("a"));
        assert_eq!(b.seen.lock().unwrap().len(), 1);
        assert!(c.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_event_bus_delivery() {
        let registry = ModuleRegistry::new();
        let mut rx = registry.subscribe();

        registry.emit(PipelineEvent::PipelineStarted {
            pipeline_id: "p-key0".to_string(),
        });

        match rx.recv().await.unwrap() {
            PipelineEvent::PipelineStarted { pipeline_id } => {
                assert_eq!(pipeline_id, "p-key0");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_stats_accumulate() {
        let registry = ModuleRegistry::new();
        registry.record_execution("p", 10, true);
        registry.record_execution("p", 30, false);

        let stats = registry.pipeline_stats("p").unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.success, 1);
        assert_eq!(stats.failure, 1);
        assert!((stats.avg_processing_ms - 20.0).abs() < f64::EPSILON);
        assert!(stats.last_activity.is_some());
    }
}
