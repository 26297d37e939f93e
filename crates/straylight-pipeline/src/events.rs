//! Observability events emitted on the registry's bus.
//!
//! Events are notifications, not control flow: nothing may subscribe to
//! them to back-channel state between modules. Subscribers that fall
//! behind lose events (broadcast semantics), which is acceptable for
//! observability and would be a bug for anything else.

use uuid::Uuid;

use crate::module::ModuleStatus;

/// Events the registry publishes about pipelines and modules.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A pipeline finished starting its modules.
    PipelineStarted {
        /// The pipeline that started.
        pipeline_id: String,
    },
    /// A request traversed the full pipeline and produced a reply.
    PipelineExecutionCompleted {
        /// The request id.
        execution_id: Uuid,
        /// Wall-clock duration of the execution.
        duration_ms: u64,
    },
    /// A request failed at some stage.
    PipelineExecutionFailed {
        /// The request id.
        execution_id: Uuid,
        /// Wall-clock duration until the failure.
        duration_ms: u64,
        /// The taxonomy code of the failure.
        error: String,
    },
    /// A module changed lifecycle status.
    ModuleStatusChanged {
        /// The module that changed.
        module_id: String,
        /// Its new status.
        status: ModuleStatus,
    },
    /// A module raised an error.
    ModuleError {
        /// The module that failed.
        module_id: String,
        /// The failure message.
        message: String,
    },
}
