//! Data Broker Protection operation scheduler.
//!
//! This library exposes the queue manager, the job store and the background
//! agent for the `dbp-agent` binary and for tests.

pub mod agent;
pub mod config;
pub mod job_store;
pub mod queue;
pub mod sqlite_persistence;
pub mod telemetry;

// Re-export commonly used types for convenience
pub use config::{AgentConfig, ExecutionConfig};
pub use job_store::{JobSource, SqliteJobStore};
pub use queue::{
    create_queue_manager, BatchCallbacks, ErrorCollection, OperationDependencies, OperationType,
    QueueCollaborators, QueueError, QueueHandle, QueueManager,
};
pub use telemetry::{PrometheusTelemetry, TelemetryEvent, TelemetrySink};
