//! Mode-arbitrated scheduling of broker scan and opt-out jobs.
//!
//! The [`QueueManager`] owns the current mode and is driven through a
//! cloneable [`QueueHandle`]. Admitted requests are turned into one job per
//! broker by a [`JobFactory`] and executed on a bounded [`WorkerPool`]; a
//! barrier reports the aggregated [`ErrorCollection`] once the batch is over.

mod error_aggregator;
mod errors;
mod factory;
mod handle;
mod job;
mod manager;
mod mode;
mod pool;
#[cfg(test)]
pub(crate) mod test_support;

pub use error_aggregator::{ErrorAggregator, JobErrorDelegate};
pub use errors::{DataBrokerError, ErrorCollection, QueueError, SharedError};
pub use factory::{DefaultJobFactory, JobFactory};
pub use handle::{BatchCallbacks, QueueHandle};
pub use job::{BrokerJob, JobRunner, QueueJob, RunContext};
pub use manager::{BrokerUpdater, DebugCommand, MismatchCalculator, QueueManager};
pub use mode::QueueMode;
pub use pool::{TokioWorkerPool, WorkerPool};

#[cfg(feature = "mock")]
pub use manager::{MockBrokerUpdater, MockMismatchCalculator};

use crate::config::ExecutionConfig;
use crate::job_store::JobSource;
use crate::telemetry::TelemetrySink;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Kind of work a batch performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Scan,
    OptOut,
    /// Scans and opt-outs.
    All,
    ManualScan,
    ScheduledScan,
}

impl OperationType {
    pub fn includes_scans(&self) -> bool {
        !matches!(self, OperationType::OptOut)
    }

    pub fn includes_opt_outs(&self) -> bool {
        matches!(self, OperationType::OptOut | OperationType::All)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Scan => write!(f, "scan"),
            OperationType::OptOut => write!(f, "optOut"),
            OperationType::All => write!(f, "all"),
            OperationType::ManualScan => write!(f, "manualScan"),
            OperationType::ScheduledScan => write!(f, "scheduledScan"),
        }
    }
}

/// Shared, read-mostly dependencies handed to every job of a batch.
#[derive(Clone)]
pub struct OperationDependencies {
    pub config: ExecutionConfig,
    pub job_source: Arc<dyn JobSource>,
    pub runner: Arc<dyn JobRunner>,
}

/// Optional collaborators of the queue manager.
#[derive(Default)]
pub struct QueueCollaborators {
    pub broker_updater: Option<Arc<dyn BrokerUpdater>>,
    pub mismatch_calculator: Option<Arc<dyn MismatchCalculator>>,
}

/// Create a queue manager and its handle.
///
/// The manager must be driven with [`QueueManager::run`]; it stops when
/// `shutdown_token` is cancelled.
pub fn create_queue_manager(
    pool: Arc<dyn WorkerPool>,
    factory: Arc<dyn JobFactory>,
    telemetry: Arc<dyn TelemetrySink>,
    collaborators: QueueCollaborators,
    shutdown_token: CancellationToken,
) -> (QueueManager, QueueHandle) {
    let (command_tx, command_rx) = mpsc::channel(100);

    let manager = QueueManager::new(
        pool,
        factory,
        telemetry,
        collaborators,
        command_rx,
        shutdown_token,
    );
    let handle = QueueHandle::new(command_tx);

    (manager, handle)
}
