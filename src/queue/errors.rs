use std::sync::Arc;
use thiserror::Error;

/// Batch-level errors produced by mode arbitration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Cannot interrupt the running batch")]
    CannotInterrupt,

    #[error("Batch was interrupted by a higher priority request")]
    Interrupted,

    #[error("Queue manager is not running")]
    ManagerStopped,
}

/// Errors raised by a single scan or opt-out.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataBrokerError {
    #[error("HTTP error (status {code})")]
    HttpError { code: u16 },

    #[error("Action {action_id} failed: {message}")]
    ActionFailed { action_id: String, message: String },

    #[error("No action found")]
    NoActionFound,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

pub type SharedError = Arc<anyhow::Error>;

/// Error envelope delivered once per batch.
///
/// `operation_errors` is `None` when no job failed, so callers can tell a clean
/// run apart from a run that completed with partial failures.
#[derive(Debug, Clone, Default)]
pub struct ErrorCollection {
    pub one_time_error: Option<SharedError>,
    pub operation_errors: Option<Vec<SharedError>>,
}

impl ErrorCollection {
    pub fn new(one_time_error: Option<anyhow::Error>, operation_errors: Option<Vec<SharedError>>) -> Self {
        Self {
            one_time_error: one_time_error.map(Arc::new),
            operation_errors,
        }
    }

    pub fn fatal(error: anyhow::Error) -> Self {
        Self::new(Some(error), None)
    }

    pub fn from_operation_errors(operation_errors: Option<Vec<SharedError>>) -> Self {
        Self::new(None, operation_errors)
    }

    pub fn is_empty(&self) -> bool {
        self.one_time_error.is_none() && self.operation_errors.is_none()
    }

    pub fn operation_error_count(&self) -> usize {
        self.operation_errors.as_ref().map_or(0, Vec::len)
    }

    /// The arbitration error carried as one-time error, if any.
    pub fn queue_error(&self) -> Option<&QueueError> {
        self.one_time_error
            .as_ref()
            .and_then(|e| e.downcast_ref::<QueueError>())
    }

    pub fn is_interrupted(&self) -> bool {
        self.queue_error() == Some(&QueueError::Interrupted)
    }

    pub fn is_cannot_interrupt(&self) -> bool {
        self.queue_error() == Some(&QueueError::CannotInterrupt)
    }
}
