use super::errors::SharedError;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Receives the non-fatal errors raised by jobs while they run.
pub trait JobErrorDelegate: Send + Sync {
    fn job_did_error(&self, error: anyhow::Error, broker_name: Option<&str>);
}

/// Collects the job errors of one batch in completion order.
pub struct ErrorAggregator {
    errors: Mutex<Vec<SharedError>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl ErrorAggregator {
    pub fn new(telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            errors: Mutex::new(Vec::new()),
            telemetry,
        }
    }

    /// Append an error and, when the broker is known, fire its telemetry event.
    pub fn record(&self, error: anyhow::Error, broker_name: Option<&str>) {
        if let Some(broker_name) = broker_name {
            self.telemetry
                .fire(TelemetryEvent::from_job_error(&error, broker_name));
        }

        debug!(
            "Recorded job error for broker {}: {:#}",
            broker_name.unwrap_or("<unknown>"),
            error
        );
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(error));
    }

    /// Accumulated errors, or `None` if nothing failed.
    pub fn snapshot(&self) -> Option<Vec<SharedError>> {
        let errors = self.errors.lock().unwrap_or_else(PoisonError::into_inner);
        if errors.is_empty() {
            None
        } else {
            Some(errors.clone())
        }
    }

    pub fn reset(&self) {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.errors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobErrorDelegate for ErrorAggregator {
    fn job_did_error(&self, error: anyhow::Error, broker_name: Option<&str>) {
        self.record(error, broker_name);
    }
}
