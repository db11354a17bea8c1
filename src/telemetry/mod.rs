//! Telemetry events fired for job errors and the sink they are delivered to.

pub mod metrics;

use crate::queue::DataBrokerError;
use tracing::warn;

/// Structured event describing a job error attributed to a data broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    HttpError {
        code: u16,
        data_broker: String,
    },
    ActionFailedError {
        action_id: String,
        message: String,
        data_broker: String,
    },
    OtherError {
        message: String,
        data_broker: String,
    },
}

impl TelemetryEvent {
    /// Classify a job error raised while working on `data_broker`.
    pub fn from_job_error(error: &anyhow::Error, data_broker: &str) -> Self {
        match error.downcast_ref::<DataBrokerError>() {
            Some(DataBrokerError::HttpError { code }) => TelemetryEvent::HttpError {
                code: *code,
                data_broker: data_broker.to_string(),
            },
            Some(DataBrokerError::ActionFailed { action_id, message }) => {
                TelemetryEvent::ActionFailedError {
                    action_id: action_id.clone(),
                    message: message.clone(),
                    data_broker: data_broker.to_string(),
                }
            }
            _ => TelemetryEvent::OtherError {
                message: error.to_string(),
                data_broker: data_broker.to_string(),
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::HttpError { .. } => "http_error",
            TelemetryEvent::ActionFailedError { .. } => "action_failed",
            TelemetryEvent::OtherError { .. } => "other_error",
        }
    }

    pub fn data_broker(&self) -> &str {
        match self {
            TelemetryEvent::HttpError { data_broker, .. }
            | TelemetryEvent::ActionFailedError { data_broker, .. }
            | TelemetryEvent::OtherError { data_broker, .. } => data_broker,
        }
    }
}

/// Destination for telemetry events.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait TelemetrySink: Send + Sync {
    fn fire(&self, event: TelemetryEvent);
}

/// Sink counting events in the Prometheus registry.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrometheusTelemetry;

impl TelemetrySink for PrometheusTelemetry {
    fn fire(&self, event: TelemetryEvent) {
        match &event {
            TelemetryEvent::HttpError { code, data_broker } => {
                warn!("HTTP error {} from broker {}", code, data_broker);
            }
            TelemetryEvent::ActionFailedError {
                action_id,
                message,
                data_broker,
            } => {
                warn!(
                    "Action {} failed on broker {}: {}",
                    action_id, data_broker, message
                );
            }
            TelemetryEvent::OtherError {
                message,
                data_broker,
            } => {
                warn!("Job error on broker {}: {}", data_broker, message);
            }
        }
        metrics::record_job_error(event.kind(), event.data_broker());
    }
}
