//! Background agent deciding when the queue runs.

mod command_runner;

pub use command_runner::CommandJobRunner;

use crate::queue::{
    BatchCallbacks, DebugCommand, ErrorCollection, OperationDependencies, QueueError, QueueHandle,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot of the agent state for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct DebugMetadata {
    pub queue_status: &'static str,
    pub scheduler_running: bool,
    pub last_scheduler_trigger: Option<String>,
}

/// Receives the envelope of a requested batch.
pub type BatchReceiver = oneshot::Receiver<ErrorCollection>;

/// Callbacks logging the batch outcome and forwarding its envelope.
fn logged_callbacks(operation: &'static str) -> (BatchCallbacks, BatchReceiver) {
    let (tx, rx) = oneshot::channel();
    let callbacks = BatchCallbacks::on_error(move |errors| {
        log_outcome(operation, &errors);
        let _ = tx.send(errors);
    });
    (callbacks, rx)
}

fn log_outcome(operation: &str, errors: &ErrorCollection) {
    if let Some(fatal) = &errors.one_time_error {
        if errors.queue_error().is_some() {
            info!("{} did not complete: {}", operation, fatal);
        } else {
            error!("{} failed: {:#}", operation, fatal);
        }
    } else if let Some(job_errors) = &errors.operation_errors {
        warn!(
            "{} completed with {} job errors",
            operation,
            job_errors.len()
        );
    } else {
        info!("{} completed", operation);
    }
}

/// Wires queue requests to agent lifecycle events and to a periodic trigger.
pub struct BackgroundAgent {
    queue: QueueHandle,
    deps: OperationDependencies,
    show_web_view: bool,
    last_scheduler_trigger: Arc<Mutex<Option<DateTime<Utc>>>>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
}

impl BackgroundAgent {
    pub fn new(
        queue: QueueHandle,
        deps: OperationDependencies,
        show_web_view: bool,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            queue,
            deps,
            show_web_view,
            last_scheduler_trigger: Arc::new(Mutex::new(None)),
            scheduler: Mutex::new(None),
            shutdown_token,
        }
    }

    /// Start periodic runs and a first scheduled run, if there is anything to do.
    ///
    /// Returns `None` when no profile query is stored.
    pub async fn agent_finished_launching(&self) -> Result<Option<BatchReceiver>> {
        let queries = self
            .deps
            .job_source
            .fetch_all_query_data()
            .context("Failed to check for stored profile queries")?;

        if queries.is_empty() {
            info!("No profile queries stored, not scheduling background runs");
            return Ok(None);
        }

        self.start_scheduler();
        Ok(Some(self.start_scheduled_operations().await?))
    }

    /// Run a manual scan of every broker after the profile changed.
    pub async fn profile_saved(&self) -> Result<BatchReceiver, QueueError> {
        info!("Profile saved, starting immediate scans");
        let (callbacks, rx) = logged_callbacks("Immediate scan");
        self.queue
            .start_immediate_operations(self.show_web_view, self.deps.clone(), callbacks)
            .await?;
        Ok(rx)
    }

    pub async fn app_launched(&self) -> Result<BatchReceiver, QueueError> {
        self.start_scheduled_operations().await
    }

    /// Run every opt-out now, whatever the current mode.
    pub async fn run_all_opt_outs(&self) -> Result<BatchReceiver, QueueError> {
        let (callbacks, rx) = logged_callbacks("Debug opt-out run");
        self.queue
            .execute_debug_command(DebugCommand::StartOptOutOperations {
                show_web_view: self.show_web_view,
                deps: self.deps.clone(),
                callbacks,
            })
            .await?;
        Ok(rx)
    }

    pub async fn debug_metadata(&self) -> Result<DebugMetadata, QueueError> {
        let queue_status = self.queue.debug_status().await?;
        let last_scheduler_trigger = self
            .last_scheduler_trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|dt| dt.to_rfc3339());

        Ok(DebugMetadata {
            queue_status,
            scheduler_running: self.is_scheduler_running(),
            last_scheduler_trigger,
        })
    }

    pub fn is_scheduler_running(&self) -> bool {
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    async fn start_scheduled_operations(&self) -> Result<BatchReceiver, QueueError> {
        start_scheduled_all(&self.queue, &self.deps, self.show_web_view).await
    }

    /// Spawn the periodic trigger unless it is already running.
    fn start_scheduler(&self) {
        let mut scheduler = self
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if scheduler.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!("Activity scheduler already running");
            return;
        }

        let interval = self.deps.config.activity_scheduler_trigger_interval;
        let queue = self.queue.clone();
        let deps = self.deps.clone();
        let show_web_view = self.show_web_view;
        let last_trigger = Arc::clone(&self.last_scheduler_trigger);
        let shutdown_token = self.shutdown_token.clone();

        info!("Starting activity scheduler every {:?}", interval);
        *scheduler = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_token.cancelled() => {
                        debug!("Activity scheduler stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        debug!("Activity scheduler triggered");
                        *last_trigger.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
                        if let Err(e) = start_scheduled_all(&queue, &deps, show_web_view).await {
                            warn!("Scheduled run not requested: {}", e);
                            break;
                        }
                    }
                }
            }
        }));
    }
}

async fn start_scheduled_all(
    queue: &QueueHandle,
    deps: &OperationDependencies,
    show_web_view: bool,
) -> Result<BatchReceiver, QueueError> {
    let (callbacks, rx) = logged_callbacks("Scheduled run");
    queue
        .start_scheduled_all_operations(show_web_view, deps.clone(), callbacks)
        .await?;
    Ok(rx)
}
