use super::errors::{ErrorCollection, QueueError};
use super::manager::DebugCommand;
use super::mode::QueueMode;
use super::{OperationDependencies, OperationType};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

type ErrorHandler = Box<dyn FnOnce(ErrorCollection) + Send>;
type Completion = Box<dyn FnOnce() + Send>;

/// Caller callbacks of one batch.
///
/// The error handler always runs before the completion, and each runs at most
/// once.
#[derive(Default)]
pub struct BatchCallbacks {
    on_error: Option<ErrorHandler>,
    on_complete: Option<Completion>,
}

impl BatchCallbacks {
    pub fn new(
        on_error: impl FnOnce(ErrorCollection) + Send + 'static,
        on_complete: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            on_error: Some(Box::new(on_error)),
            on_complete: Some(Box::new(on_complete)),
        }
    }

    pub fn on_error(on_error: impl FnOnce(ErrorCollection) + Send + 'static) -> Self {
        Self {
            on_error: Some(Box::new(on_error)),
            on_complete: None,
        }
    }

    /// Callbacks resolving the returned receiver with the batch's envelope once
    /// the batch has completed.
    pub fn channel() -> (Self, oneshot::Receiver<ErrorCollection>) {
        let (tx, rx) = oneshot::channel();
        let reported = Arc::new(Mutex::new(None));
        let reported_by_handler = Arc::clone(&reported);

        let callbacks = Self::new(
            move |errors| {
                *reported_by_handler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(errors);
            },
            move || {
                let errors = reported
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .unwrap_or_default();
                let _ = tx.send(errors);
            },
        );
        (callbacks, rx)
    }

    pub(crate) fn report(&mut self, errors: ErrorCollection) {
        if let Some(on_error) = self.on_error.take() {
            on_error(errors);
        }
    }

    pub(crate) fn complete(mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete();
        }
    }

    /// Report `errors` and complete right away.
    pub(crate) fn finish(mut self, errors: ErrorCollection) {
        self.report(errors);
        self.complete();
    }
}

/// Command sent to the queue manager.
pub(crate) enum QueueCommand {
    Start {
        mode: QueueMode,
        operation_type: OperationType,
        show_web_view: bool,
        deps: OperationDependencies,
        callbacks: BatchCallbacks,
    },
    Debug(DebugCommand),
    DebugStatus {
        response: oneshot::Sender<&'static str>,
    },
    CurrentMode {
        response: oneshot::Sender<QueueMode>,
    },
}

impl QueueCommand {
    /// Notify the caller of a command that never reached the manager.
    fn reject(self) {
        let stopped = || ErrorCollection::fatal(QueueError::ManagerStopped.into());
        match self {
            QueueCommand::Start { callbacks, .. } => callbacks.finish(stopped()),
            QueueCommand::Debug(DebugCommand::StartOptOutOperations { callbacks, .. }) => {
                callbacks.finish(stopped())
            }
            QueueCommand::DebugStatus { .. } | QueueCommand::CurrentMode { .. } => {}
        }
    }
}

/// Cloneable handle used to request batches from the queue manager.
#[derive(Clone)]
pub struct QueueHandle {
    command_tx: mpsc::Sender<QueueCommand>,
}

impl QueueHandle {
    pub(crate) fn new(command_tx: mpsc::Sender<QueueCommand>) -> Self {
        Self { command_tx }
    }

    async fn send(&self, command: QueueCommand) -> Result<(), QueueError> {
        self.command_tx.send(command).await.map_err(|e| {
            e.0.reject();
            QueueError::ManagerStopped
        })
    }

    /// Request a manual scan of every broker, interrupting any running batch.
    ///
    /// Arbitration errors are delivered through `callbacks`; the returned
    /// error only tells whether the request reached the manager.
    pub async fn start_immediate_operations(
        &self,
        show_web_view: bool,
        deps: OperationDependencies,
        callbacks: BatchCallbacks,
    ) -> Result<(), QueueError> {
        self.send(QueueCommand::Start {
            mode: QueueMode::Immediate,
            operation_type: OperationType::ManualScan,
            show_web_view,
            deps,
            callbacks,
        })
        .await
    }

    /// Request a scheduled run of all due scans and opt-outs.
    pub async fn start_scheduled_all_operations(
        &self,
        show_web_view: bool,
        deps: OperationDependencies,
        callbacks: BatchCallbacks,
    ) -> Result<(), QueueError> {
        self.send(QueueCommand::Start {
            mode: QueueMode::Scheduled,
            operation_type: OperationType::All,
            show_web_view,
            deps,
            callbacks,
        })
        .await
    }

    /// Request a scheduled run of due scans only.
    pub async fn start_scheduled_scan_operations(
        &self,
        show_web_view: bool,
        deps: OperationDependencies,
        callbacks: BatchCallbacks,
    ) -> Result<(), QueueError> {
        self.send(QueueCommand::Start {
            mode: QueueMode::Scheduled,
            operation_type: OperationType::ScheduledScan,
            show_web_view,
            deps,
            callbacks,
        })
        .await
    }

    /// Run a diagnostic command, bypassing mode arbitration.
    pub async fn execute_debug_command(&self, command: DebugCommand) -> Result<(), QueueError> {
        self.send(QueueCommand::Debug(command)).await
    }

    /// `"idle"` or `"running"`.
    pub async fn debug_status(&self) -> Result<&'static str, QueueError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(QueueCommand::DebugStatus {
            response: response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| QueueError::ManagerStopped)
    }

    pub async fn current_mode(&self) -> Result<QueueMode, QueueError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(QueueCommand::CurrentMode {
            response: response_tx,
        })
        .await?;
        response_rx.await.map_err(|_| QueueError::ManagerStopped)
    }
}
