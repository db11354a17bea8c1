use super::error_aggregator::ErrorAggregator;
use super::errors::{ErrorCollection, QueueError};
use super::factory::JobFactory;
use super::handle::{BatchCallbacks, QueueCommand};
use super::mode::QueueMode;
use super::pool::WorkerPool;
use super::{OperationDependencies, OperationType, QueueCollaborators};
use crate::telemetry::metrics;
use crate::telemetry::TelemetrySink;
use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Refreshes broker definitions before a batch is built. Best effort.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait BrokerUpdater: Send + Sync {
    fn check_for_updates(&self) -> Result<()>;
}

/// Recomputes scan result mismatches after a manual scan batch.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait MismatchCalculator: Send + Sync {
    fn calculate_mismatches(&self);
}

/// Diagnostic commands that bypass mode arbitration.
pub enum DebugCommand {
    /// Run every opt-out right away, without changing the queue mode.
    StartOptOutOperations {
        show_web_view: bool,
        deps: OperationDependencies,
        callbacks: BatchCallbacks,
    },
}

/// The batch admitted under the current non-idle mode.
struct ActiveBatch {
    id: u64,
    mode: QueueMode,
    operation_type: OperationType,
    callbacks: BatchCallbacks,
    errors: Arc<ErrorAggregator>,
    started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Completed,
    CompletedWithErrors,
    Failed,
    Interrupted,
}

impl BatchOutcome {
    fn as_str(self) -> &'static str {
        match self {
            BatchOutcome::Completed => "completed",
            BatchOutcome::CompletedWithErrors => "completed_with_errors",
            BatchOutcome::Failed => "failed",
            BatchOutcome::Interrupted => "interrupted",
        }
    }
}

/// A debug opt-out run whose jobs are still in the pool.
struct DebugRun {
    callbacks: BatchCallbacks,
    errors: Arc<ErrorAggregator>,
}

/// What the barrier of a batch reports back to the manager.
enum BarrierEvent {
    BatchFinished { batch_id: u64 },
    DebugFinished { run_id: u64 },
}

/// Single owner of the queue mode.
///
/// All mode changes happen on the task running [`QueueManager::run`], so the
/// admission check and the mode switch cannot interleave with another request.
pub struct QueueManager {
    active: Option<ActiveBatch>,
    next_batch_id: u64,
    debug_runs: HashMap<u64, DebugRun>,
    next_debug_run_id: u64,

    pool: Arc<dyn WorkerPool>,
    factory: Arc<dyn JobFactory>,
    telemetry: Arc<dyn TelemetrySink>,
    broker_updater: Option<Arc<dyn BrokerUpdater>>,
    mismatch_calculator: Option<Arc<dyn MismatchCalculator>>,

    /// Receiver for commands from QueueHandle
    command_receiver: mpsc::Receiver<QueueCommand>,
    /// Barriers report finished batches here
    barrier_tx: mpsc::UnboundedSender<BarrierEvent>,
    barrier_rx: mpsc::UnboundedReceiver<BarrierEvent>,

    shutdown_token: CancellationToken,
}

impl QueueManager {
    pub(crate) fn new(
        pool: Arc<dyn WorkerPool>,
        factory: Arc<dyn JobFactory>,
        telemetry: Arc<dyn TelemetrySink>,
        collaborators: QueueCollaborators,
        command_receiver: mpsc::Receiver<QueueCommand>,
        shutdown_token: CancellationToken,
    ) -> Self {
        let (barrier_tx, barrier_rx) = mpsc::unbounded_channel();
        Self {
            active: None,
            next_batch_id: 0,
            debug_runs: HashMap::new(),
            next_debug_run_id: 0,
            pool,
            factory,
            telemetry,
            broker_updater: collaborators.broker_updater,
            mismatch_calculator: collaborators.mismatch_calculator,
            command_receiver,
            barrier_tx,
            barrier_rx,
            shutdown_token,
        }
    }

    pub fn mode(&self) -> QueueMode {
        self.active
            .as_ref()
            .map_or(QueueMode::Idle, |batch| batch.mode)
    }

    /// Main manager loop.
    pub async fn run(&mut self) {
        info!("Starting queue manager");

        loop {
            // Finished batches settle before new requests are admitted.
            tokio::select! {
                biased;
                Some(event) = self.barrier_rx.recv() => {
                    self.handle_barrier(event);
                }
                command = self.command_receiver.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All queue handles dropped");
                        self.shutdown();
                        break;
                    }
                },
                _ = self.shutdown_token.cancelled() => {
                    info!("Queue manager received shutdown signal");
                    self.shutdown();
                    break;
                }
            }
        }

        info!("Queue manager stopped");
    }

    fn handle_command(&mut self, command: QueueCommand) {
        match command {
            QueueCommand::Start {
                mode,
                operation_type,
                show_web_view,
                deps,
                callbacks,
            } => {
                self.start_operations_if_permitted(
                    mode,
                    operation_type,
                    show_web_view,
                    deps,
                    callbacks,
                );
            }
            QueueCommand::Debug(command) => self.execute_debug_command(command),
            QueueCommand::DebugStatus { response } => {
                let _ = response.send(self.debug_status());
            }
            QueueCommand::CurrentMode { response } => {
                let _ = response.send(self.mode());
            }
        }
    }

    fn debug_status(&self) -> &'static str {
        if self.mode().is_idle() {
            "idle"
        } else {
            "running"
        }
    }

    fn start_operations_if_permitted(
        &mut self,
        mode: QueueMode,
        operation_type: OperationType,
        show_web_view: bool,
        deps: OperationDependencies,
        callbacks: BatchCallbacks,
    ) {
        let current_mode = self.mode();
        if !current_mode.can_be_interrupted_by(mode) {
            info!(
                "Rejecting {} {} request: {} batch is running",
                mode, operation_type, current_mode
            );
            callbacks.finish(ErrorCollection::fatal(QueueError::CannotInterrupt.into()));
            return;
        }

        self.interrupt_active_batch();

        self.next_batch_id += 1;
        let batch_id = self.next_batch_id;
        let errors = Arc::new(ErrorAggregator::new(Arc::clone(&self.telemetry)));
        let priority_date = mode.priority_date(Utc::now());

        self.active = Some(ActiveBatch {
            id: batch_id,
            mode,
            operation_type,
            callbacks,
            errors: Arc::clone(&errors),
            started_at: Instant::now(),
        });
        metrics::set_active_mode(Some(mode.as_str()));

        self.update_broker_data();

        let max_concurrent = deps.config.concurrent_operations_for(operation_type);
        self.pool.set_max_concurrent(max_concurrent);

        let jobs = match self.factory.create_jobs(
            operation_type,
            priority_date,
            show_web_view,
            errors,
            &deps,
        ) {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Failed to create {} jobs: {:#}", operation_type, e);
                self.finish_active_batch(Some(e), BatchOutcome::Failed);
                return;
            }
        };

        info!(
            "Starting {} batch {} ({}) with {} jobs, concurrency {}",
            mode,
            batch_id,
            operation_type,
            jobs.len(),
            max_concurrent
        );
        for job in jobs {
            self.pool.submit(job);
        }

        let barrier_tx = self.barrier_tx.clone();
        self.pool
            .run_after_all_current_work_completes(Box::new(move || {
                let _ = barrier_tx.send(BarrierEvent::BatchFinished { batch_id });
            }));
    }

    /// Cancel the active batch, if any, and notify its caller.
    fn interrupt_active_batch(&mut self) {
        let Some(batch) = self.active.as_ref() else {
            return;
        };

        info!(
            "Interrupting {} batch {} ({})",
            batch.mode, batch.id, batch.operation_type
        );
        self.pool.cancel_all();
        self.finish_active_batch(Some(QueueError::Interrupted.into()), BatchOutcome::Interrupted);
    }

    fn update_broker_data(&self) {
        if let Some(updater) = &self.broker_updater {
            if let Err(e) = updater.check_for_updates() {
                warn!("Broker definitions update failed: {:#}", e);
            }
        }
    }

    /// Deliver the envelope of the active batch, go back to idle, then complete.
    fn finish_active_batch(&mut self, one_time_error: Option<anyhow::Error>, outcome: BatchOutcome) {
        let Some(mut batch) = self.active.take() else {
            return;
        };

        if batch.mode == QueueMode::Immediate && outcome != BatchOutcome::Interrupted {
            if let Some(calculator) = &self.mismatch_calculator {
                calculator.calculate_mismatches();
            }
        }

        let envelope = ErrorCollection::new(one_time_error, batch.errors.snapshot());
        let elapsed = batch.started_at.elapsed();
        info!(
            "{} batch {} ({}) {} after {:?} with {} job errors",
            batch.mode,
            batch.id,
            batch.operation_type,
            outcome.as_str(),
            elapsed,
            envelope.operation_error_count()
        );
        metrics::record_batch_finished(batch.mode.as_str(), outcome.as_str(), elapsed);

        batch.callbacks.report(envelope);
        batch.errors.reset();
        metrics::set_active_mode(None);
        batch.callbacks.complete();
    }

    fn handle_barrier(&mut self, event: BarrierEvent) {
        match event {
            BarrierEvent::BatchFinished { batch_id } => {
                if self.active.as_ref().map(|b| b.id) != Some(batch_id) {
                    debug!("Ignoring barrier of superseded batch {}", batch_id);
                    return;
                }
                let outcome = match self.active.as_ref() {
                    Some(batch) if !batch.errors.is_empty() => BatchOutcome::CompletedWithErrors,
                    _ => BatchOutcome::Completed,
                };
                self.finish_active_batch(None, outcome);
            }
            BarrierEvent::DebugFinished { run_id } => {
                let Some(run) = self.debug_runs.remove(&run_id) else {
                    return;
                };
                info!(
                    "Debug opt-out run {} finished with {} job errors",
                    run_id,
                    run.errors.len()
                );
                run.callbacks
                    .finish(ErrorCollection::from_operation_errors(run.errors.snapshot()));
            }
        }
    }

    fn execute_debug_command(&mut self, command: DebugCommand) {
        match command {
            DebugCommand::StartOptOutOperations {
                show_web_view,
                deps,
                callbacks,
            } => {
                let operation_type = OperationType::OptOut;
                let errors = Arc::new(ErrorAggregator::new(Arc::clone(&self.telemetry)));

                self.pool
                    .set_max_concurrent(deps.config.concurrent_operations_for(operation_type));
                let jobs = match self.factory.create_jobs(
                    operation_type,
                    None,
                    show_web_view,
                    errors.clone(),
                    &deps,
                ) {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        error!("Failed to create debug opt-out jobs: {:#}", e);
                        callbacks.finish(ErrorCollection::fatal(e));
                        return;
                    }
                };

                self.next_debug_run_id += 1;
                let run_id = self.next_debug_run_id;
                info!(
                    "Debug command: run {} with {} opt-out jobs",
                    run_id,
                    jobs.len()
                );
                for job in jobs {
                    self.pool.submit(job);
                }
                self.debug_runs.insert(run_id, DebugRun { callbacks, errors });

                let barrier_tx = self.barrier_tx.clone();
                self.pool
                    .run_after_all_current_work_completes(Box::new(move || {
                        let _ = barrier_tx.send(BarrierEvent::DebugFinished { run_id });
                    }));
            }
        }
    }

    fn shutdown(&mut self) {
        info!("Shutting down queue manager...");
        if self.active.is_none() && self.debug_runs.is_empty() {
            return;
        }

        self.pool.cancel_all();
        self.finish_active_batch(Some(QueueError::Interrupted.into()), BatchOutcome::Interrupted);
        for (run_id, run) in self.debug_runs.drain() {
            info!("Interrupting debug opt-out run {}", run_id);
            run.callbacks.finish(ErrorCollection::new(
                Some(QueueError::Interrupted.into()),
                run.errors.snapshot(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::QueueJob;
    use crate::queue::test_support::*;
    use crate::queue::{create_queue_manager, DefaultJobFactory, QueueHandle, TokioWorkerPool};
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::{oneshot, Notify};

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Job controlled by the test: optionally reports an error, then waits on `release`.
    struct ControlledJob {
        broker_id: i64,
        fail: bool,
        release: Arc<Notify>,
        started: Arc<AtomicUsize>,
        reported: Arc<AtomicUsize>,
        delegate: Arc<dyn crate::queue::JobErrorDelegate>,
    }

    #[async_trait]
    impl QueueJob for ControlledJob {
        fn broker_id(&self) -> i64 {
            self.broker_id
        }

        async fn run(&self, cancellation_token: CancellationToken) {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                self.delegate.job_did_error(
                    crate::queue::DataBrokerError::HttpError { code: 500 }.into(),
                    Some("Broker"),
                );
                self.reported.fetch_add(1, Ordering::SeqCst);
            }
            tokio::select! {
                _ = cancellation_token.cancelled() => {}
                _ = self.release.notified() => {}
            }
        }
    }

    #[derive(Default)]
    struct ControlledFactory {
        failing_jobs: Vec<i64>,
        job_count: usize,
        fail_creation: bool,
        release: Arc<Notify>,
        started: Arc<AtomicUsize>,
        reported: Arc<AtomicUsize>,
        requests: Mutex<Vec<(OperationType, Option<DateTime<Utc>>)>>,
    }

    impl JobFactory for ControlledFactory {
        fn create_jobs(
            &self,
            operation_type: OperationType,
            priority_date: Option<DateTime<Utc>>,
            _show_web_view: bool,
            error_delegate: Arc<dyn crate::queue::JobErrorDelegate>,
            _deps: &OperationDependencies,
        ) -> Result<Vec<Box<dyn QueueJob>>> {
            self.requests
                .lock()
                .unwrap()
                .push((operation_type, priority_date));
            if self.fail_creation {
                anyhow::bail!("job source unavailable");
            }
            Ok((1..=self.job_count as i64)
                .map(|broker_id| {
                    Box::new(ControlledJob {
                        broker_id,
                        fail: self.failing_jobs.contains(&broker_id),
                        release: Arc::clone(&self.release),
                        started: Arc::clone(&self.started),
                        reported: Arc::clone(&self.reported),
                        delegate: Arc::clone(&error_delegate),
                    }) as Box<dyn QueueJob>
                })
                .collect())
        }
    }

    impl ControlledFactory {
        fn with_jobs(job_count: usize) -> Self {
            Self {
                job_count,
                ..Default::default()
            }
        }

        fn release_all(&self) {
            for _ in 0..self.job_count * 4 {
                self.release.notify_one();
            }
        }
    }

    #[derive(Default)]
    struct CountingCollaborator {
        calls: AtomicUsize,
    }

    impl BrokerUpdater for CountingCollaborator {
        fn check_for_updates(&self) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("network unavailable")
        }
    }

    impl MismatchCalculator for CountingCollaborator {
        fn calculate_mismatches(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn deps() -> OperationDependencies {
        test_dependencies(
            StaticJobSource::new(Vec::new()),
            Arc::new(RecordingRunner::default()),
        )
    }

    /// Pool that drops jobs and hands barriers to the test.
    #[derive(Default)]
    struct ManualPool {
        barriers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    }

    impl ManualPool {
        fn fire_last_barrier(&self) {
            let barrier = self.barriers.lock().unwrap().pop().unwrap();
            barrier();
        }
    }

    impl WorkerPool for ManualPool {
        fn set_max_concurrent(&self, _max_concurrent: usize) {}

        fn submit(&self, _job: Box<dyn QueueJob>) {}

        fn cancel_all(&self) {}

        fn run_after_all_current_work_completes(&self, callback: Box<dyn FnOnce() + Send>) {
            self.barriers.lock().unwrap().push(callback);
        }
    }

    /// Tokio pool remembering every concurrency limit it was given.
    struct LimitRecordingPool {
        inner: TokioWorkerPool,
        limits: Mutex<Vec<usize>>,
    }

    impl WorkerPool for LimitRecordingPool {
        fn set_max_concurrent(&self, max_concurrent: usize) {
            self.limits.lock().unwrap().push(max_concurrent);
            self.inner.set_max_concurrent(max_concurrent);
        }

        fn submit(&self, job: Box<dyn QueueJob>) {
            self.inner.submit(job);
        }

        fn cancel_all(&self) {
            self.inner.cancel_all();
        }

        fn run_after_all_current_work_completes(&self, callback: Box<dyn FnOnce() + Send>) {
            self.inner.run_after_all_current_work_completes(callback);
        }
    }

    fn spawn_manager_with_pool(
        pool: Arc<dyn WorkerPool>,
        factory: Arc<dyn JobFactory>,
        collaborators: QueueCollaborators,
    ) -> (QueueHandle, CancellationToken) {
        let shutdown_token = CancellationToken::new();
        let (mut manager, handle) = create_queue_manager(
            pool,
            factory,
            Arc::new(RecordingTelemetry::default()),
            collaborators,
            shutdown_token.clone(),
        );
        tokio::spawn(async move { manager.run().await });
        (handle, shutdown_token)
    }

    fn spawn_manager(
        factory: Arc<dyn JobFactory>,
        collaborators: QueueCollaborators,
    ) -> (QueueHandle, Arc<TokioWorkerPool>, CancellationToken) {
        let pool = Arc::new(TokioWorkerPool::new(2));
        let (handle, shutdown_token) =
            spawn_manager_with_pool(pool.clone(), factory, collaborators);
        (handle, pool, shutdown_token)
    }

    async fn wait_for_count(counter: &AtomicUsize, count: usize) {
        tokio::time::timeout(TIMEOUT, async {
            while counter.load(Ordering::SeqCst) < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn envelope(rx: oneshot::Receiver<ErrorCollection>) -> ErrorCollection {
        tokio::time::timeout(TIMEOUT, rx).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_scheduled_batch_completes_without_errors() {
        let factory = Arc::new(ControlledFactory::with_jobs(2));
        let (handle, _pool, _token) = spawn_manager(factory.clone(), QueueCollaborators::default());

        let (callbacks, rx) = BatchCallbacks::channel();
        handle
            .start_scheduled_all_operations(false, deps(), callbacks)
            .await
            .unwrap();
        wait_for_count(&factory.started, 2).await;
        assert_eq!(handle.debug_status().await.unwrap(), "running");

        factory.release_all();
        let errors = envelope(rx).await;

        assert!(errors.is_empty());
        assert_eq!(handle.current_mode().await.unwrap(), QueueMode::Idle);
        assert_eq!(handle.debug_status().await.unwrap(), "idle");

        let requests = factory.requests.lock().unwrap();
        assert_eq!(requests[0].0, OperationType::All);
        assert!(requests[0].1.is_some());
    }

    #[tokio::test]
    async fn test_scheduled_rejected_while_scheduled_running() {
        let factory = Arc::new(ControlledFactory::with_jobs(1));
        let (handle, _pool, _token) = spawn_manager(factory.clone(), QueueCollaborators::default());

        let (first, first_rx) = BatchCallbacks::channel();
        handle
            .start_scheduled_all_operations(false, deps(), first)
            .await
            .unwrap();
        wait_for_count(&factory.started, 1).await;

        let (second, second_rx) = BatchCallbacks::channel();
        handle
            .start_scheduled_scan_operations(false, deps(), second)
            .await
            .unwrap();
        let rejected = envelope(second_rx).await;
        assert!(rejected.is_cannot_interrupt());
        assert!(rejected.operation_errors.is_none());

        assert_eq!(handle.current_mode().await.unwrap(), QueueMode::Scheduled);
        assert_eq!(factory.requests.lock().unwrap().len(), 1);

        factory.release_all();
        assert!(envelope(first_rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_immediate_interrupts_scheduled_batch_once() {
        let factory = Arc::new(ControlledFactory {
            job_count: 2,
            failing_jobs: vec![1],
            ..Default::default()
        });
        let (handle, _pool, _token) = spawn_manager(factory.clone(), QueueCollaborators::default());

        let interrupted_calls = Arc::new(AtomicUsize::new(0));
        let calls = interrupted_calls.clone();
        let (interrupted_tx, interrupted_rx) = oneshot::channel();
        let scheduled = BatchCallbacks::on_error(move |errors| {
            calls.fetch_add(1, Ordering::SeqCst);
            let _ = interrupted_tx.send(errors);
        });
        handle
            .start_scheduled_all_operations(false, deps(), scheduled)
            .await
            .unwrap();
        wait_for_count(&factory.started, 2).await;
        // Broker 1 has failed, both jobs are still running.
        wait_for_count(&factory.reported, 1).await;

        let (immediate, immediate_rx) = BatchCallbacks::channel();
        handle
            .start_immediate_operations(false, deps(), immediate)
            .await
            .unwrap();

        let interrupted = envelope(interrupted_rx).await;
        assert!(interrupted.is_interrupted());
        assert_eq!(interrupted.operation_error_count(), 1);

        wait_for_count(&factory.started, 4).await;
        assert_eq!(handle.current_mode().await.unwrap(), QueueMode::Immediate);

        factory.release_all();
        let immediate_errors = envelope(immediate_rx).await;
        assert!(immediate_errors.one_time_error.is_none());
        // Only the new batch's own failure, nothing carried over.
        assert_eq!(immediate_errors.operation_error_count(), 1);
        assert_eq!(interrupted_calls.load(Ordering::SeqCst), 1);

        let requests = factory.requests.lock().unwrap();
        assert_eq!(requests[1], (OperationType::ManualScan, None));
    }

    #[tokio::test]
    async fn test_partial_failures_are_aggregated() {
        let factory = Arc::new(ControlledFactory {
            job_count: 5,
            failing_jobs: vec![2, 4],
            ..Default::default()
        });
        let (handle, _pool, _token) = spawn_manager(factory.clone(), QueueCollaborators::default());

        let barrier_calls = Arc::new(AtomicUsize::new(0));
        let calls = barrier_calls.clone();
        let (tx, rx) = oneshot::channel();
        let callbacks = BatchCallbacks::new(
            move |errors| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(errors);
            },
            || {},
        );
        handle
            .start_immediate_operations(false, deps(), callbacks)
            .await
            .unwrap();
        // Concurrency for manual scans lets all five start.
        wait_for_count(&factory.started, 5).await;
        factory.release_all();

        let errors = envelope(rx).await;
        assert!(errors.one_time_error.is_none());
        assert_eq!(errors.operation_error_count(), 2);
        assert_eq!(barrier_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_factory_failure_is_fatal_and_resets_mode() {
        let factory = Arc::new(ControlledFactory {
            fail_creation: true,
            ..Default::default()
        });
        let (handle, _pool, _token) = spawn_manager(factory.clone(), QueueCollaborators::default());

        let (callbacks, rx) = BatchCallbacks::channel();
        handle
            .start_scheduled_all_operations(false, deps(), callbacks)
            .await
            .unwrap();

        let errors = envelope(rx).await;
        let fatal = errors.one_time_error.unwrap();
        assert!(fatal.to_string().contains("job source unavailable"));
        assert!(errors.operation_errors.is_none());
        assert_eq!(handle.current_mode().await.unwrap(), QueueMode::Idle);
        assert_eq!(factory.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_new_batch_admitted_after_completion() {
        let factory = Arc::new(ControlledFactory {
            job_count: 1,
            failing_jobs: vec![1],
            ..Default::default()
        });
        let (handle, _pool, _token) = spawn_manager(factory.clone(), QueueCollaborators::default());

        for round in 1..=2 {
            let (callbacks, rx) = BatchCallbacks::channel();
            handle
                .start_scheduled_scan_operations(false, deps(), callbacks)
                .await
                .unwrap();
            wait_for_count(&factory.started, round).await;
            factory.release_all();

            let errors = envelope(rx).await;
            assert!(errors.one_time_error.is_none());
            // Errors from the previous round are not carried over.
            assert_eq!(errors.operation_error_count(), 1);
            assert_eq!(handle.current_mode().await.unwrap(), QueueMode::Idle);
        }
    }

    #[tokio::test]
    async fn test_collaborators_are_invoked() {
        let factory = Arc::new(ControlledFactory::with_jobs(1));
        let updater = Arc::new(CountingCollaborator::default());
        let calculator = Arc::new(CountingCollaborator::default());
        let (handle, _pool, _token) = spawn_manager(
            factory.clone(),
            QueueCollaborators {
                broker_updater: Some(updater.clone()),
                mismatch_calculator: Some(calculator.clone()),
            },
        );

        let (callbacks, rx) = BatchCallbacks::channel();
        handle
            .start_scheduled_all_operations(false, deps(), callbacks)
            .await
            .unwrap();
        wait_for_count(&factory.started, 1).await;
        factory.release_all();
        // Failing broker update does not block the batch.
        assert!(envelope(rx).await.is_empty());
        assert_eq!(updater.calls.load(Ordering::SeqCst), 1);
        assert_eq!(calculator.calls.load(Ordering::SeqCst), 0);

        let (callbacks, rx) = BatchCallbacks::channel();
        handle
            .start_immediate_operations(false, deps(), callbacks)
            .await
            .unwrap();
        wait_for_count(&factory.started, 2).await;
        factory.release_all();
        envelope(rx).await;
        assert_eq!(updater.calls.load(Ordering::SeqCst), 2);
        assert_eq!(calculator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_debug_command_bypasses_mode() {
        let factory = Arc::new(ControlledFactory::with_jobs(2));
        let (handle, _pool, _token) = spawn_manager(factory.clone(), QueueCollaborators::default());

        let (callbacks, rx) = BatchCallbacks::channel();
        handle
            .execute_debug_command(DebugCommand::StartOptOutOperations {
                show_web_view: false,
                deps: deps(),
                callbacks,
            })
            .await
            .unwrap();
        wait_for_count(&factory.started, 2).await;
        assert_eq!(handle.debug_status().await.unwrap(), "idle");

        factory.release_all();
        assert!(envelope(rx).await.is_empty());
        assert_eq!(factory.requests.lock().unwrap()[0], (OperationType::OptOut, None));
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_active_batch() {
        let factory = Arc::new(ControlledFactory::with_jobs(1));
        let (handle, _pool, token) = spawn_manager(factory.clone(), QueueCollaborators::default());

        let (callbacks, rx) = BatchCallbacks::channel();
        handle
            .start_scheduled_all_operations(false, deps(), callbacks)
            .await
            .unwrap();
        wait_for_count(&factory.started, 1).await;

        token.cancel();
        assert!(envelope(rx).await.is_interrupted());
    }

    #[tokio::test]
    async fn test_finished_batch_is_not_reported_interrupted() {
        let pool = Arc::new(ManualPool::default());
        let (handle, _token) = spawn_manager_with_pool(
            pool.clone(),
            Arc::new(ControlledFactory::with_jobs(1)),
            QueueCollaborators::default(),
        );

        for _ in 0..40 {
            let (scheduled, scheduled_rx) = BatchCallbacks::channel();
            handle
                .start_scheduled_all_operations(false, deps(), scheduled)
                .await
                .unwrap();
            assert_eq!(handle.current_mode().await.unwrap(), QueueMode::Scheduled);

            // Every job finished, then an immediate request arrives.
            pool.fire_last_barrier();
            let (immediate, immediate_rx) = BatchCallbacks::channel();
            handle
                .start_immediate_operations(false, deps(), immediate)
                .await
                .unwrap();

            assert!(envelope(scheduled_rx).await.is_empty());
            assert_eq!(handle.current_mode().await.unwrap(), QueueMode::Immediate);

            pool.fire_last_barrier();
            assert!(envelope(immediate_rx).await.is_empty());
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_debug_run() {
        let factory = Arc::new(ControlledFactory::with_jobs(1));
        let (handle, _pool, token) = spawn_manager(factory.clone(), QueueCollaborators::default());

        let (callbacks, rx) = BatchCallbacks::channel();
        handle
            .execute_debug_command(DebugCommand::StartOptOutOperations {
                show_web_view: false,
                deps: deps(),
                callbacks,
            })
            .await
            .unwrap();
        wait_for_count(&factory.started, 1).await;

        token.cancel();
        assert!(envelope(rx).await.is_interrupted());
    }

    #[tokio::test]
    async fn test_scenario_two_brokers_from_three_records() {
        let t0 = Utc::now();
        let runner = Arc::new(RecordingRunner::default());
        let deps = test_dependencies(
            StaticJobSource::new(vec![
                broker_query(1, "A", 10, Some(t0 - chrono::Duration::minutes(5))),
                broker_query(1, "A", 11, Some(t0 - chrono::Duration::minutes(1))),
                broker_query(2, "B", 10, Some(t0 - chrono::Duration::minutes(3))),
            ]),
            runner.clone(),
        );
        let all_limit = deps.config.concurrent_operations_for(OperationType::All);
        let pool = Arc::new(LimitRecordingPool {
            inner: TokioWorkerPool::new(1),
            limits: Mutex::new(Vec::new()),
        });
        let (handle, _token) = spawn_manager_with_pool(
            pool.clone(),
            Arc::new(DefaultJobFactory),
            QueueCollaborators::default(),
        );

        let (callbacks, rx) = BatchCallbacks::channel();
        handle
            .start_scheduled_all_operations(false, deps, callbacks)
            .await
            .unwrap();

        let errors = envelope(rx).await;
        assert!(errors.one_time_error.is_none());
        assert!(errors.operation_errors.is_none());

        let mut calls = runner.calls();
        calls.sort();
        assert_eq!(
            calls,
            vec![
                ("scan".to_string(), 1, 10),
                ("scan".to_string(), 1, 11),
                ("scan".to_string(), 2, 10),
            ]
        );
        assert_eq!(*pool.limits.lock().unwrap(), vec![all_limit]);
    }
}
