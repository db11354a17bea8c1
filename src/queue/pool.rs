use super::job::QueueJob;
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bounded executor for queue jobs.
pub trait WorkerPool: Send + Sync {
    /// Concurrency limit applied to jobs submitted from now on.
    fn set_max_concurrent(&self, max_concurrent: usize);

    fn submit(&self, job: Box<dyn QueueJob>);

    /// Cancel queued and running jobs. Jobs stop cooperatively.
    fn cancel_all(&self);

    /// Run `callback` once every job submitted so far has finished.
    fn run_after_all_current_work_completes(&self, callback: Box<dyn FnOnce() + Send>);
}

struct PoolState {
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
    pending: Vec<JoinHandle<()>>,
}

/// Worker pool backed by Tokio tasks gated by a semaphore.
pub struct TokioWorkerPool {
    state: Mutex<PoolState>,
}

impl TokioWorkerPool {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            state: Mutex::new(PoolState {
                semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
                token: CancellationToken::new(),
                pending: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkerPool for TokioWorkerPool {
    fn set_max_concurrent(&self, max_concurrent: usize) {
        let max_concurrent = max_concurrent.max(1);
        debug!("Worker pool concurrency set to {}", max_concurrent);
        self.state().semaphore = Arc::new(Semaphore::new(max_concurrent));
    }

    fn submit(&self, job: Box<dyn QueueJob>) {
        let mut state = self.state();
        let semaphore = Arc::clone(&state.semaphore);
        let token = state.token.clone();

        let handle = tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                permit = semaphore.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            if token.is_cancelled() {
                return;
            }
            job.run(token).await;
        });

        state.pending.retain(|handle| !handle.is_finished());
        state.pending.push(handle);
    }

    fn cancel_all(&self) {
        let mut state = self.state();
        state.token.cancel();
        state.token = CancellationToken::new();
    }

    fn run_after_all_current_work_completes(&self, callback: Box<dyn FnOnce() + Send>) {
        let mut state = self.state();
        let handles = std::mem::take(&mut state.pending);

        let barrier = tokio::spawn(async move {
            join_all(handles).await;
            callback();
        });
        state.pending.push(barrier);
    }
}
