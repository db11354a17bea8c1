use super::error_aggregator::JobErrorDelegate;
use super::{OperationDependencies, OperationType};
use crate::job_store::{BrokerJobData, BrokerProfileQuery};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A unit of work submitted to the worker pool.
#[async_trait]
pub trait QueueJob: Send + Sync {
    /// Broker this job works on.
    fn broker_id(&self) -> i64;

    /// Run to completion or until `cancellation_token` is cancelled.
    /// Failures are reported through the job's error delegate.
    async fn run(&self, cancellation_token: CancellationToken);
}

/// Context passed to the runner for a single scan or opt-out.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub operation_type: OperationType,
    pub show_web_view: bool,
    pub is_immediate: bool,
    pub cancellation_token: CancellationToken,
}

/// Executes one scan or opt-out against a broker.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(
        &self,
        job: &BrokerJobData,
        query: &BrokerProfileQuery,
        ctx: &RunContext,
    ) -> Result<()>;
}

/// Runs every due scan and/or opt-out of one broker, one after the other.
pub struct BrokerJob {
    broker_id: i64,
    operation_type: OperationType,
    priority_date: Option<DateTime<Utc>>,
    show_web_view: bool,
    error_delegate: Arc<dyn JobErrorDelegate>,
    deps: OperationDependencies,
}

impl BrokerJob {
    pub fn new(
        broker_id: i64,
        operation_type: OperationType,
        priority_date: Option<DateTime<Utc>>,
        show_web_view: bool,
        error_delegate: Arc<dyn JobErrorDelegate>,
        deps: OperationDependencies,
    ) -> Self {
        Self {
            broker_id,
            operation_type,
            priority_date,
            show_web_view,
            error_delegate,
            deps,
        }
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn priority_date(&self) -> Option<DateTime<Utc>> {
        self.priority_date
    }

    pub fn show_web_view(&self) -> bool {
        self.show_web_view
    }

    /// Work items of this broker, in execution order.
    ///
    /// With a priority date only items whose preferred run date is not after it
    /// are kept, earliest first. Without one every item is kept in source order.
    pub fn collect_job_data<'a>(
        &self,
        queries: &'a [BrokerProfileQuery],
    ) -> Vec<(BrokerJobData, &'a BrokerProfileQuery)> {
        let mut items = Vec::new();
        for query in queries
            .iter()
            .filter(|q| q.broker_id() == Some(self.broker_id))
        {
            if self.operation_type.includes_scans() {
                items.push((BrokerJobData::Scan(query.scan_job_data.clone()), query));
            }
            if self.operation_type.includes_opt_outs() {
                items.extend(
                    query
                        .opt_out_jobs_data
                        .iter()
                        .map(|opt_out| (BrokerJobData::OptOut(opt_out.clone()), query)),
                );
            }
        }

        if let Some(priority_date) = self.priority_date {
            items.retain(|(data, _)| {
                data.preferred_run_date()
                    .is_some_and(|date| date <= priority_date)
            });
            items.sort_by_key(|(data, _)| data.preferred_run_date());
        }

        items
    }

    fn run_context(&self, cancellation_token: &CancellationToken) -> RunContext {
        RunContext {
            operation_type: self.operation_type,
            show_web_view: self.show_web_view,
            is_immediate: self.operation_type == OperationType::ManualScan,
            cancellation_token: cancellation_token.clone(),
        }
    }
}

#[async_trait]
impl QueueJob for BrokerJob {
    fn broker_id(&self) -> i64 {
        self.broker_id
    }

    async fn run(&self, cancellation_token: CancellationToken) {
        let queries = match self
            .deps
            .job_source
            .fetch_all_query_data()
            .with_context(|| format!("Failed to load jobs for broker {}", self.broker_id))
        {
            Ok(queries) => queries,
            Err(e) => {
                self.error_delegate.job_did_error(e, None);
                return;
            }
        };

        let items = self.collect_job_data(&queries);
        debug!(
            "Broker {} has {} {} items to run",
            self.broker_id,
            items.len(),
            self.operation_type
        );

        let ctx = self.run_context(&cancellation_token);
        let interval = self.deps.config.interval_between_same_broker_operations;

        for (data, query) in items {
            if cancellation_token.is_cancelled() {
                info!("Broker {} job cancelled", self.broker_id);
                break;
            }

            let result = tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => {
                    info!(
                        "Broker {} job cancelled during {}",
                        self.broker_id,
                        data.kind()
                    );
                    break;
                }
                result = self.deps.runner.run(&data, query, &ctx) => result,
            };

            match result {
                Ok(()) => {
                    tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                Err(e) => {
                    self.error_delegate
                        .job_did_error(e, Some(query.broker_name()));
                }
            }
        }
    }
}
