use super::error_aggregator::JobErrorDelegate;
use super::job::{BrokerJob, QueueJob};
use super::{OperationDependencies, OperationType};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Builds the jobs of a batch.
pub trait JobFactory: Send + Sync {
    fn create_jobs(
        &self,
        operation_type: OperationType,
        priority_date: Option<DateTime<Utc>>,
        show_web_view: bool,
        error_delegate: Arc<dyn JobErrorDelegate>,
        deps: &OperationDependencies,
    ) -> Result<Vec<Box<dyn QueueJob>>>;
}

/// Creates one [`BrokerJob`] per distinct broker found in the job source.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultJobFactory;

impl DefaultJobFactory {
    /// Jobs in first-seen broker order; later records of a known broker are skipped.
    pub fn broker_jobs(
        &self,
        operation_type: OperationType,
        priority_date: Option<DateTime<Utc>>,
        show_web_view: bool,
        error_delegate: Arc<dyn JobErrorDelegate>,
        deps: &OperationDependencies,
    ) -> Result<Vec<BrokerJob>> {
        let queries = deps
            .job_source
            .fetch_all_query_data()
            .context("Failed to fetch broker profile queries")?;

        let mut seen_brokers = HashSet::new();
        let mut jobs = Vec::new();
        for query in &queries {
            let Some(broker_id) = query.broker_id() else {
                continue;
            };
            if !seen_brokers.insert(broker_id) {
                continue;
            }
            jobs.push(BrokerJob::new(
                broker_id,
                operation_type,
                priority_date,
                show_web_view,
                Arc::clone(&error_delegate),
                deps.clone(),
            ));
        }

        debug!(
            "Created {} {} jobs from {} query records",
            jobs.len(),
            operation_type,
            queries.len()
        );
        Ok(jobs)
    }
}

impl JobFactory for DefaultJobFactory {
    fn create_jobs(
        &self,
        operation_type: OperationType,
        priority_date: Option<DateTime<Utc>>,
        show_web_view: bool,
        error_delegate: Arc<dyn JobErrorDelegate>,
        deps: &OperationDependencies,
    ) -> Result<Vec<Box<dyn QueueJob>>> {
        Ok(self
            .broker_jobs(operation_type, priority_date, show_web_view, error_delegate, deps)?
            .into_iter()
            .map(|job| Box::new(job) as Box<dyn QueueJob>)
            .collect())
    }
}
