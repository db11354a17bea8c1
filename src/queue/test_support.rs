//! Fixtures shared by the queue unit tests.

use super::error_aggregator::JobErrorDelegate;
use super::job::{JobRunner, RunContext};
use super::OperationDependencies;
use crate::config::ExecutionConfig;
use crate::job_store::{
    BrokerJobData, BrokerProfileQuery, DataBroker, JobSource, OptOutJobData, ProfileQuery,
    ScanJobData,
};
use crate::queue::DataBrokerError;
use crate::telemetry::{TelemetryEvent, TelemetrySink};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn broker_query(
    broker_id: i64,
    broker_name: &str,
    profile_query_id: i64,
    preferred_run_date: Option<DateTime<Utc>>,
) -> BrokerProfileQuery {
    BrokerProfileQuery {
        data_broker: DataBroker {
            id: Some(broker_id),
            name: broker_name.to_string(),
            url: format!("{}.com", broker_name.to_lowercase()),
            version: "1.0.0".to_string(),
        },
        profile_query: ProfileQuery {
            id: Some(profile_query_id),
            first_name: "John".to_string(),
            last_name: "Doe".to_string(),
            city: "Miami".to_string(),
            state: "FL".to_string(),
            birth_year: 1978,
        },
        scan_job_data: ScanJobData {
            broker_id,
            profile_query_id,
            preferred_run_date,
            last_run_date: None,
        },
        opt_out_jobs_data: Vec::new(),
    }
}

pub fn with_opt_out(
    mut query: BrokerProfileQuery,
    extracted_profile_id: i64,
    preferred_run_date: Option<DateTime<Utc>>,
) -> BrokerProfileQuery {
    query.opt_out_jobs_data.push(OptOutJobData {
        broker_id: query.scan_job_data.broker_id,
        profile_query_id: query.scan_job_data.profile_query_id,
        extracted_profile_id,
        preferred_run_date,
        last_run_date: None,
    });
    query
}

pub struct StaticJobSource {
    queries: Vec<BrokerProfileQuery>,
    fail: bool,
}

impl StaticJobSource {
    pub fn new(queries: Vec<BrokerProfileQuery>) -> Self {
        Self {
            queries,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            queries: Vec::new(),
            fail: true,
        }
    }
}

impl JobSource for StaticJobSource {
    fn fetch_all_query_data(&self) -> Result<Vec<BrokerProfileQuery>> {
        if self.fail {
            anyhow::bail!("database unavailable");
        }
        Ok(self.queries.clone())
    }
}

/// Runner recording `(kind, broker id, profile query id)` for each call.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<(String, i64, i64)>>,
    failing_queries: Vec<i64>,
    delay: Duration,
}

impl RecordingRunner {
    pub fn failing_for(profile_query_ids: &[i64]) -> Self {
        Self {
            failing_queries: profile_query_ids.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, i64, i64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobRunner for RecordingRunner {
    async fn run(
        &self,
        job: &BrokerJobData,
        _query: &BrokerProfileQuery,
        _ctx: &RunContext,
    ) -> Result<()> {
        self.calls.lock().unwrap().push((
            job.kind().to_string(),
            job.broker_id(),
            job.profile_query_id(),
        ));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing_queries.contains(&job.profile_query_id()) {
            return Err(DataBrokerError::HttpError { code: 500 }.into());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingDelegate {
    errors: Mutex<Vec<(String, Option<String>)>>,
}

impl RecordingDelegate {
    pub fn errors(&self) -> Vec<(String, Option<String>)> {
        self.errors.lock().unwrap().clone()
    }
}

impl JobErrorDelegate for RecordingDelegate {
    fn job_did_error(&self, error: anyhow::Error, broker_name: Option<&str>) {
        self.errors
            .lock()
            .unwrap()
            .push((error.to_string(), broker_name.map(str::to_string)));
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn fire(&self, event: TelemetryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn test_config() -> ExecutionConfig {
    ExecutionConfig {
        interval_between_same_broker_operations: Duration::ZERO,
        ..ExecutionConfig::default()
    }
}

pub fn test_dependencies(
    source: StaticJobSource,
    runner: Arc<dyn JobRunner>,
) -> OperationDependencies {
    OperationDependencies {
        config: test_config(),
        job_source: Arc::new(source),
        runner,
    }
}
