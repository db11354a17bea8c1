//! Job runner delegating each scan or opt-out to an external program.
//!
//! The program receives the work item through environment variables:
//!
//! | Variable                  | Value                                  |
//! |---------------------------|----------------------------------------|
//! | `DBP_OPERATION`           | `scan` or `opt_out`                    |
//! | `DBP_BROKER_ID`           | broker id                              |
//! | `DBP_BROKER_NAME`         | broker name                            |
//! | `DBP_BROKER_URL`          | broker url                             |
//! | `DBP_PROFILE_QUERY_ID`    | profile query id                       |
//! | `DBP_EXTRACTED_PROFILE_ID`| extracted profile id (opt-outs only)   |
//! | `DBP_SHOW_WEB_VIEW`       | `1` or `0`                             |
//! | `DBP_IMMEDIATE`           | `1` for manual scans, `0` otherwise    |
//!
//! A zero exit status is a success. On failure the last non-empty stderr line
//! is classified: `HTTP <code>` and `ACTION <id>: <message>` map to the
//! matching [`DataBrokerError`] variants, anything else is reported as unknown.

use crate::job_store::{BrokerJobData, BrokerProfileQuery};
use crate::queue::{DataBrokerError, JobRunner, RunContext};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

pub struct CommandJobRunner {
    program: String,
    args: Vec<String>,
}

impl CommandJobRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command(&self, job: &BrokerJobData, query: &BrokerProfileQuery, ctx: &RunContext) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("DBP_OPERATION", job.kind())
            .env("DBP_BROKER_ID", job.broker_id().to_string())
            .env("DBP_BROKER_NAME", query.broker_name())
            .env("DBP_BROKER_URL", &query.data_broker.url)
            .env("DBP_PROFILE_QUERY_ID", job.profile_query_id().to_string())
            .env("DBP_SHOW_WEB_VIEW", flag(ctx.show_web_view))
            .env("DBP_IMMEDIATE", flag(ctx.is_immediate))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let BrokerJobData::OptOut(opt_out) = job {
            command.env(
                "DBP_EXTRACTED_PROFILE_ID",
                opt_out.extracted_profile_id.to_string(),
            );
        }
        command
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "1"
    } else {
        "0"
    }
}

/// Map the runner's stderr to a domain error.
fn classify_failure(stderr: &str, status: std::process::ExitStatus) -> DataBrokerError {
    let Some(line) = stderr.lines().rev().map(str::trim).find(|l| !l.is_empty()) else {
        return DataBrokerError::Unknown(format!("runner exited with {}", status));
    };

    if let Some(code) = line
        .strip_prefix("HTTP ")
        .and_then(|code| code.trim().parse::<u16>().ok())
    {
        return DataBrokerError::HttpError { code };
    }

    if let Some((action_id, message)) = line
        .strip_prefix("ACTION ")
        .and_then(|rest| rest.split_once(':'))
    {
        return DataBrokerError::ActionFailed {
            action_id: action_id.trim().to_string(),
            message: message.trim().to_string(),
        };
    }

    DataBrokerError::Unknown(line.to_string())
}

#[async_trait]
impl JobRunner for CommandJobRunner {
    async fn run(
        &self,
        job: &BrokerJobData,
        query: &BrokerProfileQuery,
        ctx: &RunContext,
    ) -> Result<()> {
        debug!(
            "Running {} for broker {} (profile query {})",
            job.kind(),
            query.broker_name(),
            job.profile_query_id()
        );

        let child = self
            .command(job, query, ctx)
            .spawn()
            .with_context(|| format!("Failed to start job runner {}", self.program))?;

        // Dropping the child kills the process.
        let output = tokio::select! {
            _ = ctx.cancellation_token.cancelled() => {
                return Err(DataBrokerError::Cancelled.into());
            }
            output = child.wait_with_output() => output.context("Failed to wait for job runner")?,
        };

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(classify_failure(&stderr, output.status).into())
    }
}
