//! Storage of broker profile queries and the scan/opt-out work attached to them.

mod models;
mod schema;
mod sqlite_job_store;

pub use models::*;
pub use schema::JOB_STORE_VERSIONED_SCHEMAS;
pub use sqlite_job_store::SqliteJobStore;

use anyhow::Result;

/// Source of the records the queue builds its jobs from.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait JobSource: Send + Sync {
    /// Every broker profile query currently stored, in a stable order.
    fn fetch_all_query_data(&self) -> Result<Vec<BrokerProfileQuery>>;
}
