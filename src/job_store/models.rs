use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBroker {
    pub id: Option<i64>,
    pub name: String,
    pub url: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileQuery {
    pub id: Option<i64>,
    pub first_name: String,
    pub last_name: String,
    pub city: String,
    pub state: String,
    pub birth_year: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJobData {
    pub broker_id: i64,
    pub profile_query_id: i64,
    pub preferred_run_date: Option<DateTime<Utc>>,
    pub last_run_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptOutJobData {
    pub broker_id: i64,
    pub profile_query_id: i64,
    pub extracted_profile_id: i64,
    pub preferred_run_date: Option<DateTime<Utc>>,
    pub last_run_date: Option<DateTime<Utc>>,
}

/// One profile query as seen by one broker, with all work attached to the pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerProfileQuery {
    pub data_broker: DataBroker,
    pub profile_query: ProfileQuery,
    pub scan_job_data: ScanJobData,
    pub opt_out_jobs_data: Vec<OptOutJobData>,
}

impl BrokerProfileQuery {
    pub fn broker_id(&self) -> Option<i64> {
        self.data_broker.id
    }

    pub fn broker_name(&self) -> &str {
        &self.data_broker.name
    }
}

/// A single unit of work run against a broker: one scan or one opt-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerJobData {
    Scan(ScanJobData),
    OptOut(OptOutJobData),
}

impl BrokerJobData {
    pub fn broker_id(&self) -> i64 {
        match self {
            BrokerJobData::Scan(data) => data.broker_id,
            BrokerJobData::OptOut(data) => data.broker_id,
        }
    }

    pub fn profile_query_id(&self) -> i64 {
        match self {
            BrokerJobData::Scan(data) => data.profile_query_id,
            BrokerJobData::OptOut(data) => data.profile_query_id,
        }
    }

    pub fn preferred_run_date(&self) -> Option<DateTime<Utc>> {
        match self {
            BrokerJobData::Scan(data) => data.preferred_run_date,
            BrokerJobData::OptOut(data) => data.preferred_run_date,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BrokerJobData::Scan(_) => "scan",
            BrokerJobData::OptOut(_) => "opt_out",
        }
    }
}
