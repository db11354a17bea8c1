use super::models::{BrokerProfileQuery, DataBroker, OptOutJobData, ProfileQuery, ScanJobData};
use super::schema::JOB_STORE_VERSIONED_SCHEMAS;
use super::JobSource;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        let is_new_db = !path.exists();

        let conn = Connection::open(path).context("Failed to open job store database")?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        let latest_schema = JOB_STORE_VERSIONED_SCHEMAS
            .last()
            .context("No job store schema defined")?;

        if is_new_db {
            info!("Creating new job store database at {:?}", path);
            latest_schema.create(&conn)?;
        } else {
            let raw_version: i64 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
            let db_version = raw_version - BASE_DB_VERSION as i64;

            if db_version < 1 {
                anyhow::bail!(
                    "Job store database version {} is invalid (expected >= 1)",
                    db_version
                );
            }

            let schema = JOB_STORE_VERSIONED_SCHEMAS
                .iter()
                .find(|s| s.version == db_version as usize)
                .with_context(|| format!("Unknown job store database version {}", db_version))?;
            schema.validate(&conn).with_context(|| {
                format!(
                    "Job store database schema validation failed for version {}",
                    db_version
                )
            })?;

            if schema.version < latest_schema.version {
                info!(
                    "Migrating job store database from version {} to {}",
                    schema.version, latest_schema.version
                );
                Self::migrate(&conn, schema.version)?;
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate(conn: &Connection, from_version: usize) -> Result<()> {
        let mut latest_from = from_version;
        for schema in JOB_STORE_VERSIONED_SCHEMAS
            .iter()
            .filter(|s| s.version > from_version)
        {
            if let Some(migration_fn) = schema.migration {
                migration_fn(conn).with_context(|| {
                    format!("Failed to run migration to version {}", schema.version)
                })?;
            }
            latest_from = schema.version;
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + latest_from),
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("Job store connection mutex poisoned"))
    }

    fn format_datetime(dt: &Option<DateTime<Utc>>) -> Option<String> {
        dt.map(|dt| dt.to_rfc3339())
    }

    /// Malformed stored dates are logged and read as unset.
    fn parse_datetime(value: Option<String>) -> Option<DateTime<Utc>> {
        let raw = value?;
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(dt) => Some(dt.with_timezone(&Utc)),
            Err(e) => {
                warn!("Ignoring malformed run date {:?} in job store: {}", raw, e);
                None
            }
        }
    }

    /// Insert a broker, returning its id.
    pub fn save_broker(&self, broker: &DataBroker) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO brokers (name, url, version) VALUES (?1, ?2, ?3)",
            params![broker.name, broker.url, broker.version],
        )
        .with_context(|| format!("Failed to save broker {}", broker.url))?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert a profile query, returning its id.
    pub fn save_profile_query(&self, query: &ProfileQuery) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO profile_queries (first_name, last_name, city, state, birth_year)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                query.first_name,
                query.last_name,
                query.city,
                query.state,
                query.birth_year
            ],
        )
        .context("Failed to save profile query")?;
        Ok(conn.last_insert_rowid())
    }

    /// Insert or replace the scan job of a broker/profile query pair.
    pub fn save_scan_job(&self, scan: &ScanJobData) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO scan_jobs (broker_id, profile_query_id, preferred_run_date, last_run_date)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(broker_id, profile_query_id) DO UPDATE SET
                preferred_run_date = excluded.preferred_run_date,
                last_run_date = excluded.last_run_date",
            params![
                scan.broker_id,
                scan.profile_query_id,
                Self::format_datetime(&scan.preferred_run_date),
                Self::format_datetime(&scan.last_run_date)
            ],
        )
        .context("Failed to save scan job")?;
        Ok(())
    }

    /// Insert or replace an opt-out job for an extracted profile.
    pub fn save_opt_out_job(&self, opt_out: &OptOutJobData) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO opt_out_jobs
                (broker_id, profile_query_id, extracted_profile_id, preferred_run_date, last_run_date)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(broker_id, profile_query_id, extracted_profile_id) DO UPDATE SET
                preferred_run_date = excluded.preferred_run_date,
                last_run_date = excluded.last_run_date",
            params![
                opt_out.broker_id,
                opt_out.profile_query_id,
                opt_out.extracted_profile_id,
                Self::format_datetime(&opt_out.preferred_run_date),
                Self::format_datetime(&opt_out.last_run_date)
            ],
        )
        .context("Failed to save opt-out job")?;
        Ok(())
    }

    fn fetch_opt_outs(conn: &Connection) -> Result<HashMap<(i64, i64), Vec<OptOutJobData>>> {
        let mut stmt = conn.prepare(
            "SELECT broker_id, profile_query_id, extracted_profile_id, preferred_run_date, last_run_date
             FROM opt_out_jobs ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(OptOutJobData {
                broker_id: row.get(0)?,
                profile_query_id: row.get(1)?,
                extracted_profile_id: row.get(2)?,
                preferred_run_date: Self::parse_datetime(row.get(3)?),
                last_run_date: Self::parse_datetime(row.get(4)?),
            })
        })?;

        let mut by_pair: HashMap<(i64, i64), Vec<OptOutJobData>> = HashMap::new();
        for row in rows {
            let opt_out = row?;
            by_pair
                .entry((opt_out.broker_id, opt_out.profile_query_id))
                .or_default()
                .push(opt_out);
        }
        Ok(by_pair)
    }
}

impl JobSource for SqliteJobStore {
    fn fetch_all_query_data(&self) -> Result<Vec<BrokerProfileQuery>> {
        let conn = self.lock()?;
        let mut opt_outs = Self::fetch_opt_outs(&conn).context("Failed to read opt-out jobs")?;

        let mut stmt = conn.prepare(
            "SELECT b.id, b.name, b.url, b.version,
                    pq.id, pq.first_name, pq.last_name, pq.city, pq.state, pq.birth_year,
                    s.preferred_run_date, s.last_run_date
             FROM scan_jobs s
             JOIN brokers b ON b.id = s.broker_id
             JOIN profile_queries pq ON pq.id = s.profile_query_id
             ORDER BY s.rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            let broker_id: i64 = row.get(0)?;
            let profile_query_id: i64 = row.get(4)?;
            Ok(BrokerProfileQuery {
                data_broker: DataBroker {
                    id: Some(broker_id),
                    name: row.get(1)?,
                    url: row.get(2)?,
                    version: row.get(3)?,
                },
                profile_query: ProfileQuery {
                    id: Some(profile_query_id),
                    first_name: row.get(5)?,
                    last_name: row.get(6)?,
                    city: row.get(7)?,
                    state: row.get(8)?,
                    birth_year: row.get(9)?,
                },
                scan_job_data: ScanJobData {
                    broker_id,
                    profile_query_id,
                    preferred_run_date: Self::parse_datetime(row.get(10)?),
                    last_run_date: Self::parse_datetime(row.get(11)?),
                },
                opt_out_jobs_data: Vec::new(),
            })
        })?;

        let mut result = Vec::new();
        for row in rows {
            let mut query = row.context("Failed to read broker profile query")?;
            query.opt_out_jobs_data = opt_outs
                .remove(&(query.scan_job_data.broker_id, query.scan_job_data.profile_query_id))
                .unwrap_or_default();
            result.push(query);
        }

        debug!("Fetched {} broker profile queries", result.len());
        Ok(result)
    }
}
