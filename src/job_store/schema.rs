//! SQLite schema definitions for the job store database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, ForeignKey, SqlType, Table, VersionedSchema};

// =============================================================================
// Version 1 - Brokers, profile queries, scan and opt-out jobs
// =============================================================================

const BROKERS_TABLE_V1: Table = Table {
    name: "brokers",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("url", &SqlType::Text, non_null = true),
        sqlite_column!("version", &SqlType::Text, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[&["url"]],
};

const PROFILE_QUERIES_TABLE_V1: Table = Table {
    name: "profile_queries",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("first_name", &SqlType::Text, non_null = true),
        sqlite_column!("last_name", &SqlType::Text, non_null = true),
        sqlite_column!("city", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!("birth_year", &SqlType::Integer, non_null = true),
    ],
    indices: &[],
    unique_constraints: &[],
};

/// One row per broker/profile query pair.
const SCAN_JOBS_TABLE_V1: Table = Table {
    name: "scan_jobs",
    columns: &[
        sqlite_column!(
            "broker_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "brokers",
                foreign_column: "id",
            })
        ),
        sqlite_column!(
            "profile_query_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "profile_queries",
                foreign_column: "id",
            })
        ),
        sqlite_column!("preferred_run_date", &SqlType::Text),
        sqlite_column!("last_run_date", &SqlType::Text),
    ],
    indices: &[("idx_scan_jobs_broker", "broker_id")],
    unique_constraints: &[&["broker_id", "profile_query_id"]],
};

const OPT_OUT_JOBS_TABLE_V1: Table = Table {
    name: "opt_out_jobs",
    columns: &[
        sqlite_column!(
            "broker_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "brokers",
                foreign_column: "id",
            })
        ),
        sqlite_column!(
            "profile_query_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "profile_queries",
                foreign_column: "id",
            })
        ),
        sqlite_column!("extracted_profile_id", &SqlType::Integer, non_null = true),
        sqlite_column!("preferred_run_date", &SqlType::Text),
        sqlite_column!("last_run_date", &SqlType::Text),
    ],
    indices: &[("idx_opt_out_jobs_broker_query", "broker_id, profile_query_id")],
    unique_constraints: &[&["broker_id", "profile_query_id", "extracted_profile_id"]],
};

pub const JOB_STORE_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 1,
    tables: &[
        BROKERS_TABLE_V1,
        PROFILE_QUERIES_TABLE_V1,
        SCAN_JOBS_TABLE_V1,
        OPT_OUT_JOBS_TABLE_V1,
    ],
    migration: None,
}];
