//! Database schema for registry.db.
//!
//! Defines versioned schemas for datasets, jobs, job events and alerts.

use crate::sqlite_column;
use crate::sqlite_persistence::{ForeignKey, Index, SqlType, Table, VersionedSchema};
use anyhow::Result;
use rusqlite::Connection;

const DATASET_FK: ForeignKey = ForeignKey {
    foreign_table: "datasets",
    foreign_column: "id",
};

const JOB_FK: ForeignKey = ForeignKey {
    foreign_table: "jobs",
    foreign_column: "id",
};

// =============================================================================
// Version 0
// =============================================================================

const DATASETS_TABLE_V0: Table = Table {
    name: "datasets",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("url", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("last_revision", &SqlType::Text),
        sqlite_column!("head_describe", &SqlType::Text),
        sqlite_column!("annex_uuid", &SqlType::Text),
        sqlite_column!("branches", &SqlType::Text),
        sqlite_column!("tags", &SqlType::Text),
        sqlite_column!("size_bytes", &SqlType::Integer),
        sqlite_column!("check_interval_secs", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "consecutive_failures",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!(
            "processed",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("registered_at", &SqlType::Integer, non_null = true),
        sqlite_column!("last_checked_at", &SqlType::Integer),
        sqlite_column!("last_changed_at", &SqlType::Integer),
        sqlite_column!("update_announced_at", &SqlType::Integer),
        sqlite_column!("retired_at", &SqlType::Integer),
    ],
    indices: &[
        Index {
            name: "idx_datasets_url",
            columns: "url",
            unique: true,
            predicate: None,
        },
        Index::plain("idx_datasets_status", "status"),
    ],
};

const JOBS_TABLE_V0: Table = Table {
    name: "jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "dataset_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&DATASET_FK)
        ),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("state", &SqlType::Text, non_null = true),
        sqlite_column!(
            "attempts",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("max_attempts", &SqlType::Integer, non_null = true),
        sqlite_column!("scheduled_at", &SqlType::Integer, non_null = true),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
        sqlite_column!("claimed_by", &SqlType::Text),
        sqlite_column!("lease_expires_at", &SqlType::Integer),
        sqlite_column!("last_heartbeat_at", &SqlType::Integer),
        sqlite_column!("started_at", &SqlType::Integer),
        sqlite_column!("finished_at", &SqlType::Integer),
        sqlite_column!(
            "cancel_requested",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("result", &SqlType::Text),
        sqlite_column!("error_kind", &SqlType::Text),
        sqlite_column!("error_detail", &SqlType::Text),
    ],
    indices: &[
        Index::plain("idx_jobs_claim_order", "state, scheduled_at, id"),
        Index::plain("idx_jobs_dataset", "dataset_id, created_at"),
        Index::plain("idx_jobs_lease", "state, lease_expires_at"),
        Index {
            name: "idx_jobs_one_active_per_dataset",
            columns: "dataset_id",
            unique: true,
            predicate: Some("state IN ('pending', 'claimed', 'running')"),
        },
    ],
};

const JOB_EVENTS_TABLE_V0: Table = Table {
    name: "job_events",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "job_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&JOB_FK)
        ),
        sqlite_column!("dataset_id", &SqlType::Text, non_null = true),
        sqlite_column!("event_type", &SqlType::Text, non_null = true),
        sqlite_column!("timestamp", &SqlType::Integer, non_null = true),
        sqlite_column!("worker_id", &SqlType::Text),
        sqlite_column!("details", &SqlType::Text),
    ],
    indices: &[Index::plain("idx_job_events_job", "job_id, timestamp")],
};

// =============================================================================
// Version 1 - alerting
// =============================================================================

const DATASETS_TABLE_V1: Table = Table {
    name: "datasets",
    columns: &[
        sqlite_column!("id", &SqlType::Text, is_primary_key = true),
        sqlite_column!("url", &SqlType::Text, non_null = true),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("last_revision", &SqlType::Text),
        sqlite_column!("head_describe", &SqlType::Text),
        sqlite_column!("annex_uuid", &SqlType::Text),
        sqlite_column!("branches", &SqlType::Text),
        sqlite_column!("tags", &SqlType::Text),
        sqlite_column!("size_bytes", &SqlType::Integer),
        sqlite_column!("check_interval_secs", &SqlType::Integer, non_null = true),
        sqlite_column!(
            "consecutive_failures",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!(
            "processed",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("registered_at", &SqlType::Integer, non_null = true),
        sqlite_column!("last_checked_at", &SqlType::Integer),
        sqlite_column!("last_changed_at", &SqlType::Integer),
        sqlite_column!("update_announced_at", &SqlType::Integer),
        sqlite_column!("retired_at", &SqlType::Integer),
        sqlite_column!("alerted_status", &SqlType::Text),
    ],
    indices: DATASETS_TABLE_V0.indices,
};

const ALERTS_TABLE_V1: Table = Table {
    name: "alerts",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "dataset_id",
            &SqlType::Text,
            non_null = true,
            foreign_key = Some(&DATASET_FK)
        ),
        sqlite_column!("kind", &SqlType::Text, non_null = true),
        sqlite_column!("consecutive_failures", &SqlType::Integer, non_null = true),
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true),
    ],
    indices: &[Index::plain("idx_alerts_dataset", "dataset_id, created_at")],
};

fn migrate_v0_to_v1(conn: &Connection) -> Result<()> {
    conn.execute("ALTER TABLE datasets ADD COLUMN alerted_status TEXT", [])?;
    ALERTS_TABLE_V1.create(conn)?;
    Ok(())
}

pub const REGISTRY_VERSIONED_SCHEMAS: &[VersionedSchema] = &[
    VersionedSchema {
        version: 0,
        tables: &[DATASETS_TABLE_V0, JOBS_TABLE_V0, JOB_EVENTS_TABLE_V0],
        migration: None,
    },
    VersionedSchema {
        version: 1,
        tables: &[
            DATASETS_TABLE_V1,
            JOBS_TABLE_V0,
            JOB_EVENTS_TABLE_V0,
            ALERTS_TABLE_V1,
        ],
        migration: Some(migrate_v0_to_v1),
    },
];
