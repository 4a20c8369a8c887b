//! SQLite-backed registry store.
//!
//! One connection per process behind a mutex. Every mutation runs in an
//! immediate transaction so separate processes sharing the database file
//! serialize on the SQLite write lock.

use super::error::{StoreError, StoreResult};
use super::models::*;
use super::schema::REGISTRY_VERSIONED_SCHEMAS;
use super::RegistryStore;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{bail, Context};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction,
    TransactionBehavior,
};
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

const ACTIVE_STATES: &str = "('pending', 'claimed', 'running')";
const LEASED_STATES: &str = "('claimed', 'running')";
const TERMINAL_STATES: &str = "('succeeded', 'failed', 'cancelled')";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteRegistryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRegistryStore {
    /// Open an existing registry database, or create one with the latest schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> anyhow::Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open_with_flags(
                &db_path,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            let conn = Connection::open(&db_path)?;
            REGISTRY_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new registry database at {:?}", db_path.as_ref());
            conn
        };

        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Registry database version {} is too old, does not contain base db version {}",
                db_version,
                BASE_DB_VERSION
            );
        }
        let version = db_version as usize;

        let schema_count = REGISTRY_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Registry database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        REGISTRY_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteRegistryStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a store backed by a private in-memory database.
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        REGISTRY_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;

        Ok(SqliteRegistryStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate_if_needed(conn: &Connection, current_version: usize) -> anyhow::Result<()> {
        let target_version = REGISTRY_VERSIONED_SCHEMAS.len() - 1;
        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating registry database from version {} to {}",
            current_version, target_version
        );

        for schema in REGISTRY_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!("Running registry migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }

        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
            [],
        )?;
        REGISTRY_VERSIONED_SCHEMAS[target_version].validate(conn)?;
        Ok(())
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("registry connection poisoned".to_string()))
    }

    fn row_to_dataset(row: &rusqlite::Row) -> rusqlite::Result<Dataset> {
        Ok(Dataset {
            id: row.get("id")?,
            url: row.get("url")?,
            status: decode(row.get("status")?, DatasetStatus::from_str, "dataset status")?,
            last_revision: row.get("last_revision")?,
            head_describe: row.get("head_describe")?,
            annex_uuid: row.get("annex_uuid")?,
            branches: decode_list(row.get("branches")?),
            tags: decode_list(row.get("tags")?),
            size_bytes: row.get::<_, Option<i64>>("size_bytes")?.map(|v| v as u64),
            check_interval_secs: row.get::<_, i64>("check_interval_secs")? as u64,
            consecutive_failures: row.get::<_, i64>("consecutive_failures")? as u32,
            last_error: row.get("last_error")?,
            processed: row.get::<_, i64>("processed")? != 0,
            alerted_status: row
                .get::<_, Option<String>>("alerted_status")?
                .and_then(|s| DatasetStatus::from_str(&s)),
            registered_at: row.get("registered_at")?,
            last_checked_at: row.get("last_checked_at")?,
            last_changed_at: row.get("last_changed_at")?,
            update_announced_at: row.get("update_announced_at")?,
            retired_at: row.get("retired_at")?,
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        Ok(Job {
            id: row.get("id")?,
            dataset_id: row.get("dataset_id")?,
            kind: decode(row.get("kind")?, JobKind::from_str, "job kind")?,
            state: decode(row.get("state")?, JobState::from_str, "job state")?,
            attempts: row.get::<_, i64>("attempts")? as u32,
            max_attempts: row.get::<_, i64>("max_attempts")? as u32,
            scheduled_at: row.get("scheduled_at")?,
            created_at: row.get("created_at")?,
            claimed_by: row.get("claimed_by")?,
            lease_expires_at: row.get("lease_expires_at")?,
            last_heartbeat_at: row.get("last_heartbeat_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
            cancel_requested: row.get::<_, i64>("cancel_requested")? != 0,
            result: row
                .get::<_, Option<String>>("result")?
                .and_then(|s| serde_json::from_str(&s).ok()),
            error_kind: row
                .get::<_, Option<String>>("error_kind")?
                .and_then(|s| FailureKind::from_str(&s)),
            error_detail: row.get("error_detail")?,
        })
    }

    fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<JobEvent> {
        Ok(JobEvent {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            dataset_id: row.get("dataset_id")?,
            event_type: decode(row.get("event_type")?, JobEventType::from_str, "event type")?,
            timestamp: row.get("timestamp")?,
            worker_id: row.get("worker_id")?,
            details: row
                .get::<_, Option<String>>("details")?
                .and_then(|s| serde_json::from_str(&s).ok()),
        })
    }

    fn row_to_alert(row: &rusqlite::Row) -> rusqlite::Result<AlertEvent> {
        Ok(AlertEvent {
            id: row.get("id")?,
            dataset_id: row.get("dataset_id")?,
            url: row.get("url")?,
            kind: decode(row.get("kind")?, AlertKind::from_str, "alert kind")?,
            consecutive_failures: row.get::<_, i64>("consecutive_failures")? as u32,
            last_error: row.get("last_error")?,
            created_at: row.get("created_at")?,
        })
    }

    fn load_dataset(conn: &Connection, id: &str) -> StoreResult<Option<Dataset>> {
        Ok(conn
            .query_row(
                "SELECT * FROM datasets WHERE id = ?1",
                [id],
                Self::row_to_dataset,
            )
            .optional()?)
    }

    fn load_job(conn: &Connection, id: JobId) -> StoreResult<Option<Job>> {
        Ok(conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", [id], Self::row_to_job)
            .optional()?)
    }

    fn query_jobs(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<Job>> {
        let mut stmt = conn.prepare(sql)?;
        let jobs = stmt
            .query_map(params, Self::row_to_job)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    fn query_datasets(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StoreResult<Vec<Dataset>> {
        let mut stmt = conn.prepare(sql)?;
        let datasets = stmt
            .query_map(params, Self::row_to_dataset)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(datasets)
    }

    /// Load a job and check that `worker_id` holds its lease.
    fn leased_job(tx: &Transaction, job_id: JobId, worker_id: &str) -> StoreResult<Job> {
        let job = Self::load_job(tx, job_id)?.ok_or(StoreError::JobNotFound(job_id))?;
        if !job.state.is_leased() || job.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::LeaseLost(job_id));
        }
        Ok(job)
    }

    fn insert_event(
        tx: &Transaction,
        job: &Job,
        event_type: JobEventType,
        now: i64,
        worker_id: Option<&str>,
        details: Option<serde_json::Value>,
    ) -> StoreResult<()> {
        tx.execute(
            "INSERT INTO job_events (job_id, dataset_id, event_type, timestamp, worker_id, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id,
                job.dataset_id,
                event_type.as_str(),
                now,
                worker_id,
                details.map(|d| d.to_string()),
            ],
        )?;
        Ok(())
    }

    /// Count a terminal job failure against its dataset.
    fn record_dataset_failure(
        tx: &Transaction,
        dataset_id: &str,
        failure: &JobFailure,
        now: i64,
    ) -> StoreResult<()> {
        let permanent = failure.kind == FailureKind::Permanent;
        tx.execute(
            "UPDATE datasets SET
                consecutive_failures = consecutive_failures + 1,
                last_error = ?1,
                last_checked_at = ?2,
                status = CASE WHEN ?3 THEN 'unreachable' ELSE status END
             WHERE id = ?4",
            params![failure.summary(), now, permanent, dataset_id],
        )?;
        Ok(())
    }

    fn apply_result_to_dataset(
        tx: &Transaction,
        job: &Job,
        result: &ExecutionResult,
        now: i64,
    ) -> StoreResult<bool> {
        let dataset = Self::load_dataset(tx, &job.dataset_id)?
            .ok_or_else(|| StoreError::DatasetNotFound(job.dataset_id.clone()))?;

        let revision_changed =
            result.revision.is_some() && result.revision != dataset.last_revision;
        let collects_metadata = matches!(job.kind, JobKind::Register | JobKind::Refresh);

        // An announcement made after this job was created still needs a refresh.
        let update_announced_at = match dataset.update_announced_at {
            Some(at) if collects_metadata && at <= job.created_at => None,
            other => other,
        };

        let metadata = result.metadata.clone().unwrap_or_else(|| DatasetMetadata {
            head_describe: dataset.head_describe.clone(),
            annex_uuid: dataset.annex_uuid.clone(),
            branches: dataset.branches.clone(),
            tags: dataset.tags.clone(),
        });

        tx.execute(
            "UPDATE datasets SET
                status = ?1,
                last_revision = ?2,
                head_describe = ?3,
                annex_uuid = ?4,
                branches = ?5,
                tags = ?6,
                size_bytes = ?7,
                consecutive_failures = 0,
                last_error = NULL,
                processed = ?8,
                last_checked_at = ?9,
                last_changed_at = ?10,
                update_announced_at = ?11
             WHERE id = ?12",
            params![
                result.health_signal.as_status().as_str(),
                result.revision.clone().or(dataset.last_revision),
                metadata.head_describe,
                metadata.annex_uuid,
                serde_json::to_string(&metadata.branches)?,
                serde_json::to_string(&metadata.tags)?,
                result.size_bytes as i64,
                dataset.processed || collects_metadata,
                now,
                if revision_changed {
                    Some(now)
                } else {
                    dataset.last_changed_at
                },
                update_announced_at,
                job.dataset_id,
            ],
        )?;
        Ok(revision_changed)
    }

    /// Cancel the dataset's pending job, or flag its leased job for cancellation.
    fn cancel_active_job(tx: &Transaction, dataset_id: &str, now: i64) -> StoreResult<()> {
        let active = tx
            .query_row(
                &format!(
                    "SELECT * FROM jobs WHERE dataset_id = ?1 AND state IN {}",
                    ACTIVE_STATES
                ),
                [dataset_id],
                Self::row_to_job,
            )
            .optional()?;
        if let Some(job) = active {
            Self::cancel_in_tx(tx, &job, now)?;
        }
        Ok(())
    }

    fn cancel_in_tx(tx: &Transaction, job: &Job, now: i64) -> StoreResult<CancelOutcome> {
        match job.state {
            JobState::Pending => {
                tx.execute(
                    "UPDATE jobs SET state = 'cancelled', finished_at = ?1
                     WHERE id = ?2 AND state = 'pending'",
                    params![now, job.id],
                )?;
                Self::insert_event(tx, job, JobEventType::Cancelled, now, None, None)?;
                Ok(CancelOutcome::Cancelled)
            }
            JobState::Claimed | JobState::Running => {
                tx.execute(
                    "UPDATE jobs SET cancel_requested = 1 WHERE id = ?1",
                    params![job.id],
                )?;
                Self::insert_event(tx, job, JobEventType::CancelRequested, now, None, None)?;
                Ok(CancelOutcome::Requested)
            }
            state => Err(StoreError::NotCancellable(job.id, state)),
        }
    }
}

fn decode<T>(value: String, parse: fn(&str) -> Option<T>, what: &str) -> rusqlite::Result<T> {
    parse(&value).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid {}: {}", what, value).into(),
        )
    })
}

fn decode_list(value: Option<String>) -> Vec<String> {
    value
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn millis(duration: Duration) -> i64 {
    duration.as_millis() as i64
}

impl RegistryStore for SqliteRegistryStore {
    // === Datasets ===

    fn insert_dataset(&self, dataset: &Dataset) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO datasets (
                id, url, status, last_revision, head_describe, annex_uuid, branches, tags,
                size_bytes, check_interval_secs, consecutive_failures, last_error, processed,
                registered_at, last_checked_at, last_changed_at, update_announced_at,
                retired_at, alerted_status
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19
            )",
            params![
                dataset.id,
                dataset.url,
                dataset.status.as_str(),
                dataset.last_revision,
                dataset.head_describe,
                dataset.annex_uuid,
                serde_json::to_string(&dataset.branches)?,
                serde_json::to_string(&dataset.tags)?,
                dataset.size_bytes.map(|v| v as i64),
                dataset.check_interval_secs as i64,
                dataset.consecutive_failures,
                dataset.last_error,
                dataset.processed,
                dataset.registered_at,
                dataset.last_checked_at,
                dataset.last_changed_at,
                dataset.update_announced_at,
                dataset.retired_at,
                dataset.alerted_status.map(|s| s.as_str()),
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StoreError::DatasetAlreadyRegistered(dataset.url.clone())
            } else {
                e.into()
            }
        })?;
        Ok(())
    }

    fn get_dataset(&self, id: &str) -> StoreResult<Option<Dataset>> {
        let conn = self.lock()?;
        Self::load_dataset(&conn, id)
    }

    fn find_dataset_by_url(&self, url: &str) -> StoreResult<Option<Dataset>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT * FROM datasets WHERE url = ?1",
                [url],
                Self::row_to_dataset,
            )
            .optional()?)
    }

    fn list_datasets(&self, filter: &DatasetFilter) -> StoreResult<Vec<Dataset>> {
        let conn = self.lock()?;
        let mut sql = String::from("SELECT * FROM datasets WHERE 1 = 1");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if !filter.include_retired {
            sql.push_str(" AND retired_at IS NULL");
        }
        if let Some(fragment) = &filter.url_contains {
            params_vec.push(Box::new(format!("%{}%", fragment)));
            sql.push_str(&format!(" AND url LIKE ?{}", params_vec.len()));
        }
        if let Some(status) = filter.status {
            params_vec.push(Box::new(status.as_str()));
            sql.push_str(&format!(" AND status = ?{}", params_vec.len()));
        }

        sql.push_str(&format!(
            " ORDER BY {} {} NULLS LAST, id ASC",
            filter.order_by.column(),
            if filter.descending { "DESC" } else { "ASC" }
        ));
        params_vec.push(Box::new(filter.limit as i64));
        sql.push_str(&format!(" LIMIT ?{}", params_vec.len()));
        params_vec.push(Box::new(filter.offset as i64));
        sql.push_str(&format!(" OFFSET ?{}", params_vec.len()));

        Self::query_datasets(
            &conn,
            &sql,
            params_from_iter(params_vec.iter().map(|p| p.as_ref())),
        )
    }

    fn schedulable_datasets(&self) -> StoreResult<Vec<Dataset>> {
        let conn = self.lock()?;
        Self::query_datasets(
            &conn,
            &format!(
                "SELECT * FROM datasets d
                 WHERE d.retired_at IS NULL
                   AND NOT EXISTS (
                       SELECT 1 FROM jobs j WHERE j.dataset_id = d.id AND j.state IN {}
                   )
                 ORDER BY d.registered_at ASC, d.id ASC",
                ACTIVE_STATES
            ),
            [],
        )
    }

    fn failing_datasets(&self, min_failures: u32) -> StoreResult<Vec<Dataset>> {
        let conn = self.lock()?;
        Self::query_datasets(
            &conn,
            "SELECT * FROM datasets
             WHERE retired_at IS NULL AND consecutive_failures >= ?1
             ORDER BY consecutive_failures DESC, id ASC",
            [min_failures],
        )
    }

    fn escalate_status(
        &self,
        dataset_id: &str,
        status: DatasetStatus,
        observed_failures: u32,
    ) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE datasets SET status = ?1
             WHERE id = ?2 AND consecutive_failures = ?3 AND status != ?1",
            params![status.as_str(), dataset_id, observed_failures],
        )?;
        Ok(changed == 1)
    }

    fn announce_update(&self, dataset_id: &str, now: i64) -> StoreResult<()> {
        let conn = self.lock()?;
        let dataset = Self::load_dataset(&conn, dataset_id)?
            .ok_or_else(|| StoreError::DatasetNotFound(dataset_id.to_string()))?;
        if dataset.is_retired() {
            return Err(StoreError::DatasetRetired(dataset_id.to_string()));
        }
        conn.execute(
            "UPDATE datasets SET update_announced_at = ?1 WHERE id = ?2",
            params![now, dataset_id],
        )?;
        Ok(())
    }

    fn retire_dataset(&self, dataset_id: &str, now: i64) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let dataset = Self::load_dataset(&tx, dataset_id)?
            .ok_or_else(|| StoreError::DatasetNotFound(dataset_id.to_string()))?;
        if dataset.is_retired() {
            return Ok(());
        }
        tx.execute(
            "UPDATE datasets SET retired_at = ?1 WHERE id = ?2",
            params![now, dataset_id],
        )?;
        Self::cancel_active_job(&tx, dataset_id, now)?;
        tx.commit()?;
        Ok(())
    }

    // === Jobs ===

    fn create_job(
        &self,
        dataset_id: &str,
        kind: JobKind,
        scheduled_at: i64,
        max_attempts: u32,
    ) -> StoreResult<JobId> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let retired_at: Option<Option<i64>> = tx
            .query_row(
                "SELECT retired_at FROM datasets WHERE id = ?1",
                [dataset_id],
                |row| row.get(0),
            )
            .optional()?;
        match retired_at {
            None => return Err(StoreError::DatasetNotFound(dataset_id.to_string())),
            Some(Some(_)) => return Err(StoreError::DatasetRetired(dataset_id.to_string())),
            Some(None) => {}
        }

        let active: Option<JobId> = tx
            .query_row(
                &format!(
                    "SELECT id FROM jobs WHERE dataset_id = ?1 AND state IN {}",
                    ACTIVE_STATES
                ),
                [dataset_id],
                |row| row.get(0),
            )
            .optional()?;
        if active.is_some() {
            return Err(StoreError::DuplicateActiveJob(dataset_id.to_string()));
        }

        let now = now_millis();
        tx.execute(
            "INSERT INTO jobs (dataset_id, kind, state, attempts, max_attempts, scheduled_at, created_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5)",
            params![dataset_id, kind.as_str(), max_attempts, scheduled_at, now],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                StoreError::DuplicateActiveJob(dataset_id.to_string())
            } else {
                e.into()
            }
        })?;
        let id = tx.last_insert_rowid();

        let job = Self::load_job(&tx, id)?.ok_or(StoreError::JobNotFound(id))?;
        Self::insert_event(
            &tx,
            &job,
            JobEventType::Created,
            now,
            None,
            Some(json!({ "kind": kind.as_str(), "scheduled_at": scheduled_at })),
        )?;
        tx.commit()?;
        Ok(id)
    }

    fn get_job(&self, id: JobId) -> StoreResult<Option<Job>> {
        let conn = self.lock()?;
        Self::load_job(&conn, id)
    }

    fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<Job>> {
        let conn = self.lock()?;
        let mut sql = String::from("SELECT * FROM jobs WHERE 1 = 1");
        let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(dataset_id) = &filter.dataset_id {
            params_vec.push(Box::new(dataset_id.clone()));
            sql.push_str(&format!(" AND dataset_id = ?{}", params_vec.len()));
        }
        if let Some(state) = filter.state {
            params_vec.push(Box::new(state.as_str()));
            sql.push_str(&format!(" AND state = ?{}", params_vec.len()));
        }
        if let Some(kind) = filter.kind {
            params_vec.push(Box::new(kind.as_str()));
            sql.push_str(&format!(" AND kind = ?{}", params_vec.len()));
        }

        params_vec.push(Box::new(filter.limit as i64));
        sql.push_str(&format!(" ORDER BY id DESC LIMIT ?{}", params_vec.len()));
        params_vec.push(Box::new(filter.offset as i64));
        sql.push_str(&format!(" OFFSET ?{}", params_vec.len()));

        Self::query_jobs(
            &conn,
            &sql,
            params_from_iter(params_vec.iter().map(|p| p.as_ref())),
        )
    }

    fn active_job_for_dataset(&self, dataset_id: &str) -> StoreResult<Option<Job>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                &format!(
                    "SELECT * FROM jobs WHERE dataset_id = ?1 AND state IN {}",
                    ACTIVE_STATES
                ),
                [dataset_id],
                Self::row_to_job,
            )
            .optional()?)
    }

    fn cancel_job(&self, id: JobId) -> StoreResult<CancelOutcome> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = Self::load_job(&tx, id)?.ok_or(StoreError::JobNotFound(id))?;
        let outcome = Self::cancel_in_tx(&tx, &job, now_millis())?;
        tx.commit()?;
        Ok(outcome)
    }

    fn job_events(&self, id: JobId) -> StoreResult<Vec<JobEvent>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT * FROM job_events WHERE job_id = ?1 ORDER BY id ASC")?;
        let events = stmt
            .query_map([id], Self::row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }

    fn count_jobs_by_state(&self) -> StoreResult<Vec<(JobState, usize)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")?;
        let counts = stmt
            .query_map([], |row| {
                let state = decode(row.get(0)?, JobState::from_str, "job state")?;
                Ok((state, row.get::<_, i64>(1)? as usize))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(counts)
    }

    fn prune_finished_jobs(&self, finished_before: i64) -> StoreResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let selection = format!(
            "SELECT id FROM jobs WHERE state IN {} AND finished_at < ?1",
            TERMINAL_STATES
        );
        tx.execute(
            &format!("DELETE FROM job_events WHERE job_id IN ({})", selection),
            [finished_before],
        )?;
        let deleted = tx.execute(
            &format!("DELETE FROM jobs WHERE id IN ({})", selection),
            [finished_before],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    // === Leases ===

    fn claim_next(&self, worker_id: &str, lease_duration: Duration) -> StoreResult<Option<Job>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();

        let candidate: Option<JobId> = tx
            .query_row(
                "SELECT id FROM jobs
                 WHERE state = 'pending' AND scheduled_at <= ?1
                 ORDER BY scheduled_at ASC, id ASC
                 LIMIT 1",
                [now],
                |row| row.get(0),
            )
            .optional()?;
        let Some(job_id) = candidate else {
            return Ok(None);
        };

        let claimed = tx.execute(
            "UPDATE jobs SET
                state = 'claimed',
                claimed_by = ?1,
                lease_expires_at = ?2,
                last_heartbeat_at = ?3,
                attempts = attempts + 1
             WHERE id = ?4 AND state = 'pending'",
            params![worker_id, now + millis(lease_duration), now, job_id],
        )?;
        if claimed != 1 {
            debug!("Job {} was claimed by another worker", job_id);
            return Ok(None);
        }

        let job = Self::load_job(&tx, job_id)?.ok_or(StoreError::JobNotFound(job_id))?;
        Self::insert_event(
            &tx,
            &job,
            JobEventType::Claimed,
            now,
            Some(worker_id),
            Some(json!({ "attempt": job.attempts })),
        )?;
        tx.commit()?;
        Ok(Some(job))
    }

    fn mark_running(&self, job_id: JobId, worker_id: &str) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = Self::leased_job(&tx, job_id, worker_id)?;
        if job.state == JobState::Running {
            return Ok(());
        }
        let now = now_millis();
        tx.execute(
            "UPDATE jobs SET state = 'running', started_at = ?1 WHERE id = ?2",
            params![now, job_id],
        )?;
        Self::insert_event(&tx, &job, JobEventType::Started, now, Some(worker_id), None)?;
        tx.commit()?;
        Ok(())
    }

    fn heartbeat(
        &self,
        job_id: JobId,
        worker_id: &str,
        lease_duration: Duration,
    ) -> StoreResult<HeartbeatAck> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = Self::leased_job(&tx, job_id, worker_id)?;
        let now = now_millis();
        let lease_expires_at = now + millis(lease_duration);
        tx.execute(
            "UPDATE jobs SET lease_expires_at = ?1, last_heartbeat_at = ?2 WHERE id = ?3",
            params![lease_expires_at, now, job_id],
        )?;
        tx.commit()?;
        Ok(HeartbeatAck {
            lease_expires_at,
            cancel_requested: job.cancel_requested,
        })
    }

    fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: &ExecutionResult,
    ) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = Self::leased_job(&tx, job_id, worker_id)?;
        let now = now_millis();

        tx.execute(
            "UPDATE jobs SET
                state = 'succeeded',
                finished_at = ?1,
                lease_expires_at = NULL,
                result = ?2,
                error_kind = NULL,
                error_detail = NULL
             WHERE id = ?3",
            params![now, serde_json::to_string(result)?, job_id],
        )?;
        let revision_changed = Self::apply_result_to_dataset(&tx, &job, result, now)?;
        Self::insert_event(
            &tx,
            &job,
            JobEventType::Succeeded,
            now,
            Some(worker_id),
            Some(json!({
                "revision": result.revision,
                "revision_changed": revision_changed,
                "health": result.health_signal,
            })),
        )?;
        tx.commit()?;
        Ok(())
    }

    fn fail(&self, job_id: JobId, worker_id: &str, failure: &JobFailure) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = Self::leased_job(&tx, job_id, worker_id)?;
        let now = now_millis();

        tx.execute(
            "UPDATE jobs SET
                state = 'failed',
                finished_at = ?1,
                lease_expires_at = NULL,
                error_kind = ?2,
                error_detail = ?3
             WHERE id = ?4",
            params![now, failure.kind.as_str(), failure.detail, job_id],
        )?;
        Self::record_dataset_failure(&tx, &job.dataset_id, failure, now)?;
        Self::insert_event(
            &tx,
            &job,
            JobEventType::Failed,
            now,
            Some(worker_id),
            Some(json!({
                "error_kind": failure.kind.as_str(),
                "error": failure.summary(),
                "attempts": job.attempts,
            })),
        )?;
        tx.commit()?;
        Ok(())
    }

    fn retry_later(
        &self,
        job_id: JobId,
        worker_id: &str,
        failure: &JobFailure,
        next_eligible_at: i64,
    ) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = Self::leased_job(&tx, job_id, worker_id)?;
        let now = now_millis();

        if job.cancel_requested {
            tx.execute(
                "UPDATE jobs SET state = 'cancelled', finished_at = ?1, lease_expires_at = NULL,
                    error_kind = ?2, error_detail = ?3
                 WHERE id = ?4",
                params![now, failure.kind.as_str(), failure.detail, job_id],
            )?;
            Self::insert_event(&tx, &job, JobEventType::Cancelled, now, Some(worker_id), None)?;
        } else {
            tx.execute(
                "UPDATE jobs SET
                    state = 'pending',
                    claimed_by = NULL,
                    lease_expires_at = NULL,
                    last_heartbeat_at = NULL,
                    scheduled_at = ?1,
                    error_kind = ?2,
                    error_detail = ?3
                 WHERE id = ?4",
                params![next_eligible_at, failure.kind.as_str(), failure.detail, job_id],
            )?;
            Self::insert_event(
                &tx,
                &job,
                JobEventType::RetryScheduled,
                now,
                Some(worker_id),
                Some(json!({
                    "error_kind": failure.kind.as_str(),
                    "error": failure.summary(),
                    "attempts": job.attempts,
                    "next_eligible_at": next_eligible_at,
                })),
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn acknowledge_cancel(&self, job_id: JobId, worker_id: &str) -> StoreResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job = Self::leased_job(&tx, job_id, worker_id)?;
        let now = now_millis();
        tx.execute(
            "UPDATE jobs SET state = 'cancelled', finished_at = ?1, lease_expires_at = NULL
             WHERE id = ?2",
            params![now, job_id],
        )?;
        Self::insert_event(&tx, &job, JobEventType::Cancelled, now, Some(worker_id), None)?;
        tx.commit()?;
        Ok(())
    }

    fn expired_leases(&self, now: i64) -> StoreResult<Vec<Job>> {
        let conn = self.lock()?;
        Self::query_jobs(
            &conn,
            &format!(
                "SELECT * FROM jobs
                 WHERE state IN {} AND lease_expires_at <= ?1
                 ORDER BY lease_expires_at ASC, id ASC",
                LEASED_STATES
            ),
            [now],
        )
    }

    fn reclaim_job(
        &self,
        job: &Job,
        disposition: ReclaimDisposition,
        now: i64,
    ) -> StoreResult<bool> {
        let Some(lease) = job.lease() else {
            return Ok(false);
        };
        if !lease.is_expired_at(now) {
            return Ok(false);
        }

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let detail = format!(
            "lease held by {} expired without heartbeat",
            lease.worker_id
        );
        let guard = format!(
            "WHERE id = ?1 AND claimed_by = ?2 AND lease_expires_at = ?3 AND state IN {}",
            LEASED_STATES
        );

        let changed = match disposition {
            ReclaimDisposition::Pending { next_eligible_at } => tx.execute(
                &format!(
                    "UPDATE jobs SET
                        state = 'pending',
                        claimed_by = NULL,
                        lease_expires_at = NULL,
                        last_heartbeat_at = NULL,
                        scheduled_at = ?4,
                        error_kind = 'lease_expired',
                        error_detail = ?5
                     {}",
                    guard
                ),
                params![job.id, lease.worker_id, lease.expires_at, next_eligible_at, detail],
            )?,
            ReclaimDisposition::Failed => tx.execute(
                &format!(
                    "UPDATE jobs SET
                        state = 'failed',
                        finished_at = ?4,
                        lease_expires_at = NULL,
                        error_kind = 'lease_expired',
                        error_detail = ?5
                     {}",
                    guard
                ),
                params![job.id, lease.worker_id, lease.expires_at, now, detail],
            )?,
            ReclaimDisposition::Cancelled => tx.execute(
                &format!(
                    "UPDATE jobs SET
                        state = 'cancelled',
                        finished_at = ?4,
                        lease_expires_at = NULL,
                        error_kind = 'lease_expired',
                        error_detail = ?5
                     {}",
                    guard
                ),
                params![job.id, lease.worker_id, lease.expires_at, now, detail],
            )?,
        };
        if changed != 1 {
            return Ok(false);
        }

        if disposition == ReclaimDisposition::Failed {
            let failure = JobFailure::new(FailureKind::LeaseExpired, detail);
            Self::record_dataset_failure(&tx, &job.dataset_id, &failure, now)?;
        }
        Self::insert_event(
            &tx,
            job,
            JobEventType::Reclaimed,
            now,
            Some(&lease.worker_id),
            Some(json!({
                "attempts": job.attempts,
                "disposition": match disposition {
                    ReclaimDisposition::Pending { .. } => "pending",
                    ReclaimDisposition::Failed => "failed",
                    ReclaimDisposition::Cancelled => "cancelled",
                },
            })),
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn long_running_jobs(&self, started_before: i64) -> StoreResult<Vec<Job>> {
        let conn = self.lock()?;
        Self::query_jobs(
            &conn,
            "SELECT * FROM jobs WHERE state = 'running' AND started_at <= ?1
             ORDER BY started_at ASC",
            [started_before],
        )
    }

    // === Alerts ===

    fn datasets_pending_alert(&self) -> StoreResult<Vec<Dataset>> {
        let conn = self.lock()?;
        Self::query_datasets(
            &conn,
            "SELECT * FROM datasets
             WHERE retired_at IS NULL AND (
                (status IN ('degraded', 'unreachable')
                    AND (alerted_status IS NULL OR alerted_status != status))
                OR (status = 'healthy' AND alerted_status IS NOT NULL)
             )
             ORDER BY id ASC",
            [],
        )
    }

    fn record_alert(
        &self,
        dataset_id: &str,
        kind: AlertKind,
        now: i64,
    ) -> StoreResult<Option<AlertEvent>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let changed = match kind {
            AlertKind::Recovered => tx.execute(
                "UPDATE datasets SET alerted_status = NULL
                 WHERE id = ?1 AND status = 'healthy' AND alerted_status IS NOT NULL",
                params![dataset_id],
            )?,
            AlertKind::Degraded | AlertKind::Unreachable => tx.execute(
                "UPDATE datasets SET alerted_status = ?2
                 WHERE id = ?1 AND status = ?2
                   AND (alerted_status IS NULL OR alerted_status != ?2)",
                params![dataset_id, kind.as_str()],
            )?,
        };
        if changed != 1 {
            return Ok(None);
        }

        let dataset = Self::load_dataset(&tx, dataset_id)?
            .ok_or_else(|| StoreError::DatasetNotFound(dataset_id.to_string()))?;
        tx.execute(
            "INSERT INTO alerts (dataset_id, kind, consecutive_failures, last_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                dataset_id,
                kind.as_str(),
                dataset.consecutive_failures,
                dataset.last_error,
                now
            ],
        )?;
        let alert = AlertEvent {
            id: tx.last_insert_rowid(),
            dataset_id: dataset.id,
            url: dataset.url,
            kind,
            consecutive_failures: dataset.consecutive_failures,
            last_error: dataset.last_error,
            created_at: now,
        };
        tx.commit()?;
        Ok(Some(alert))
    }

    fn list_alerts(&self, dataset_id: Option<&str>, limit: usize) -> StoreResult<Vec<AlertEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT a.*, d.url FROM alerts a JOIN datasets d ON d.id = a.dataset_id
             WHERE ?1 IS NULL OR a.dataset_id = ?1
             ORDER BY a.id DESC
             LIMIT ?2",
        )?;
        let alerts = stmt
            .query_map(params![dataset_id, limit as i64], Self::row_to_alert)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(alerts)
    }
}
