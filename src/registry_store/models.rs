//! Data models for the registry store.
//!
//! Defines datasets, jobs, leases, job events, alerts and the shared
//! execution result shape that every job kind reports.

use serde::{Deserialize, Serialize};

pub type JobId = i64;

/// Current wall-clock time as Unix milliseconds. All stored timestamps use it.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Health of a registered dataset as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Unknown,
    Healthy,
    Degraded,
    Unreachable,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetStatus::Unknown => "unknown",
            DatasetStatus::Healthy => "healthy",
            DatasetStatus::Degraded => "degraded",
            DatasetStatus::Unreachable => "unreachable",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "unknown" => Some(DatasetStatus::Unknown),
            "healthy" => Some(DatasetStatus::Healthy),
            "degraded" => Some(DatasetStatus::Degraded),
            "unreachable" => Some(DatasetStatus::Unreachable),
            _ => None,
        }
    }

    /// Statuses that warrant an operator alert.
    pub fn is_alerting(&self) -> bool {
        matches!(self, DatasetStatus::Degraded | DatasetStatus::Unreachable)
    }

    /// Ordering used when escalating: a status never moves to a less severe
    /// one through failure counting alone.
    pub fn severity(&self) -> u8 {
        match self {
            DatasetStatus::Unknown => 0,
            DatasetStatus::Healthy => 0,
            DatasetStatus::Degraded => 1,
            DatasetStatus::Unreachable => 2,
        }
    }
}

impl std::fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Kind of work a job performs against a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// First collection of a dataset's revision and metadata.
    Register,
    /// Periodic integrity and reachability check.
    Verify,
    /// Metadata re-collection after an update was announced.
    Refresh,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Register => "register",
            JobKind::Verify => "verify",
            JobKind::Refresh => "refresh",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "register" => Some(JobKind::Register),
            "verify" => Some(JobKind::Verify),
            "refresh" => Some(JobKind::Refresh),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Claimed,
    Running,
    Succeeded, // terminal
    Failed,    // terminal
    Cancelled, // terminal
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Claimed => "claimed",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobState::Pending),
            "claimed" => Some(JobState::Claimed),
            "running" => Some(JobState::Running),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            "cancelled" => Some(JobState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Claimed or running: a worker holds a lease on the job.
    pub fn is_leased(&self) -> bool {
        matches!(self, JobState::Claimed | JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// Classification of a job failure, persisted alongside the error detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,  // network/timeout - retry
    Permanent,  // repository gone or corrupt - NO retry
    Unexpected, // tool crash - retry with backoff
    LeaseExpired,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::Unexpected => "unexpected",
            FailureKind::LeaseExpired => "lease_expired",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(FailureKind::Transient),
            "permanent" => Some(FailureKind::Permanent),
            "unexpected" => Some(FailureKind::Unexpected),
            "lease_expired" => Some(FailureKind::LeaseExpired),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Permanent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: FailureKind,
    pub detail: String,
}

impl JobFailure {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// One-line summary shown to users once the retry budget is spent.
    pub fn summary(&self) -> String {
        let first_line = self.detail.lines().next().unwrap_or_default();
        format!("{}: {}", self.kind.as_str(), first_line)
    }
}

/// What the execution adapter observed about the dataset's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthSignal {
    Healthy,
    Degraded,
}

impl HealthSignal {
    pub fn as_status(&self) -> DatasetStatus {
        match self {
            HealthSignal::Healthy => DatasetStatus::Healthy,
            HealthSignal::Degraded => DatasetStatus::Degraded,
        }
    }
}

/// Descriptive repository metadata collected by register and refresh jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub head_describe: Option<String>,
    pub annex_uuid: Option<String>,
    pub branches: Vec<String>,
    pub tags: Vec<String>,
}

/// Result shape shared by every job kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub revision: Option<String>,
    pub size_bytes: u64,
    pub health_signal: HealthSignal,
    /// True when `revision` differs from the dataset's last known revision.
    pub revision_changed: bool,
    /// Present for register and refresh jobs only.
    pub metadata: Option<DatasetMetadata>,
    /// Extra diagnostics, e.g. integrity check output when degraded.
    pub detail: Option<String>,
}

/// A registered external dataset repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dataset {
    pub id: String,
    pub url: String,
    pub status: DatasetStatus,
    pub last_revision: Option<String>,
    pub head_describe: Option<String>,
    pub annex_uuid: Option<String>,
    pub branches: Vec<String>,
    pub tags: Vec<String>,
    pub size_bytes: Option<u64>,
    /// Baseline check interval; the scheduler backs off from it on failures.
    pub check_interval_secs: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    /// Initial registration data has been collected.
    pub processed: bool,
    /// Status for which an alert was last emitted, if any.
    pub alerted_status: Option<DatasetStatus>,
    pub registered_at: i64,
    pub last_checked_at: Option<i64>,
    pub last_changed_at: Option<i64>,
    pub update_announced_at: Option<i64>,
    pub retired_at: Option<i64>,
}

impl Dataset {
    pub fn new(url: impl Into<String>, check_interval_secs: u64, now: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            url: url.into(),
            status: DatasetStatus::Unknown,
            last_revision: None,
            head_describe: None,
            annex_uuid: None,
            branches: Vec::new(),
            tags: Vec::new(),
            size_bytes: None,
            check_interval_secs,
            consecutive_failures: 0,
            last_error: None,
            processed: false,
            alerted_status: None,
            registered_at: now,
            last_checked_at: None,
            last_changed_at: None,
            update_announced_at: None,
            retired_at: None,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired_at.is_some()
    }
}

/// One unit of work against a dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub dataset_id: String,
    pub kind: JobKind,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be claimed. Retries push it forward.
    pub scheduled_at: i64,
    pub created_at: i64,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub last_heartbeat_at: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub cancel_requested: bool,
    pub result: Option<ExecutionResult>,
    pub error_kind: Option<FailureKind>,
    pub error_detail: Option<String>,
}

impl Job {
    /// The live lease on this job, if a worker holds one.
    pub fn lease(&self) -> Option<Lease> {
        if !self.state.is_leased() {
            return None;
        }
        match (&self.claimed_by, self.lease_expires_at) {
            (Some(worker_id), Some(expires_at)) => Some(Lease {
                job_id: self.id,
                worker_id: worker_id.clone(),
                expires_at,
            }),
            _ => None,
        }
    }

    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Time-bounded claim binding a job to one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Lease {
    pub job_id: JobId,
    pub worker_id: String,
    pub expires_at: i64,
}

impl Lease {
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub lease_expires_at: i64,
    pub cancel_requested: bool,
}

/// Where the monitor sends a job whose lease expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimDisposition {
    Pending { next_eligible_at: i64 },
    Failed,
    /// Cancellation was requested before the worker went silent.
    Cancelled,
}

/// Result of cancelling a job through the inbound interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    /// The job is leased; the worker will see the request at its next heartbeat.
    Requested,
}

#[derive(Debug, Clone)]
pub struct JobFilter {
    pub dataset_id: Option<String>,
    pub state: Option<JobState>,
    pub kind: Option<JobKind>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            dataset_id: None,
            state: None,
            kind: None,
            limit: 20,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasetOrder {
    Url,
    LastChecked,
    LastChanged,
    Size,
}

impl DatasetOrder {
    pub fn column(&self) -> &'static str {
        match self {
            DatasetOrder::Url => "url",
            DatasetOrder::LastChecked => "last_checked_at",
            DatasetOrder::LastChanged => "last_changed_at",
            DatasetOrder::Size => "size_bytes",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "url" => Some(DatasetOrder::Url),
            "last_checked" => Some(DatasetOrder::LastChecked),
            "last_changed" => Some(DatasetOrder::LastChanged),
            "size" => Some(DatasetOrder::Size),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DatasetFilter {
    pub url_contains: Option<String>,
    pub status: Option<DatasetStatus>,
    pub include_retired: bool,
    pub order_by: DatasetOrder,
    pub descending: bool,
    pub limit: usize,
    pub offset: usize,
}

impl Default for DatasetFilter {
    fn default() -> Self {
        Self {
            url_contains: None,
            status: None,
            include_retired: false,
            order_by: DatasetOrder::Url,
            descending: false,
            limit: 20,
            offset: 0,
        }
    }
}

/// Type of a job lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    Created,
    Claimed,
    Started,
    RetryScheduled,
    Succeeded,
    Failed,
    CancelRequested,
    Cancelled,
    Reclaimed,
}

impl JobEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventType::Created => "created",
            JobEventType::Claimed => "claimed",
            JobEventType::Started => "started",
            JobEventType::RetryScheduled => "retry_scheduled",
            JobEventType::Succeeded => "succeeded",
            JobEventType::Failed => "failed",
            JobEventType::CancelRequested => "cancel_requested",
            JobEventType::Cancelled => "cancelled",
            JobEventType::Reclaimed => "reclaimed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(JobEventType::Created),
            "claimed" => Some(JobEventType::Claimed),
            "started" => Some(JobEventType::Started),
            "retry_scheduled" => Some(JobEventType::RetryScheduled),
            "succeeded" => Some(JobEventType::Succeeded),
            "failed" => Some(JobEventType::Failed),
            "cancel_requested" => Some(JobEventType::CancelRequested),
            "cancelled" => Some(JobEventType::Cancelled),
            "reclaimed" => Some(JobEventType::Reclaimed),
            _ => None,
        }
    }
}

/// Audit trail entry for a job transition.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub id: i64,
    pub job_id: JobId,
    pub dataset_id: String,
    pub event_type: JobEventType,
    pub timestamp: i64,
    pub worker_id: Option<String>,
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Degraded,
    Unreachable,
    Recovered,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Degraded => "degraded",
            AlertKind::Unreachable => "unreachable",
            AlertKind::Recovered => "recovered",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "degraded" => Some(AlertKind::Degraded),
            "unreachable" => Some(AlertKind::Unreachable),
            "recovered" => Some(AlertKind::Recovered),
            _ => None,
        }
    }

    /// Alert kind announcing a transition into `status`, if it is alert-worthy.
    pub fn for_status(status: DatasetStatus) -> Option<Self> {
        match status {
            DatasetStatus::Degraded => Some(AlertKind::Degraded),
            DatasetStatus::Unreachable => Some(AlertKind::Unreachable),
            DatasetStatus::Healthy | DatasetStatus::Unknown => None,
        }
    }
}

/// Notification about a dataset's health transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: i64,
    pub dataset_id: String,
    pub url: String,
    pub kind: AlertKind,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub created_at: i64,
}
