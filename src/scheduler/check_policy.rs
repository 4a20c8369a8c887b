use crate::config::SchedulerSettings;
use crate::registry_store::{Dataset, JobKind};

/// A job the scheduler wants to create on this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub dataset_id: String,
    pub kind: JobKind,
    /// How far past its due time the dataset is, in millis. Zero for
    /// datasets that are due immediately.
    pub overdue_ms: i64,
}

impl Candidate {
    /// Lower sorts first: register, then refresh, then verify.
    fn rank(&self) -> u8 {
        match self.kind {
            JobKind::Register => 0,
            JobKind::Refresh => 1,
            JobKind::Verify => 2,
        }
    }
}

/// Check interval for a dataset after backing off for its failures.
///
/// `base * multiplier^consecutive_failures`, capped at the configured maximum
/// but never below the dataset's own baseline.
pub fn effective_interval_secs(dataset: &Dataset, settings: &SchedulerSettings) -> u64 {
    let base = dataset.check_interval_secs;
    if dataset.consecutive_failures == 0 {
        return base;
    }
    let exponent = dataset.consecutive_failures.min(i32::MAX as u32) as i32;
    let backed_off = base as f64 * settings.backoff_multiplier.powi(exponent);
    let cap = settings.max_check_interval_secs.max(base);
    backed_off.min(cap as f64) as u64
}

/// Decide which job, if any, a schedulable dataset needs at `now`.
///
/// The caller guarantees the dataset is not retired and has no active job.
pub fn candidate_for(
    dataset: &Dataset,
    settings: &SchedulerSettings,
    now: i64,
) -> Option<Candidate> {
    let interval_ms = (effective_interval_secs(dataset, settings) as i64).saturating_mul(1000);
    let last_checked = dataset.last_checked_at.unwrap_or(dataset.registered_at);
    let due_at = last_checked.saturating_add(interval_ms);
    // Failing datasets wait out their backoff before anything is retried.
    let backoff_elapsed = dataset.consecutive_failures == 0 || due_at <= now;

    let kind = if !dataset.processed {
        JobKind::Register
    } else if dataset.update_announced_at.is_some() {
        JobKind::Refresh
    } else if due_at <= now {
        JobKind::Verify
    } else {
        return None;
    };

    if !backoff_elapsed {
        return None;
    }

    Some(Candidate {
        dataset_id: dataset.id.clone(),
        kind,
        overdue_ms: (now - due_at).max(0),
    })
}

/// Order candidates so that the claim order serves them by priority.
pub fn prioritize(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        a.rank()
            .cmp(&b.rank())
            .then_with(|| b.overdue_ms.cmp(&a.overdue_ms))
            .then_with(|| a.dataset_id.cmp(&b.dataset_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR_MS: i64 = 3_600_000;

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            tick_interval_secs: 30,
            default_check_interval_secs: 3600,
            backoff_multiplier: 2.0,
            max_check_interval_secs: 4 * 3600,
            max_jobs_per_tick: None,
        }
    }

    fn checked_dataset(last_checked_at: i64) -> Dataset {
        let mut dataset = Dataset::new("https://example.org/ds", 3600, 0);
        dataset.processed = true;
        dataset.last_checked_at = Some(last_checked_at);
        dataset
    }

    #[test]
    fn test_effective_interval_backs_off_and_caps() {
        let mut dataset = checked_dataset(0);
        assert_eq!(effective_interval_secs(&dataset, &settings()), 3600);

        dataset.consecutive_failures = 1;
        assert_eq!(effective_interval_secs(&dataset, &settings()), 7200);

        dataset.consecutive_failures = 2;
        assert_eq!(effective_interval_secs(&dataset, &settings()), 14400);

        dataset.consecutive_failures = 10;
        assert_eq!(effective_interval_secs(&dataset, &settings()), 14400);
    }

    #[test]
    fn test_cap_never_shortens_baseline() {
        let mut dataset = checked_dataset(0);
        dataset.check_interval_secs = 10 * 3600;
        dataset.consecutive_failures = 3;
        assert_eq!(effective_interval_secs(&dataset, &settings()), 10 * 3600);
    }

    #[test]
    fn test_verify_due_after_interval() {
        let now = 10 * HOUR_MS;
        let stale = checked_dataset(now - 2 * HOUR_MS);
        let candidate = candidate_for(&stale, &settings(), now).unwrap();
        assert_eq!(candidate.kind, JobKind::Verify);
        assert_eq!(candidate.overdue_ms, HOUR_MS);

        let fresh = checked_dataset(now - HOUR_MS / 2);
        assert_eq!(candidate_for(&fresh, &settings(), now), None);
    }

    #[test]
    fn test_unprocessed_dataset_gets_register() {
        let dataset = Dataset::new("https://example.org/ds", 3600, 0);
        let candidate = candidate_for(&dataset, &settings(), 1).unwrap();
        assert_eq!(candidate.kind, JobKind::Register);
    }

    #[test]
    fn test_announcement_triggers_refresh_immediately() {
        let now = 10 * HOUR_MS;
        let mut dataset = checked_dataset(now - 60_000);
        dataset.update_announced_at = Some(now - 1_000);
        let candidate = candidate_for(&dataset, &settings(), now).unwrap();
        assert_eq!(candidate.kind, JobKind::Refresh);
    }

    #[test]
    fn test_failing_dataset_waits_for_backoff() {
        let now = 10 * HOUR_MS;
        let mut dataset = checked_dataset(now - 90 * 60_000);
        dataset.consecutive_failures = 1;
        dataset.update_announced_at = Some(now);
        // 1.5h since the failure, backoff is 2h.
        assert_eq!(candidate_for(&dataset, &settings(), now), None);

        dataset.last_checked_at = Some(now - 3 * HOUR_MS);
        assert_eq!(
            candidate_for(&dataset, &settings(), now).unwrap().kind,
            JobKind::Refresh
        );
    }

    #[test]
    fn test_prioritize_orders_by_kind_then_overdue() {
        let candidate = |id: &str, kind, overdue_ms| Candidate {
            dataset_id: id.to_string(),
            kind,
            overdue_ms,
        };
        let mut candidates = vec![
            candidate("a", JobKind::Verify, 10),
            candidate("b", JobKind::Verify, 500),
            candidate("c", JobKind::Refresh, 0),
            candidate("d", JobKind::Register, 0),
        ];
        prioritize(&mut candidates);

        let order: Vec<&str> = candidates.iter().map(|c| c.dataset_id.as_str()).collect();
        assert_eq!(order, vec!["d", "c", "b", "a"]);
    }
}
