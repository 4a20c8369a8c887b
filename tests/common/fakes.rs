use async_trait::async_trait;
use dataset_registry::execution::{ExecutionAdapter, ExecutionError, ExecutionRequest};
use dataset_registry::monitor::AlertNotifier;
use dataset_registry::registry_store::{AlertEvent, ExecutionResult, HealthSignal};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub fn healthy_result(revision: &str) -> ExecutionResult {
    ExecutionResult {
        revision: Some(revision.to_string()),
        size_bytes: 1024,
        health_signal: HealthSignal::Healthy,
        revision_changed: true,
        metadata: None,
        detail: None,
    }
}

/// Adapter that replays a fixed list of outcomes, one per run.
///
/// Once the script is exhausted every run succeeds with `fallback`.
pub struct ScriptedAdapter {
    outcomes: Mutex<VecDeque<Result<ExecutionResult, ExecutionError>>>,
    fallback: ExecutionResult,
    requests: Mutex<Vec<ExecutionRequest>>,
}

#[allow(dead_code)]
impl ScriptedAdapter {
    pub fn new(outcomes: Vec<Result<ExecutionResult, ExecutionError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback: healthy_result("fallback"),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always_healthy(revision: &str) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fallback: healthy_result(revision),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing(error: ExecutionError, times: usize) -> Self {
        Self::new(vec![Err(error); times])
    }

    pub fn requests(&self) -> Vec<ExecutionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionAdapter for ScriptedAdapter {
    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.requests.lock().unwrap().push(request.clone());
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        let next = self.outcomes.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }
}

/// Notifier that keeps every alert it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<AlertEvent>>,
}

#[allow(dead_code)]
impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<AlertEvent> {
        self.alerts.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertNotifier for RecordingNotifier {
    async fn notify(&self, alert: &AlertEvent) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }
}
