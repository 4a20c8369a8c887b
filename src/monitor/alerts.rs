//! Outbound alert delivery.

use crate::registry_store::{AlertEvent, AlertKind};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

/// Delivers dataset health transitions to operators.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &AlertEvent) -> Result<()>;
}

/// Writes alerts to the log. Used when no webhook is configured.
pub struct LogAlertNotifier;

#[async_trait]
impl AlertNotifier for LogAlertNotifier {
    async fn notify(&self, alert: &AlertEvent) -> Result<()> {
        match alert.kind {
            AlertKind::Recovered => info!(
                dataset_id = %alert.dataset_id,
                url = %alert.url,
                "Dataset recovered"
            ),
            kind => warn!(
                dataset_id = %alert.dataset_id,
                url = %alert.url,
                consecutive_failures = alert.consecutive_failures,
                last_error = alert.last_error.as_deref().unwrap_or("-"),
                "Dataset is {}",
                kind.as_str()
            ),
        }
        Ok(())
    }
}

/// POSTs each alert as JSON to a configured URL.
pub struct WebhookAlertNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlertNotifier {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertNotifier for WebhookAlertNotifier {
    async fn notify(&self, alert: &AlertEvent) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .context("Failed to reach alert webhook")?;

        if !response.status().is_success() {
            anyhow::bail!("Alert webhook returned status: {}", response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(kind: AlertKind) -> AlertEvent {
        AlertEvent {
            id: 1,
            dataset_id: "ds".to_string(),
            url: "https://example.org/ds".to_string(),
            kind,
            consecutive_failures: 3,
            last_error: Some("transient: timed out".to_string()),
            created_at: 0,
        }
    }

    #[tokio::test]
    async fn test_log_notifier_accepts_every_kind() {
        for kind in [AlertKind::Degraded, AlertKind::Unreachable, AlertKind::Recovered] {
            LogAlertNotifier.notify(&alert(kind)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_webhook_notifier_reports_unreachable_endpoint() {
        // Port 9 (discard) on localhost is closed in test environments.
        let notifier = WebhookAlertNotifier::new("http://127.0.0.1:9/alerts", 2).unwrap();
        assert!(notifier.notify(&alert(AlertKind::Degraded)).await.is_err());
    }

    #[test]
    fn test_alert_payload_shape() {
        let json = serde_json::to_value(alert(AlertKind::Unreachable)).unwrap();
        assert_eq!(json["kind"], "unreachable");
        assert_eq!(json["consecutive_failures"], 3);
    }
}
