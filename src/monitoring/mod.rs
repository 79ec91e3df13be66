//! Best-effort webhook alerting.
//!
//! State transitions, emergency flattens, and anomalies are posted as
//! structured JSON to a configured webhook. Delivery failures are logged
//! and never block the cycle.

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::MonitoringConfig;
use crate::risk::RiskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

/// One alert posted to the webhook.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub timestamp: DateTime<Utc>,
    pub level: AlertLevel,
    pub title: String,
    pub message: String,
    pub context: BTreeMap<String, String>,
}

impl AlertEvent {
    pub fn new(level: AlertLevel, title: &str, message: String) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            title: title.to_string(),
            message,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: &str, value: impl ToString) -> Self {
        self.context.insert(key.to_string(), value.to_string());
        self
    }

    pub fn state_transition(from: RiskStatus, to: RiskStatus, drawdown: Decimal) -> Self {
        let level = match to {
            RiskStatus::Normal => AlertLevel::Info,
            RiskStatus::Reduce => AlertLevel::Warning,
            RiskStatus::HaltNew => AlertLevel::Critical,
        };
        Self::new(
            level,
            "risk_state_transition",
            format!("Risk state {from} -> {to}"),
        )
        .with_context("from", from)
        .with_context("to", to)
        .with_context("drawdown", drawdown)
    }

    pub fn pair_flattened(pair_id: &str, reason: &str) -> Self {
        Self::new(
            AlertLevel::Warning,
            "pair_flattened",
            format!("Pair {pair_id} flattened: {reason}"),
        )
        .with_context("pair_id", pair_id)
        .with_context("reason", reason)
    }

    pub fn zombie_pair(pair_id: &str, detail: &str) -> Self {
        Self::new(
            AlertLevel::Critical,
            "zombie_pair",
            format!("Pair {pair_id} needs operator intervention: {detail}"),
        )
        .with_context("pair_id", pair_id)
    }

    pub fn equity_drop(previous: Decimal, current: Decimal, drop_pct: Decimal) -> Self {
        Self::new(
            AlertLevel::Warning,
            "equity_drop",
            format!("Equity fell {drop_pct}% in one cycle"),
        )
        .with_context("previous", previous)
        .with_context("current", current)
    }

    pub fn execution_failures(failed: usize, attempted: usize) -> Self {
        Self::new(
            AlertLevel::Warning,
            "execution_failures",
            format!("{failed} of {attempted} executions failed this cycle"),
        )
        .with_context("failed", failed)
        .with_context("attempted", attempted)
    }

    pub fn repeated_cycle_skips(consecutive: u32) -> Self {
        Self::new(
            AlertLevel::Warning,
            "cycle_skips",
            format!("{consecutive} consecutive cycles skipped"),
        )
        .with_context("consecutive", consecutive)
    }
}

/// Posts alert events to the configured webhook.
pub struct WebhookNotifier {
    target: Option<(Client, String)>,
}

impl WebhookNotifier {
    pub fn new(config: &MonitoringConfig) -> Self {
        let target = config.webhook_url.as_ref().and_then(|url| {
            Client::builder()
                .timeout(Duration::from_secs(config.webhook_timeout_secs))
                .build()
                .ok()
                .map(|client| (client, url.clone()))
        });
        if target.is_none() {
            info!("Webhook alerting disabled");
        }
        Self { target }
    }

    /// Deliver one event. Failures are logged; the result is advisory.
    pub async fn send(&self, event: AlertEvent) -> bool {
        let Some((client, url)) = &self.target else {
            info!(title = %event.title, "Alert (no webhook): {}", event.message);
            return false;
        };

        match client.post(url).json(&event).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(title = %event.title, status = %response.status(), "Webhook rejected alert");
                false
            }
            Err(e) => {
                warn!(title = %event.title, error = %e, "Webhook delivery failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_transition_event_levels() {
        let event =
            AlertEvent::state_transition(RiskStatus::Normal, RiskStatus::HaltNew, dec!(0.16));
        assert_eq!(event.level, AlertLevel::Critical);
        assert_eq!(event.context["to"], "HALT_NEW");

        let event =
            AlertEvent::state_transition(RiskStatus::Reduce, RiskStatus::Normal, dec!(0.05));
        assert_eq!(event.level, AlertLevel::Info);
    }

    #[test]
    fn test_event_serializes_with_context() {
        let event = AlertEvent::pair_flattened("p1", "partial fill");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"pair_flattened\""));
        assert!(json.contains("\"pair_id\":\"p1\""));
    }

    #[tokio::test]
    async fn test_disabled_notifier_reports_unsent() {
        let notifier = WebhookNotifier::new(&MonitoringConfig::default());
        let sent = notifier
            .send(AlertEvent::repeated_cycle_skips(4))
            .await;
        assert!(!sent);
    }
}
