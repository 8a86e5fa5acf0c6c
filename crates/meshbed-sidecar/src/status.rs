//! Outcome reporting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use meshbed_common::ContainerId;
use serde::Serialize;

/// Result of processing one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The container's network matches the config.
    Configured,
    /// The container was released.
    Released,
    /// Processing failed; a later event may succeed.
    Failed {
        /// Rendered error chain.
        error: String,
    },
}

/// Status of one container after one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// The container.
    pub container_id: ContainerId,
    /// Network named in the event, if any.
    pub network: Option<String>,
    /// What happened.
    pub outcome: Outcome,
    /// Label echoed from the config.
    pub callback_state: Option<String>,
    /// Online networks after the event.
    pub active: Vec<String>,
    /// Non-fatal warnings recorded while processing this event.
    pub warnings: Vec<String>,
    /// When the event finished.
    pub at: DateTime<Utc>,
}

impl StatusReport {
    /// Create a report with no network details.
    #[must_use]
    pub fn new(container_id: ContainerId, outcome: Outcome) -> Self {
        Self {
            container_id,
            network: None,
            outcome,
            callback_state: None,
            active: Vec::new(),
            warnings: Vec::new(),
            at: Utc::now(),
        }
    }

    /// Whether the event succeeded.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        !matches!(self.outcome, Outcome::Failed { .. })
    }
}

/// Receives one report per processed event.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Deliver a report.
    async fn report(&self, report: StatusReport);
}

/// Writes reports to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl StatusSink for LogSink {
    async fn report(&self, report: StatusReport) {
        match &report.outcome {
            Outcome::Failed { error } => tracing::warn!(
                container = %report.container_id.short(),
                network = ?report.network,
                error = %error,
                "Network configuration failed"
            ),
            Outcome::Configured => tracing::info!(
                container = %report.container_id.short(),
                network = ?report.network,
                callback_state = ?report.callback_state,
                active = ?report.active,
                warnings = report.warnings.len(),
                "Network configured"
            ),
            Outcome::Released => tracing::info!(
                container = %report.container_id.short(),
                "Container released"
            ),
        }
    }
}
