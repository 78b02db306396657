//! Progress reports to the supervising parent.
//!
//! When `start` is given a report URL, each stage is POSTed there as a
//! [`ReportEvent`]. Delivery is best effort: failures are logged and never
//! affect the start itself.

use ovm_protocol::{ReportEvent, Stage};
use std::time::Duration;

const REPORT_TIMEOUT: Duration = Duration::from_secs(2);

/// Sends stage events for one machine.
#[derive(Debug, Clone)]
pub struct Reporter {
    machine: String,
    target: Option<(reqwest::Client, String)>,
}

impl Reporter {
    /// A reporter posting to `url`, or a silent one without a URL.
    pub fn new(machine: &str, url: Option<&str>) -> Self {
        let target = url.filter(|u| !u.is_empty()).and_then(|url| {
            match reqwest::Client::builder().timeout(REPORT_TIMEOUT).build() {
                Ok(client) => Some((client, url.to_string())),
                Err(e) => {
                    tracing::warn!(error = %e, "could not build report client, reports disabled");
                    None
                }
            }
        });
        Self {
            machine: machine.to_string(),
            target,
        }
    }

    /// Reporter that never sends.
    pub fn disabled(machine: &str) -> Self {
        Self::new(machine, None)
    }

    /// Whether events go anywhere.
    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Event body for `stage`.
    pub fn event(&self, stage: Stage, message: impl Into<String>) -> ReportEvent {
        ReportEvent {
            machine: self.machine.clone(),
            stage,
            message: message.into(),
        }
    }

    /// POST one event.
    pub async fn send(&self, stage: Stage, message: impl Into<String>) {
        let event = self.event(stage, message);
        let Some((client, url)) = &self.target else {
            tracing::trace!(?event, "report skipped");
            return;
        };
        match client.post(url).json(&event).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(stage = ?event.stage, "report delivered");
            }
            Ok(resp) => {
                tracing::debug!(stage = ?event.stage, status = %resp.status(), "report rejected");
            }
            Err(e) => {
                tracing::debug!(stage = ?event.stage, error = %e, "report failed");
            }
        }
    }
}
