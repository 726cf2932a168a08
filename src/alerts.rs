use crate::state::StateResolution;
use chrono::NaiveDateTime;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Older-than-ideal states in use.
    Degraded,
    /// No usable states; the run cold-starts.
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub severity: Severity,
    pub subject: String,
    pub body: String,
}

/// Delivery seam. Message transport (email, chat, pager) lives outside
/// this crate; production wiring logs, tests capture.
pub trait Notifier {
    fn notify(&self, alert: &Alert);
}

/// Default notifier: alerts land in the log stream, tagged with the
/// configured recipients so the on-call rotation is visible in the log
/// even before a transport is wired up.
pub struct LogNotifier {
    recipients: Vec<String>,
}

impl LogNotifier {
    pub fn new(recipients: Vec<String>) -> Self {
        LogNotifier { recipients }
    }
}

impl Notifier for LogNotifier {
    fn notify(&self, alert: &Alert) {
        match alert.severity {
            Severity::Degraded => warn!("{}: {}", alert.subject, alert.body),
            Severity::Failure => error!("{}: {}", alert.subject, alert.body),
        }
        if !self.recipients.is_empty() {
            warn!(
                "Alert recorded for {}",
                self.recipients.join(", ")
            );
        }
    }
}

/// Decide whether the state-resolution outcome warrants an alert.
/// No alert when states were found at the desired time; degraded when an
/// older timestamp is in use; failure on a cold start.
pub fn evaluate_state_alert(
    resolution: &StateResolution,
    desired: NaiveDateTime,
    current: NaiveDateTime,
    system_name: &str,
) -> Option<Alert> {
    let stamp = |t: NaiveDateTime| t.format("%Y%m%d_%H%M").to_string();

    if !resolution.found {
        return Some(Alert {
            severity: Severity::Failure,
            subject: format!("{} failed for {}", system_name, stamp(current)),
            body: format!(
                "Missing states from {} to {}. Starting model with cold states.",
                stamp(resolution.start),
                stamp(desired)
            ),
        });
    }
    if resolution.start != desired {
        return Some(Alert {
            severity: Severity::Degraded,
            subject: format!("{} warning for {}", system_name, stamp(current)),
            body: format!(
                "Using states from {} instead of {}.",
                stamp(resolution.start),
                stamp(desired)
            ),
        });
    }
    None
}
