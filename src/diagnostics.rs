//! Diagnostic reporting around the dispatcher.
//!
//! The dispatcher returns a `Dispatch` record instead of logging. Callers
//! hand that record to [`report`] to get one log line per attempt.

use crate::core::AttemptOutcome;
use crate::dispatcher::{DeliveryError, Dispatch};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when it is set.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Masks a secret for logging: the first 7 and last 4 characters are kept,
/// anything of 11 characters or fewer is fully hidden.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 11 {
        return "***".to_string();
    }
    let head: String = chars[..7].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}***{}", head, tail)
}

/// Logs every attempt of a dispatch and its final outcome.
pub fn report(dispatch: &Dispatch) {
    for attempt in &dispatch.attempts {
        match &attempt.outcome {
            AttemptOutcome::Delivered => debug!(
                attempt = attempt.number,
                elapsed_ms = attempt.elapsed.as_millis() as u64,
                "Attempt delivered"
            ),
            AttemptOutcome::Transient(reason) => warn!(
                attempt = attempt.number,
                elapsed_ms = attempt.elapsed.as_millis() as u64,
                started_at = %attempt.started_at.to_rfc3339(),
                reason = %reason,
                "Attempt failed, may retry"
            ),
            AttemptOutcome::Rejected(reason) => warn!(
                attempt = attempt.number,
                elapsed_ms = attempt.elapsed.as_millis() as u64,
                started_at = %attempt.started_at.to_rfc3339(),
                reason = %reason,
                "Attempt rejected by endpoint"
            ),
        }
    }

    match &dispatch.result {
        Ok(sent) => info!(
            attempts = dispatch.attempts.len(),
            message_id = ?sent.message_id,
            "Notification delivered"
        ),
        Err(DeliveryError::Validation(e)) => {
            error!(error = %e, "Notification refused before sending")
        }
        Err(DeliveryError::Rejected { code, description }) => error!(
            code = ?code,
            description = %description,
            "Notification rejected by endpoint"
        ),
        Err(e @ DeliveryError::Transient { .. }) => {
            error!(error = %e, "Notification not delivered")
        }
    }
}
