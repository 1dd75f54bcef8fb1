//! Status lifecycle tracker: the closed transition table for letters and
//! the fold from a finished campaign run to a terminal status.
use crate::model::{CampaignRun, LetterStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("illegal transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: LetterStatus,
        to: LetterStatus,
    },
    #[error("scheduled date {0} is not in the future")]
    ScheduledDateInPast(DateTime<Utc>),
}

/// Whether `from -> to` appears in the transition table.
///
/// Terminal statuses (`Sent`, `Failed`, `Bounced`) admit no transitions;
/// a resend is a new logical letter, never a re-entry into `Sending`.
pub fn permits(from: LetterStatus, to: LetterStatus) -> bool {
    use LetterStatus::*;
    matches!(
        (from, to),
        (Draft, Scheduled)
            | (Scheduled, Sending)
            | (Sending, Sent)
            | (Sending, Failed)
            | (Sending, Bounced)
    )
}

/// Validate an externally triggered `Draft -> Scheduled` transition.
pub fn check_schedule(
    current: LetterStatus,
    when: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), LifecycleError> {
    if !permits(current, LetterStatus::Scheduled) {
        return Err(LifecycleError::IllegalTransition {
            from: current,
            to: LetterStatus::Scheduled,
        });
    }
    if when <= now {
        return Err(LifecycleError::ScheduledDateInPast(when));
    }
    Ok(())
}

/// Fold a completed run into the letter's terminal status.
///
/// Any hard failure wins over bounces; bounces win over partial success.
/// `Sent` requires every attempt to have succeeded.
pub fn terminal_status(run: &CampaignRun) -> LetterStatus {
    if run.failed > 0 {
        LetterStatus::Failed
    } else if run.bounced > 0 {
        LetterStatus::Bounced
    } else {
        LetterStatus::Sent
    }
}
