//! Delivery scheduler: the recurring sweep that selects due letters and
//! claims them for dispatch. The claim is an atomic compare-and-set on the
//! status column, so concurrent sweeps hand each letter to exactly one
//! dispatcher.
use crate::db::{self, Pool};
use crate::model::LetterStatus;
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

/// One sweep pass: returns the ids this caller successfully claimed.
///
/// Re-running while a letter is already `Sending` or terminal is a no-op;
/// every skipped letter is logged with why the claim was not taken.
#[instrument(skip_all)]
pub async fn sweep_once(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<i64>> {
    let due = db::due_letters(pool, now).await?;
    let mut claimed = Vec::with_capacity(due.len());

    for id in due {
        if db::claim_for_sending(pool, id).await? {
            info!(letter_id = id, "claimed letter for sending");
            claimed.push(id);
            continue;
        }

        // Lost the CAS; re-read to say why.
        match db::letter_status(pool, id).await? {
            Some(LetterStatus::Sending) => {
                warn!(letter_id = id, "claim lost: another sweep is dispatching this letter");
            }
            Some(status) => {
                warn!(
                    letter_id = id,
                    status = status.as_str(),
                    "claim skipped: letter no longer scheduled"
                );
            }
            None => {
                warn!(letter_id = id, "claim skipped: letter disappeared from store");
            }
        }
    }

    Ok(claimed)
}
