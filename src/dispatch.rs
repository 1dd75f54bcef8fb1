//! Dispatch engine: runs one campaign pass over a claimed letter.
//!
//! Recipients are resolved once, rendered and sent through a bounded worker
//! pool, and every resolved recipient ends up with exactly one delivery
//! attempt record per run, whether it was sent, failed, bounced, timed out
//! or never started.
use crate::config::App;
use crate::db::{self, Pool};
use crate::directory::UserDirectory;
use crate::lifecycle;
use crate::model::{AttemptOutcome, CampaignRun, FailurePolicy, Letter, LetterStatus, Template};
use crate::render;
use crate::resolver;
use crate::transport::{MailTransport, Outcome};
use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub workers: usize,
    pub run_deadline: Duration,
    pub send_timeout: Duration,
}

impl DispatchOptions {
    pub fn from_config(app: &App) -> Self {
        Self {
            workers: app.dispatch_workers,
            run_deadline: Duration::from_secs(app.run_deadline_seconds),
            send_timeout: Duration::from_millis(app.send_timeout_ms),
        }
    }
}

/// Outcome of one recipient's attempt before it is written to the log.
struct AttemptResult {
    recipient_id: i64,
    outcome: AttemptOutcome,
    error: Option<String>,
}

/// Run one campaign pass over a letter already claimed into `Sending`.
///
/// Resolution failure is the only run-fatal error: the letter is finalized
/// `Failed` before any send. Everything else is folded into the run.
#[instrument(skip_all)]
pub async fn run_letter(
    pool: &Pool,
    dir: &dyn UserDirectory,
    transport: &dyn MailTransport,
    letter_id: i64,
    opts: &DispatchOptions,
    cancel: &watch::Receiver<bool>,
) -> Result<CampaignRun> {
    let letter = match db::get_letter(pool, letter_id).await {
        Ok(letter) => letter,
        Err(err) => {
            warn!(letter_id, ?err, "claimed letter could not be loaded; failing run");
            db::finalize_letter(pool, letter_id, LetterStatus::Failed, 0).await?;
            return Err(err).context("loading claimed letter");
        }
    };

    let recipients = match resolver::resolve(dir, &letter.rule, &letter.exclude).await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(letter_id, ?err, "recipient resolution failed; failing run");
            db::finalize_letter(pool, letter_id, LetterStatus::Failed, 0).await?;
            return Err(err).context("resolving recipients");
        }
    };

    let template = match db::get_template(pool, &letter.template).await {
        Ok(Some(tpl)) => Some(tpl),
        Ok(None) => {
            warn!(
                letter_id,
                template = %letter.template,
                "unknown template; falling back to plain section order"
            );
            None
        }
        Err(err) => {
            warn!(letter_id, ?err, "template lookup failed; falling back to plain section order");
            None
        }
    };

    let mut run = CampaignRun::begin(letter_id, recipients.len());
    info!(
        letter_id,
        run_id = %run.id,
        total = run.total,
        "starting campaign run"
    );

    let results = deliver_all(
        dir,
        transport,
        &letter,
        template.as_ref(),
        &recipients,
        opts,
        cancel,
    )
    .await;

    // Every resolved recipient gets exactly one attempt row; the ones the
    // deadline cut off are failed with a timeout error. A broken attempt
    // log never aborts the run: the outcome still counts and the letter
    // still reaches finalization.
    let mut seen: HashSet<i64> = HashSet::with_capacity(results.len());
    for res in &results {
        seen.insert(res.recipient_id);
        if let Err(err) = db::record_attempt(
            pool,
            letter_id,
            run.id,
            res.recipient_id,
            res.outcome,
            res.error.as_deref(),
        )
        .await
        {
            error!(
                letter_id,
                recipient_id = res.recipient_id,
                ?err,
                "failed to append delivery attempt"
            );
        }
        run.record(res.outcome);
    }
    for &rid in recipients.iter().filter(|rid| !seen.contains(rid)) {
        if let Err(err) = db::record_attempt(
            pool,
            letter_id,
            run.id,
            rid,
            AttemptOutcome::Failed,
            Some("run deadline exceeded"),
        )
        .await
        {
            error!(letter_id, recipient_id = rid, ?err, "failed to append delivery attempt");
        }
        run.record(AttemptOutcome::Failed);
    }

    run.finish();
    let terminal = lifecycle::terminal_status(&run);
    db::finalize_letter(pool, letter_id, terminal, run.sent as i64).await?;
    info!(
        letter_id,
        run_id = %run.id,
        status = terminal.as_str(),
        sent = run.sent,
        failed = run.failed,
        bounced = run.bounced,
        "campaign run finalized"
    );
    Ok(run)
}

/// Drive the bounded worker pool until done or the run deadline elapses.
/// In-flight attempts survive a cancel signal; nothing new starts after it.
///
/// The deadline branch drops in-flight sends mid-transport, so a message
/// the mail API already accepted can still end up logged as a deadline
/// failure. The cut-off under-reports deliveries, never the reverse.
async fn deliver_all(
    dir: &dyn UserDirectory,
    transport: &dyn MailTransport,
    letter: &Letter,
    template: Option<&Template>,
    recipients: &[i64],
    opts: &DispatchOptions,
    cancel: &watch::Receiver<bool>,
) -> Vec<AttemptResult> {
    let aborted = AtomicBool::new(false);
    let mut work = stream::iter(recipients.iter().copied())
        .map(|rid| {
            attempt_one(
                dir, transport, letter, template, rid, opts, cancel, &aborted,
            )
        })
        .buffer_unordered(opts.workers.max(1));

    let deadline = sleep_until(Instant::now() + opts.run_deadline);
    tokio::pin!(deadline);

    let mut results = Vec::with_capacity(recipients.len());
    loop {
        tokio::select! {
            next = work.next() => match next {
                Some(res) => results.push(res),
                None => break,
            },
            _ = &mut deadline => {
                warn!(letter_id = letter.id, "run deadline elapsed with attempts outstanding");
                break;
            }
        }
    }
    results
}

#[allow(clippy::too_many_arguments)]
async fn attempt_one(
    dir: &dyn UserDirectory,
    transport: &dyn MailTransport,
    letter: &Letter,
    template: Option<&Template>,
    recipient_id: i64,
    opts: &DispatchOptions,
    cancel: &watch::Receiver<bool>,
    aborted: &AtomicBool,
) -> AttemptResult {
    let failed = |error: String| AttemptResult {
        recipient_id,
        outcome: AttemptOutcome::Failed,
        error: Some(error),
    };

    if *cancel.borrow() {
        return failed("dispatch cancelled".into());
    }
    if aborted.load(Ordering::SeqCst) {
        return failed("aborted: earlier delivery failed".into());
    }

    let recipient = match dir.recipient(recipient_id).await {
        Ok(Some(recipient)) => recipient,
        Ok(None) => return failed("recipient not found in directory".into()),
        Err(err) => return failed(format!("directory lookup failed: {err}")),
    };

    let rendered = render::render(letter, template, &recipient);

    let outcome = match timeout(opts.send_timeout, transport.send(&rendered, &recipient.email)).await
    {
        Ok(outcome) => outcome,
        Err(_) => Outcome::Failed("send timed out".into()),
    };

    match outcome {
        Outcome::Sent => AttemptResult {
            recipient_id,
            outcome: AttemptOutcome::Sent,
            error: None,
        },
        Outcome::Bounced(reason) => AttemptResult {
            recipient_id,
            outcome: AttemptOutcome::Bounced,
            error: Some(reason),
        },
        Outcome::Failed(reason) => {
            if letter.failure_policy == FailurePolicy::AbortOnFailure {
                aborted.store(true, Ordering::SeqCst);
            }
            failed(reason)
        }
    }
}
