use crate::lifecycle;
use crate::model::{
    AttemptOutcome, DateFormat, DeliveryAttempt, FailurePolicy, Letter, LetterStatus, NewLetter,
    Template,
};
use crate::resolver;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;
use uuid::Uuid;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn insert_letter(pool: &Pool, letter: &NewLetter) -> Result<i64> {
    let (roles, recipients, meta_key, meta_value) = rule_columns(&letter.rule)?;
    let rec = sqlx::query(
        "INSERT INTO letters (template, date_format, status, subject, greeting, body, closing, signature, \
         recipient_type, user_roles, custom_recipients, meta_key, meta_value, exclude_users, failure_policy) \
         VALUES (?, ?, 'draft', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&letter.template)
    .bind(letter.date_format.as_str())
    .bind(&letter.subject)
    .bind(&letter.greeting)
    .bind(&letter.body)
    .bind(&letter.closing)
    .bind(&letter.signature)
    .bind(letter.rule.type_str())
    .bind(roles)
    .bind(recipients)
    .bind(meta_key)
    .bind(meta_value)
    .bind(serde_json::to_string(&letter.exclude)?)
    .bind(letter.failure_policy.as_str())
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

fn rule_columns(
    rule: &crate::model::RecipientRule,
) -> Result<(String, String, Option<String>, Option<String>)> {
    use crate::model::RecipientRule::*;
    Ok(match rule {
        AllUsers => ("[]".into(), "[]".into(), None, None),
        ByRole(roles) => (serde_json::to_string(roles)?, "[]".into(), None, None),
        ExplicitList(ids) => ("[]".into(), serde_json::to_string(ids)?, None, None),
        ByAttribute { key, value } => (
            "[]".into(),
            "[]".into(),
            Some(key.clone()),
            Some(value.clone()),
        ),
    })
}

fn letter_from_row(row: &SqliteRow) -> Result<Letter> {
    let status_raw: String = row.get("status");
    let status = LetterStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("unknown letter status '{}'", status_raw))?;
    let format_raw: String = row.get("date_format");
    let date_format = DateFormat::parse(&format_raw)
        .ok_or_else(|| anyhow!("unknown date format '{}'", format_raw))?;
    let policy_raw: String = row.get("failure_policy");
    let failure_policy = FailurePolicy::parse(&policy_raw)
        .ok_or_else(|| anyhow!("unknown failure policy '{}'", policy_raw))?;

    let rule = resolver::parse_rule(
        row.get::<String, _>("recipient_type").as_str(),
        row.get::<String, _>("user_roles").as_str(),
        row.get::<String, _>("custom_recipients").as_str(),
        row.get::<Option<String>, _>("meta_key"),
        row.get::<Option<String>, _>("meta_value"),
    )?;
    let exclude: Vec<i64> = serde_json::from_str(row.get::<String, _>("exclude_users").as_str())?;

    Ok(Letter {
        id: row.get("id"),
        template: row.get("template"),
        date_format,
        status,
        scheduled_date: row.get("scheduled_date"),
        subject: row.get("subject"),
        greeting: row.get("greeting"),
        body: row.get("body"),
        closing: row.get("closing"),
        signature: row.get("signature"),
        rule,
        exclude,
        failure_policy,
        sent_count: row.get("sent_count"),
        created_at: row.get("created_at"),
    })
}

#[instrument(skip_all)]
pub async fn get_letter(pool: &Pool, id: i64) -> Result<Letter> {
    let row = sqlx::query("SELECT * FROM letters WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow!("letter {} not found", id))?;
    letter_from_row(&row)
}

#[instrument(skip_all)]
pub async fn letter_status(pool: &Pool, id: i64) -> Result<Option<LetterStatus>> {
    let raw = sqlx::query_scalar::<_, String>("SELECT status FROM letters WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    match raw {
        None => Ok(None),
        Some(s) => LetterStatus::parse(&s)
            .map(Some)
            .ok_or_else(|| anyhow!("unknown letter status '{}'", s)),
    }
}

/// Externally triggered `Draft -> Scheduled` transition. The timestamp must
/// be in the future; the UPDATE re-checks the draft status so a concurrent
/// schedule or dispatch cannot double-apply.
#[instrument(skip_all)]
pub async fn schedule_letter(pool: &Pool, id: i64, when: DateTime<Utc>) -> Result<()> {
    let current = letter_status(pool, id)
        .await?
        .ok_or_else(|| anyhow!("letter {} not found", id))?;
    lifecycle::check_schedule(current, when, Utc::now())?;

    let res = sqlx::query(
        "UPDATE letters SET status = 'scheduled', scheduled_date = ? WHERE id = ? AND status = 'draft'",
    )
    .bind(when)
    .bind(id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("letter {} left draft before scheduling applied", id));
    }
    Ok(())
}

/// Ids of letters whose scheduled date has elapsed, oldest first.
#[instrument(skip_all)]
pub async fn due_letters(pool: &Pool, now: DateTime<Utc>) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM letters WHERE status = 'scheduled' AND scheduled_date <= ? ORDER BY scheduled_date ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Atomic `Scheduled -> Sending` claim. Clears the scheduled date in the
/// same statement (set iff status = scheduled). Returns whether this caller
/// won the claim; the sole mutual-exclusion point for dispatch.
#[instrument(skip_all)]
pub async fn claim_for_sending(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE letters SET status = 'sending', scheduled_date = NULL WHERE id = ? AND status = 'scheduled'",
    )
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Terminal `Sending -> {Sent,Failed,Bounced}` write, applied exactly once
/// per claimed run together with the final sent count.
#[instrument(skip_all)]
pub async fn finalize_letter(
    pool: &Pool,
    id: i64,
    status: LetterStatus,
    sent_count: i64,
) -> Result<()> {
    if !lifecycle::permits(LetterStatus::Sending, status) {
        return Err(anyhow!(
            "cannot finalize letter {} into {:?}",
            id,
            status
        ));
    }
    let res = sqlx::query(
        "UPDATE letters SET status = ?, sent_count = ? WHERE id = ? AND status = 'sending'",
    )
    .bind(status.as_str())
    .bind(sent_count)
    .bind(id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        return Err(anyhow!("letter {} was not in sending state", id));
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_attempt(
    pool: &Pool,
    letter_id: i64,
    run_id: Uuid,
    recipient_id: i64,
    outcome: AttemptOutcome,
    error: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO delivery_attempts (letter_id, run_id, recipient_id, outcome, error) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(letter_id)
    .bind(run_id.to_string())
    .bind(recipient_id)
    .bind(outcome.as_str())
    .bind(error)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

#[instrument(skip_all)]
pub async fn attempts_for_letter(pool: &Pool, letter_id: i64) -> Result<Vec<DeliveryAttempt>> {
    let rows = sqlx::query(
        "SELECT id, letter_id, run_id, recipient_id, outcome, error, attempted_at \
         FROM delivery_attempts WHERE letter_id = ? ORDER BY id ASC",
    )
    .bind(letter_id)
    .fetch_all(pool)
    .await?;

    let mut attempts = Vec::with_capacity(rows.len());
    for row in rows {
        let outcome_raw: String = row.get("outcome");
        let outcome = AttemptOutcome::parse(&outcome_raw)
            .ok_or_else(|| anyhow!("unknown attempt outcome '{}'", outcome_raw))?;
        let run_raw: String = row.get("run_id");
        attempts.push(DeliveryAttempt {
            id: row.get("id"),
            letter_id: row.get("letter_id"),
            run_id: Uuid::parse_str(&run_raw)?,
            recipient_id: row.get("recipient_id"),
            outcome,
            error: row.get("error"),
            attempted_at: row.get("attempted_at"),
        });
    }
    Ok(attempts)
}

#[instrument(skip_all)]
pub async fn get_template(pool: &Pool, slug: &str) -> Result<Option<Template>> {
    let row = sqlx::query("SELECT slug, name, skeleton FROM templates WHERE slug = ?")
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| Template {
        slug: r.get("slug"),
        name: r.get("name"),
        skeleton: r.get("skeleton"),
    }))
}
