use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a letter. Stored as lowercase TEXT; unknown values
/// are rejected at the db boundary rather than mapped to a default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LetterStatus {
    Draft,
    Scheduled,
    Sending,
    Sent,
    Failed,
    Bounced,
}

impl LetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LetterStatus::Draft => "draft",
            LetterStatus::Scheduled => "scheduled",
            LetterStatus::Sending => "sending",
            LetterStatus::Sent => "sent",
            LetterStatus::Failed => "failed",
            LetterStatus::Bounced => "bounced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(LetterStatus::Draft),
            "scheduled" => Some(LetterStatus::Scheduled),
            "sending" => Some(LetterStatus::Sending),
            "sent" => Some(LetterStatus::Sent),
            "failed" => Some(LetterStatus::Failed),
            "bounced" => Some(LetterStatus::Bounced),
            _ => None,
        }
    }
}

/// How recipients are selected for a letter. Always paired with an
/// exclusion set on the letter itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RecipientRule {
    AllUsers,
    ByRole(Vec<String>),
    ExplicitList(Vec<i64>),
    ByAttribute { key: String, value: String },
}

impl RecipientRule {
    pub fn type_str(&self) -> &'static str {
        match self {
            RecipientRule::AllUsers => "all_users",
            RecipientRule::ByRole(_) => "user_role",
            RecipientRule::ExplicitList(_) => "custom_list",
            RecipientRule::ByAttribute { .. } => "user_meta",
        }
    }
}

/// Date rendering preference for the `[date]` tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DateFormat {
    LongDate,
    DayMonthYear,
    Iso,
    MonthDayYear,
}

impl DateFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DateFormat::LongDate => "long_date",
            DateFormat::DayMonthYear => "day_month_year",
            DateFormat::Iso => "iso",
            DateFormat::MonthDayYear => "month_day_year",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long_date" => Some(DateFormat::LongDate),
            "day_month_year" => Some(DateFormat::DayMonthYear),
            "iso" => Some(DateFormat::Iso),
            "month_day_year" => Some(DateFormat::MonthDayYear),
            _ => None,
        }
    }

    /// chrono format string for this preference.
    pub fn pattern(&self) -> &'static str {
        match self {
            DateFormat::LongDate => "%B %-d, %Y",
            DateFormat::DayMonthYear => "%d/%m/%Y",
            DateFormat::Iso => "%Y-%m-%d",
            DateFormat::MonthDayYear => "%m/%d/%Y",
        }
    }
}

/// Whether a hard delivery failure aborts the rest of the run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailurePolicy {
    ContinueOnFailure,
    AbortOnFailure,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::ContinueOnFailure => "continue",
            FailurePolicy::AbortOnFailure => "abort",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "continue" => Some(FailurePolicy::ContinueOnFailure),
            "abort" => Some(FailurePolicy::AbortOnFailure),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Letter {
    pub id: i64,
    pub template: String,
    pub date_format: DateFormat,
    pub status: LetterStatus,
    pub scheduled_date: Option<DateTime<Utc>>,
    pub subject: String,
    pub greeting: String,
    pub body: String,
    pub closing: String,
    pub signature: String,
    pub rule: RecipientRule,
    pub exclude: Vec<i64>,
    pub failure_policy: FailurePolicy,
    pub sent_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Draft content handed to the engine by the external author.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLetter {
    pub template: String,
    pub date_format: DateFormat,
    pub subject: String,
    pub greeting: String,
    pub body: String,
    pub closing: String,
    pub signature: String,
    pub rule: RecipientRule,
    pub exclude: Vec<i64>,
    pub failure_policy: FailurePolicy,
}

impl NewLetter {
    pub fn text(subject: &str, body: &str, rule: RecipientRule) -> Self {
        Self {
            template: "standard".into(),
            date_format: DateFormat::Iso,
            subject: subject.into(),
            greeting: String::new(),
            body: body.into(),
            closing: String::new(),
            signature: String::new(),
            rule,
            exclude: Vec::new(),
            failure_policy: FailurePolicy::ContinueOnFailure,
        }
    }
}

/// Read-only body skeleton owned by the external template store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub slug: String,
    pub name: String,
    pub skeleton: String,
}

/// One entry from the user directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub id: i64,
    pub email: String,
    pub display_name: String,
    pub meta: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AttemptOutcome {
    Sent,
    Failed,
    Bounced,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Sent => "sent",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Bounced => "bounced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(AttemptOutcome::Sent),
            "failed" => Some(AttemptOutcome::Failed),
            "bounced" => Some(AttemptOutcome::Bounced),
            _ => None,
        }
    }
}

/// Append-only delivery log entry, one per (run, recipient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: i64,
    pub letter_id: i64,
    pub run_id: Uuid,
    pub recipient_id: i64,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Ephemeral aggregate over one dispatch pass of one letter. Folded into
/// the letter's status and sent_count at finalization, then discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRun {
    pub id: Uuid,
    pub letter_id: i64,
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    pub bounced: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CampaignRun {
    pub fn begin(letter_id: i64, total: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            letter_id,
            total,
            sent: 0,
            failed: 0,
            bounced: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record(&mut self, outcome: AttemptOutcome) {
        match outcome {
            AttemptOutcome::Sent => self.sent += 1,
            AttemptOutcome::Failed => self.failed += 1,
            AttemptOutcome::Bounced => self.bounced += 1,
        }
    }

    pub fn attempted(&self) -> usize {
        self.sent + self.failed + self.bounced
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }
}

/// Final document produced by the renderer for one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedLetter {
    pub subject: String,
    pub body: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            LetterStatus::Draft,
            LetterStatus::Scheduled,
            LetterStatus::Sending,
            LetterStatus::Sent,
            LetterStatus::Failed,
            LetterStatus::Bounced,
        ] {
            assert_eq!(LetterStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(LetterStatus::parse("published"), None);
    }

    #[test]
    fn campaign_run_counts() {
        let mut run = CampaignRun::begin(1, 3);
        run.record(AttemptOutcome::Sent);
        run.record(AttemptOutcome::Bounced);
        run.record(AttemptOutcome::Failed);
        assert_eq!(run.attempted(), 3);
        assert_eq!((run.sent, run.failed, run.bounced), (1, 1, 1));
    }
}
