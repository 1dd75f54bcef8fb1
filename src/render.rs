//! Letter renderer: merges template skeleton, letter sections and
//! per-recipient placeholder values into the final document.
//!
//! Unknown bracketed tags are left verbatim so a malformed template degrades
//! to odd-looking output instead of blocking the whole campaign.
use crate::model::{Letter, Recipient, RenderedLetter, Template};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::warn;

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([a-z][a-z0-9_]*)\]").unwrap());

/// Render a letter for one recipient. Same inputs always produce the same
/// output; the `[date]` tag reads the letter's own dates, never the clock.
pub fn render(letter: &Letter, template: Option<&Template>, recipient: &Recipient) -> RenderedLetter {
    let (rendered, warnings) = render_tracked(letter, template, recipient);
    for tag in &warnings {
        warn!(
            letter_id = letter.id,
            recipient_id = recipient.id,
            tag,
            "unknown placeholder tag left verbatim"
        );
    }
    rendered
}

/// Like [`render`] but also returns the unknown tags encountered, for
/// callers that aggregate warnings themselves.
pub fn render_tracked(
    letter: &Letter,
    template: Option<&Template>,
    recipient: &Recipient,
) -> (RenderedLetter, Vec<String>) {
    let assembled = match template {
        Some(tpl) => fill_sections(&tpl.skeleton, letter),
        // No usable skeleton: fixed order greeting, body, closing, signature.
        None => [
            letter.greeting.as_str(),
            letter.body.as_str(),
            letter.closing.as_str(),
            letter.signature.as_str(),
        ]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n"),
    };

    let mut warnings = Vec::new();
    let subject = substitute(&letter.subject, letter, recipient, &mut warnings);
    let body = substitute(&assembled, letter, recipient, &mut warnings);
    (RenderedLetter { subject, body }, warnings)
}

// Single pass over the skeleton only: section content is never re-scanned
// for slots, so a greeting containing a literal `[body]` stays as written.
fn fill_sections(skeleton: &str, letter: &Letter) -> String {
    TAG.replace_all(skeleton, |caps: &Captures| match &caps[1] {
        "greeting" => letter.greeting.clone(),
        "body" => letter.body.clone(),
        "closing" => letter.closing.clone(),
        "signature" => letter.signature.clone(),
        _ => caps[0].to_string(),
    })
    .into_owned()
}

fn substitute(
    input: &str,
    letter: &Letter,
    recipient: &Recipient,
    warnings: &mut Vec<String>,
) -> String {
    TAG.replace_all(input, |caps: &Captures| {
        let tag = &caps[1];
        match tag {
            "recipient_name" => recipient.display_name.clone(),
            "recipient_email" => recipient.email.clone(),
            "date" => letter
                .scheduled_date
                .unwrap_or(letter.created_at)
                .format(letter.date_format.pattern())
                .to_string(),
            _ => {
                if let Some(value) = tag
                    .strip_prefix("meta_")
                    .and_then(|key| recipient.meta.get(key))
                {
                    value.clone()
                } else {
                    warnings.push(tag.to_string());
                    caps[0].to_string()
                }
            }
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DateFormat, FailurePolicy, LetterStatus, RecipientRule};
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn letter() -> Letter {
        Letter {
            id: 1,
            template: "standard".into(),
            date_format: DateFormat::Iso,
            status: LetterStatus::Scheduled,
            scheduled_date: Some(Utc.with_ymd_and_hms(2026, 9, 1, 9, 0, 0).unwrap()),
            subject: "Update for [recipient_name]".into(),
            greeting: "Dear [recipient_name],".into(),
            body: "Your account [recipient_email] is ready as of [date].".into(),
            closing: "Sincerely,".into(),
            signature: "The Letters Team".into(),
            rule: RecipientRule::AllUsers,
            exclude: vec![],
            failure_policy: FailurePolicy::ContinueOnFailure,
            sent_count: 0,
            created_at: Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
        }
    }

    fn recipient() -> Recipient {
        let mut meta = HashMap::new();
        meta.insert("city".to_string(), "Lisbon".to_string());
        Recipient {
            id: 7,
            email: "alice@example.com".into(),
            display_name: "Alice".into(),
            meta,
        }
    }

    fn template(skeleton: &str) -> Template {
        Template {
            slug: "custom".into(),
            name: "Custom".into(),
            skeleton: skeleton.into(),
        }
    }

    #[test]
    fn substitutes_known_tags_in_subject_and_body() {
        let (out, warnings) = render_tracked(&letter(), None, &recipient());
        assert_eq!(out.subject, "Update for Alice");
        assert!(out.body.contains("Dear Alice,"));
        assert!(out.body.contains("alice@example.com"));
        assert!(out.body.contains("2026-09-01"));
        assert!(warnings.is_empty());
    }

    #[test]
    fn fallback_concatenation_uses_fixed_section_order() {
        let (out, _) = render_tracked(&letter(), None, &recipient());
        let greeting = out.body.find("Dear Alice,").unwrap();
        let body = out.body.find("Your account").unwrap();
        let closing = out.body.find("Sincerely,").unwrap();
        let signature = out.body.find("The Letters Team").unwrap();
        assert!(greeting < body && body < closing && closing < signature);
    }

    #[test]
    fn skeleton_controls_section_placement() {
        let tpl = template("[signature]\n---\n[body]");
        let (out, _) = render_tracked(&letter(), Some(&tpl), &recipient());
        let signature = out.body.find("The Letters Team").unwrap();
        let body = out.body.find("Your account").unwrap();
        assert!(signature < body);
        assert!(!out.body.contains("Sincerely"));
    }

    #[test]
    fn section_content_is_not_rescanned_for_slots() {
        let mut l = letter();
        l.greeting = "Use the [body] slot sparingly.".into();
        l.body = "actual body".into();
        let tpl = template("[greeting]\n\n[body]");
        let (out, warnings) = render_tracked(&l, Some(&tpl), &recipient());
        assert!(out.body.contains("Use the [body] slot sparingly."));
        assert_eq!(out.body.matches("actual body").count(), 1);
        assert_eq!(warnings, vec!["body".to_string()]);
    }

    #[test]
    fn unknown_tag_stays_verbatim_and_warns() {
        let mut l = letter();
        l.body = "Hello [unknown_tag], welcome.".into();
        let (out, warnings) = render_tracked(&l, None, &recipient());
        assert!(out.body.contains("[unknown_tag]"));
        assert_eq!(warnings, vec!["unknown_tag".to_string()]);
    }

    #[test]
    fn meta_tags_read_recipient_attributes() {
        let mut l = letter();
        l.body = "Greetings from [meta_city]! [meta_country]".into();
        let (out, warnings) = render_tracked(&l, None, &recipient());
        assert!(out.body.contains("Greetings from Lisbon!"));
        assert!(out.body.contains("[meta_country]"));
        assert_eq!(warnings, vec!["meta_country".to_string()]);
    }

    #[test]
    fn date_tag_uses_created_at_when_unscheduled() {
        let mut l = letter();
        l.scheduled_date = None;
        l.date_format = DateFormat::DayMonthYear;
        l.body = "As of [date].".into();
        let (out, _) = render_tracked(&l, None, &recipient());
        assert!(out.body.contains("01/08/2026"));
    }

    #[test]
    fn render_is_deterministic() {
        let l = letter();
        let r = recipient();
        let a = render(&l, None, &r);
        let b = render(&l, None, &r);
        assert_eq!(a, b);
    }
}
