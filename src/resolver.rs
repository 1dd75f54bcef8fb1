//! Recipient resolver: turns a letter's recipient rule plus exclusion set
//! into a concrete, deduplicated recipient id list. Pure read against the
//! user directory; exclusion is always applied last.
use crate::directory::UserDirectory;
use crate::model::RecipientRule;
use anyhow::Result;
use std::collections::HashSet;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("unrecognized recipient rule type '{0}'")]
    UnrecognizedRule(String),
    #[error("malformed recipient rule data: {0}")]
    MalformedRule(String),
}

/// Reconstruct a rule from its stored columns. The `user_meta` variant
/// requires both key and value; anything outside the four known types is a
/// fatal `ResolutionError`.
pub fn parse_rule(
    recipient_type: &str,
    user_roles_json: &str,
    custom_recipients_json: &str,
    meta_key: Option<String>,
    meta_value: Option<String>,
) -> Result<RecipientRule, ResolutionError> {
    match recipient_type {
        "all_users" => Ok(RecipientRule::AllUsers),
        "user_role" => {
            let roles: Vec<String> = serde_json::from_str(user_roles_json)
                .map_err(|e| ResolutionError::MalformedRule(e.to_string()))?;
            Ok(RecipientRule::ByRole(roles))
        }
        "custom_list" => {
            let ids: Vec<i64> = serde_json::from_str(custom_recipients_json)
                .map_err(|e| ResolutionError::MalformedRule(e.to_string()))?;
            Ok(RecipientRule::ExplicitList(ids))
        }
        "user_meta" => match (meta_key, meta_value) {
            (Some(key), Some(value)) => Ok(RecipientRule::ByAttribute { key, value }),
            _ => Err(ResolutionError::MalformedRule(
                "user_meta rule missing key or value".into(),
            )),
        },
        other => Err(ResolutionError::UnrecognizedRule(other.to_string())),
    }
}

/// Resolve a rule to an ordered id sequence: duplicates removed (first
/// occurrence wins), then the exclusion set applied.
pub async fn resolve(
    dir: &dyn UserDirectory,
    rule: &RecipientRule,
    exclude: &[i64],
) -> Result<Vec<i64>> {
    let raw = match rule {
        RecipientRule::AllUsers => dir.active_users().await?,
        RecipientRule::ByRole(roles) => {
            let mut ids = Vec::new();
            for role in roles {
                match dir.role_members(role).await? {
                    Some(members) => ids.extend(members),
                    None => warn!(role, "unknown role in recipient rule; skipping"),
                }
            }
            ids
        }
        RecipientRule::ExplicitList(ids) => ids.clone(),
        RecipientRule::ByAttribute { key, value } => dir.users_with_meta(key, value).await?,
    };

    let excluded: HashSet<i64> = exclude.iter().copied().collect();
    let mut seen = HashSet::with_capacity(raw.len());
    let mut resolved = Vec::with_capacity(raw.len());
    for id in raw {
        if seen.insert(id) && !excluded.contains(&id) {
            resolved.push(id);
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Recipient;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Fixed-answer directory for resolver tests.
    struct StaticDirectory {
        active: Vec<i64>,
        roles: HashMap<String, Vec<i64>>,
        meta: HashMap<(String, String), Vec<i64>>,
    }

    #[async_trait]
    impl UserDirectory for StaticDirectory {
        async fn active_users(&self) -> Result<Vec<i64>> {
            Ok(self.active.clone())
        }

        async fn role_members(&self, role: &str) -> Result<Option<Vec<i64>>> {
            Ok(self.roles.get(role).cloned())
        }

        async fn users_with_meta(&self, key: &str, value: &str) -> Result<Vec<i64>> {
            Ok(self
                .meta
                .get(&(key.to_string(), value.to_string()))
                .cloned()
                .unwrap_or_default())
        }

        async fn recipient(&self, _id: i64) -> Result<Option<Recipient>> {
            Ok(None)
        }
    }

    fn directory() -> StaticDirectory {
        let mut roles = HashMap::new();
        roles.insert("editor".to_string(), vec![1, 2]);
        roles.insert("author".to_string(), vec![2, 3]);
        roles.insert("subscriber".to_string(), vec![]);
        let mut meta = HashMap::new();
        meta.insert(("city".to_string(), "Lisbon".to_string()), vec![4, 5]);
        StaticDirectory {
            active: vec![1, 2, 3, 4, 5],
            roles,
            meta,
        }
    }

    #[tokio::test]
    async fn all_users_applies_exclusion_last() {
        let dir = directory();
        let ids = resolve(&dir, &RecipientRule::AllUsers, &[2, 4])
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 3, 5]);
    }

    #[tokio::test]
    async fn by_role_unions_and_dedupes() {
        let dir = directory();
        let rule = RecipientRule::ByRole(vec!["editor".into(), "author".into()]);
        let ids = resolve(&dir, &rule, &[]).await.unwrap();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unknown_role_is_skipped_not_fatal() {
        let dir = directory();
        let rule = RecipientRule::ByRole(vec!["superhero".into(), "editor".into()]);
        let ids = resolve(&dir, &rule, &[]).await.unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn empty_role_resolves_empty_not_error() {
        let dir = directory();
        let rule = RecipientRule::ByRole(vec!["subscriber".into()]);
        let ids = resolve(&dir, &rule, &[]).await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn explicit_list_preserves_order_first_occurrence_wins() {
        let dir = directory();
        let rule = RecipientRule::ExplicitList(vec![5, 3, 5, 1, 3]);
        let ids = resolve(&dir, &rule, &[1]).await.unwrap();
        assert_eq!(ids, vec![5, 3]);
    }

    #[tokio::test]
    async fn attribute_miss_yields_empty() {
        let dir = directory();
        let rule = RecipientRule::ByAttribute {
            key: "city".into(),
            value: "Porto".into(),
        };
        let ids = resolve(&dir, &rule, &[]).await.unwrap();
        assert!(ids.is_empty());

        let hit = RecipientRule::ByAttribute {
            key: "city".into(),
            value: "Lisbon".into(),
        };
        assert_eq!(resolve(&dir, &hit, &[]).await.unwrap(), vec![4, 5]);
    }

    #[test]
    fn parse_rule_rejects_unknown_type() {
        let err = parse_rule("by_horoscope", "[]", "[]", None, None).unwrap_err();
        assert_eq!(err, ResolutionError::UnrecognizedRule("by_horoscope".into()));
    }

    #[test]
    fn parse_rule_round_trips_known_types() {
        assert_eq!(
            parse_rule("all_users", "[]", "[]", None, None).unwrap(),
            RecipientRule::AllUsers
        );
        assert_eq!(
            parse_rule("user_role", "[\"editor\"]", "[]", None, None).unwrap(),
            RecipientRule::ByRole(vec!["editor".into()])
        );
        assert_eq!(
            parse_rule("custom_list", "[]", "[3,1]", None, None).unwrap(),
            RecipientRule::ExplicitList(vec![3, 1])
        );
        assert_eq!(
            parse_rule("user_meta", "[]", "[]", Some("city".into()), Some("Lisbon".into()))
                .unwrap(),
            RecipientRule::ByAttribute {
                key: "city".into(),
                value: "Lisbon".into()
            }
        );
        assert!(parse_rule("user_meta", "[]", "[]", None, None).is_err());
    }
}
