use letterflow::directory::{SqliteDirectory, UserDirectory};
use letterflow::model::RecipientRule;
use letterflow::resolver::resolve;
use sqlx::Row;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

async fn seed_user(pool: &sqlx::SqlitePool, email: &str, name: &str, active: bool) -> i64 {
    sqlx::query("INSERT INTO users (email, display_name, active) VALUES (?, ?, ?) RETURNING id")
        .bind(email)
        .bind(name)
        .bind(active)
        .fetch_one(pool)
        .await
        .unwrap()
        .get("id")
}

async fn grant_role(pool: &sqlx::SqlitePool, user_id: i64, role: &str) {
    sqlx::query("INSERT INTO user_roles (user_id, role_key) VALUES (?, ?)")
        .bind(user_id)
        .bind(role)
        .execute(pool)
        .await
        .unwrap();
}

async fn set_meta(pool: &sqlx::SqlitePool, user_id: i64, key: &str, value: &str) {
    sqlx::query("INSERT INTO user_meta (user_id, meta_key, meta_value) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(key)
        .bind(value)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn all_users_skips_inactive_accounts() {
    let pool = setup_pool().await;
    let alice = seed_user(&pool, "alice@example.com", "Alice", true).await;
    let _gone = seed_user(&pool, "gone@example.com", "Gone", false).await;
    let bob = seed_user(&pool, "bob@example.com", "Bob", true).await;

    let dir = SqliteDirectory::new(pool);
    let ids = resolve(&dir, &RecipientRule::AllUsers, &[]).await.unwrap();
    assert_eq!(ids, vec![alice, bob]);
}

#[tokio::test]
async fn role_union_dedupes_and_skips_unknown_roles() {
    let pool = setup_pool().await;
    let alice = seed_user(&pool, "alice@example.com", "Alice", true).await;
    let bob = seed_user(&pool, "bob@example.com", "Bob", true).await;
    grant_role(&pool, alice, "editor").await;
    grant_role(&pool, alice, "author").await;
    grant_role(&pool, bob, "author").await;

    let dir = SqliteDirectory::new(pool);
    let rule = RecipientRule::ByRole(vec![
        "editor".into(),
        "author".into(),
        "superhero".into(),
    ]);
    let ids = resolve(&dir, &rule, &[]).await.unwrap();
    assert_eq!(ids, vec![alice, bob]);
}

#[tokio::test]
async fn registered_role_with_no_members_resolves_empty() {
    let pool = setup_pool().await;
    seed_user(&pool, "alice@example.com", "Alice", true).await;

    let dir = SqliteDirectory::new(pool);
    let rule = RecipientRule::ByRole(vec!["subscriber".into()]);
    let ids = resolve(&dir, &rule, &[]).await.unwrap();
    assert!(ids.is_empty());
}

#[tokio::test]
async fn meta_rule_matches_exact_key_and_value() {
    let pool = setup_pool().await;
    let alice = seed_user(&pool, "alice@example.com", "Alice", true).await;
    let bob = seed_user(&pool, "bob@example.com", "Bob", true).await;
    set_meta(&pool, alice, "city", "Lisbon").await;
    set_meta(&pool, bob, "city", "Porto").await;

    let dir = SqliteDirectory::new(pool);
    let rule = RecipientRule::ByAttribute {
        key: "city".into(),
        value: "Lisbon".into(),
    };
    assert_eq!(resolve(&dir, &rule, &[]).await.unwrap(), vec![alice]);

    let miss = RecipientRule::ByAttribute {
        key: "city".into(),
        value: "Faro".into(),
    };
    assert!(resolve(&dir, &miss, &[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn exclusion_applies_across_rule_types() {
    let pool = setup_pool().await;
    let alice = seed_user(&pool, "alice@example.com", "Alice", true).await;
    let bob = seed_user(&pool, "bob@example.com", "Bob", true).await;
    grant_role(&pool, alice, "editor").await;
    grant_role(&pool, bob, "editor").await;

    let dir = SqliteDirectory::new(pool);
    let rule = RecipientRule::ByRole(vec!["editor".into()]);
    assert_eq!(resolve(&dir, &rule, &[bob]).await.unwrap(), vec![alice]);

    let list = RecipientRule::ExplicitList(vec![bob, alice, bob]);
    assert_eq!(resolve(&dir, &list, &[bob]).await.unwrap(), vec![alice]);
}

#[tokio::test]
async fn recipient_lookup_carries_meta_map() {
    let pool = setup_pool().await;
    let alice = seed_user(&pool, "alice@example.com", "Alice", true).await;
    set_meta(&pool, alice, "city", "Lisbon").await;
    set_meta(&pool, alice, "plan", "gold").await;

    let dir = SqliteDirectory::new(pool);
    let recipient = dir.recipient(alice).await.unwrap().unwrap();
    assert_eq!(recipient.email, "alice@example.com");
    assert_eq!(recipient.display_name, "Alice");
    assert_eq!(recipient.meta.get("city").map(String::as_str), Some("Lisbon"));
    assert_eq!(recipient.meta.get("plan").map(String::as_str), Some("gold"));

    assert!(dir.recipient(alice + 99).await.unwrap().is_none());
}
