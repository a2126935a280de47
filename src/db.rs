use crate::model::{RepositoryState, TrackedAccount};
use anyhow::Result;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability; foreign keys drive the
    // account→repos cascade.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA foreign_keys=ON;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{}", expanded_path);
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

/// Register an account for a guild, or rebind an existing one to a new
/// category. Existing repo rows are untouched either way.
#[instrument(skip_all)]
pub async fn upsert_account(
    pool: &Pool,
    guild_id: &str,
    account: &str,
    category_id: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO tracked_accounts (guild_id, account, category_id) VALUES (?, ?, ?) \
         ON CONFLICT (guild_id, account) DO UPDATE SET category_id = excluded.category_id",
    )
    .bind(guild_id)
    .bind(account)
    .bind(category_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Load one tracked account with all of its repository state, or None if the
/// account is not tracked for this guild.
#[instrument(skip_all)]
pub async fn load_account(
    pool: &Pool,
    guild_id: &str,
    account: &str,
) -> Result<Option<TrackedAccount>> {
    let category_id = sqlx::query_scalar::<_, String>(
        "SELECT category_id FROM tracked_accounts WHERE guild_id = ? AND account = ?",
    )
    .bind(guild_id)
    .bind(account)
    .fetch_optional(pool)
    .await?;
    let Some(category_id) = category_id else {
        return Ok(None);
    };

    let rows = sqlx::query(
        "SELECT name, channel_id, last_release_id FROM repos \
         WHERE guild_id = ? AND account = ? ORDER BY name",
    )
    .bind(guild_id)
    .bind(account)
    .fetch_all(pool)
    .await?;

    let mut repos = BTreeMap::new();
    for row in rows {
        repos.insert(
            row.get::<String, _>("name"),
            RepositoryState {
                channel_id: row.get("channel_id"),
                last_release_id: row.get("last_release_id"),
            },
        );
    }

    Ok(Some(TrackedAccount {
        account: account.to_string(),
        category_id,
        repos,
    }))
}

/// Remove an account and all of its repository rows.
#[instrument(skip_all)]
pub async fn remove_account(pool: &Pool, guild_id: &str, account: &str) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM repos WHERE guild_id = ? AND account = ?")
        .bind(guild_id)
        .bind(account)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM tracked_accounts WHERE guild_id = ? AND account = ?")
        .bind(guild_id)
        .bind(account)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Persist one newly mirrored repository. Called immediately after its
/// channel exists, so a crash never leaves a row without a real channel.
#[instrument(skip_all)]
pub async fn insert_repo(
    pool: &Pool,
    guild_id: &str,
    account: &str,
    name: &str,
    channel_id: &str,
    last_release_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO repos (guild_id, account, name, channel_id, last_release_id) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(guild_id)
    .bind(account)
    .bind(name)
    .bind(channel_id)
    .bind(last_release_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_repo(pool: &Pool, guild_id: &str, account: &str, name: &str) -> Result<()> {
    sqlx::query("DELETE FROM repos WHERE guild_id = ? AND account = ? AND name = ?")
        .bind(guild_id)
        .bind(account)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(())
}

/// Overwrite the stored watermark for one repository. The reconciler only
/// calls this with a release id that differs from the stored one.
#[instrument(skip_all)]
pub async fn advance_watermark(
    pool: &Pool,
    guild_id: &str,
    account: &str,
    name: &str,
    release_id: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE repos SET last_release_id = ? WHERE guild_id = ? AND account = ? AND name = ?",
    )
    .bind(release_id)
    .bind(guild_id)
    .bind(account)
    .bind(name)
    .execute(pool)
    .await?;
    Ok(())
}

/// All (guild, account) pairs currently tracked, in stable order. One poll
/// tick walks exactly this list.
#[instrument(skip_all)]
pub async fn list_tracked(pool: &Pool) -> Result<Vec<(String, String)>> {
    let rows = sqlx::query(
        "SELECT guild_id, account FROM tracked_accounts ORDER BY guild_id, account",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get("guild_id"), row.get("account")))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn account_roundtrip() {
        let pool = setup_pool().await;
        upsert_account(&pool, "g1", "octocat", "cat-1").await.unwrap();

        let acct = load_account(&pool, "g1", "octocat").await.unwrap().unwrap();
        assert_eq!(acct.category_id, "cat-1");
        assert!(acct.repos.is_empty());

        assert!(load_account(&pool, "g1", "nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_rebinds_category_and_keeps_repos() {
        let pool = setup_pool().await;
        upsert_account(&pool, "g1", "octocat", "cat-1").await.unwrap();
        insert_repo(&pool, "g1", "octocat", "hello-world", "ch-1", Some("v1"))
            .await
            .unwrap();

        upsert_account(&pool, "g1", "octocat", "cat-2").await.unwrap();

        let acct = load_account(&pool, "g1", "octocat").await.unwrap().unwrap();
        assert_eq!(acct.category_id, "cat-2");
        assert_eq!(acct.repos["hello-world"].channel_id, "ch-1");
        assert_eq!(acct.repos["hello-world"].last_release_id.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn channel_ids_are_unique() {
        let pool = setup_pool().await;
        upsert_account(&pool, "g1", "octocat", "cat-1").await.unwrap();
        insert_repo(&pool, "g1", "octocat", "a", "ch-1", None).await.unwrap();
        let err = insert_repo(&pool, "g1", "octocat", "b", "ch-1", None).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn watermark_update_and_repo_delete() {
        let pool = setup_pool().await;
        upsert_account(&pool, "g1", "octocat", "cat-1").await.unwrap();
        insert_repo(&pool, "g1", "octocat", "a", "ch-1", None).await.unwrap();

        advance_watermark(&pool, "g1", "octocat", "a", "v2").await.unwrap();
        let acct = load_account(&pool, "g1", "octocat").await.unwrap().unwrap();
        assert_eq!(acct.repos["a"].last_release_id.as_deref(), Some("v2"));

        delete_repo(&pool, "g1", "octocat", "a").await.unwrap();
        let acct = load_account(&pool, "g1", "octocat").await.unwrap().unwrap();
        assert!(acct.repos.is_empty());
    }

    #[tokio::test]
    async fn remove_account_drops_repos() {
        let pool = setup_pool().await;
        upsert_account(&pool, "g1", "octocat", "cat-1").await.unwrap();
        insert_repo(&pool, "g1", "octocat", "a", "ch-1", None).await.unwrap();

        remove_account(&pool, "g1", "octocat").await.unwrap();
        assert!(load_account(&pool, "g1", "octocat").await.unwrap().is_none());

        let repo_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repos")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(repo_rows, 0);
    }

    #[tokio::test]
    async fn list_tracked_is_ordered() {
        let pool = setup_pool().await;
        upsert_account(&pool, "g2", "zed", "c").await.unwrap();
        upsert_account(&pool, "g1", "octocat", "c").await.unwrap();
        upsert_account(&pool, "g1", "alice", "c").await.unwrap();

        let tracked = list_tracked(&pool).await.unwrap();
        assert_eq!(
            tracked,
            vec![
                ("g1".to_string(), "alice".to_string()),
                ("g1".to_string(), "octocat".to_string()),
                ("g2".to_string(), "zed".to_string()),
            ]
        );
    }
}
