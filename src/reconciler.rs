//! The reconciliation core: converges local mirror state (channels and
//! release watermarks) with what the source account actually contains.
//!
//! Structural changes (channel create/delete) happen only in [`sync_account`];
//! [`poll_account`] only refreshes release watermarks. Keeping the two apart
//! bounds what a single periodic tick is allowed to touch.
use crate::db::{self, Pool};
use crate::discord::ChannelGateway;
use crate::github::SourceGateway;
use crate::model::{Fetch, RemoteRepo};
use anyhow::Result;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("account {account} is not tracked for guild {guild_id}")]
    NotTracked { guild_id: String, account: String },
}

/// What one sync pass did. `skipped` entries failed on a gateway call and
/// will be retried on the next sync.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub skipped: Vec<String>,
    /// The remote list was unavailable or empty; nothing was touched.
    pub aborted: bool,
}

/// What one poll pass announced. `failed` entries keep their stored
/// watermark and are retried on the next tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub announced: Vec<String>,
    pub failed: Vec<String>,
    /// The remote list was unavailable or empty; no watermark was touched.
    pub aborted: bool,
}

/// Track `account` for a guild, binding it to a channel category, then run
/// an immediate sync. Re-registering an already-tracked account rebinds the
/// category and leaves its existing mirrors alone.
#[instrument(skip_all)]
pub async fn register_account(
    pool: &Pool,
    source: &dyn SourceGateway,
    channels: &dyn ChannelGateway,
    guild_id: &str,
    category_id: &str,
    account: &str,
) -> Result<SyncReport> {
    db::upsert_account(pool, guild_id, account, category_id).await?;
    info!(guild_id, account, category_id, "registered account");
    sync_account(pool, source, channels, guild_id, account).await
}

/// Converge the set of mirror channels with the account's current
/// repository list.
///
/// An unavailable or empty repository list aborts the whole pass: absence of
/// data is treated as "unknown", never as "everything was deleted", so a
/// flaky fetch can never mass-delete channels. Per-repository gateway
/// failures are logged and skipped without aborting the rest of the pass.
#[instrument(skip_all)]
pub async fn sync_account(
    pool: &Pool,
    source: &dyn SourceGateway,
    channels: &dyn ChannelGateway,
    guild_id: &str,
    account: &str,
) -> Result<SyncReport> {
    let tracked = db::load_account(pool, guild_id, account)
        .await?
        .ok_or_else(|| not_tracked(guild_id, account))?;

    let remote = match source.list_repositories(account).await {
        Fetch::Ok(list) if list.is_empty() => {
            info!(guild_id, account, "remote repository list is empty; sync aborted");
            return Ok(SyncReport {
                aborted: true,
                ..Default::default()
            });
        }
        Fetch::Ok(list) => list,
        Fetch::Unavailable => {
            warn!(guild_id, account, "repository list unavailable; sync aborted");
            return Ok(SyncReport {
                aborted: true,
                ..Default::default()
            });
        }
    };

    let mut report = SyncReport::default();

    // Creations first, in the order the source returned them.
    for repo in &remote {
        if tracked.repos.contains_key(&repo.name) {
            continue;
        }
        match create_mirror(pool, source, channels, guild_id, &tracked.category_id, account, repo)
            .await
        {
            Ok(()) => report.created.push(repo.name.clone()),
            Err(err) => {
                warn!(?err, guild_id, account, repo = %repo.name,
                    "failed to create mirror; will retry on next sync");
                report.skipped.push(repo.name.clone());
            }
        }
    }

    // Then remove mirrors whose repository disappeared from the account.
    for (name, state) in &tracked.repos {
        if remote.iter().any(|r| &r.name == name) {
            continue;
        }
        match channels.delete_channel(&state.channel_id).await {
            Ok(()) => {
                db::delete_repo(pool, guild_id, account, name).await?;
                report.deleted.push(name.clone());
            }
            Err(err) => {
                warn!(?err, guild_id, account, repo = %name,
                    "failed to delete mirror channel; will retry on next sync");
                report.skipped.push(name.clone());
            }
        }
    }

    info!(
        guild_id,
        account,
        created = report.created.len(),
        deleted = report.deleted.len(),
        skipped = report.skipped.len(),
        "sync finished"
    );
    Ok(report)
}

/// Create one mirror channel and persist its state.
///
/// The repo row is written as soon as the channel exists, before any posts:
/// a failed announcement must not orphan a real channel. The watermark is
/// only advanced after the announcement actually went out, so a failed post
/// is re-announced by the next poll.
async fn create_mirror(
    pool: &Pool,
    source: &dyn SourceGateway,
    channels: &dyn ChannelGateway,
    guild_id: &str,
    category_id: &str,
    account: &str,
    repo: &RemoteRepo,
) -> Result<()> {
    let channel_id = channels
        .create_channel(guild_id, category_id, &repo.name)
        .await?;
    db::insert_repo(pool, guild_id, account, &repo.name, &channel_id, None).await?;

    if let Err(err) = channels
        .post_message(&channel_id, &format!("🔗 {}", repo.html_url))
        .await
    {
        warn!(?err, guild_id, account, repo = %repo.name, "failed to post repository link");
    }

    match source.latest_release(account, &repo.name).await {
        Fetch::Ok(Some(release)) => match channels.post_release(&channel_id, &release).await {
            Ok(()) => {
                db::advance_watermark(pool, guild_id, account, &repo.name, &release.id).await?;
            }
            Err(err) => {
                // Watermark stays null; the next poll re-announces.
                warn!(?err, guild_id, account, repo = %repo.name,
                    "failed to post initial announcement");
            }
        },
        Fetch::Ok(None) => {}
        Fetch::Unavailable => {
            // Watermark stays null; the next poll announces whatever is
            // latest by then.
            warn!(guild_id, account, repo = %repo.name, "latest release unavailable at creation");
        }
    }
    Ok(())
}

/// Check every tracked repository for a new latest release and announce it
/// once.
///
/// Structural drift (repos added or removed remotely) is deliberately not
/// reconciled here; that is [`sync_account`]'s job. A repository whose
/// release fetch fails keeps its watermark and does not stop the others.
#[instrument(skip_all)]
pub async fn poll_account(
    pool: &Pool,
    source: &dyn SourceGateway,
    channels: &dyn ChannelGateway,
    guild_id: &str,
    account: &str,
) -> Result<PollReport> {
    let tracked = db::load_account(pool, guild_id, account)
        .await?
        .ok_or_else(|| not_tracked(guild_id, account))?;

    let remote = match source.list_repositories(account).await {
        Fetch::Ok(list) if !list.is_empty() => list,
        Fetch::Ok(_) | Fetch::Unavailable => {
            warn!(guild_id, account, "repository list unavailable or empty; poll skipped");
            return Ok(PollReport {
                aborted: true,
                ..Default::default()
            });
        }
    };

    let mut report = PollReport::default();
    for repo in &remote {
        let Some(state) = tracked.repos.get(&repo.name) else {
            continue;
        };
        let release = match source.latest_release(account, &repo.name).await {
            Fetch::Ok(Some(release)) => release,
            Fetch::Ok(None) => continue,
            Fetch::Unavailable => {
                warn!(guild_id, account, repo = %repo.name, "latest release unavailable");
                report.failed.push(repo.name.clone());
                continue;
            }
        };
        if state.last_release_id.as_deref() == Some(release.id.as_str()) {
            continue;
        }
        match channels.post_release(&state.channel_id, &release).await {
            Ok(()) => {
                db::advance_watermark(pool, guild_id, account, &repo.name, &release.id).await?;
                info!(guild_id, account, repo = %repo.name, release = %release.id,
                    "announced release");
                report.announced.push(repo.name.clone());
            }
            Err(err) => {
                // Watermark untouched, so the next tick retries the
                // announcement.
                warn!(?err, guild_id, account, repo = %repo.name, "failed to post announcement");
                report.failed.push(repo.name.clone());
            }
        }
    }
    Ok(report)
}

/// Stop tracking an account: delete every mirror channel, then drop the
/// account row. Mirrors whose channel deletion fails keep their rows and the
/// account stays tracked, so a retry can finish the job without orphaning a
/// channel. Returns the repositories that could not be removed.
#[instrument(skip_all)]
pub async fn unregister_account(
    pool: &Pool,
    channels: &dyn ChannelGateway,
    guild_id: &str,
    account: &str,
) -> Result<Vec<String>> {
    let tracked = db::load_account(pool, guild_id, account)
        .await?
        .ok_or_else(|| not_tracked(guild_id, account))?;

    let mut failed = Vec::new();
    for (name, state) in &tracked.repos {
        match channels.delete_channel(&state.channel_id).await {
            Ok(()) => db::delete_repo(pool, guild_id, account, name).await?,
            Err(err) => {
                warn!(?err, guild_id, account, repo = %name, "failed to delete mirror channel");
                failed.push(name.clone());
            }
        }
    }

    if failed.is_empty() {
        db::remove_account(pool, guild_id, account).await?;
        info!(guild_id, account, "unregistered account");
    }
    Ok(failed)
}

fn not_tracked(guild_id: &str, account: &str) -> anyhow::Error {
    ReconcileError::NotTracked {
        guild_id: guild_id.to_string(),
        account: account.to_string(),
    }
    .into()
}
