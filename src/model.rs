use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of a gateway fetch.
///
/// `Unavailable` means the remote call failed or returned malformed data;
/// it is distinct from a successful fetch that legitimately found nothing,
/// so callers never mistake an outage for an empty account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch<T> {
    Ok(T),
    Unavailable,
}

/// One repository as reported by the source account's repo list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteRepo {
    pub name: String,
    pub html_url: String,
}

/// A published release for one repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Release {
    /// Opaque release identifier, used as the announcement watermark.
    pub id: String,
    pub name: Option<String>,
    pub body: Option<String>,
    pub html_url: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// One tracked repository's local mirror: its channel and the last release
/// announced there. The channel id is set at creation and never changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositoryState {
    pub channel_id: String,
    pub last_release_id: Option<String>,
}

/// One externally-watched account within one guild, with its mirrored repos
/// keyed by repository name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrackedAccount {
    pub account: String,
    pub category_id: String,
    pub repos: BTreeMap<String, RepositoryState>,
}
