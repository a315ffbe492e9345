//! The blessing state machine and fetch-on-grant replication.
//!
//! A blessing is a post owner's decision on a remote comment. This node
//! tracks every decision it sees, and for comments on its own posts that
//! were granted, replicates the comment's markdown into the site tree and
//! indexes it under the post it replies to.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::client::ContentFetcher;
use crate::error::{ProjectionError, StoreError};
use crate::event::{BlessingPayload, Event, EventKind};
use crate::projection::{ProjectionHandler, ProjectionResult, SyncContext};
use crate::storage::{StateLayout, read_json, write_atomic, write_json_atomic};

/// Moderation status of one comment on one post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlessingStatus {
    Pending,
    Granted,
    Denied,
    Revoked,
}

impl BlessingStatus {
    /// Status carried by a blessing event, if it carries one.
    pub fn from_kind(kind: &EventKind) -> Option<Self> {
        match kind {
            EventKind::BlessingRequested => Some(Self::Pending),
            EventKind::BlessingGranted => Some(Self::Granted),
            EventKind::BlessingDenied => Some(Self::Denied),
            EventKind::BlessingRevoked => Some(Self::Revoked),
            _ => None,
        }
    }

    /// `true` if moving from `self` to `next` is a legal transition.
    ///
    /// `pending` resolves to `granted` or `denied`; either may later be
    /// `revoked`; nothing leaves `revoked` and nothing returns to `pending`.
    pub fn can_transition_to(self, next: BlessingStatus) -> bool {
        use BlessingStatus::*;
        matches!(
            (self, next),
            (Pending, Granted) | (Pending, Denied) | (Granted, Revoked) | (Denied, Revoked)
        )
    }
}

/// Last known decision for one `(source_url, target_url)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlessingEntry {
    /// The comment.
    pub source_url: String,
    /// The post it replies to.
    pub target_url: String,
    pub status: BlessingStatus,
    /// Domain that emitted the deciding event.
    pub actor: String,
    pub updated_at: DateTime<Utc>,
}

/// What [`BlessingState::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First time this pair was seen.
    Inserted,
    /// The pair moved to a new status.
    Updated(BlessingStatus),
    /// The pair already had this status.
    Unchanged,
    /// The move is not allowed from the current status.
    Rejected(BlessingStatus),
}

/// Persisted blessing entries (the projection's state blob).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlessingState {
    #[serde(default)]
    pub entries: Vec<BlessingEntry>,
}

impl BlessingState {
    /// Returns the entry for a comment/post pair.
    pub fn get(&self, source_url: &str, target_url: &str) -> Option<&BlessingEntry> {
        self.entries
            .iter()
            .find(|e| e.source_url == source_url && e.target_url == target_url)
    }

    /// Record `status` for the pair, enforcing the state machine.
    pub fn apply(
        &mut self,
        source_url: &str,
        target_url: &str,
        status: BlessingStatus,
        actor: &str,
        at: DateTime<Utc>,
    ) -> Transition {
        let existing = self
            .entries
            .iter_mut()
            .find(|e| e.source_url == source_url && e.target_url == target_url);
        match existing {
            None => {
                self.entries.push(BlessingEntry {
                    source_url: source_url.to_string(),
                    target_url: target_url.to_string(),
                    status,
                    actor: actor.to_string(),
                    updated_at: at,
                });
                Transition::Inserted
            }
            Some(entry) if entry.status == status => Transition::Unchanged,
            Some(entry) if entry.status.can_transition_to(status) => {
                let previous = entry.status;
                entry.status = status;
                entry.actor = actor.to_string();
                entry.updated_at = at;
                Transition::Updated(previous)
            }
            Some(entry) => Transition::Rejected(entry.status),
        }
    }
}

/// One replicated comment listed under the post it replies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlessedComment {
    pub url: String,
    /// Location of the replicated markdown, relative to the site root.
    pub path: String,
    /// Domain that authored the comment.
    pub author: String,
    pub blessed_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    comments: BTreeMap<String, Vec<BlessedComment>>,
}

/// The blessed-comments index: post URL to the comments blessed on it.
///
/// Shared with the HTTP-facing grant handler, so every write is an
/// upsert keyed by comment URL.
#[derive(Debug, Clone)]
pub struct BlessedCommentsIndex {
    path: PathBuf,
}

impl BlessedCommentsIndex {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Comments blessed on `post_url`, in insertion order.
    pub fn comments_for(&self, post_url: &str) -> Result<Vec<BlessedComment>, StoreError> {
        Ok(self
            .load()?
            .comments
            .remove(post_url)
            .unwrap_or_default())
    }

    /// Every indexed post URL with its comments.
    pub fn all(&self) -> Result<BTreeMap<String, Vec<BlessedComment>>, StoreError> {
        Ok(self.load()?.comments)
    }

    /// Insert or replace `comment` under `post_url`. Returns `true` if the
    /// comment was not indexed before.
    pub fn upsert(&self, post_url: &str, comment: BlessedComment) -> Result<bool, StoreError> {
        let mut file = self.load()?;
        let list = file.comments.entry(post_url.to_string()).or_default();
        let added = match list.iter_mut().find(|c| c.url == comment.url) {
            Some(existing) => {
                *existing = comment;
                false
            }
            None => {
                list.push(comment);
                true
            }
        };
        write_json_atomic(&self.path, &file)?;
        Ok(added)
    }

    /// Drop `comment_url` from `post_url`. Returns `true` if it was indexed.
    pub fn remove(&self, post_url: &str, comment_url: &str) -> Result<bool, StoreError> {
        let mut file = self.load()?;
        let Some(list) = file.comments.get_mut(post_url) else {
            return Ok(false);
        };
        let before = list.len();
        list.retain(|c| c.url != comment_url);
        let removed = list.len() != before;
        if list.is_empty() {
            file.comments.remove(post_url);
        }
        if removed {
            write_json_atomic(&self.path, &file)?;
        }
        Ok(removed)
    }

    fn load(&self) -> Result<IndexFile, StoreError> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }
}

/// Derive where a remote comment is stored, relative to the blessed
/// comments directory: `<host>/<path>.md`.
///
/// Returns `None` for non-http(s) URLs, URLs without a path, and paths
/// that would escape the directory.
pub fn comment_path_from_url(url: &str) -> Option<PathBuf> {
    let parsed = reqwest::Url::parse(url.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = crate::event::url_host(url.trim())?.replace(':', "_");
    let mut relative = PathBuf::from(host);
    let segments: Vec<&str> = parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .collect();
    if segments.is_empty() {
        return None;
    }
    for segment in &segments {
        if *segment == ".." || *segment == "." || segment.contains('\\') {
            return None;
        }
        relative.push(segment);
    }
    let file_name = relative.file_name()?.to_string_lossy().into_owned();
    let stem = file_name
        .strip_suffix(".html")
        .or_else(|| file_name.strip_suffix(".md"))
        .unwrap_or(&file_name);
    relative.set_file_name(format!("{stem}.md"));
    if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(relative)
}

/// Applies blessing decisions and replicates granted comments on local
/// posts.
#[derive(Clone)]
pub struct BlessingProjector {
    index: BlessedCommentsIndex,
    site_dir: PathBuf,
    blessed_dir: PathBuf,
    fetcher: Arc<dyn ContentFetcher>,
}

impl std::fmt::Debug for BlessingProjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlessingProjector")
            .field("blessed_dir", &self.blessed_dir)
            .finish_non_exhaustive()
    }
}

impl BlessingProjector {
    pub fn new(layout: &StateLayout, fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self {
            index: BlessedCommentsIndex::open(layout.blessed_index_path()),
            site_dir: layout.site_dir().to_path_buf(),
            blessed_dir: layout.blessed_comments_dir(),
            fetcher,
        }
    }

    /// Make sure a granted comment is on disk and indexed.
    ///
    /// The remote fetch only happens when the file is absent; a file that is
    /// present but missing from the index is indexed again. Returns `true` if
    /// the file or the index changed.
    async fn fetch_on_grant(
        &self,
        blessing: &BlessingPayload,
        at: DateTime<Utc>,
    ) -> Result<bool, ProjectionError> {
        let Some(relative) = comment_path_from_url(&blessing.comment_url) else {
            tracing::warn!(url = %blessing.comment_url, "cannot derive storage path for comment");
            return Ok(false);
        };
        let local = self.blessed_dir.join(&relative);

        let mut wrote = false;
        if !tokio::fs::try_exists(&local).await? {
            let markdown = match self.fetcher.fetch(&blessing.comment_url).await {
                Ok(markdown) => markdown,
                Err(e) => {
                    tracing::warn!(url = %blessing.comment_url, error = %e, "failed to fetch blessed comment");
                    return Ok(false);
                }
            };
            write_atomic(&local, markdown.as_bytes())?;
            wrote = true;
        }

        let already_indexed = self
            .index
            .comments_for(&blessing.target_url)?
            .iter()
            .any(|c| c.url == blessing.comment_url);
        if already_indexed {
            if !wrote {
                tracing::debug!(path = %local.display(), "blessed comment already replicated");
            }
            return Ok(wrote);
        }
        self.index.upsert(
            &blessing.target_url,
            BlessedComment {
                url: blessing.comment_url.clone(),
                path: site_relative(&self.site_dir, &local),
                author: blessing.source_domain.clone(),
                blessed_at: at,
            },
        )?;
        tracing::info!(
            comment = %blessing.comment_url,
            post = %blessing.target_url,
            fetched = wrote,
            "indexed blessed comment"
        );
        Ok(true)
    }
}

impl ProjectionHandler for BlessingProjector {
    type State = BlessingState;
    const NAME: &'static str = "blessings";

    fn event_types(&self) -> &[&'static str] {
        &["blessing.granted", "blessing.denied", "blessing.revoked"]
    }

    async fn process(
        &self,
        ctx: &SyncContext,
        events: &[Event],
        state: &mut BlessingState,
    ) -> Result<ProjectionResult, ProjectionError> {
        let mut result = ProjectionResult::default();

        for event in events {
            let Some(status) = BlessingStatus::from_kind(&event.kind()) else {
                continue;
            };
            let blessing = match BlessingPayload::from_event(event) {
                Ok(blessing) => blessing,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed blessing event");
                    continue;
                }
            };
            let at = event.timestamp.unwrap_or_else(Utc::now);
            let transition = state.apply(
                &blessing.comment_url,
                &blessing.target_url,
                status,
                &event.actor_domain(),
                at,
            );
            if let Transition::Rejected(from) = transition {
                tracing::warn!(
                    event_id = %event.id,
                    comment = %blessing.comment_url,
                    ?from,
                    to = ?status,
                    "ignoring illegal blessing transition"
                );
                continue;
            }

            if !ctx.is_local(&blessing.target_domain) {
                continue;
            }
            let applied = match status {
                BlessingStatus::Granted => self.fetch_on_grant(&blessing, at).await,
                BlessingStatus::Revoked => self
                    .index
                    .remove(&blessing.target_url, &blessing.comment_url)
                    .map_err(ProjectionError::from),
                BlessingStatus::Denied | BlessingStatus::Pending => Ok(false),
            };
            match applied {
                Ok(changed) => {
                    if changed && status == BlessingStatus::Revoked {
                        tracing::info!(comment = %blessing.comment_url, "unindexed revoked comment");
                    }
                    result.files_changed |= changed;
                }
                // The decision is kept in state; a replay of this event
                // retries the file effect.
                Err(e) => tracing::warn!(
                    event_id = %event.id,
                    comment = %blessing.comment_url,
                    error = %e,
                    "blessing file effect failed"
                ),
            }
        }
        Ok(result)
    }
}

fn site_relative(site_dir: &Path, path: &Path) -> String {
    path.strip_prefix(site_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
