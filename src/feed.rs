//! Activity feed: cached posts and comments from followed authors.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cursor::{CursorStore, SYNC_STREAM};
use crate::error::{ProjectionError, StoreError};
use crate::event::{ContentPayload, ContentType, Event};
use crate::projection::{ProjectionHandler, ProjectionResult, SyncContext};
use crate::storage::{read_json, write_json_atomic};

/// Namespace for feed item ids. Ids are UUID v5 over `"<type>/<url>"`, so
/// a republished post maps to the same cached entry as the original.
const FEED_NAMESPACE: Uuid = Uuid::from_bytes([
    0x5f, 0x0c, 0x8e, 0x21, 0x93, 0x4b, 0x4d, 0x6a, 0xa1, 0x37, 0xc2, 0x58, 0x0e, 0x7d, 0x19, 0xb4,
]);

/// Derive the stable cache key for a piece of content.
pub fn feed_item_id(content_type: ContentType, url: &str) -> String {
    let kind = match content_type {
        ContentType::Post => "post",
        ContentType::Comment => "comment",
    };
    Uuid::new_v5(&FEED_NAMESPACE, format!("{kind}/{url}").as_bytes()).to_string()
}

/// A remote post or comment surfaced in the local activity feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    /// Stable key, see [`feed_item_id`].
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: ContentType,
    pub title: String,
    pub url: String,
    pub published: DateTime<Utc>,
    pub author_url: String,
    pub author_domain: String,
    /// For comments, the post being replied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    pub cached_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl FeedItem {
    /// Build a feed item from a publication event.
    pub fn from_content(event: &Event, content: &ContentPayload, now: DateTime<Utc>) -> Self {
        let author_domain = event.actor_domain();
        let title = content
            .title
            .clone()
            .unwrap_or_else(|| title_from_url(&content.url));
        Self {
            id: feed_item_id(content.content_type, &content.url),
            item_type: content.content_type,
            title,
            url: content.url.clone(),
            published: content.published.or(event.timestamp).unwrap_or(now),
            author_url: format!("https://{author_domain}"),
            author_domain,
            target_url: content.target_url.clone(),
            cached_at: now,
            read_at: None,
        }
    }
}

/// Fallback title: the last path segment without its extension.
fn title_from_url(url: &str) -> String {
    let segment = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url);
    let stem = segment.rsplit_once('.').map_or(segment, |(stem, _)| stem);
    stem.replace(['-', '_'], " ")
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FeedFile {
    #[serde(default)]
    items: Vec<FeedItem>,
}

/// File-backed feed cache with upsert-by-id merge and read flags.
#[derive(Debug, Clone)]
pub struct FeedCache {
    path: PathBuf,
}

impl FeedCache {
    /// Open the cache at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<FeedFile, StoreError> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    fn save(&self, file: &FeedFile) -> Result<(), StoreError> {
        write_json_atomic(&self.path, file)?;
        Ok(())
    }

    /// Returns every cached item, newest publication first.
    pub fn items(&self) -> Result<Vec<FeedItem>, StoreError> {
        let mut items = self.load()?.items;
        sort_newest_first(&mut items);
        Ok(items)
    }

    /// Upsert `incoming` by id and return how many ids were new.
    ///
    /// An existing entry keeps its `cached_at` and `read_at`; its
    /// title, publication time, and reply target are refreshed.
    pub fn merge(&self, incoming: Vec<FeedItem>) -> Result<usize, StoreError> {
        self.merge_entries(incoming.into_iter().map(|item| (item, true)))
    }

    /// Like [`merge`](FeedCache::merge), but an existing entry's
    /// publication time is only replaced where the paired flag is set.
    fn merge_entries(
        &self,
        incoming: impl IntoIterator<Item = (FeedItem, bool)>,
    ) -> Result<usize, StoreError> {
        let mut incoming = incoming.into_iter().peekable();
        if incoming.peek().is_none() {
            return Ok(0);
        }
        let mut file = self.load()?;
        let mut added = 0;
        for (item, refresh_published) in incoming {
            match file.items.iter_mut().find(|existing| existing.id == item.id) {
                Some(existing) => {
                    existing.title = item.title;
                    if refresh_published {
                        existing.published = item.published;
                    }
                    existing.target_url = item.target_url;
                }
                None => {
                    file.items.push(item);
                    added += 1;
                }
            }
        }
        sort_newest_first(&mut file.items);
        self.save(&file)?;
        Ok(added)
    }

    /// Mark one item read.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] if no item has `id`.
    pub fn mark_read(&self, id: &str) -> Result<(), StoreError> {
        self.update_one(id, |item| {
            item.read_at.get_or_insert_with(Utc::now);
        })
    }

    /// Clear the read flag on one item.
    pub fn mark_unread(&self, id: &str) -> Result<(), StoreError> {
        self.update_one(id, |item| item.read_at = None)
    }

    /// Mark every item read. Returns how many were unread.
    pub fn mark_all_read(&self) -> Result<usize, StoreError> {
        let mut file = self.load()?;
        let now = Utc::now();
        let mut changed = 0;
        for item in file.items.iter_mut().filter(|i| i.read_at.is_none()) {
            item.read_at = Some(now);
            changed += 1;
        }
        if changed > 0 {
            self.save(&file)?;
        }
        Ok(changed)
    }

    /// Mark `id` and every item published at or after it unread.
    ///
    /// Returns how many items changed.
    pub fn mark_unread_from(&self, id: &str) -> Result<usize, StoreError> {
        let mut file = self.load()?;
        let pivot = file
            .items
            .iter()
            .find(|i| i.id == id)
            .map(|i| i.published)
            .ok_or_else(|| StoreError::NotFound(format!("feed item {id}")))?;
        let mut changed = 0;
        for item in file.items.iter_mut().filter(|i| i.published >= pivot) {
            if item.read_at.take().is_some() {
                changed += 1;
            }
        }
        if changed > 0 {
            self.save(&file)?;
        }
        Ok(changed)
    }

    /// Number of unread items.
    pub fn unread_count(&self) -> Result<usize, StoreError> {
        Ok(self
            .load()?
            .items
            .iter()
            .filter(|i| i.read_at.is_none())
            .count())
    }

    /// `true` until a sync cycle has advanced the unified cursor at least once.
    pub fn is_stale(cursors: &CursorStore) -> bool {
        cursors.get(SYNC_STREAM).is_empty()
    }

    fn update_one(&self, id: &str, f: impl FnOnce(&mut FeedItem)) -> Result<(), StoreError> {
        let mut file = self.load()?;
        let item = file
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("feed item {id}")))?;
        f(item);
        self.save(&file)
    }
}

fn sort_newest_first(items: &mut [FeedItem]) {
    items.sort_by(|a, b| b.published.cmp(&a.published).then_with(|| a.id.cmp(&b.id)));
}

/// Caches publications by followed authors into the [`FeedCache`].
#[derive(Debug, Clone)]
pub struct FeedProjector {
    cache: FeedCache,
}

impl FeedProjector {
    pub fn new(cache: FeedCache) -> Self {
        Self { cache }
    }
}

impl ProjectionHandler for FeedProjector {
    type State = ();
    const NAME: &'static str = "feed";

    fn event_types(&self) -> &[&'static str] {
        &[
            "post.published",
            "post.republished",
            "comment.published",
            "comment.republished",
        ]
    }

    async fn process(
        &self,
        ctx: &SyncContext,
        events: &[Event],
        _state: &mut (),
    ) -> Result<ProjectionResult, ProjectionError> {
        let now = Utc::now();
        let mut items = Vec::new();
        for event in events {
            let author = event.actor_domain();
            if !ctx.follows(&author) {
                continue;
            }
            match ContentPayload::from_event(event) {
                Ok(content) => {
                    let claimed = content.published.is_some();
                    items.push((FeedItem::from_content(event, &content, now), claimed));
                }
                Err(e) => tracing::warn!(error = %e, "skipping malformed publication event"),
            }
        }

        // Republishes without a claimed date keep the original position.
        let added = self.cache.merge_entries(items)?;
        if added > 0 {
            tracing::debug!(added, "feed items cached");
        }
        Ok(ProjectionResult {
            new_feed_items: added,
            ..ProjectionResult::default()
        })
    }
}
