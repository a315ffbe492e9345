//! The unified sync engine.
//!
//! One cycle resolves the unified cursor, issues up to three filtered
//! queries from it, deduplicates the merged result, fans the batch out to
//! every registered projection, then persists the cursor and notifies the
//! render and broadcast collaborators.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::blessing::BlessingProjector;
use crate::broadcast::{Broadcaster, LiveUpdate, Subscription};
use crate::client::{ContentFetcher, EventQuery, EventSource, StreamPage};
use crate::comment_status::{CommentDrafts, CommentStatusProjector};
use crate::cursor::{CursorStore, SYNC_STREAM, cursor_cmp, cursor_greater, max_cursor};
use crate::error::ClientError;
use crate::event::Event;
use crate::feed::{FeedCache, FeedProjector};
use crate::follower::{FollowerProjector, FollowerStore};
use crate::notification::{NotificationLog, NotificationProjector};
use crate::projection::{
    DynProjection, ProjectionHandler, ProjectionResult, ProjectionStateStore, SyncContext,
    filter_events,
};
use crate::storage::{FollowingList, StateLayout, normalize_domain};

/// Default maximum number of events requested per query.
pub const DEFAULT_QUERY_LIMIT: usize = 1000;

/// Re-renders published pages after synchronized content changed.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Rebuild every page.
    async fn render_all(&self) -> io::Result<()>;
}

/// [`Renderer`] that does nothing, for nodes without a site build step.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRenderer;

#[async_trait]
impl Renderer for NoopRenderer {
    async fn render_all(&self) -> io::Result<()> {
        Ok(())
    }
}

/// Outcome of one [`SyncEngine::sync_once`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    /// Deduplicated events fetched this cycle.
    pub events: usize,
    /// Sum of every projection's contribution.
    pub summary: ProjectionResult,
    /// Unified cursor after the cycle.
    pub cursor: String,
    /// Whether the cursor moved forward.
    pub cursor_advanced: bool,
    /// Queries that failed and contributed nothing.
    pub failed_queries: usize,
    /// Projections whose processing failed this cycle.
    pub failed_projections: Vec<&'static str>,
    /// Whether the render collaborator was invoked.
    pub rendered: bool,
}

/// Drives every projection from the discovery log.
///
/// Cycles are serialized: a `sync_once` call waits for any cycle already in
/// progress. Clone is cheap; clones share collaborators and the cycle lock.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    source: Option<Arc<dyn EventSource>>,
    local_domain: String,
    layout: StateLayout,
    query_limit: usize,
    projections: Vec<Box<dyn DynProjection>>,
    states: ProjectionStateStore,
    renderer: Arc<dyn Renderer>,
    broadcaster: Broadcaster,
    cycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("local_domain", &self.inner.local_domain)
            .field("namespace", &self.inner.layout.namespace())
            .field("projections", &self.projection_names())
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Start building an engine whose state lives under `layout`.
    pub fn builder(layout: StateLayout) -> SyncEngineBuilder {
        SyncEngineBuilder::new(layout)
    }

    /// Returns `true` if a discovery source is configured.
    pub fn is_configured(&self) -> bool {
        self.inner.source.is_some()
    }

    /// Registered projection names, in fan-out order.
    pub fn projection_names(&self) -> Vec<&'static str> {
        self.inner.projections.iter().map(|p| p.name()).collect()
    }

    /// Returns the storage layout.
    pub fn layout(&self) -> &StateLayout {
        &self.inner.layout
    }

    /// Returns the broadcaster cycles publish to.
    pub fn broadcaster(&self) -> &Broadcaster {
        &self.inner.broadcaster
    }

    /// Subscribe to per-cycle live updates.
    pub fn subscribe(&self) -> Subscription {
        self.inner.broadcaster.subscribe()
    }

    /// `true` until a cycle has recorded a unified cursor.
    pub fn feed_is_stale(&self) -> bool {
        match CursorStore::open(self.inner.layout.cursors_path()) {
            Ok(cursors) => FeedCache::is_stale(&cursors),
            Err(e) => {
                tracing::warn!(error = %e, "cannot read cursors, treating feed as stale");
                true
            }
        }
    }

    /// Run one synchronization cycle.
    ///
    /// Never fails: query, projection, storage, and render failures are
    /// logged and degrade to "no new data" for the affected part.
    pub async fn sync_once(&self) -> SyncResult {
        let Some(source) = self.inner.source.as_ref() else {
            tracing::debug!("discovery not configured, skipping sync");
            return SyncResult::default();
        };
        let _cycle = self.inner.cycle.lock().await;

        let mut cursors = match CursorStore::open(self.inner.layout.cursors_path()) {
            Ok(cursors) => cursors,
            Err(e) => {
                tracing::error!(error = %e, "cannot open cursor store, skipping cycle");
                return SyncResult::default();
            }
        };
        let before = cursors.resolve_unified();
        let following = self.following();

        let queries = self.queries(&before, &following);
        let pages = run_queries(source.as_ref(), &queries).await;
        let failed_queries = pages.iter().filter(|p| p.is_err()).count();
        let (events, candidate) = merge_pages(pages);

        let cursor = max_cursor(&before, &candidate).to_string();
        let cursor_advanced = cursor_greater(&cursor, &before);
        let mut result = SyncResult {
            events: events.len(),
            cursor: cursor.clone(),
            cursor_advanced,
            failed_queries,
            ..SyncResult::default()
        };

        if !events.is_empty() {
            let ctx = SyncContext {
                local_domain: self.inner.local_domain.clone(),
                following,
            };
            let (summary, failed) = self.fan_out(&ctx, &events).await;
            result.summary = summary;
            result.failed_projections = failed;
        }

        if cursor_advanced && let Err(e) = cursors.set(SYNC_STREAM, &cursor) {
            tracing::error!(cursor = %cursor, error = %e, "failed to persist unified cursor");
        }

        if events.is_empty() {
            tracing::debug!(cursor = %cursor, "no new events");
            return result;
        }

        if result.summary.files_changed {
            match self.inner.renderer.render_all().await {
                Ok(()) => result.rendered = true,
                Err(e) => tracing::error!(error = %e, "render after sync failed"),
            }
        }

        let delivered = self.inner.broadcaster.publish(LiveUpdate::from(result.summary));
        tracing::info!(
            events = result.events,
            cursor = %result.cursor,
            new_notifications = result.summary.new_notifications,
            new_feed_items = result.summary.new_feed_items,
            followers_changed = result.summary.followers_changed,
            files_changed = result.summary.files_changed,
            subscribers = delivered,
            "sync cycle complete"
        );
        result
    }

    fn following(&self) -> BTreeSet<String> {
        match FollowingList::open(self.inner.layout.following_path()).domains() {
            Ok(domains) => domains,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read following list, assuming none");
                BTreeSet::new()
            }
        }
    }

    /// Queries A (targets us), B (sourced from us), and C (from followed
    /// authors, only when following anyone).
    fn queries(&self, cursor: &str, following: &BTreeSet<String>) -> Vec<EventQuery> {
        let types: Vec<String> = self
            .inner
            .projections
            .iter()
            .flat_map(|p| p.event_types().iter().map(|t| t.to_string()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let base = EventQuery {
            cursor: cursor.to_string(),
            limit: self.inner.query_limit,
            types,
            ..EventQuery::default()
        };
        let local = vec![self.inner.local_domain.clone()];
        let mut queries = vec![
            EventQuery {
                target_domains: local.clone(),
                ..base.clone()
            },
            EventQuery {
                source_domains: local,
                ..base.clone()
            },
        ];
        if !following.is_empty() {
            queries.push(EventQuery {
                actors: following.iter().cloned().collect(),
                ..base
            });
        }
        queries
    }

    async fn fan_out(&self, ctx: &SyncContext, events: &[Event]) -> (ProjectionResult, Vec<&'static str>) {
        let mut summary = ProjectionResult::default();
        let mut failed = Vec::new();
        for projection in &self.inner.projections {
            let name = projection.name();
            let filtered = filter_events(events, projection.event_types());
            if filtered.is_empty() {
                continue;
            }
            let state = match self.inner.states.load(name) {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(projection = name, error = %e, "cannot load projection state");
                    failed.push(name);
                    continue;
                }
            };
            match projection.process_erased(ctx, &filtered, state).await {
                Ok((state, contribution)) => {
                    if let Err(e) = self.inner.states.save(name, &state) {
                        tracing::error!(projection = name, error = %e, "failed to save projection state");
                    }
                    tracing::debug!(projection = name, events = filtered.len(), ?contribution, "projection applied");
                    summary.merge(contribution);
                }
                Err(e) => {
                    // The cursor still advances past these events.
                    tracing::error!(
                        projection = name,
                        events = filtered.len(),
                        error = %e,
                        "projection failed, its events for this cycle are dropped"
                    );
                    failed.push(name);
                }
            }
        }
        (summary, failed)
    }
}

async fn run_queries(
    source: &dyn EventSource,
    queries: &[EventQuery],
) -> Vec<Result<StreamPage, ClientError>> {
    let mut pages = Vec::with_capacity(queries.len());
    for query in queries {
        let page = source.query(query).await;
        if let Err(e) = &page {
            tracing::warn!(
                target_domain = ?query.target_domains,
                source_domain = ?query.source_domains,
                actors = query.actors.len(),
                error = %e,
                "discovery query failed"
            );
        }
        pages.push(page);
    }
    pages
}

/// Deduplicate events across pages by id and find the furthest cursor any
/// successful page reached. Events come back in log order.
fn merge_pages(pages: Vec<Result<StreamPage, ClientError>>) -> (Vec<Event>, String) {
    let mut seen = HashSet::new();
    let mut events = Vec::new();
    let mut candidate = String::new();
    for page in pages.into_iter().flatten() {
        if cursor_greater(&page.cursor, &candidate) {
            candidate = page.cursor;
        }
        for event in page.events {
            if cursor_greater(&event.id, &candidate) {
                candidate = event.id.clone();
            }
            if seen.insert(event.id.clone()) {
                events.push(event);
            }
        }
    }
    events.sort_by(|a, b| cursor_cmp(&a.id, &b.id));
    (events, candidate)
}

/// Builder for [`SyncEngine`]. The projection list is fixed once built.
pub struct SyncEngineBuilder {
    layout: StateLayout,
    local_domain: String,
    source: Option<Arc<dyn EventSource>>,
    query_limit: usize,
    projections: Vec<Box<dyn DynProjection>>,
    renderer: Arc<dyn Renderer>,
    broadcaster: Broadcaster,
}

impl SyncEngineBuilder {
    fn new(layout: StateLayout) -> Self {
        Self {
            layout,
            local_domain: String::new(),
            source: None,
            query_limit: DEFAULT_QUERY_LIMIT,
            projections: Vec::new(),
            renderer: Arc::new(NoopRenderer),
            broadcaster: Broadcaster::default(),
        }
    }

    /// Set this node's domain.
    pub fn local_domain(mut self, domain: &str) -> Self {
        self.local_domain = normalize_domain(domain);
        self
    }

    /// Set the discovery source. Without one, cycles are no-ops.
    pub fn event_source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Set the per-query event limit.
    pub fn query_limit(mut self, limit: usize) -> Self {
        self.query_limit = limit.max(1);
        self
    }

    /// Register a projection. Fan-out follows registration order.
    pub fn projection<P: ProjectionHandler>(mut self, projection: P) -> Self {
        self.projections.push(Box::new(projection));
        self
    }

    /// Register the notification, feed, follower, blessing, and
    /// comment-status projections over this builder's layout.
    pub fn standard_projections(
        self,
        fetcher: Arc<dyn ContentFetcher>,
        drafts: Arc<dyn CommentDrafts>,
    ) -> Self {
        let layout = self.layout.clone();
        self.projection(NotificationProjector::new(NotificationLog::open(
            layout.notifications_path(),
        )))
        .projection(FeedProjector::new(FeedCache::open(layout.feed_path())))
        .projection(FollowerProjector::new(FollowerStore::open(layout.followers_path())))
        .projection(BlessingProjector::new(&layout, fetcher))
        .projection(CommentStatusProjector::new(drafts))
    }

    /// Set the render collaborator.
    pub fn renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Share an existing broadcaster.
    pub fn broadcaster(mut self, broadcaster: Broadcaster) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn build(self) -> SyncEngine {
        let states = ProjectionStateStore::new(self.layout.namespace_dir().join("projections"));
        SyncEngine {
            inner: Arc::new(EngineInner {
                source: self.source,
                local_domain: self.local_domain,
                layout: self.layout,
                query_limit: self.query_limit,
                projections: self.projections,
                states,
                renderer: self.renderer,
                broadcaster: self.broadcaster,
                cycle: tokio::sync::Mutex::new(()),
            }),
        }
    }
}
