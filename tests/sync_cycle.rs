//! Full sync cycles driven through the public API with in-memory doubles.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use polis_sync::{
    BlessedCommentsIndex, ClientError, ContentFetcher, CursorStore, DraftDirectories, Event,
    EventQuery, EventSource, FeedCache, FollowerStore, FollowingList, NodeConfig,
    NotificationLog, ProjectionStateStore, Renderer, SYNC_STREAM, StateLayout, StreamPage,
    SyncEngine, cursor_less,
};

const LOCAL: &str = "alice.example";

/// Which of the three engine queries a request is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryKind {
    Target,
    Source,
    Actor,
}

fn kind_of(query: &EventQuery) -> QueryKind {
    if !query.target_domains.is_empty() {
        QueryKind::Target
    } else if !query.source_domains.is_empty() {
        QueryKind::Source
    } else {
        QueryKind::Actor
    }
}

/// Serves a fixed event log, filtered the way the discovery service would.
#[derive(Default)]
struct FakeDiscovery {
    log: Mutex<Vec<Event>>,
    failing: Mutex<Vec<QueryKind>>,
    queries: Mutex<Vec<EventQuery>>,
}

impl FakeDiscovery {
    fn push(&self, event: Event) {
        self.log.lock().expect("lock").push(event);
    }

    fn fail(&self, kinds: &[QueryKind]) {
        *self.failing.lock().expect("lock") = kinds.to_vec();
    }

    fn query_count(&self) -> usize {
        self.queries.lock().expect("lock").len()
    }
}

#[async_trait]
impl EventSource for FakeDiscovery {
    async fn query(&self, query: &EventQuery) -> Result<StreamPage, ClientError> {
        self.queries.lock().expect("lock").push(query.clone());
        let kind = kind_of(query);
        if self.failing.lock().expect("lock").contains(&kind) {
            return Err(ClientError::Status {
                status: 503,
                url: "fake".to_string(),
            });
        }
        let log = self.log.lock().expect("lock");
        let field = |e: &Event, key: &str| {
            e.payload
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        let events: Vec<Event> = log
            .iter()
            .filter(|e| query.cursor.is_empty() || cursor_less(&query.cursor, &e.id))
            .filter(|e| query.types.is_empty() || query.types.contains(&e.event_type))
            .filter(|e| match kind {
                QueryKind::Target => query.target_domains.contains(&field(e, "target_domain")),
                QueryKind::Source => query.source_domains.contains(&field(e, "source_domain")),
                QueryKind::Actor => query.actors.contains(&e.actor),
            })
            .take(query.limit)
            .cloned()
            .collect();
        let cursor = log.last().map(|e| e.id.clone()).unwrap_or_default();
        Ok(StreamPage {
            events,
            cursor,
            has_more: false,
        })
    }
}

#[derive(Default)]
struct FakeFetcher {
    calls: AtomicUsize,
}

#[async_trait]
impl ContentFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<String, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("---\nsource: {url}\n---\nNice post!\n"))
    }
}

#[derive(Default)]
struct CountingRenderer {
    renders: AtomicUsize,
}

#[async_trait]
impl Renderer for CountingRenderer {
    async fn render_all(&self) -> io::Result<()> {
        self.renders.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Node {
    _dir: tempfile::TempDir,
    layout: StateLayout,
    discovery: Arc<FakeDiscovery>,
    fetcher: Arc<FakeFetcher>,
    renderer: Arc<CountingRenderer>,
    engine: SyncEngine,
}

fn node() -> Node {
    let dir = tempfile::tempdir().expect("failed to create tmpdir");
    let layout = StateLayout::new(dir.path().join("data"), dir.path().join("site"), "ds.example");
    let discovery = Arc::new(FakeDiscovery::default());
    let fetcher = Arc::new(FakeFetcher::default());
    let renderer = Arc::new(CountingRenderer::default());
    let engine = SyncEngine::builder(layout.clone())
        .local_domain(LOCAL)
        .event_source(discovery.clone())
        .renderer(renderer.clone())
        .standard_projections(
            fetcher.clone(),
            Arc::new(DraftDirectories::new(layout.comment_drafts_dir())),
        )
        .build();
    Node {
        _dir: dir,
        layout,
        discovery,
        fetcher,
        renderer,
        engine,
    }
}

fn event(id: u64, event_type: &str, actor: &str, payload: serde_json::Value) -> Event {
    serde_json::from_value(json!({
        "id": id,
        "type": event_type,
        "timestamp": "2026-03-01T12:00:00Z",
        "actor": actor,
        "payload": payload,
    }))
    .expect("valid event")
}

fn stored_cursor(layout: &StateLayout) -> String {
    CursorStore::open(layout.cursors_path())
        .expect("open cursors")
        .get(SYNC_STREAM)
        .to_string()
}

fn blessed_file(layout: &StateLayout) -> std::path::PathBuf {
    layout
        .blessed_comments_dir()
        .join("bob.example/comments/20260301/hi.md")
}

fn grant(id: u64, post_domain: &str) -> Event {
    event(
        id,
        "blessing.granted",
        post_domain,
        json!({
            "comment_url": "https://bob.example/comments/20260301/hi.md",
            "target_url": format!("https://{post_domain}/posts/hello.md"),
            "target_domain": post_domain,
            "source_domain": "bob.example",
        }),
    )
}

#[tokio::test]
async fn follower_announce_then_remove() {
    let node = node();
    let mut live = node.engine.subscribe();
    node.discovery.push(event(
        1,
        "follow.announced",
        "bob.example",
        json!({"target_domain": LOCAL}),
    ));

    let first = node.engine.sync_once().await;
    assert!(first.summary.followers_changed);
    assert_eq!(first.summary.new_notifications, 1);
    let followers = FollowerStore::open(node.layout.followers_path());
    assert_eq!(followers.load().expect("load").count, 1);
    let update = live.recv().await.expect("update broadcast");
    assert!(update.followers_changed);

    node.discovery.push(event(
        2,
        "follow.removed",
        "bob.example",
        json!({"target_domain": LOCAL}),
    ));
    let second = node.engine.sync_once().await;
    assert!(second.summary.followers_changed);
    assert_eq!(followers.load().expect("load").count, 0);
    assert_eq!(stored_cursor(&node.layout), "2");
}

#[tokio::test]
async fn event_from_two_queries_is_processed_once() {
    let node = node();
    FollowingList::open(node.layout.following_path())
        .follow("bob.example")
        .expect("follow");
    // A comment by a followed author on a local post matches both the
    // target query and the followed-author query.
    node.discovery.push(event(
        5,
        "comment.published",
        "bob.example",
        json!({
            "url": "https://bob.example/comments/c.md",
            "in_reply_to": "https://alice.example/posts/p.md",
            "target_domain": LOCAL,
        }),
    ));

    let result = node.engine.sync_once().await;
    assert_eq!(node.discovery.query_count(), 3);
    assert_eq!(result.events, 1);
    assert_eq!(result.summary.new_feed_items, 1);
    assert_eq!(result.summary.new_notifications, 1);
    assert_eq!(
        NotificationLog::open(node.layout.notifications_path())
            .entries()
            .expect("entries")
            .len(),
        1
    );
}

#[tokio::test]
async fn cursor_never_regresses_under_query_failures() {
    use QueryKind::*;
    let subsets: [&[QueryKind]; 5] = [&[], &[Target], &[Source], &[Target, Source], &[Target, Source, Actor]];
    for failing in subsets {
        let node = node();
        FollowingList::open(node.layout.following_path())
            .follow("bob.example")
            .expect("follow");
        node.discovery.push(event(
            10,
            "follow.announced",
            "carol.example",
            json!({"target_domain": LOCAL}),
        ));
        node.engine.sync_once().await;
        let before = stored_cursor(&node.layout);
        assert_eq!(before, "10");

        node.discovery.fail(failing);
        let result = node.engine.sync_once().await;
        assert_eq!(result.failed_queries, failing.len());
        let after = stored_cursor(&node.layout);
        assert!(
            !cursor_less(&after, &before),
            "cursor regressed from {before} to {after} with {failing:?} failing"
        );
    }
}

#[tokio::test]
async fn grant_on_local_post_fetches_once() {
    let node = node();
    node.discovery.push(grant(3, LOCAL));

    let result = node.engine.sync_once().await;
    assert!(result.summary.files_changed);
    assert!(result.rendered);
    assert_eq!(node.renderer.renders.load(Ordering::SeqCst), 1);
    assert_eq!(node.fetcher.calls.load(Ordering::SeqCst), 1);

    let content = std::fs::read_to_string(blessed_file(&node.layout)).expect("comment replicated");
    assert!(content.contains("Nice post!"));
    let index = BlessedCommentsIndex::open(node.layout.blessed_index_path());
    assert_eq!(
        index
            .comments_for("https://alice.example/posts/hello.md")
            .expect("index")
            .len(),
        1
    );

    // Replaying the same grant after the file exists is a no-op.
    std::fs::remove_file(node.layout.cursors_path()).expect("reset cursor");
    let replay = node.engine.sync_once().await;
    assert_eq!(replay.events, 1);
    assert!(!replay.summary.files_changed);
    assert_eq!(node.fetcher.calls.load(Ordering::SeqCst), 1);
    assert_eq!(node.renderer.renders.load(Ordering::SeqCst), 1);
    assert_eq!(
        std::fs::read_to_string(blessed_file(&node.layout)).expect("still there"),
        content
    );
}

#[tokio::test]
async fn grant_on_remote_post_changes_no_files() {
    let node = node();
    let mut remote = grant(4, "carol.example");
    // Make it reachable through the source query.
    remote
        .payload
        .insert("source_domain".to_string(), json!(LOCAL));
    node.discovery.push(remote);

    let result = node.engine.sync_once().await;
    assert_eq!(result.events, 1);
    assert!(!result.summary.files_changed);
    assert_eq!(node.fetcher.calls.load(Ordering::SeqCst), 0);
    assert!(!blessed_file(&node.layout).exists());
    assert!(!result.rendered);
}

#[tokio::test]
async fn feed_merge_is_idempotent_across_cycles() {
    let node = node();
    FollowingList::open(node.layout.following_path())
        .follow("bob.example")
        .expect("follow");
    let post = event(
        8,
        "post.published",
        "bob.example",
        json!({"url": "https://bob.example/posts/p.md", "title": "Hello"}),
    );
    node.discovery.push(post.clone());
    let feed = FeedCache::open(node.layout.feed_path());

    assert!(node.engine.feed_is_stale());
    let first = node.engine.sync_once().await;
    assert_eq!(first.summary.new_feed_items, 1);
    assert!(!node.engine.feed_is_stale());

    // A republish under a new id maps to the same item.
    let mut again = post;
    again.id = "9".to_string();
    again.event_type = "post.republished".to_string();
    node.discovery.push(again);
    let second = node.engine.sync_once().await;
    assert_eq!(second.events, 1);
    assert_eq!(second.summary.new_feed_items, 0);
    assert_eq!(feed.items().expect("items").len(), 1);
}

#[tokio::test]
async fn legacy_cursors_migrate_to_their_minimum() {
    let node = node();
    let mut cursors = CursorStore::open(node.layout.cursors_path()).expect("open");
    cursors.set("polis.notification", "40").expect("seed");
    cursors.set("polis.follow", "25").expect("seed");
    cursors.set("polis.feed", "31").expect("seed");

    node.discovery
        .fail(&[QueryKind::Target, QueryKind::Source, QueryKind::Actor]);
    let failed = node.engine.sync_once().await;
    assert_eq!(failed.failed_queries, 2);
    assert!(!failed.cursor_advanced);
    assert_eq!(stored_cursor(&node.layout), "", "migration alone records nothing");
    assert!(node.engine.feed_is_stale());

    node.discovery.fail(&[]);
    node.discovery.push(event(
        30,
        "follow.announced",
        "bob.example",
        json!({"target_domain": LOCAL}),
    ));
    let result = node.engine.sync_once().await;
    assert_eq!(result.events, 1);
    assert_eq!(stored_cursor(&node.layout), "30");
    assert!(!node.engine.feed_is_stale());

    let queries = node.discovery.queries.lock().expect("lock");
    assert_eq!(queries.len(), 4);
    assert!(queries.iter().all(|q| q.cursor == "25"));
}

#[tokio::test]
async fn user_notification_rule_receives_its_event_type() {
    let node = node();
    FollowingList::open(node.layout.following_path())
        .follow("bob.example")
        .expect("follow");
    ProjectionStateStore::new(node.layout.namespace_dir().join("projections"))
        .save(
            "notifications",
            &json!({
                "rules": [{
                    "id": "followed-republish",
                    "event_type": "post.republished",
                    "relevance": "followed_author",
                    "message": "{actor} republished a post"
                }]
            }),
        )
        .expect("seed notification config");
    node.discovery.push(event(
        12,
        "post.republished",
        "bob.example",
        json!({"url": "https://bob.example/posts/p.md"}),
    ));

    let result = node.engine.sync_once().await;
    let queries = node.discovery.queries.lock().expect("lock");
    assert!(
        queries
            .iter()
            .all(|q| q.types.iter().any(|t| t == "post.republished"))
    );
    drop(queries);
    assert_eq!(result.summary.new_notifications, 1);
    let entries = NotificationLog::open(node.layout.notifications_path())
        .entries()
        .expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].rule_id, "followed-republish");
}

#[tokio::test]
async fn no_config_makes_no_calls() {
    let config = NodeConfig::from_toml_str("[node]\ndomain = \"alice.example\"\n").expect("config");
    assert!(!config.discovery_configured());

    let dir = tempfile::tempdir().expect("failed to create tmpdir");
    let layout = StateLayout::new(dir.path().join("data"), dir.path().join("site"), "default");
    let fetcher = Arc::new(FakeFetcher::default());
    let engine = SyncEngine::builder(layout.clone())
        .local_domain(&config.node.domain)
        .standard_projections(
            fetcher.clone(),
            Arc::new(DraftDirectories::new(layout.comment_drafts_dir())),
        )
        .build();

    let result = engine.sync_once().await;
    assert_eq!(result, polis_sync::SyncResult::default());
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    assert!(!layout.cursors_path().exists());
}
