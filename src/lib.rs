//! Discovery-log synchronization for a federated publishing node.
//!
//! A [`SyncEngine`] polls the discovery service with a unified cursor and
//! fans each deduplicated batch out to a fixed list of projections that
//! maintain the node's notifications, feed, followers, blessed comments,
//! and comment drafts.

mod auth;
mod blessing;
mod broadcast;
mod client;
mod comment_status;
mod config;
mod cursor;
mod engine;
mod error;
mod event;
mod feed;
mod follower;
mod live;
mod logging;
mod notification;
mod projection;
mod storage;

pub use auth::{Ed25519Signer, RequestSigner, canonical_request};
pub use blessing::{
    BlessedComment, BlessedCommentsIndex, BlessingEntry, BlessingProjector, BlessingState,
    BlessingStatus, Transition, comment_path_from_url,
};
pub use broadcast::{Broadcaster, LiveUpdate, Subscription};
pub use client::{
    ContentFetcher, EventQuery, EventSource, HttpContentFetcher, HttpDiscoveryClient, StreamPage,
    normalize_content_url,
};
pub use comment_status::{CommentDrafts, CommentStatusProjector, Decision, DraftDirectories};
pub use config::{ConfigError, LoggingConfig, NodeConfig, namespace_for};
pub use cursor::{
    CursorStore, LEGACY_STREAMS, SYNC_STREAM, cursor_cmp, cursor_greater, cursor_less, max_cursor,
};
pub use engine::{NoopRenderer, Renderer, SyncEngine, SyncEngineBuilder, SyncResult};
pub use error::{ClientError, PayloadError, ProjectionError, StoreError};
pub use event::{
    BlessingPayload, ContentPayload, ContentType, Event, EventKind, FollowPayload, KNOWN_EVENT_TYPES,
};
pub use feed::{FeedCache, FeedItem, FeedProjector, feed_item_id};
pub use follower::{FollowerProjector, FollowerRecord, FollowerState, FollowerStore};
pub use live::{LiveConfig, SyncHandle, spawn_sync_loop};
pub use logging::{LogError, LogService};
pub use notification::{
    Notification, NotificationConfig, NotificationLog, NotificationProjector, NotificationRule,
    RelevanceClass, default_rules,
};
pub use projection::{ProjectionHandler, ProjectionResult, ProjectionStateStore, SyncContext};
pub use storage::{FollowingList, StateLayout, normalize_domain};
