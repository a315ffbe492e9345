//! Projections: independent stateful consumers of the discovery stream.
//!
//! The sync engine fetches one deduplicated event batch per cycle and fans
//! it out to every registered projection. Each projection declares the
//! event types it cares about, receives only those, and owns a persisted
//! state blob that the engine loads and saves without inspecting.

use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProjectionError;
use crate::event::Event;
use crate::storage::{read_json, write_json_atomic};

/// Per-cycle facts shared by every projection.
#[derive(Debug, Clone, Default)]
pub struct SyncContext {
    /// This node's own domain.
    pub local_domain: String,
    /// Domains this node follows, normalized.
    pub following: BTreeSet<String>,
}

impl SyncContext {
    /// `true` if `domain` is this node.
    pub fn is_local(&self, domain: &str) -> bool {
        !self.local_domain.is_empty() && domain == self.local_domain
    }

    /// `true` if this node follows `domain`.
    pub fn follows(&self, domain: &str) -> bool {
        self.following.contains(domain)
    }
}

/// Summary a projection reports for one cycle.
///
/// Each projection fills in the fields it is responsible for; the engine
/// sums them into the cycle result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionResult {
    /// Notifications appended that were not already in the log.
    pub new_notifications: usize,
    /// Feed items cached that were not already in the cache.
    pub new_feed_items: usize,
    /// Whether the follower count changed.
    pub followers_changed: bool,
    /// Whether published site files were written, moved, or unindexed.
    pub files_changed: bool,
}

impl ProjectionResult {
    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: ProjectionResult) {
        self.new_notifications += other.new_notifications;
        self.new_feed_items += other.new_feed_items;
        self.followers_changed |= other.followers_changed;
        self.files_changed |= other.files_changed;
    }

    /// `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A projection over the discovery stream.
///
/// # Contract
///
/// - [`process`](ProjectionHandler::process) must be idempotent: replaying
///   an event it already applied must not duplicate any effect, since the
///   unified cursor may be migrated backwards once and queries overlap.
/// - A malformed event is logged and skipped; it never fails the batch.
/// - `state` is only persisted when `process` returns `Ok`.
pub trait ProjectionHandler: Send + Sync + 'static {
    /// Persisted state owned by this projection.
    type State: Default + Serialize + DeserializeOwned + Send;

    /// Stable name, used as the state directory name.
    const NAME: &'static str;

    /// Event types this projection wants to see.
    fn event_types(&self) -> &[&'static str];

    /// Apply a batch of events that all carry one of
    /// [`event_types`](ProjectionHandler::event_types).
    fn process(
        &self,
        ctx: &SyncContext,
        events: &[Event],
        state: &mut Self::State,
    ) -> impl Future<Output = Result<ProjectionResult, ProjectionError>> + Send;
}

/// Stores one JSON state blob per projection name.
#[derive(Debug, Clone)]
pub struct ProjectionStateStore {
    root: PathBuf,
}

impl ProjectionStateStore {
    /// State blobs live at `<root>/<name>/state.json`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Load the raw blob for `name`. Missing or corrupt blobs load as `None`.
    pub fn load(&self, name: &str) -> io::Result<Option<serde_json::Value>> {
        load_state(&self.dir(name))
    }

    /// Persist the raw blob for `name` atomically.
    pub fn save(&self, name: &str, state: &serde_json::Value) -> io::Result<()> {
        save_state(&self.dir(name), state)
    }
}

fn save_state(dir: &Path, state: &serde_json::Value) -> io::Result<()> {
    write_json_atomic(&dir.join("state.json"), state)
}

fn load_state(dir: &Path) -> io::Result<Option<serde_json::Value>> {
    read_json(&dir.join("state.json"))
}

/// Boxed future returned by the type-erased projection interface.
pub(crate) type ProcessFuture<'a> = Pin<
    Box<dyn Future<Output = Result<(serde_json::Value, ProjectionResult), ProjectionError>> + Send + 'a>,
>;

/// Type-erased interface over [`ProjectionHandler`].
///
/// Lets the engine hold a fixed list of heterogeneous projections built at
/// composition time. State crosses this boundary as an opaque JSON value.
pub(crate) trait DynProjection: Send + Sync {
    /// Projection name.
    fn name(&self) -> &'static str;

    /// Declared event types.
    fn event_types(&self) -> &[&'static str];

    /// Decode `state`, process `events`, and return the re-encoded state.
    fn process_erased<'a>(
        &'a self,
        ctx: &'a SyncContext,
        events: &'a [Event],
        state: Option<serde_json::Value>,
    ) -> ProcessFuture<'a>;
}

impl<H: ProjectionHandler> DynProjection for H {
    fn name(&self) -> &'static str {
        H::NAME
    }

    fn event_types(&self) -> &[&'static str] {
        ProjectionHandler::event_types(self)
    }

    fn process_erased<'a>(
        &'a self,
        ctx: &'a SyncContext,
        events: &'a [Event],
        state: Option<serde_json::Value>,
    ) -> ProcessFuture<'a> {
        Box::pin(async move {
            let mut typed: H::State = match state {
                Some(value) => decode_state::<H>(value),
                None => H::State::default(),
            };
            let result = self.process(ctx, events, &mut typed).await?;
            let encoded = serde_json::to_value(&typed)?;
            Ok((encoded, result))
        })
    }
}

/// Decode a stored blob, starting over from defaults if it no longer
/// matches the state type.
fn decode_state<H: ProjectionHandler>(value: serde_json::Value) -> H::State {
    match serde_json::from_value(value) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(
                projection = H::NAME,
                error = %e,
                "projection state does not match its schema, starting from defaults"
            );
            H::State::default()
        }
    }
}

/// Returns the events whose type is in `types`.
pub(crate) fn filter_events(events: &[Event], types: &[&'static str]) -> Vec<Event> {
    events
        .iter()
        .filter(|event| types.contains(&event.event_type.as_str()))
        .cloned()
        .collect()
}
