//! Who follows this node.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProjectionError, StoreError};
use crate::event::{Event, FollowPayload};
use crate::projection::{ProjectionHandler, ProjectionResult, SyncContext};
use crate::storage::{read_json, write_json_atomic};

/// One remote node following this one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerRecord {
    /// Follower's domain.
    pub domain: String,
    /// When the most recent `follow.announced` for this domain was recorded.
    pub followed_at: DateTime<Utc>,
}

/// Persisted follower list. `count` always equals `followers.len()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowerState {
    pub count: usize,
    pub followers: Vec<FollowerRecord>,
}

impl FollowerState {
    /// Add or refresh `domain`. Returns `true` if it was not present.
    pub fn add(&mut self, domain: &str, at: DateTime<Utc>) -> bool {
        let added = match self.followers.iter_mut().find(|r| r.domain == domain) {
            Some(existing) => {
                existing.followed_at = existing.followed_at.max(at);
                false
            }
            None => {
                self.followers.push(FollowerRecord {
                    domain: domain.to_string(),
                    followed_at: at,
                });
                true
            }
        };
        self.count = self.followers.len();
        added
    }

    /// Remove `domain`. Returns `true` if it was present.
    pub fn remove(&mut self, domain: &str) -> bool {
        let before = self.followers.len();
        self.followers.retain(|r| r.domain != domain);
        self.count = self.followers.len();
        before != self.count
    }

    /// `true` if `domain` follows this node.
    pub fn contains(&self, domain: &str) -> bool {
        self.followers.iter().any(|r| r.domain == domain)
    }
}

/// File-backed [`FollowerState`].
///
/// Shared with the HTTP-facing handlers; every write is a read-modify-write
/// upsert so a concurrent foreground change is reapplied, never lost.
#[derive(Debug, Clone)]
pub struct FollowerStore {
    path: PathBuf,
}

impl FollowerStore {
    /// Open the follower list at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the current state. An absent file means no followers.
    pub fn load(&self) -> Result<FollowerState, StoreError> {
        let mut state: FollowerState = read_json(&self.path)?.unwrap_or_default();
        state.count = state.followers.len();
        Ok(state)
    }

    /// Persist `state`.
    pub fn save(&self, state: &FollowerState) -> Result<(), StoreError> {
        write_json_atomic(&self.path, state)?;
        Ok(())
    }
}

/// Maintains [`FollowerState`] from follow events targeting this node.
#[derive(Debug, Clone)]
pub struct FollowerProjector {
    store: FollowerStore,
}

impl FollowerProjector {
    pub fn new(store: FollowerStore) -> Self {
        Self { store }
    }
}

impl ProjectionHandler for FollowerProjector {
    type State = ();
    const NAME: &'static str = "followers";

    fn event_types(&self) -> &[&'static str] {
        &["follow.announced", "follow.removed"]
    }

    async fn process(
        &self,
        ctx: &SyncContext,
        events: &[Event],
        _state: &mut (),
    ) -> Result<ProjectionResult, ProjectionError> {
        let mut followers = self.store.load()?;
        let before = followers.count;
        let mut dirty = false;

        for event in events {
            let follow = match FollowPayload::from_event(event) {
                Ok(follow) => follow,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed follow event");
                    continue;
                }
            };
            if !ctx.is_local(&follow.target_domain) {
                continue;
            }
            if follow.announced {
                let at = event.timestamp.unwrap_or_else(Utc::now);
                followers.add(&follow.follower, at);
                dirty = true;
            } else {
                dirty |= followers.remove(&follow.follower);
            }
        }

        if dirty {
            self.store.save(&followers)?;
        }
        let changed = followers.count != before;
        if changed {
            tracing::info!(before, after = followers.count, "follower count changed");
        }
        Ok(ProjectionResult {
            followers_changed: changed,
            ..ProjectionResult::default()
        })
    }
}
