//! Notification rules and the durable notification log.
//!
//! Rules map event types to notifications. Defaults are seeded on the first
//! cycle and new defaults are merged in by id on later cycles, leaving the
//! user's edits to existing rules (and the mute list) untouched.

use std::collections::{BTreeSet, HashSet};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProjectionError, StoreError};
use crate::event::{BlessingPayload, COMMENT_URL_KEYS, Event, FollowPayload, KNOWN_EVENT_TYPES};
use crate::projection::{ProjectionHandler, ProjectionResult, SyncContext};
use crate::storage::{corrupt_path, normalize_domain, write_atomic};

const NOTIFICATION_NAMESPACE: Uuid = Uuid::from_bytes([
    0x2b, 0x71, 0xd4, 0x0e, 0x6a, 0x93, 0x4f, 0x1c, 0x8d, 0x52, 0x3e, 0xa9, 0x14, 0xc7, 0x60, 0x8f,
]);

const DEFAULT_MAX_ITEMS: usize = 500;
const DEFAULT_MAX_AGE_DAYS: u32 = 90;

/// Which discovery query naturally surfaces a rule's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelevanceClass {
    /// The event targets this node.
    TargetDomain,
    /// The event concerns something this node authored elsewhere.
    SourceDomain,
    /// The event was emitted by someone this node follows.
    FollowedAuthor,
}

/// A configurable mapping from an event type to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRule {
    pub id: String,
    pub event_type: String,
    pub relevance: RelevanceClass,
    /// Human-readable template; `{actor}` is replaced by the actor domain.
    pub message: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NotificationRule {
    fn new(id: &str, event_type: &str, relevance: RelevanceClass, message: &str) -> Self {
        Self {
            id: id.to_string(),
            event_type: event_type.to_string(),
            relevance,
            message: message.to_string(),
            enabled: true,
        }
    }

    /// `true` if this rule fires for `event` in `ctx`.
    pub fn matches(&self, ctx: &SyncContext, event: &Event) -> bool {
        if !self.enabled || self.event_type != event.event_type {
            return false;
        }
        match self.relevance {
            RelevanceClass::TargetDomain => target_domain(event).is_some_and(|d| ctx.is_local(&d)),
            RelevanceClass::SourceDomain => source_domain(event).is_some_and(|d| ctx.is_local(&d)),
            RelevanceClass::FollowedAuthor => ctx.follows(&event.actor_domain()),
        }
    }
}

/// Built-in rules seeded on first run.
pub fn default_rules() -> Vec<NotificationRule> {
    use RelevanceClass::*;
    vec![
        NotificationRule::new("new-follower", "follow.announced", TargetDomain, "{actor} followed you"),
        NotificationRule::new("lost-follower", "follow.removed", TargetDomain, "{actor} unfollowed you"),
        NotificationRule::new("new-comment", "comment.published", TargetDomain, "{actor} commented on your post"),
        NotificationRule::new(
            "blessing-requested",
            "blessing.requested",
            TargetDomain,
            "{actor} asked you to bless a comment",
        ),
        NotificationRule::new("comment-blessed", "blessing.granted", SourceDomain, "{actor} blessed your comment"),
        NotificationRule::new("comment-denied", "blessing.denied", SourceDomain, "{actor} declined your comment"),
        NotificationRule::new("followed-post", "post.published", FollowedAuthor, "{actor} published a new post"),
    ]
}

/// Persisted notification configuration (the projection's state blob).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub rules: Vec<NotificationRule>,
    #[serde(default)]
    pub muted_domains: BTreeSet<String>,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

fn default_max_items() -> usize {
    DEFAULT_MAX_ITEMS
}

fn default_max_age_days() -> u32 {
    DEFAULT_MAX_AGE_DAYS
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            muted_domains: BTreeSet::new(),
            max_items: DEFAULT_MAX_ITEMS,
            max_age_days: DEFAULT_MAX_AGE_DAYS,
        }
    }
}

impl NotificationConfig {
    /// Append every default rule whose id is not present yet.
    ///
    /// Returns how many rules were added.
    pub fn merge_default_rules(&mut self) -> usize {
        let known: HashSet<String> = self.rules.iter().map(|r| r.id.clone()).collect();
        let missing: Vec<NotificationRule> = default_rules()
            .into_iter()
            .filter(|rule| !known.contains(&rule.id))
            .collect();
        let added = missing.len();
        self.rules.extend(missing);
        added
    }
}

/// One entry in the notification log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// UUID v5 over `"<rule_id>/<event_id>"`; replays map to the same id.
    pub id: String,
    pub rule_id: String,
    pub event_id: String,
    pub event_type: String,
    pub actor: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// When the discovery service recorded the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_at: Option<DateTime<Utc>>,
    /// When this node logged the notification; drives age-based pruning.
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

impl Notification {
    fn from_rule(rule: &NotificationRule, event: &Event, now: DateTime<Utc>) -> Self {
        let actor = event.actor_domain();
        let url = event
            .optional_str(&["url", COMMENT_URL_KEYS[0], COMMENT_URL_KEYS[1]])
            .ok()
            .flatten()
            .map(str::to_string);
        Self {
            id: notification_id(&rule.id, &event.id),
            rule_id: rule.id.clone(),
            event_id: event.id.clone(),
            event_type: event.event_type.clone(),
            message: rule.message.replace("{actor}", &actor),
            actor,
            url,
            event_at: event.timestamp,
            created_at: now,
            read_at: None,
        }
    }
}

/// Derive the id of the notification `rule_id` produces for `event_id`.
pub fn notification_id(rule_id: &str, event_id: &str) -> String {
    Uuid::new_v5(
        &NOTIFICATION_NAMESPACE,
        format!("{rule_id}/{event_id}").as_bytes(),
    )
    .to_string()
}

/// Append-only, order-preserving notification log stored as JSON lines.
#[derive(Debug, Clone)]
pub struct NotificationLog {
    path: PathBuf,
}

impl NotificationLog {
    /// Open the log at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns every entry, oldest first. Unparseable lines are skipped.
    pub fn entries(&self) -> Result<Vec<Notification>, StoreError> {
        Ok(self.read()?.0)
    }

    /// Parsed entries plus the raw lines that did not parse.
    fn read(&self) -> Result<(Vec<Notification>, Vec<String>), StoreError> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), Vec::new())),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        let mut rejected = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %e,
                        "skipping corrupt notification line"
                    );
                    rejected.push(line);
                }
            }
        }
        Ok((entries, rejected))
    }

    /// Append entries whose id is not already logged. Returns how many
    /// were appended.
    pub fn append(&self, incoming: Vec<Notification>) -> Result<usize, StoreError> {
        let mut seen: HashSet<String> = self.entries()?.into_iter().map(|n| n.id).collect();
        let fresh: Vec<Notification> = incoming
            .into_iter()
            .filter(|n| seen.insert(n.id.clone()))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for entry in &fresh {
            writeln!(file, "{}", serde_json::to_string(entry)?)?;
        }
        Ok(fresh.len())
    }

    /// Evict entries older than `max_age_days`, then the oldest entries
    /// beyond `max_items`. Returns how many were evicted.
    pub fn prune(&self, max_items: usize, max_age_days: u32, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let (entries, rejected) = self.read()?;
        let before = entries.len();
        let cutoff = now - Duration::days(i64::from(max_age_days));
        let mut kept: Vec<Notification> = entries
            .into_iter()
            .filter(|n| n.created_at >= cutoff)
            .collect();
        if kept.len() > max_items {
            kept.drain(..kept.len() - max_items);
        }
        let evicted = before - kept.len();
        if evicted > 0 {
            self.rewrite(&kept, &rejected)?;
        }
        Ok(evicted)
    }

    /// Mark the given ids read. Returns how many changed.
    pub fn mark_read(&self, ids: &[String]) -> Result<usize, StoreError> {
        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        self.update_read(|n| wanted.contains(n.id.as_str()))
    }

    /// Mark every entry read. Returns how many changed.
    pub fn mark_all_read(&self) -> Result<usize, StoreError> {
        self.update_read(|_| true)
    }

    /// Number of unread entries.
    pub fn unread_count(&self) -> Result<usize, StoreError> {
        Ok(self.entries()?.iter().filter(|n| n.read_at.is_none()).count())
    }

    fn update_read(&self, select: impl Fn(&Notification) -> bool) -> Result<usize, StoreError> {
        let (mut entries, rejected) = self.read()?;
        let now = Utc::now();
        let mut changed = 0;
        for entry in entries.iter_mut().filter(|n| n.read_at.is_none() && select(n)) {
            entry.read_at = Some(now);
            changed += 1;
        }
        if changed > 0 {
            self.rewrite(&entries, &rejected)?;
        }
        Ok(changed)
    }

    /// Replace the log with `entries`. Lines that did not parse are kept
    /// in a `.corrupt-<timestamp>` sibling first.
    fn rewrite(&self, entries: &[Notification], rejected: &[String]) -> Result<(), StoreError> {
        if !rejected.is_empty() {
            let kept = corrupt_path(&self.path);
            write_atomic(&kept, format!("{}\n", rejected.join("\n")).as_bytes())?;
            tracing::warn!(kept = %kept.display(), lines = rejected.len(), "corrupt notification lines moved aside");
        }
        let mut out = String::new();
        for entry in entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes())?;
        Ok(())
    }
}

/// Turns matching events into notifications.
///
/// Subscribes to every known event type, so a rule the user adds or edits
/// receives events without any change here. Rules naming a type outside
/// [`KNOWN_EVENT_TYPES`] never fire.
#[derive(Debug, Clone)]
pub struct NotificationProjector {
    log: NotificationLog,
}

impl NotificationProjector {
    pub fn new(log: NotificationLog) -> Self {
        Self { log }
    }
}

impl ProjectionHandler for NotificationProjector {
    type State = NotificationConfig;
    const NAME: &'static str = "notifications";

    fn event_types(&self) -> &[&'static str] {
        KNOWN_EVENT_TYPES
    }

    async fn process(
        &self,
        ctx: &SyncContext,
        events: &[Event],
        config: &mut NotificationConfig,
    ) -> Result<ProjectionResult, ProjectionError> {
        let added_rules = config.merge_default_rules();
        if added_rules > 0 {
            tracing::info!(added_rules, "merged default notification rules");
        }
        let muted: HashSet<String> = config
            .muted_domains
            .iter()
            .map(|d| normalize_domain(d))
            .collect();

        let now = Utc::now();
        let mut pending = Vec::new();
        for event in events {
            if muted.contains(&event.actor_domain()) {
                continue;
            }
            for rule in config.rules.iter().filter(|r| r.matches(ctx, event)) {
                pending.push(Notification::from_rule(rule, event, now));
            }
        }

        let added = self.log.append(pending)?;
        let evicted = self.log.prune(config.max_items, config.max_age_days, now)?;
        if added > 0 || evicted > 0 {
            tracing::debug!(added, evicted, "notification log updated");
        }
        Ok(ProjectionResult {
            new_notifications: added,
            ..ProjectionResult::default()
        })
    }
}

fn target_domain(event: &Event) -> Option<String> {
    if event.event_type.starts_with("follow.") {
        return FollowPayload::from_event(event).ok().map(|f| f.target_domain);
    }
    if event.event_type.starts_with("blessing.") {
        return BlessingPayload::from_event(event).ok().map(|b| b.target_domain);
    }
    event
        .optional_str(&["target_domain"])
        .ok()
        .flatten()
        .map(normalize_domain)
        .or_else(|| {
            event
                .optional_str(crate::event::TARGET_URL_KEYS)
                .ok()
                .flatten()
                .and_then(crate::event::url_host)
        })
}

fn source_domain(event: &Event) -> Option<String> {
    if event.event_type.starts_with("blessing.") {
        return BlessingPayload::from_event(event).ok().map(|b| b.source_domain);
    }
    event
        .optional_str(&["source_domain"])
        .ok()
        .flatten()
        .map(normalize_domain)
}
