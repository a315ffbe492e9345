//! Discovery events and typed views over their payloads.
//!
//! Events arrive as loosely shaped JSON. Projections never index the raw
//! payload map directly; they decode one of the typed views below, which
//! fail with a [`PayloadError`] naming every key consulted instead of
//! silently producing an empty value.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;
use crate::storage::normalize_domain;

/// Candidate keys for the URL of a comment, in priority order.
pub const COMMENT_URL_KEYS: &[&str] = &["comment_url", "source_url"];

/// Candidate keys for the URL a comment replies to, in priority order.
pub const TARGET_URL_KEYS: &[&str] = &["in_reply_to", "target_url"];

/// One immutable record fetched from the discovery log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Position-ordered identifier assigned by the discovery service.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Event type tag (e.g. `"follow.announced"`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Time the discovery service recorded the event.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Domain of the node that emitted the event.
    #[serde(default)]
    pub actor: String,
    /// Type-specific fields.
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Every type tag this node interprets, in log-family order.
pub const KNOWN_EVENT_TYPES: &[&str] = &[
    "follow.announced",
    "follow.removed",
    "post.published",
    "post.republished",
    "comment.published",
    "comment.republished",
    "blessing.requested",
    "blessing.granted",
    "blessing.denied",
    "blessing.revoked",
];

/// Known discovery event types, one variant per type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    FollowAnnounced,
    FollowRemoved,
    PostPublished,
    PostRepublished,
    CommentPublished,
    CommentRepublished,
    BlessingRequested,
    BlessingGranted,
    BlessingDenied,
    BlessingRevoked,
    /// Any type this node does not interpret.
    Other(String),
}

impl EventKind {
    /// Returns the wire tag for this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::FollowAnnounced => "follow.announced",
            Self::FollowRemoved => "follow.removed",
            Self::PostPublished => "post.published",
            Self::PostRepublished => "post.republished",
            Self::CommentPublished => "comment.published",
            Self::CommentRepublished => "comment.republished",
            Self::BlessingRequested => "blessing.requested",
            Self::BlessingGranted => "blessing.granted",
            Self::BlessingDenied => "blessing.denied",
            Self::BlessingRevoked => "blessing.revoked",
            Self::Other(tag) => tag,
        }
    }
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "follow.announced" => Self::FollowAnnounced,
            "follow.removed" => Self::FollowRemoved,
            "post.published" => Self::PostPublished,
            "post.republished" => Self::PostRepublished,
            "comment.published" => Self::CommentPublished,
            "comment.republished" => Self::CommentRepublished,
            "blessing.requested" => Self::BlessingRequested,
            "blessing.granted" => Self::BlessingGranted,
            "blessing.denied" => Self::BlessingDenied,
            "blessing.revoked" => Self::BlessingRevoked,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Event {
    /// Returns the parsed kind of this event.
    pub fn kind(&self) -> EventKind {
        match self.event_type.parse() {
            Ok(kind) => kind,
            Err(never) => match never {},
        }
    }

    /// Returns the normalized actor domain.
    pub fn actor_domain(&self) -> String {
        normalize_domain(&self.actor)
    }

    /// Returns the first candidate key holding a non-empty string.
    ///
    /// # Errors
    ///
    /// [`PayloadError::WrongType`] if a candidate is present but not a
    /// string; [`PayloadError::Missing`] if no candidate holds a value.
    pub fn require_str(&self, candidates: &[&'static str]) -> Result<&str, PayloadError> {
        self.optional_str(candidates)?
            .ok_or_else(|| PayloadError::Missing {
                event_id: self.id.clone(),
                candidates: candidates.to_vec(),
            })
    }

    /// Like [`require_str`](Event::require_str) but absence is `Ok(None)`.
    pub fn optional_str(&self, candidates: &[&'static str]) -> Result<Option<&str>, PayloadError> {
        for &key in candidates {
            match self.payload.get(key) {
                None | Some(serde_json::Value::Null) => continue,
                Some(serde_json::Value::String(s)) if s.trim().is_empty() => continue,
                Some(serde_json::Value::String(s)) => return Ok(Some(s.trim())),
                Some(_) => {
                    return Err(PayloadError::WrongType {
                        event_id: self.id.clone(),
                        field: key,
                    });
                }
            }
        }
        Ok(None)
    }

    /// Resolve a domain field, falling back to the host of `url`.
    fn domain_or_host(&self, key: &'static str, url: Option<&str>) -> Result<String, PayloadError> {
        if let Some(domain) = self.optional_str(&[key])? {
            return Ok(normalize_domain(domain));
        }
        match url {
            Some(url) => url_host(url).ok_or_else(|| PayloadError::InvalidUrl {
                event_id: self.id.clone(),
                url: url.to_string(),
            }),
            None => Err(PayloadError::Missing {
                event_id: self.id.clone(),
                candidates: vec![key],
            }),
        }
    }

    fn unexpected(&self, expected: &'static str) -> PayloadError {
        PayloadError::UnexpectedType {
            event_id: self.id.clone(),
            event_type: self.event_type.clone(),
            expected,
        }
    }
}

/// Returns the lower-cased host of an http(s) URL, if it has one.
pub fn url_host(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    })
}

/// Typed view of `follow.announced` / `follow.removed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowPayload {
    /// `true` for `follow.announced`, `false` for `follow.removed`.
    pub announced: bool,
    /// Domain doing the following.
    pub follower: String,
    /// Domain being followed.
    pub target_domain: String,
}

impl FollowPayload {
    /// Decode a follow event.
    pub fn from_event(event: &Event) -> Result<Self, PayloadError> {
        let announced = match event.kind() {
            EventKind::FollowAnnounced => true,
            EventKind::FollowRemoved => false,
            _ => return Err(event.unexpected("FollowPayload")),
        };
        let follower = match event.optional_str(&["follower", "source_domain"])? {
            Some(domain) => normalize_domain(domain),
            None if !event.actor.trim().is_empty() => event.actor_domain(),
            None => {
                return Err(PayloadError::Missing {
                    event_id: event.id.clone(),
                    candidates: vec!["follower", "source_domain", "actor"],
                });
            }
        };
        let target_url = event.optional_str(&["target_url"])?;
        let target_domain = event.domain_or_host("target_domain", target_url)?;
        Ok(Self {
            announced,
            follower,
            target_domain,
        })
    }
}

/// Whether a content event describes a post or a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Post,
    Comment,
}

/// Typed view of `post.*` and `comment.*` publication events.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentPayload {
    /// Post or comment.
    pub content_type: ContentType,
    /// `true` for the `*.republished` variants.
    pub republished: bool,
    /// Canonical URL of the published content.
    pub url: String,
    /// Title, if the publisher supplied one.
    pub title: Option<String>,
    /// Publication time claimed by the publisher, if any.
    pub published: Option<DateTime<Utc>>,
    /// For comments, the URL being replied to.
    pub target_url: Option<String>,
}

impl ContentPayload {
    /// Decode a publication event.
    pub fn from_event(event: &Event) -> Result<Self, PayloadError> {
        let (content_type, republished) = match event.kind() {
            EventKind::PostPublished => (ContentType::Post, false),
            EventKind::PostRepublished => (ContentType::Post, true),
            EventKind::CommentPublished => (ContentType::Comment, false),
            EventKind::CommentRepublished => (ContentType::Comment, true),
            _ => return Err(event.unexpected("ContentPayload")),
        };
        let url_keys: &[&'static str] = match content_type {
            ContentType::Post => &["url", "post_url"],
            ContentType::Comment => &["url", "comment_url", "source_url"],
        };
        let url = event.require_str(url_keys)?.to_string();
        let target_url = match content_type {
            ContentType::Post => None,
            ContentType::Comment => Some(event.require_str(TARGET_URL_KEYS)?.to_string()),
        };
        let published = event
            .optional_str(&["published_at", "published"])?
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc));
        Ok(Self {
            content_type,
            republished,
            url,
            title: event.optional_str(&["title"])?.map(str::to_string),
            published,
            target_url,
        })
    }
}

/// Typed view of `blessing.*` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlessingPayload {
    /// URL of the comment being blessed.
    pub comment_url: String,
    /// URL of the post the comment replies to.
    pub target_url: String,
    /// Domain owning the post.
    pub target_domain: String,
    /// Domain that authored the comment.
    pub source_domain: String,
}

impl BlessingPayload {
    /// Decode a blessing event.
    pub fn from_event(event: &Event) -> Result<Self, PayloadError> {
        if !matches!(
            event.kind(),
            EventKind::BlessingRequested
                | EventKind::BlessingGranted
                | EventKind::BlessingDenied
                | EventKind::BlessingRevoked
        ) {
            return Err(event.unexpected("BlessingPayload"));
        }
        let comment_url = event.require_str(COMMENT_URL_KEYS)?.to_string();
        let target_url = event.require_str(TARGET_URL_KEYS)?.to_string();
        let target_domain = event.domain_or_host("target_domain", Some(&target_url))?;
        let source_domain = event.domain_or_host("source_domain", Some(&comment_url))?;
        Ok(Self {
            comment_url,
            target_url,
            target_domain,
            source_domain,
        })
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "event id must be a string or number, got {other}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Build an event with the given payload fields.
    pub(crate) fn event(id: &str, event_type: &str, actor: &str, payload: serde_json::Value) -> Event {
        Event {
            id: id.to_string(),
            event_type: event_type.to_string(),
            timestamp: Some(
                DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
                    .expect("valid timestamp")
                    .with_timezone(&Utc),
            ),
            actor: actor.to_string(),
            payload: payload.as_object().cloned().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::event;
    use super::*;
    use serde_json::json;

    #[test]
    fn known_event_types_all_parse_to_named_kinds() {
        for tag in KNOWN_EVENT_TYPES {
            let kind: EventKind = tag.parse().expect("infallible");
            assert!(!matches!(kind, EventKind::Other(_)), "{tag} has no variant");
            assert_eq!(kind.as_str(), *tag);
        }
    }

    #[test]
    fn event_deserializes_numeric_id() {
        let raw = json!({
            "id": 1234,
            "type": "follow.announced",
            "timestamp": "2026-03-01T12:00:00Z",
            "actor": "bob.example",
            "payload": {"target_domain": "alice.example"}
        });
        let event: Event = serde_json::from_value(raw).expect("decode event");
        assert_eq!(event.id, "1234");
        assert_eq!(event.kind(), EventKind::FollowAnnounced);
    }

    #[test]
    fn kind_round_trips_unknown_tags() {
        let kind: EventKind = "site.renamed".parse().expect("infallible");
        assert_eq!(kind, EventKind::Other("site.renamed".to_string()));
        assert_eq!(kind.as_str(), "site.renamed");
    }

    #[test]
    fn require_str_prefers_first_non_empty_candidate() {
        let ev = event(
            "1",
            "blessing.granted",
            "alice.example",
            json!({"comment_url": "", "source_url": "https://bob.example/comments/c1.md"}),
        );
        assert_eq!(
            ev.require_str(COMMENT_URL_KEYS).expect("alias resolves"),
            "https://bob.example/comments/c1.md"
        );
    }

    #[test]
    fn require_str_reports_missing_candidates() {
        let ev = event("7", "blessing.granted", "alice.example", json!({}));
        let err = ev.require_str(COMMENT_URL_KEYS).expect_err("should be missing");
        assert_eq!(
            err,
            PayloadError::Missing {
                event_id: "7".to_string(),
                candidates: vec!["comment_url", "source_url"],
            }
        );
    }

    #[test]
    fn require_str_rejects_non_string() {
        let ev = event("8", "post.published", "bob.example", json!({"url": 12}));
        assert!(matches!(
            ev.require_str(&["url"]),
            Err(PayloadError::WrongType { field: "url", .. })
        ));
    }

    #[test]
    fn blessing_payload_accepts_legacy_aliases_and_derives_domains() {
        let ev = event(
            "9",
            "blessing.granted",
            "alice.example",
            json!({
                "source_url": "https://bob.example/comments/20260301/hi.md",
                "target_url": "https://alice.example/posts/hello.md"
            }),
        );
        let payload = BlessingPayload::from_event(&ev).expect("decode blessing");
        assert_eq!(payload.target_domain, "alice.example");
        assert_eq!(payload.source_domain, "bob.example");
        assert_eq!(payload.target_url, "https://alice.example/posts/hello.md");
    }

    #[test]
    fn blessing_payload_explicit_domain_wins() {
        let ev = event(
            "10",
            "blessing.denied",
            "alice.example",
            json!({
                "comment_url": "https://bob.example/c.md",
                "in_reply_to": "https://alice.example/p.md",
                "target_domain": "Alice.Example"
            }),
        );
        let payload = BlessingPayload::from_event(&ev).expect("decode blessing");
        assert_eq!(payload.target_domain, "alice.example");
    }

    #[test]
    fn follow_payload_uses_actor_when_no_follower_field() {
        let ev = event(
            "11",
            "follow.removed",
            "Bob.Example",
            json!({"target_domain": "alice.example"}),
        );
        let payload = FollowPayload::from_event(&ev).expect("decode follow");
        assert!(!payload.announced);
        assert_eq!(payload.follower, "bob.example");
        assert_eq!(payload.target_domain, "alice.example");
    }

    #[test]
    fn content_payload_requires_reply_target_for_comments() {
        let ev = event(
            "12",
            "comment.published",
            "bob.example",
            json!({"url": "https://bob.example/comments/c.md"}),
        );
        assert!(matches!(
            ContentPayload::from_event(&ev),
            Err(PayloadError::Missing { .. })
        ));
    }

    #[test]
    fn content_payload_publication_time_is_only_the_claimed_one() {
        let ev = event(
            "13",
            "post.republished",
            "bob.example",
            json!({"url": "https://bob.example/posts/p.md", "title": "Hello"}),
        );
        let payload = ContentPayload::from_event(&ev).expect("decode content");
        assert!(payload.republished);
        assert_eq!(payload.content_type, ContentType::Post);
        assert_eq!(payload.published, None);
        assert_eq!(payload.title.as_deref(), Some("Hello"));

        let claimed = event(
            "15",
            "post.published",
            "bob.example",
            json!({"url": "https://bob.example/posts/p.md", "published_at": "2026-02-01T08:00:00+01:00"}),
        );
        let payload = ContentPayload::from_event(&claimed).expect("decode content");
        assert_eq!(
            payload.published.map(|t| t.to_rfc3339()),
            Some("2026-02-01T07:00:00+00:00".to_string())
        );
    }

    #[test]
    fn typed_view_rejects_wrong_event_type() {
        let ev = event("14", "post.published", "bob.example", json!({}));
        assert!(matches!(
            BlessingPayload::from_event(&ev),
            Err(PayloadError::UnexpectedType { expected: "BlessingPayload", .. })
        ));
    }

    #[test]
    fn url_host_rejects_non_http() {
        assert_eq!(url_host("https://Bob.Example/x"), Some("bob.example".to_string()));
        assert_eq!(url_host("http://bob.example:8080/x"), Some("bob.example:8080".to_string()));
        assert_eq!(url_host("ftp://bob.example/x"), None);
        assert_eq!(url_host("not a url"), None);
    }
}
