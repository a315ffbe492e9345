//! Typed HTTP clients for the discovery service and for remote content.
//!
//! The sync engine and projections depend only on the [`EventSource`] and
//! [`ContentFetcher`] traits, so tests drive them with in-memory doubles
//! and never open a socket.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::auth::{RequestAuth, RequestSigner};
use crate::error::ClientError;
use crate::event::Event;

/// Default bound on every outgoing request.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// One filtered range query against the discovery log.
///
/// Empty filter lists mean "unrestricted".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventQuery {
    /// Return events strictly after this cursor. Empty means "from the start".
    pub cursor: String,
    /// Maximum number of events to return.
    pub limit: usize,
    /// Restrict to these event types.
    pub types: Vec<String>,
    /// Restrict to events emitted by these domains.
    pub actors: Vec<String>,
    /// Restrict to events whose target domain is one of these.
    pub target_domains: Vec<String>,
    /// Restrict to events whose source domain is one of these.
    pub source_domains: Vec<String>,
}

impl EventQuery {
    /// Encode the query as URL parameters. Filters are comma-joined.
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("since", self.cursor.clone()), ("limit", self.limit.to_string())];
        let lists = [
            ("type", &self.types),
            ("actor", &self.actors),
            ("target_domain", &self.target_domains),
            ("source_domain", &self.source_domains),
        ];
        for (key, values) in lists {
            if !values.is_empty() {
                params.push((key, values.join(",")));
            }
        }
        params
    }
}

/// Result of one [`EventQuery`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StreamPage {
    /// Matching events in log order. Records that do not decode as an
    /// [`Event`] are logged and dropped; the rest of the page is kept.
    #[serde(default, deserialize_with = "lenient_events")]
    pub events: Vec<Event>,
    /// Position the query scanned up to. Empty if the service reported none.
    #[serde(default, deserialize_with = "cursor_string")]
    pub cursor: String,
    /// Whether more matching events exist past `cursor`.
    #[serde(default)]
    pub has_more: bool,
}

/// Source of discovery events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Run one filtered range query.
    async fn query(&self, query: &EventQuery) -> Result<StreamPage, ClientError>;
}

/// Fetches raw markdown for a remote piece of content.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    /// Fetch the markdown behind `url`.
    async fn fetch(&self, url: &str) -> Result<String, ClientError>;
}

/// [`EventSource`] that queries a discovery service over HTTP.
///
/// Clone is cheap; the underlying connection pool and credentials are
/// shared.
#[derive(Clone)]
pub struct HttpDiscoveryClient {
    http: reqwest::Client,
    base_url: reqwest::Url,
    auth: Arc<RequestAuth>,
}

impl fmt::Debug for HttpDiscoveryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variant = if self.auth.signer.is_some() {
            "Signed"
        } else {
            "Plain"
        };
        f.debug_struct("HttpDiscoveryClient")
            .field("base_url", &self.base_url.as_str())
            .field("transport", &variant)
            .finish()
    }
}

impl HttpDiscoveryClient {
    /// Create a client for the discovery service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] if `base_url` does not parse, or
    /// [`ClientError::Transport`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, ClientError> {
        let mut base_url = reqwest::Url::parse(base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        // Url::join replaces the last segment unless the path ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            auth: Arc::new(RequestAuth {
                api_key: api_key.to_string(),
                signer: None,
            }),
        })
    }

    /// Sign every request with `signer` (the authenticated query variant).
    pub fn with_signer(mut self, signer: Arc<dyn RequestSigner>) -> Self {
        self.auth = Arc::new(RequestAuth {
            api_key: self.auth.api_key.clone(),
            signer: Some(signer),
        });
        self
    }

    /// Returns `true` if requests are signed.
    pub fn is_signed(&self) -> bool {
        self.auth.signer.is_some()
    }

    /// Build the full request URL for `query`.
    pub fn stream_url(&self, query: &EventQuery) -> Result<reqwest::Url, ClientError> {
        let mut url = self
            .base_url
            .join("stream")
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .extend_pairs(query.to_params().iter().map(|(k, v)| (*k, v.as_str())));
        Ok(url)
    }
}

#[async_trait]
impl EventSource for HttpDiscoveryClient {
    async fn query(&self, query: &EventQuery) -> Result<StreamPage, ClientError> {
        let url = self.stream_url(query)?;
        let path_and_query = match url.query() {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_string(),
        };
        let request = self.auth.apply(
            self.http.get(url.clone()),
            &path_and_query,
            chrono::Utc::now().timestamp(),
        );

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let body = response.bytes().await?;
        let page: StreamPage =
            serde_json::from_slice(&body).map_err(|e| ClientError::Decode(e.to_string()))?;
        tracing::debug!(
            events = page.events.len(),
            cursor = %page.cursor,
            has_more = page.has_more,
            "discovery query returned"
        );
        Ok(page)
    }
}

/// [`ContentFetcher`] that downloads markdown over HTTP.
#[derive(Debug, Clone)]
pub struct HttpContentFetcher {
    http: reqwest::Client,
}

impl HttpContentFetcher {
    /// Create a fetcher whose requests are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            http: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl ContentFetcher for HttpContentFetcher {
    async fn fetch(&self, url: &str) -> Result<String, ClientError> {
        let url = normalize_content_url(url);
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response.text().await?)
    }
}

/// Map a rendered-page URL to the markdown source it was rendered from.
///
/// `https://bob.example/comments/c.html` becomes
/// `https://bob.example/comments/c.md`; other URLs are returned unchanged.
pub fn normalize_content_url(url: &str) -> String {
    let trimmed = url.trim();
    match trimmed.strip_suffix(".html") {
        Some(stem) => format!("{stem}.md"),
        None => trimmed.to_string(),
    }
}

fn lenient_events<'de, D>(deserializer: D) -> Result<Vec<Event>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut events = Vec::with_capacity(raw.len());
    for value in raw {
        let id = value.get("id").map(ToString::to_string);
        match serde_json::from_value::<Event>(value) {
            Ok(event) => events.push(event),
            Err(e) => tracing::warn!(
                event_id = id.as_deref().unwrap_or("<none>"),
                error = %e,
                "skipping malformed discovery event"
            ),
        }
    }
    Ok(events)
}

fn cursor_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "cursor must be a string or number, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Ed25519Signer;

    #[test]
    fn query_params_omit_empty_filters() {
        let query = EventQuery {
            cursor: "17".to_string(),
            limit: 100,
            target_domains: vec!["alice.example".to_string()],
            ..EventQuery::default()
        };
        assert_eq!(
            query.to_params(),
            vec![
                ("since", "17".to_string()),
                ("limit", "100".to_string()),
                ("target_domain", "alice.example".to_string()),
            ]
        );
    }

    #[test]
    fn query_params_comma_join_lists() {
        let query = EventQuery {
            limit: 10,
            actors: vec!["a.example".to_string(), "b.example".to_string()],
            types: vec!["post.published".to_string(), "comment.published".to_string()],
            ..EventQuery::default()
        };
        let params = query.to_params();
        assert!(params.contains(&("actor", "a.example,b.example".to_string())));
        assert!(params.contains(&("type", "post.published,comment.published".to_string())));
    }

    #[test]
    fn stream_url_appends_path_and_params() {
        let client = HttpDiscoveryClient::new("https://ds.example/api", "k", DEFAULT_TIMEOUT)
            .expect("client should build");
        let url = client
            .stream_url(&EventQuery {
                cursor: "5".to_string(),
                limit: 20,
                source_domains: vec!["alice.example".to_string()],
                ..EventQuery::default()
            })
            .expect("url should build");
        assert_eq!(
            url.as_str(),
            "https://ds.example/api/stream?since=5&limit=20&source_domain=alice.example"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = HttpDiscoveryClient::new("not a url", "k", DEFAULT_TIMEOUT)
            .expect_err("should reject");
        assert!(matches!(err, ClientError::InvalidUrl(_)));
    }

    #[test]
    fn debug_shows_transport_variant() {
        let client = HttpDiscoveryClient::new("https://ds.example", "k", DEFAULT_TIMEOUT)
            .expect("client should build");
        assert!(format!("{client:?}").contains("Plain"));
        assert!(!client.is_signed());

        let signed = client.with_signer(Arc::new(Ed25519Signer::from_seed(
            "alice.example",
            &[1u8; 32],
        )));
        assert!(format!("{signed:?}").contains("Signed"));
        assert!(signed.is_signed());
    }

    #[test]
    fn stream_page_accepts_numeric_cursor() {
        let page: StreamPage = serde_json::from_value(serde_json::json!({
            "events": [{"id": "3", "type": "post.published", "actor": "b.example", "payload": {}}],
            "cursor": 3,
            "has_more": false
        }))
        .expect("decode page");
        assert_eq!(page.cursor, "3");
        assert_eq!(page.events.len(), 1);
    }

    #[test]
    fn malformed_event_is_dropped_without_losing_the_page() {
        let page: StreamPage = serde_json::from_value(serde_json::json!({
            "events": [
                {"id": 7, "type": "follow.announced", "actor": "b.example",
                 "payload": {"target_domain": "alice.example"}},
                {"id": 8, "type": "follow.announced", "actor": "c.example",
                 "timestamp": "yesterday", "payload": {}},
                {"type": "post.published"},
                {"id": 9, "type": "post.published", "actor": "b.example", "payload": {}}
            ],
            "cursor": "9"
        }))
        .expect("page decodes despite bad events");
        let ids: Vec<&str> = page.events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["7", "9"]);
        assert_eq!(page.cursor, "9");
    }

    #[test]
    fn null_events_decode_as_empty() {
        let page: StreamPage = serde_json::from_value(serde_json::json!({"events": null}))
            .expect("decode page");
        assert!(page.events.is_empty());
    }

    #[test]
    fn stream_page_tolerates_missing_fields() {
        let page: StreamPage =
            serde_json::from_value(serde_json::json!({})).expect("decode empty page");
        assert!(page.events.is_empty());
        assert_eq!(page.cursor, "");
    }

    #[test]
    fn normalize_content_url_maps_html_to_md() {
        assert_eq!(
            normalize_content_url("https://bob.example/comments/c.html"),
            "https://bob.example/comments/c.md"
        );
        assert_eq!(
            normalize_content_url("https://bob.example/comments/c.md"),
            "https://bob.example/comments/c.md"
        );
    }
}
