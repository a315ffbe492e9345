//! Crate-level error types for discovery queries, payload decoding,
//! projection processing, and local state persistence.

/// Error returned when a request to the discovery service or a remote
/// node fails.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connection, TLS, or body transfer failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote answered with a non-success status.
    #[error("unexpected HTTP status {status} from {url}")]
    Status {
        /// HTTP status code returned by the remote.
        status: u16,
        /// Request URL, without credentials.
        url: String,
    },

    /// The response body could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),

    /// The request URL could not be built from configuration.
    #[error("invalid request URL: {0}")]
    InvalidUrl(String),
}

/// Error returned when an event payload does not carry the fields its
/// event type requires.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// None of the candidate keys held a non-empty string.
    #[error("event {event_id}: missing field (tried {})", candidates.join(", "))]
    Missing {
        /// Discovery event id.
        event_id: String,
        /// Every key that was consulted, in priority order.
        candidates: Vec<&'static str>,
    },

    /// A field was present but not a string.
    #[error("event {event_id}: field `{field}` is not a string")]
    WrongType {
        /// Discovery event id.
        event_id: String,
        /// Offending key.
        field: &'static str,
    },

    /// The typed view does not apply to this event type.
    #[error("event {event_id}: type `{event_type}` cannot be decoded as {expected}")]
    UnexpectedType {
        /// Discovery event id.
        event_id: String,
        /// Type carried by the event.
        event_type: String,
        /// Name of the typed view that was requested.
        expected: &'static str,
    },

    /// A URL field could not be parsed or has no host.
    #[error("event {event_id}: invalid URL `{url}`")]
    InvalidUrl {
        /// Discovery event id.
        event_id: String,
        /// The raw URL value.
        url: String,
    },
}

/// Error returned by a projection handler for one cycle.
///
/// The engine logs it and counts the projection's contribution as zero.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Local filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted projection state could not be decoded or encoded.
    #[error("projection state error: {0}")]
    State(#[from] serde_json::Error),

    /// An event could not be decoded where skipping it was not an option.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// A remote fetch failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A post-decision hook failed to run.
    #[error("hook failed: {0}")]
    Hook(String),
}

/// Error returned by the local persisted state stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Local filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored JSON could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The referenced item does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl From<StoreError> for ProjectionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io(e) => Self::Io(e),
            StoreError::Json(e) => Self::State(e),
            StoreError::NotFound(what) => Self::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                what,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_payload_field_lists_every_candidate() {
        let err = PayloadError::Missing {
            event_id: "42".to_string(),
            candidates: vec!["comment_url", "source_url"],
        };
        assert_eq!(
            err.to_string(),
            "event 42: missing field (tried comment_url, source_url)"
        );
    }

    #[test]
    fn status_error_display() {
        let err = ClientError::Status {
            status: 503,
            url: "https://ds.example/stream".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "unexpected HTTP status 503 from https://ds.example/stream"
        );
    }

    #[test]
    fn projection_error_io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = ProjectionError::from(io_err);
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn store_not_found_maps_to_projection_io() {
        let err = ProjectionError::from(StoreError::NotFound("feed item x".to_string()));
        assert!(matches!(err, ProjectionError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
    }

    // Errors cross task boundaries inside the sync loop.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ClientError>();
            assert_send_sync::<PayloadError>();
            assert_send_sync::<ProjectionError>();
            assert_send_sync::<StoreError>();
        }
    };
}
