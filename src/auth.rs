//! Request authentication for discovery queries.
//!
//! Every query carries the node's API key as a Bearer token. When the node
//! has a signing key, queries are additionally signed so the discovery
//! service can attribute them to the node's declared domain.

use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};

/// Header carrying the declared domain of a signed request.
pub const DOMAIN_HEADER: &str = "X-Polis-Domain";
/// Header carrying the Unix timestamp (seconds) a signature covers.
pub const TIMESTAMP_HEADER: &str = "X-Polis-Timestamp";
/// Header carrying the hex-encoded signature.
pub const SIGNATURE_HEADER: &str = "X-Polis-Signature";

/// Signs outgoing discovery requests on behalf of the node.
///
/// Key generation and storage live outside this crate; implementors only
/// need to produce a detached signature over the canonical request string.
pub trait RequestSigner: Send + Sync {
    /// Domain the signature is attributed to.
    fn domain(&self) -> &str;

    /// Sign `message`, returning the raw signature bytes.
    fn sign(&self, message: &[u8]) -> Vec<u8>;
}

/// [`RequestSigner`] backed by an Ed25519 key.
pub struct Ed25519Signer {
    domain: String,
    key: SigningKey,
}

impl Ed25519Signer {
    /// Create a signer from a 32-byte secret seed.
    pub fn from_seed(domain: impl Into<String>, seed: &[u8; 32]) -> Self {
        Self {
            domain: domain.into(),
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Create a signer from a hex-encoded 32-byte seed.
    ///
    /// Returns `None` if `seed_hex` is not exactly 64 hex digits.
    pub fn from_hex_seed(domain: impl Into<String>, seed_hex: &str) -> Option<Self> {
        let mut seed = [0u8; 32];
        hex::decode_to_slice(seed_hex.trim(), &mut seed).ok()?;
        Some(Self::from_seed(domain, &seed))
    }

    /// Returns the public half of the key.
    pub fn verifying_key(&self) -> ed25519_dalek::VerifyingKey {
        self.key.verifying_key()
    }
}

impl RequestSigner for Ed25519Signer {
    fn domain(&self) -> &str {
        &self.domain
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key.sign(message).to_bytes().to_vec()
    }
}

/// Credentials applied to every discovery request.
#[derive(Clone)]
pub(crate) struct RequestAuth {
    /// API key sent as a Bearer token. Empty means "no Authorization header".
    pub(crate) api_key: String,
    /// Present for the authenticated query variant.
    pub(crate) signer: Option<Arc<dyn RequestSigner>>,
}

impl RequestAuth {
    /// Attach credentials to `request`.
    ///
    /// `path_and_query` and `timestamp` are the values covered by the
    /// signature, so the caller passes the exact request target it built.
    pub(crate) fn apply(
        &self,
        mut request: reqwest::RequestBuilder,
        path_and_query: &str,
        timestamp: i64,
    ) -> reqwest::RequestBuilder {
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        if let Some(signer) = &self.signer {
            let message = canonical_request("GET", path_and_query, timestamp);
            let signature = hex::encode(signer.sign(message.as_bytes()));
            request = request
                .header(DOMAIN_HEADER, signer.domain())
                .header(TIMESTAMP_HEADER, timestamp.to_string())
                .header(SIGNATURE_HEADER, signature);
        }
        request
    }
}

/// The string a request signature covers.
pub fn canonical_request(method: &str, path_and_query: &str, timestamp: i64) -> String {
    format!("{method}\n{path_and_query}\n{timestamp}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier};

    fn build(auth: &RequestAuth) -> reqwest::Request {
        let client = reqwest::Client::new();
        auth.apply(
            client.get("https://ds.example/stream?since=5"),
            "/stream?since=5",
            1_700_000_000,
        )
        .build()
        .expect("request should build")
    }

    #[test]
    fn non_empty_api_key_inserts_bearer_header() {
        let auth = RequestAuth {
            api_key: "abc".to_string(),
            signer: None,
        };
        let request = build(&auth);
        assert_eq!(
            request
                .headers()
                .get("authorization")
                .expect("authorization header should be present"),
            "Bearer abc"
        );
        assert!(request.headers().get(SIGNATURE_HEADER).is_none());
    }

    #[test]
    fn empty_api_key_omits_authorization_header() {
        let auth = RequestAuth {
            api_key: String::new(),
            signer: None,
        };
        let request = build(&auth);
        assert!(
            request.headers().get("authorization").is_none(),
            "authorization header should not be present for empty key"
        );
    }

    #[test]
    fn signed_request_verifies_against_public_key() {
        let signer = Arc::new(Ed25519Signer::from_seed("alice.example", &[7u8; 32]));
        let verifying_key = signer.verifying_key();
        let auth = RequestAuth {
            api_key: "abc".to_string(),
            signer: Some(signer),
        };
        let request = build(&auth);

        assert_eq!(
            request.headers().get(DOMAIN_HEADER).expect("domain header"),
            "alice.example"
        );
        assert_eq!(
            request.headers().get(TIMESTAMP_HEADER).expect("timestamp header"),
            "1700000000"
        );
        let signature_hex = request
            .headers()
            .get(SIGNATURE_HEADER)
            .expect("signature header")
            .to_str()
            .expect("ascii header");
        assert_eq!(signature_hex.len(), 128);
        let bytes = hex::decode(signature_hex).expect("signature header is hex");
        let signature = Signature::from_slice(&bytes).expect("signature should be 64 bytes");
        let message = canonical_request("GET", "/stream?since=5", 1_700_000_000);
        verifying_key
            .verify(message.as_bytes(), &signature)
            .expect("signature should verify");
    }

    #[test]
    fn hex_seed_parsing() {
        let seed_hex = "07".repeat(32);
        let from_hex = Ed25519Signer::from_hex_seed("a.example", &seed_hex).expect("valid seed");
        let from_bytes = Ed25519Signer::from_seed("a.example", &[7u8; 32]);
        assert_eq!(from_hex.verifying_key(), from_bytes.verifying_key());
        assert!(Ed25519Signer::from_hex_seed("a.example", "zz").is_none());
        assert!(Ed25519Signer::from_hex_seed("a.example", &"g".repeat(64)).is_none());
        assert!(Ed25519Signer::from_hex_seed("a.example", &"07".repeat(33)).is_none());
        assert!(Ed25519Signer::from_hex_seed("a.example", &format!(" {seed_hex}\n")).is_some());
    }
}
