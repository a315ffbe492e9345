//! Persisted stream cursors and their ordering.
//!
//! A cursor is an opaque token issued by the discovery service. Tokens are
//! numeric strings in practice, but older nodes stored non-numeric tokens,
//! so ordering falls back to lexical comparison when either side does not
//! parse as an integer.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::StoreError;
use crate::storage::{read_json, write_json_atomic};

/// Unified stream every projection is driven from.
pub const SYNC_STREAM: &str = "polis.sync";

/// Per-purpose streams used before the unified cursor existed.
pub const LEGACY_STREAMS: [&str; 3] = ["polis.notification", "polis.follow", "polis.feed"];

/// Total order over cursor tokens.
///
/// The empty token sorts before everything. Two integer tokens compare
/// numerically; any other pair compares lexically.
pub fn cursor_cmp(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }
    match (a.parse::<u128>(), b.parse::<u128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// `true` if `a` is strictly before `b`.
pub fn cursor_less(a: &str, b: &str) -> bool {
    cursor_cmp(a, b) == Ordering::Less
}

/// `true` if `a` is strictly after `b`.
pub fn cursor_greater(a: &str, b: &str) -> bool {
    cursor_cmp(a, b) == Ordering::Greater
}

/// Returns the later of two cursors.
pub fn max_cursor<'a>(a: &'a str, b: &'a str) -> &'a str {
    if cursor_greater(b, a) { b } else { a }
}

/// Durable cursor-by-stream map for one discovery namespace.
///
/// Every [`set`](CursorStore::set) writes through to disk.
#[derive(Debug)]
pub struct CursorStore {
    path: PathBuf,
    cursors: BTreeMap<String, String>,
}

impl CursorStore {
    /// Open the store at `path`, loading any existing cursors.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file exists but cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let cursors = read_json(&path)?.unwrap_or_default();
        Ok(Self { path, cursors })
    }

    /// Returns the token for `stream`, or `""` if it was never set.
    pub fn get(&self, stream: &str) -> &str {
        self.cursors.get(stream).map(String::as_str).unwrap_or("")
    }

    /// Store `token` for `stream` and persist immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the write fails. The in-memory value is
    /// updated regardless so the caller sees a consistent view this cycle.
    pub fn set(&mut self, stream: &str, token: &str) -> Result<(), StoreError> {
        self.cursors.insert(stream.to_string(), token.to_string());
        write_json_atomic(&self.path, &self.cursors)?;
        Ok(())
    }

    /// Returns every stored `(stream, token)` pair.
    pub fn all(&self) -> &BTreeMap<String, String> {
        &self.cursors
    }

    /// Resolve the unified cursor, migrating from legacy streams if needed.
    ///
    /// When [`SYNC_STREAM`] is unset, returns the minimum non-empty value of
    /// [`LEGACY_STREAMS`] so no event is skipped on the first unified cycle.
    /// The migrated value is not written; [`SYNC_STREAM`] is only set once a
    /// cycle advances past it. Returns `""` if nothing was ever recorded.
    pub fn resolve_unified(&self) -> String {
        let current = self.get(SYNC_STREAM);
        if !current.is_empty() {
            return current.to_string();
        }

        let migrated = LEGACY_STREAMS
            .iter()
            .map(|stream| self.get(stream))
            .filter(|token| !token.is_empty())
            .min_by(|a, b| cursor_cmp(a, b))
            .map(str::to_string);

        match migrated {
            Some(token) => {
                tracing::info!(cursor = %token, "resolved unified cursor from legacy streams");
                token
            }
            None => String::new(),
        }
    }
}
