//! On-disk layout for synchronized state and the JSON persistence helpers
//! every store shares.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::StoreError;

/// Manages the on-disk directory layout for one node and one discovery
/// service namespace.
///
/// The layout follows this structure:
/// ```text
/// <data_dir>/
///     following.json
///     discovery/
///         <namespace>/
///             cursors.json
///             projections/
///                 <projection_name>/state.json
///             notifications.jsonl
///             feed.json
///             followers.json
/// <site_dir>/
///     .polis/
///         blessed-comments.json
///         blessed/<host>/<path>.md
///         comments/{pending,blessed,denied}/
/// ```
///
/// Cheap to clone; nothing is created until a store writes.
#[derive(Debug, Clone)]
pub struct StateLayout {
    data_dir: PathBuf,
    site_dir: PathBuf,
    namespace: String,
}

impl StateLayout {
    /// Create a layout rooted at `data_dir` for discovery namespace
    /// `namespace`, with site content under `site_dir`.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        site_dir: impl Into<PathBuf>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            data_dir: data_dir.into(),
            site_dir: site_dir.into(),
            namespace: namespace.into(),
        }
    }

    /// Returns the data root.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Returns the published site root.
    pub fn site_dir(&self) -> &Path {
        &self.site_dir
    }

    /// Returns the discovery namespace this layout is scoped to.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `<data_dir>/discovery/<namespace>`
    pub fn namespace_dir(&self) -> PathBuf {
        self.data_dir.join("discovery").join(&self.namespace)
    }

    /// `<data_dir>/discovery/<namespace>/cursors.json`
    pub fn cursors_path(&self) -> PathBuf {
        self.namespace_dir().join("cursors.json")
    }

    /// `<data_dir>/discovery/<namespace>/projections/<name>`
    pub fn projection_dir(&self, name: &str) -> PathBuf {
        self.namespace_dir().join("projections").join(name)
    }

    /// `<data_dir>/discovery/<namespace>/notifications.jsonl`
    pub fn notifications_path(&self) -> PathBuf {
        self.namespace_dir().join("notifications.jsonl")
    }

    /// `<data_dir>/discovery/<namespace>/feed.json`
    pub fn feed_path(&self) -> PathBuf {
        self.namespace_dir().join("feed.json")
    }

    /// `<data_dir>/discovery/<namespace>/followers.json`
    pub fn followers_path(&self) -> PathBuf {
        self.namespace_dir().join("followers.json")
    }

    /// `<data_dir>/following.json`
    ///
    /// Not namespaced: whom this node follows does not depend on which
    /// discovery service reports it.
    pub fn following_path(&self) -> PathBuf {
        self.data_dir.join("following.json")
    }

    /// `<site_dir>/.polis`
    pub fn site_meta_dir(&self) -> PathBuf {
        self.site_dir.join(".polis")
    }

    /// `<site_dir>/.polis/blessed-comments.json`
    pub fn blessed_index_path(&self) -> PathBuf {
        self.site_meta_dir().join("blessed-comments.json")
    }

    /// `<site_dir>/.polis/blessed`
    pub fn blessed_comments_dir(&self) -> PathBuf {
        self.site_meta_dir().join("blessed")
    }

    /// `<site_dir>/.polis/comments`
    pub fn comment_drafts_dir(&self) -> PathBuf {
        self.site_meta_dir().join("comments")
    }
}

/// Write `value` as pretty JSON to `path` atomically.
///
/// Writes a sibling `.tmp` file then renames it over `path`, creating the
/// parent directory if needed. Readers never observe a partial file.
///
/// # Errors
///
/// Returns `io::Error` if directory creation, serialization, writing, or
/// renaming fails.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
    write_atomic(path, json.as_bytes())
}

/// Write raw bytes to `path` atomically via a temp-rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, bytes)?;
    std::fs::rename(&tmp_path, path)
}

/// Read a JSON document from `path`.
///
/// Returns `Ok(None)` if the file does not exist or is corrupt. A corrupt
/// file is renamed to `<name>.corrupt-<timestamp>` before the caller starts
/// over from defaults, so a later write never replaces the only copy.
///
/// # Errors
///
/// Returns `io::Error` for I/O failures other than file-not-found, including
/// a failure to move a corrupt file aside.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                let kept = quarantine(path)?;
                tracing::warn!(
                    path = %path.display(),
                    kept = %kept.display(),
                    error = %e,
                    "corrupt state file moved aside, starting from defaults"
                );
                Ok(None)
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Sibling path a corrupt copy of `path` is kept under.
pub(crate) fn corrupt_path(path: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".corrupt-{stamp}"));
    path.with_file_name(name)
}

/// Move `path` aside to its [`corrupt_path`]. Returns the new location.
fn quarantine(path: &Path) -> io::Result<PathBuf> {
    let target = corrupt_path(path);
    std::fs::rename(path, &target)?;
    Ok(target)
}

/// The set of domains this node follows.
///
/// Maintained by the HTTP-facing follow/unfollow handlers and read by the
/// sync engine at the start of every cycle.
#[derive(Debug, Clone)]
pub struct FollowingList {
    path: PathBuf,
}

#[derive(Debug, Default, Serialize, serde::Deserialize)]
struct FollowingFile {
    #[serde(default)]
    following: BTreeSet<String>,
}

impl FollowingList {
    /// Open the following list stored at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Returns the followed domains. An absent file means "follows nobody".
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the file exists but cannot be read.
    pub fn domains(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(read_json::<FollowingFile>(&self.path)?
            .unwrap_or_default()
            .following)
    }

    /// Start following `domain`. Returns `true` if it was not followed before.
    pub fn follow(&self, domain: &str) -> Result<bool, StoreError> {
        let mut file = read_json::<FollowingFile>(&self.path)?.unwrap_or_default();
        let added = file.following.insert(normalize_domain(domain));
        if added {
            write_json_atomic(&self.path, &file)?;
        }
        Ok(added)
    }

    /// Stop following `domain`. Returns `true` if it was followed.
    pub fn unfollow(&self, domain: &str) -> Result<bool, StoreError> {
        let mut file = read_json::<FollowingFile>(&self.path)?.unwrap_or_default();
        let removed = file.following.remove(&normalize_domain(domain));
        if removed {
            write_json_atomic(&self.path, &file)?;
        }
        Ok(removed)
    }
}

/// Lower-case a domain and strip any scheme or trailing slash so that
/// `https://Alice.Example/` and `alice.example` compare equal.
pub fn normalize_domain(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_ascii_lowercase()
}
