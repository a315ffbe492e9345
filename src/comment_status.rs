//! Moves locally authored comment drafts once the post owner decides.
//!
//! Comments this node wrote on other sites wait in `pending/` until a
//! `blessing.granted` or `blessing.denied` for them arrives, then move to
//! `blessed/` or `denied/` and the optional post-decision hook runs.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProjectionError;
use crate::event::{BlessingPayload, Event, EventKind};
use crate::projection::{ProjectionHandler, ProjectionResult, SyncContext};

/// Outcome of a blessing request for one of our comments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Blessed,
    Denied,
}

impl Decision {
    /// Bucket name and hook value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blessed => "blessed",
            Self::Denied => "denied",
        }
    }
}

/// The comment-publishing subsystem, as seen from the sync engine.
#[async_trait]
pub trait CommentDrafts: Send + Sync {
    /// Apply `decision` to the draft for `comment_url`.
    ///
    /// Returns `true` if a local file moved.
    async fn resolve(&self, comment_url: &str, decision: Decision) -> Result<bool, ProjectionError>;
}

/// [`CommentDrafts`] over `pending/`, `blessed/`, and `denied/` directories.
#[derive(Debug, Clone)]
pub struct DraftDirectories {
    root: PathBuf,
    hook: Option<String>,
    hook_timeout: Duration,
}

impl DraftDirectories {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            hook: None,
            hook_timeout: Duration::from_secs(10),
        }
    }

    /// Run `command` through `sh -c` after every decision that moved a file.
    pub fn with_hook(mut self, command: impl Into<String>, timeout: Duration) -> Self {
        self.hook = Some(command.into()).filter(|c: &String| !c.trim().is_empty());
        self.hook_timeout = timeout;
        self
    }

    /// `<root>/<bucket>`
    pub fn bucket(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Run the configured hook for `comment_url`.
    ///
    /// # Errors
    ///
    /// [`ProjectionError::Hook`] if the hook cannot be spawned, exits
    /// non-zero, or outlives the timeout.
    pub async fn run_hook(&self, comment_url: &str, decision: Decision) -> Result<(), ProjectionError> {
        let Some(command) = &self.hook else {
            return Ok(());
        };
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .env("POLIS_COMMENT_URL", comment_url)
            .env("POLIS_DECISION", decision.as_str())
            .kill_on_drop(true)
            .status();
        let status = tokio::time::timeout(self.hook_timeout, child)
            .await
            .map_err(|_| ProjectionError::Hook(format!("timed out after {:?}", self.hook_timeout)))?
            .map_err(|e| ProjectionError::Hook(e.to_string()))?;
        if !status.success() {
            return Err(ProjectionError::Hook(format!("exited with {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl CommentDrafts for DraftDirectories {
    async fn resolve(&self, comment_url: &str, decision: Decision) -> Result<bool, ProjectionError> {
        let Some(file_name) = draft_file_name(comment_url) else {
            tracing::warn!(url = %comment_url, "cannot derive draft file name");
            return Ok(false);
        };
        let pending = self.bucket("pending").join(&file_name);
        if !tokio::fs::try_exists(&pending).await? {
            return Ok(false);
        }
        let dest_dir = self.bucket(decision.as_str());
        tokio::fs::create_dir_all(&dest_dir).await?;
        tokio::fs::rename(&pending, dest_dir.join(&file_name)).await?;
        tracing::info!(file = %file_name, decision = decision.as_str(), "moved comment draft");

        if let Err(e) = self.run_hook(comment_url, decision).await {
            tracing::warn!(url = %comment_url, error = %e, "comment hook failed");
        }
        Ok(true)
    }
}

/// Last path segment of `url` with a `.md` extension.
fn draft_file_name(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let segment = path.trim_end_matches('/').rsplit('/').next()?;
    if segment.is_empty() || segment == ".." || segment == "." || segment.contains(':') {
        return None;
    }
    let stem = segment
        .strip_suffix(".html")
        .or_else(|| segment.strip_suffix(".md"))
        .unwrap_or(segment);
    Some(format!("{stem}.md"))
}

/// Routes blessing decisions on this node's own comments to [`CommentDrafts`].
#[derive(Clone)]
pub struct CommentStatusProjector {
    drafts: Arc<dyn CommentDrafts>,
}

impl std::fmt::Debug for CommentStatusProjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommentStatusProjector").finish_non_exhaustive()
    }
}

impl CommentStatusProjector {
    pub fn new(drafts: Arc<dyn CommentDrafts>) -> Self {
        Self { drafts }
    }
}

impl ProjectionHandler for CommentStatusProjector {
    type State = ();
    const NAME: &'static str = "comment-status";

    fn event_types(&self) -> &[&'static str] {
        &["blessing.granted", "blessing.denied"]
    }

    async fn process(
        &self,
        ctx: &SyncContext,
        events: &[Event],
        _state: &mut (),
    ) -> Result<ProjectionResult, ProjectionError> {
        let mut result = ProjectionResult::default();
        for event in events {
            let decision = match event.kind() {
                EventKind::BlessingGranted => Decision::Blessed,
                EventKind::BlessingDenied => Decision::Denied,
                _ => continue,
            };
            let blessing = match BlessingPayload::from_event(event) {
                Ok(blessing) => blessing,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed blessing event");
                    continue;
                }
            };
            if !ctx.is_local(&blessing.source_domain) {
                continue;
            }
            match self.drafts.resolve(&blessing.comment_url, decision).await {
                Ok(moved) => result.files_changed |= moved,
                Err(e) => tracing::warn!(
                    url = %blessing.comment_url,
                    error = %e,
                    "failed to apply comment decision"
                ),
            }
        }
        Ok(result)
    }
}
