//! Background scheduling of sync cycles.
//!
//! This module provides [`LiveConfig`] for tuning the polling interval and
//! [`SyncHandle`] for controlling a running sync loop.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::MissedTickBehavior;

use crate::engine::SyncEngine;

/// Configuration for the background sync loop.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use polis_sync::LiveConfig;
///
/// let config = LiveConfig {
///     interval: Duration::from_secs(30),
///     ..LiveConfig::default()
/// };
/// assert_eq!(config.interval, Duration::from_secs(30));
/// assert!(config.run_immediately);
/// ```
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Time between the starts of consecutive cycles. A cycle that overruns
    /// delays the next one rather than causing a burst.
    ///
    /// Default: 60 seconds.
    pub interval: Duration,

    /// Run the first cycle as soon as the loop starts instead of waiting one
    /// interval.
    ///
    /// Default: `true`.
    pub run_immediately: bool,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            run_immediately: true,
        }
    }
}

/// Handle for controlling the sync loop.
///
/// Dropping the handle does **not** stop the loop; call
/// [`shutdown`](SyncHandle::shutdown). `Clone` is cheap.
#[derive(Clone)]
pub struct SyncHandle {
    shutdown_tx: watch::Sender<bool>,
    trigger: Arc<Notify>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("stopping", &*self.shutdown_tx.borrow())
            .finish_non_exhaustive()
    }
}

impl SyncHandle {
    /// Ask the loop to run an extra cycle now.
    ///
    /// The cycle runs on the loop's own task, after any cycle in progress.
    /// Triggers issued while a cycle runs coalesce into one.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the loop and wait for the current cycle, if any, to finish.
    ///
    /// Calling `shutdown` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the loop task panicked.
    pub async fn shutdown(&self) -> io::Result<()> {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle
                .await
                .map_err(|e| io::Error::other(format!("sync loop task panicked: {e}"))),
            None => Ok(()),
        }
    }
}

/// Spawn the sync loop for `engine` on the current runtime.
///
/// Exactly one task runs cycles, so a cycle never starts while another is
/// in progress.
pub fn spawn_sync_loop(engine: SyncEngine, config: LiveConfig) -> SyncHandle {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let trigger = Arc::new(Notify::new());
    let task = tokio::spawn(run_sync_loop(engine, config, trigger.clone(), shutdown_rx));
    SyncHandle {
        shutdown_tx,
        trigger,
        task: Arc::new(tokio::sync::Mutex::new(Some(task))),
    }
}

async fn run_sync_loop(
    engine: SyncEngine,
    config: LiveConfig,
    trigger: Arc<Notify>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    if !config.run_immediately {
        // The first tick completes immediately; consume it.
        ticker.tick().await;
    }
    tracing::info!(interval = ?config.interval, "sync loop started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {}
            _ = trigger.notified() => {
                tracing::debug!("sync triggered");
            }
            _ = shutdown_rx.changed() => break,
        }
        if *shutdown_rx.borrow() {
            break;
        }
        let result = engine.sync_once().await;
        if result.failed_queries > 0 || !result.failed_projections.is_empty() {
            tracing::warn!(
                failed_queries = result.failed_queries,
                failed_projections = ?result.failed_projections,
                "sync cycle completed with failures"
            );
        }
    }
    tracing::info!("sync loop stopped");
}
