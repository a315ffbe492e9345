//! `polis-sync` daemon: polls the discovery service until interrupted.
//!
//! Usage: `polis-sync [CONFIG]` (default `polis.toml`).

use std::process::ExitCode;
use std::sync::Arc;

use polis_sync::{
    DraftDirectories, HttpContentFetcher, HttpDiscoveryClient, LogService, NodeConfig,
    NoopRenderer, SyncEngine, spawn_sync_loop,
};

const DEFAULT_CONFIG_PATH: &str = "polis.toml";

#[tokio::main]
async fn main() -> ExitCode {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = match NodeConfig::load_from(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("polis-sync: {e}");
            return ExitCode::FAILURE;
        }
    };
    let logs = match LogService::open(&config.logging) {
        Ok(logs) => logs,
        Err(e) => {
            eprintln!("polis-sync: {e}");
            return ExitCode::FAILURE;
        }
    };

    let code = match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "polis-sync exiting");
            ExitCode::FAILURE
        }
    };
    logs.close();
    code
}

async fn run(config: NodeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let layout = config.layout();
    let timeout = config.request_timeout();

    let fetcher = Arc::new(HttpContentFetcher::new(timeout)?);
    let mut drafts = DraftDirectories::new(layout.comment_drafts_dir());
    if let Some(hook) = &config.comments.hook {
        drafts = drafts.with_hook(hook.clone(), config.hook_timeout());
    }

    let mut builder = SyncEngine::builder(layout)
        .local_domain(&config.node.domain)
        .query_limit(config.discovery.query_limit)
        .renderer(Arc::new(NoopRenderer))
        .standard_projections(fetcher, Arc::new(drafts));

    if config.discovery_configured() {
        let mut client =
            HttpDiscoveryClient::new(&config.discovery.url, &config.discovery.api_key, timeout)?;
        if let Some(signer) = config.signer()? {
            client = client.with_signer(Arc::new(signer));
        }
        tracing::info!(client = ?client, "discovery client ready");
        builder = builder.event_source(Arc::new(client));
    } else {
        tracing::warn!("discovery url or api_key is empty, sync cycles will be no-ops");
    }

    let engine = builder.build();
    tracing::info!(engine = ?engine, "starting sync loop");
    let handle = spawn_sync_loop(engine, config.live_config());

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");
    handle.shutdown().await?;
    Ok(())
}
