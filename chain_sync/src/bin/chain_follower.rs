use std::sync::Arc;
use std::time::Duration;

use alloy::rpc::types::Filter;
use alloy::transports::http::ReqwestTransport;
use anyhow::Result;
use chain_sync::downloader::{BlockDownloader, DownloaderConfig};
use chain_sync::env::load_dotenvy_vars_if_present;
use chain_sync::provider::{RpcChainClient, RpcConfig};
use chain_sync::repository::{InMemoryBlockRepository, InMemorySyncStatus};
use chain_sync::retry::{build_http_retry_provider, Backoff, RetryService, RetryingHttpProvider};
use chain_sync::scheduler::{SchedulerConfig, SyncScheduler};
use clap::Parser;
use tracing::info;

use self::chain_follower::*;
use crate::logs::LogSyncService;
mod chain_follower {
    pub mod cli;
    pub mod logs;
}

type Client = RpcChainClient<RetryingHttpProvider, RetryService<ReqwestTransport>>;

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenvy_vars_if_present();
    chain_sync::tracing::init();

    let args = cli::Cli::parse();

    let provider = build_http_retry_provider(
        args.rpc_url.clone(),
        Backoff {
            initial: Duration::from_millis(args.rpc_backoff),
            max_retries: args.rpc_max_retries,
        },
    );
    let client: Arc<Client> = Arc::new(RpcChainClient::new(
        provider,
        RpcConfig {
            poll_interval: Duration::from_secs(args.poll_interval),
            ..Default::default()
        },
    ));

    let downloader = BlockDownloader::new(
        client.clone(),
        Arc::new(InMemoryBlockRepository::new()),
        DownloaderConfig {
            earliest_block: args.earliest_block,
            max_reorg_offset: args.max_reorg_offset,
            ..Default::default()
        },
    );
    let filter = args.address.map(|address| Filter::new().address(address));
    let scheduler = SyncScheduler::new(
        Arc::new(LogSyncService::new(client, filter)),
        Arc::new(InMemorySyncStatus::default()),
        SchedulerConfig {
            batch_size: args.sync_batch_size,
            // Nothing synced yet means the earliest block still has to be.
            earliest_block: args.earliest_block.saturating_sub(1),
            ..Default::default()
        },
    );

    let follower = downloader.start().await?;
    let _subscriptions = scheduler.start(&downloader).await?;
    info!(rpc_url = %args.rpc_url, earliest_block = args.earliest_block, "following the chain");

    follower.await?;
    Ok(())
}
