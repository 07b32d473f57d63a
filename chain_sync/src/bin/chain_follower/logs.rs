use std::sync::Arc;

use alloy::rpc::types::Filter;
use chain_sync::block_range::BlockRange;
use chain_sync::provider::ChainClient;
use chain_sync::scheduler::DataSyncService;
use itertools::Itertools as _;
use tracing::{debug, info};

/// Syncs the logs matching `filter` by reporting them.
pub(crate) struct LogSyncService<C> {
    client: Arc<C>,
    filter: Option<Filter>,
}

impl<C> LogSyncService<C> {
    pub(crate) fn new(client: Arc<C>, filter: Option<Filter>) -> Self {
        Self { client, filter }
    }
}

impl<C: ChainClient> DataSyncService for LogSyncService<C> {
    async fn sync(&self, blocks: BlockRange) -> anyhow::Result<()> {
        let Some(filter) = &self.filter else {
            info!(range = %blocks, "synced blocks");
            return Ok(());
        };
        let logs = self.client.get_logs_in_range(&blocks, filter).await?;
        for (block, count) in logs
            .iter()
            .filter_map(|log| log.block_number)
            .counts()
            .into_iter()
            .sorted()
        {
            debug!(block, count, "logs");
        }
        info!(range = %blocks, logs = logs.len(), "synced logs");
        Ok(())
    }

    async fn discard_after(&self, block_number: u64) -> anyhow::Result<()> {
        info!(block_number, "discarded everything synced after block");
        Ok(())
    }
}
