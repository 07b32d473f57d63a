use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{BlockHash, TxHash};
use alloy::rpc::types::{BlockId, BlockTransactionsKind, Filter, Log, Transaction};
use alloy::{providers::Provider, transports::Transport};
use anyhow::{bail, Context as _};
use async_stream::stream;
use futures::stream::BoxStream;
use futures::{StreamExt as _, TryStreamExt as _};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::block::Block;
use crate::block_range::BlockRange;

/// Read access to the chain the downloader follows.
pub trait ChainClient: Send + Sync + 'static {
    fn get_block_number(&self) -> impl Future<Output = anyhow::Result<u64>> + Send;

    fn get_block(&self, id: BlockId) -> impl Future<Output = anyhow::Result<Block>> + Send;

    /// Notifications of new chain heads. Dropping the stream unsubscribes.
    fn new_blocks(&self) -> BoxStream<'static, anyhow::Result<Block>>;

    /// Logs matching `filter` emitted by the blocks of `range`. Fails when
    /// the node answers with logs of blocks the range does not allow.
    fn get_logs_in_range(
        &self,
        range: &BlockRange,
        filter: &Filter,
    ) -> impl Future<Output = anyhow::Result<Vec<Log>>> + Send;

    fn get_transaction(
        &self,
        hash: TxHash,
    ) -> impl Future<Output = anyhow::Result<Option<Transaction>>> + Send;
}

#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// How long to wait before asking for the head again when it did not
    /// move.
    pub poll_interval: Duration,
    pub max_parallel_requests: usize,
    pub block_cache_size: NonZeroUsize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_parallel_requests: 128,
            block_cache_size: NonZeroUsize::new(1024).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

/// [`ChainClient`] over an alloy provider, caching blocks by hash.
///
/// Blocks are never cached by number: a number may point to another block
/// after a reorganization.
pub struct RpcChainClient<ProviderT, TransportT> {
    provider: Arc<ProviderT>,
    // Alloy's http transport has an unbounded connection pool, so parallel
    // requests are bounded here.
    semaphore: Arc<Semaphore>,
    blocks_by_hash: Arc<Mutex<lru::LruCache<BlockHash, Block>>>,
    config: RpcConfig,
    _phantom: std::marker::PhantomData<fn() -> TransportT>,
}

impl<ProviderT, TransportT> RpcChainClient<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    pub fn new(provider: ProviderT, config: RpcConfig) -> Self {
        Self {
            provider: provider.into(),
            semaphore: Arc::new(Semaphore::new(config.max_parallel_requests)),
            blocks_by_hash: Arc::new(Mutex::new(lru::LruCache::new(config.block_cache_size))),
            config,
            _phantom: std::marker::PhantomData,
        }
    }

    async fn fetch_block(&self, id: BlockId) -> anyhow::Result<Block> {
        if let BlockId::Hash(hash) = id {
            if let Some(block) = self.blocks_by_hash.lock().await.get(&hash.block_hash) {
                return Ok(*block);
            }
        }

        let block = {
            let _permit = self.semaphore.acquire().await?;
            self.provider
                .get_block(id, BlockTransactionsKind::Hashes)
                .await?
                .with_context(|| format!("target block {id:?} does not exist"))?
        };
        let block = Block::from(&block);
        self.blocks_by_hash.lock().await.put(block.hash, block);
        Ok(block)
    }

    async fn fetch_logs(&self, filter: Filter) -> anyhow::Result<Vec<Log>> {
        let _permit = self.semaphore.acquire().await?;
        Ok(self.provider.get_logs(&filter).await?)
    }
}

impl<ProviderT, TransportT> ChainClient for RpcChainClient<ProviderT, TransportT>
where
    ProviderT: Provider<TransportT> + 'static,
    TransportT: Transport + Clone,
{
    async fn get_block_number(&self) -> anyhow::Result<u64> {
        let _permit = self.semaphore.acquire().await?;
        Ok(self.provider.get_block_number().await?)
    }

    async fn get_block(&self, id: BlockId) -> anyhow::Result<Block> {
        self.fetch_block(id).await
    }

    fn new_blocks(&self) -> BoxStream<'static, anyhow::Result<Block>> {
        let provider = self.provider.clone();
        let poll_interval = self.config.poll_interval;
        Box::pin(stream! {
            let mut last_seen = None;
            loop {
                match poll_head::<ProviderT, TransportT>(provider.as_ref(), last_seen).await {
                    Ok(Some(block)) => {
                        last_seen = Some(block.number);
                        yield Ok(block);
                    }
                    Ok(None) => tokio::time::sleep(poll_interval).await,
                    Err(err) => {
                        warn!("could not poll the chain head: {err:#}");
                        yield Err(err);
                        tokio::time::sleep(poll_interval).await;
                    }
                }
            }
        })
    }

    async fn get_logs_in_range(
        &self,
        range: &BlockRange,
        filter: &Filter,
    ) -> anyhow::Result<Vec<Log>> {
        let split = range.split_by_known_hashes();
        let mut logs = Vec::new();
        if !split.unknown.is_empty() {
            let ranged = filter
                .clone()
                .from_block(split.unknown.start)
                .to_block(split.unknown.end - 1);
            logs.extend(self.fetch_logs(ranged).await?);
        }
        let known_hashes: Vec<_> = split.known.iter().map(|block| block.hash).collect();
        let pinned: Vec<Vec<Log>> = futures::stream::iter(known_hashes)
            .map(|hash| self.fetch_logs(filter.clone().at_block_hash(hash)))
            .buffered(16)
            .try_collect()
            .await?;
        logs.extend(pinned.into_iter().flatten());

        for log in &logs {
            match (log.block_number, log.block_hash) {
                (Some(number), Some(hash)) if range.has(number, hash) => {}
                (number, hash) => bail!(
                    "log of block {number:?} ({hash:?}) is outside of range {range} or reorged"
                ),
            }
        }
        debug!(%range, logs = logs.len(), "fetched logs");
        Ok(logs)
    }

    async fn get_transaction(&self, hash: TxHash) -> anyhow::Result<Option<Transaction>> {
        let _permit = self.semaphore.acquire().await?;
        Ok(self.provider.get_transaction_by_hash(hash).await?)
    }
}

/// The head block when it is above `last_seen`.
async fn poll_head<ProviderT, TransportT>(
    provider: &ProviderT,
    last_seen: Option<u64>,
) -> anyhow::Result<Option<Block>>
where
    ProviderT: Provider<TransportT>,
    TransportT: Transport + Clone,
{
    let number = provider
        .get_block_number()
        .await
        .context("could not retrieve latest block number from the provider")?;
    if last_seen.is_some_and(|seen| number <= seen) {
        return Ok(None);
    }
    let block = provider
        .get_block(number.into(), BlockTransactionsKind::Hashes)
        .await?
        .with_context(|| format!("head block {number} does not exist"))?;
    Ok(Some(Block::from(&block)))
}
