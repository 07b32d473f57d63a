//! Follows the chain head, keeping a consistent copy of the canonical chain
//! in a [`BlockRepository`] and repairing it when the chain reorganizes.

use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::Context as _;
use futures::{StreamExt as _, TryStreamExt as _};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::block::{is_consistent_chain, Block, KnownBlock};
use crate::block_range::BlockRange;
use crate::job_queue::JobQueue;
use crate::provider::ChainClient;
use crate::repository::BlockRepository;

mod subscriptions;

pub use subscriptions::{ReorgEvent, Subscription};
use subscriptions::{Delivery, Registry};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DownloaderError {
    #[error("Not started")]
    NotStarted,

    #[error("Already started")]
    AlreadyStarted,

    #[error(
        "Unreasonable reorganization: no common ancestor within {max_offset} blocks of block {last_known}"
    )]
    UnreasonableReorganization { last_known: u64, max_offset: u64 },

    #[error("Inconsistent chain received after block {after}")]
    InconsistentChain { after: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum DownloaderStatus {
    NotStarted,
    Working {
        #[serde(rename = "lastKnownBlock")]
        last_known_block: KnownBlock,
    },
}

#[derive(Clone, Debug)]
pub struct DownloaderConfig {
    /// Block stored first when the repository is empty.
    pub earliest_block: u64,
    /// Distance of the first probe below the last known block when looking
    /// for the fork point. Doubles with every probe.
    pub initial_reorg_offset: u64,
    /// Probing stops, and the reorganization is rejected, at this offset.
    pub max_reorg_offset: u64,
    pub max_job_retries: usize,
    /// Blocks fetched concurrently when catching up.
    pub fetch_concurrency: usize,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            earliest_block: 0,
            initial_reorg_offset: 10,
            max_reorg_offset: 1000,
            max_job_retries: 2,
            fetch_concurrency: 16,
        }
    }
}

struct Shared<C, R> {
    chain: Arc<C>,
    repository: Arc<R>,
    config: DownloaderConfig,
    registry: Arc<Mutex<Registry>>,
}

pub struct BlockDownloader<C, R> {
    shared: Arc<Shared<C, R>>,
}

impl<C, R> Clone for BlockDownloader<C, R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: ChainClient, R: BlockRepository> BlockDownloader<C, R> {
    pub fn new(chain: Arc<C>, repository: Arc<R>, config: DownloaderConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                chain,
                repository,
                config,
                registry: Arc::default(),
            }),
        }
    }

    pub fn get_status(&self) -> DownloaderStatus {
        self.shared.registry.lock().status
    }

    pub fn get_last_known_block(&self) -> Result<KnownBlock, DownloaderError> {
        match self.get_status() {
            DownloaderStatus::Working { last_known_block } => Ok(last_known_block),
            DownloaderStatus::NotStarted => Err(DownloaderError::NotStarted),
        }
    }

    /// Loads the last stored block and starts following the chain.
    ///
    /// New heads are handled one at a time on a job queue. The returned
    /// task ends once the chain's head notifications end and every queued
    /// job has run.
    pub async fn start(&self) -> anyhow::Result<JoinHandle<()>> {
        if self.get_status() != DownloaderStatus::NotStarted {
            return Err(DownloaderError::AlreadyStarted.into());
        }

        let last_known = match self.shared.repository.get_last().await? {
            Some(block) => block,
            None => {
                let earliest = self
                    .shared
                    .chain
                    .get_block(self.shared.config.earliest_block.into())
                    .await
                    .context("could not fetch the earliest block")?;
                let earliest = KnownBlock::from(earliest);
                self.shared.repository.add(&[earliest]).await?;
                earliest
            }
        };
        self.set_working(last_known)?;
        info!(number = last_known.number, hash = %last_known.hash, "block downloader started");

        let mut feed = self.shared.chain.new_blocks();
        let (queue, worker) =
            JobQueue::spawn("block-downloader", self.shared.config.max_job_retries);
        let downloader = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(notification) = feed.next().await {
                let block = match notification {
                    Ok(block) => block,
                    Err(err) => {
                        warn!("new block notification failed: {err:#}");
                        continue;
                    }
                };
                let downloader = downloader.clone();
                let pushed = queue.push(format!("new block {}", block.number), move || {
                    let downloader = downloader.clone();
                    async move { downloader.handle_new_block(block).await }
                });
                if let Err(err) = pushed {
                    error!("{err:#}");
                    break;
                }
            }
            drop(queue);
            if let Err(err) = worker.await {
                error!("block downloader worker failed: {err}");
            }
        }))
    }

    /// Calls `handler` with every range of blocks accepted after `from`, the
    /// last block the caller already has.
    ///
    /// Blocks between `from` and the current head are loaded from the
    /// repository and delivered in one range together with anything
    /// accepted meanwhile. The handler runs while the downloader's
    /// subscriber registry is locked, so it must not call back into the
    /// downloader.
    pub async fn on_new_blocks(
        &self,
        from: u64,
        handler: impl FnMut(BlockRange) + Send + 'static,
    ) -> anyhow::Result<Subscription> {
        let (id, head) = {
            let mut registry = self.shared.registry.lock();
            let DownloaderStatus::Working { last_known_block } = registry.status else {
                return Err(DownloaderError::NotStarted.into());
            };
            if from >= last_known_block.number {
                let id = registry.add_new_blocks(Box::new(handler), Delivery::Live);
                return Ok(self.subscription(id));
            }
            let id = registry.add_new_blocks(Box::new(handler), Delivery::pending());
            (id, last_known_block)
        };

        let backfill = match self
            .shared
            .repository
            .get_all_in_range(from + 1, head.number)
            .await
        {
            Ok(blocks) => BlockRange::with_blocks(from + 1, head.number + 1, blocks)?,
            Err(err) => {
                self.shared.registry.lock().remove(id);
                return Err(err);
            }
        };
        debug!(%backfill, "delivering backfill");
        self.shared.registry.lock().go_live(id, backfill);
        Ok(self.subscription(id))
    }

    pub fn on_reorg(&self, handler: impl FnMut(ReorgEvent) + Send + 'static) -> Subscription {
        let id = self.shared.registry.lock().add_reorg(Box::new(handler));
        self.subscription(id)
    }

    fn subscription(&self, id: u64) -> Subscription {
        Subscription::new(Arc::downgrade(&self.shared.registry), id)
    }

    fn set_working(&self, last_known_block: KnownBlock) -> Result<(), DownloaderError> {
        let mut registry = self.shared.registry.lock();
        if registry.status != DownloaderStatus::NotStarted {
            return Err(DownloaderError::AlreadyStarted);
        }
        registry.status = DownloaderStatus::Working { last_known_block };
        Ok(())
    }

    fn accept(&self, range: &BlockRange, head: KnownBlock) {
        let mut registry = self.shared.registry.lock();
        registry.status = DownloaderStatus::Working {
            last_known_block: head,
        };
        registry.emit_new_blocks(range);
    }

    fn rewind(&self, anchor: KnownBlock) {
        let mut registry = self.shared.registry.lock();
        registry.status = DownloaderStatus::Working {
            last_known_block: anchor,
        };
        registry.emit_reorg(ReorgEvent {
            first_changed_block: anchor.number + 1,
        });
    }

    /// Extends the stored chain up to `head`, repairing a reorganization
    /// first when `head` does not build on the last known block.
    pub(crate) async fn handle_new_block(&self, head: Block) -> anyhow::Result<()> {
        let mut last_known = self.get_last_known_block()?;
        if head.number <= last_known.number {
            let stored = self.shared.repository.get_by_number(head.number).await?;
            if stored.is_some_and(|stored| stored.hash == head.hash) {
                trace!(number = head.number, "block already known");
                return Ok(());
            }
        }

        let next_number = last_known.number + 1;
        let next = match head.number.cmp(&next_number) {
            Ordering::Less => None,
            Ordering::Equal => Some(head),
            Ordering::Greater => Some(self.shared.chain.get_block(next_number.into()).await?),
        };
        if next.map_or(true, |next| next.parent_hash != last_known.hash) {
            last_known = self.repair_reorg(last_known).await?;
        }
        if head.number <= last_known.number {
            return Ok(());
        }

        let mut blocks: Vec<Block> =
            futures::stream::iter(last_known.number + 1..head.number)
                .map(|number| self.shared.chain.get_block(number.into()))
                .buffered(self.shared.config.fetch_concurrency.max(1))
                .try_collect()
                .await?;
        blocks.push(head);
        if blocks[0].parent_hash != last_known.hash || !is_consistent_chain(&blocks) {
            return Err(DownloaderError::InconsistentChain {
                after: last_known.number,
            }
            .into());
        }

        let accepted: Vec<KnownBlock> = blocks.iter().map(KnownBlock::from).collect();
        self.shared.repository.add(&accepted).await?;
        let range = BlockRange::from_blocks(accepted);
        info!(%range, "accepted new blocks");
        self.accept(&range, KnownBlock::from(head));
        Ok(())
    }

    /// Finds the latest stored block still on the canonical chain, drops
    /// everything stored after it and announces the reorganization.
    async fn repair_reorg(&self, last_known: KnownBlock) -> anyhow::Result<KnownBlock> {
        let Shared {
            chain,
            repository,
            config,
            ..
        } = self.shared.as_ref();

        if chain.get_block(last_known.number.into()).await?.hash == last_known.hash {
            return Ok(last_known);
        }

        let unreasonable = DownloaderError::UnreasonableReorganization {
            last_known: last_known.number,
            max_offset: config.max_reorg_offset,
        };
        let mut mismatch = last_known.number;
        let mut offset = config.initial_reorg_offset.max(1);
        let mut anchor = loop {
            if offset >= config.max_reorg_offset {
                return Err(unreasonable.into());
            }
            let stored = match last_known.number.checked_sub(offset) {
                Some(number) => repository.get_by_number(number).await?,
                None => None,
            };
            let Some(stored) = stored else {
                // Nothing stored that far back. The oldest block is final.
                break repository
                    .get_first()
                    .await?
                    .context("block repository is empty")?;
            };
            if chain.get_block(stored.number.into()).await?.hash == stored.hash {
                break stored;
            }
            mismatch = stored.number;
            offset *= 2;
        };
        if anchor.number >= mismatch {
            return Err(unreasonable.into());
        }

        while mismatch - anchor.number > 1 {
            let middle = anchor.number + (mismatch - anchor.number) / 2;
            let Some(stored) = repository.get_by_number(middle).await? else {
                break;
            };
            if chain.get_block(middle.into()).await?.hash == stored.hash {
                anchor = stored;
            } else {
                mismatch = middle;
            }
        }

        repository.delete_all_after(anchor.number).await?;
        warn!(
            last_known = last_known.number,
            first_changed_block = anchor.number + 1,
            "chain reorganization repaired"
        );
        self.rewind(anchor);
        Ok(anchor)
    }
}
