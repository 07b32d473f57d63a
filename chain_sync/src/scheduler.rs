//! Feeds the blocks accepted by a [`BlockDownloader`] to a
//! [`DataSyncService`] in batches, discarding synced data that a
//! reorganization invalidated.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::block::KnownBlock;
use crate::block_range::BlockRange;
use crate::downloader::{BlockDownloader, ReorgEvent, Subscription};
use crate::provider::ChainClient;
use crate::repository::{BlockRepository, SyncStatusRepository};

mod reducer;

pub use reducer::{
    reduce, SyncAction, SyncEffect, SyncSchedulerError, SyncState, SYNC_BATCH_SIZE,
};

/// Consumer of block ranges, e.g. an indexer of the logs they contain.
pub trait DataSyncService: Send + Sync + 'static {
    fn sync(&self, blocks: BlockRange) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Removes everything synced from blocks above `block_number`.
    fn discard_after(&self, block_number: u64)
        -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub batch_size: usize,
    /// Wait before reporting a failed effect, which starts it again.
    pub retry_delay: Duration,
    /// Last synced block assumed when nothing was synced yet.
    pub earliest_block: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: SYNC_BATCH_SIZE,
            retry_delay: Duration::from_secs(1),
            earliest_block: 0,
        }
    }
}

struct Shared<D, S> {
    service: Arc<D>,
    status: Arc<S>,
    config: SchedulerConfig,
    state: Mutex<SyncState>,
    initialized: AtomicBool,
    /// First changed block of a reorg whose blocks were not delivered yet.
    pending_fork: Mutex<Option<u64>>,
}

pub struct SyncScheduler<D, S> {
    shared: Arc<Shared<D, S>>,
}

impl<D, S> Clone for SyncScheduler<D, S> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<D: DataSyncService, S: SyncStatusRepository> SyncScheduler<D, S> {
    pub fn new(service: Arc<D>, status: Arc<S>, config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                service,
                status,
                config,
                state: Mutex::new(SyncState::default()),
                initialized: AtomicBool::new(false),
                pending_fork: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SyncState {
        self.shared.state.lock().clone()
    }

    /// Discards data synced past the last recorded block and subscribes to
    /// `downloader`. Dropping the returned subscriptions keeps them active;
    /// unsubscribe them to stop syncing.
    pub async fn start<C, R>(
        &self,
        downloader: &BlockDownloader<C, R>,
    ) -> anyhow::Result<Vec<Subscription>>
    where
        C: ChainClient,
        R: BlockRepository,
    {
        let last_synced = self
            .shared
            .status
            .get_last_synced()
            .await?
            .unwrap_or(self.shared.config.earliest_block);
        *self.shared.state.lock() = SyncState::new(last_synced);
        self.shared.service.discard_after(last_synced).await?;
        info!(last_synced, "sync scheduler started");

        let scheduler = self.clone();
        let reorgs = downloader.on_reorg(move |event| scheduler.note_reorg(event));
        let scheduler = self.clone();
        let new_blocks = downloader
            .on_new_blocks(last_synced, move |range| scheduler.handle_range(range))
            .await?;
        // Attached live: nothing was delivered to initialize with.
        if !self.shared.initialized.swap(true, Ordering::SeqCst) {
            self.dispatch_logged(SyncAction::Init(Vec::new()));
        }
        Ok(vec![reorgs, new_blocks])
    }

    /// Runs `action` through the reducer and starts the resulting effects.
    pub fn dispatch(&self, action: SyncAction) -> Result<(), SyncSchedulerError> {
        debug!(?action, "dispatching");
        let effects = {
            let mut state = self.shared.state.lock();
            let (next, effects) = reduce(&state, action, self.shared.config.batch_size)?;
            *state = next;
            effects
        };
        for effect in effects {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let finished = scheduler.run_effect(effect).await;
                scheduler.dispatch_logged(finished);
            });
        }
        Ok(())
    }

    fn dispatch_logged(&self, action: SyncAction) {
        if let Err(err) = self.dispatch(action) {
            error!("sync scheduler rejected an action: {err}");
        }
    }

    fn note_reorg(&self, event: ReorgEvent) {
        let mut pending = self.shared.pending_fork.lock();
        *pending = Some(
            pending.map_or(event.first_changed_block, |fork| {
                fork.min(event.first_changed_block)
            }),
        );
    }

    fn handle_range(&self, range: BlockRange) {
        let fork = self.shared.pending_fork.lock().take();
        let (before, after): (Vec<KnownBlock>, Vec<KnownBlock>) = range
            .blocks()
            .into_iter()
            .partition(|block| fork.map_or(true, |fork| block.number < fork));

        if !self.shared.initialized.swap(true, Ordering::SeqCst) {
            self.dispatch_logged(SyncAction::Init(before));
        } else if !before.is_empty() {
            self.dispatch_logged(SyncAction::NewBlocks(before));
        }
        match fork {
            Some(_) if !after.is_empty() => self.dispatch_logged(SyncAction::Reorg(after)),
            // Wait for the blocks of the new fork.
            Some(fork) => self.note_reorg(ReorgEvent {
                first_changed_block: fork,
            }),
            None => {}
        }
    }

    async fn run_effect(&self, effect: SyncEffect) -> SyncAction {
        let Shared {
            service,
            status,
            config,
            ..
        } = self.shared.as_ref();
        match effect {
            SyncEffect::Sync(range) => {
                let last = range.end().saturating_sub(1);
                let result = async {
                    service.sync(range.clone()).await?;
                    status.set_last_synced(last).await
                }
                .await;
                if let Err(err) = &result {
                    error!(%range, "sync failed: {err:#}");
                    tokio::time::sleep(config.retry_delay).await;
                } else {
                    info!(%range, "synced");
                }
                SyncAction::SyncFinished {
                    success: result.is_ok(),
                }
            }
            SyncEffect::DiscardAfter(block_number) => {
                let result = async {
                    service.discard_after(block_number).await?;
                    status.set_last_synced(block_number).await
                }
                .await;
                if let Err(err) = &result {
                    error!(block_number, "discard failed: {err:#}");
                    tokio::time::sleep(config.retry_delay).await;
                } else {
                    info!(block_number, "discarded synced data");
                }
                SyncAction::DiscardFinished {
                    success: result.is_ok(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;
    use crate::downloader::DownloaderConfig;
    use crate::repository::{InMemoryBlockRepository, InMemorySyncStatus};
    use crate::test_utils::{chain, eventually, known, known_chain, FakeChain};

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Sync(u64, u64),
        DiscardAfter(u64),
    }

    /// Keeps the synced blocks in memory and fails the first `failures`
    /// syncs.
    #[derive(Default)]
    struct RecordingService {
        calls: Mutex<Vec<Call>>,
        synced: Mutex<Vec<KnownBlock>>,
        failures: Mutex<usize>,
    }

    impl DataSyncService for RecordingService {
        async fn sync(&self, blocks: BlockRange) -> anyhow::Result<()> {
            self.calls
                .lock()
                .push(Call::Sync(blocks.start(), blocks.end()));
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    bail!("flaky backend");
                }
            }
            let mut synced = self.synced.lock();
            synced.retain(|block| block.number < blocks.start());
            synced.extend(blocks.blocks());
            Ok(())
        }

        async fn discard_after(&self, block_number: u64) -> anyhow::Result<()> {
            self.calls.lock().push(Call::DiscardAfter(block_number));
            self.synced
                .lock()
                .retain(|block| block.number <= block_number);
            Ok(())
        }
    }

    struct Setup {
        fake: Arc<FakeChain>,
        downloader: BlockDownloader<FakeChain, InMemoryBlockRepository>,
        scheduler: SyncScheduler<RecordingService, InMemorySyncStatus>,
        service: Arc<RecordingService>,
        status: Arc<InMemorySyncStatus>,
    }

    async fn setup(stored: u64, last_synced: Option<u64>, failures: usize) -> Setup {
        let main = chain("main", 0..=stored, "main");
        let fake = FakeChain::with_blocks(&main);
        let repository = Arc::new(InMemoryBlockRepository::new());
        repository.add(&known_chain(&main)).await.unwrap();
        let downloader =
            BlockDownloader::new(fake.clone(), repository, DownloaderConfig::default());
        downloader.start().await.unwrap();

        let service = Arc::new(RecordingService {
            failures: Mutex::new(failures),
            ..Default::default()
        });
        let status = Arc::new(InMemorySyncStatus::new(last_synced));
        let config = SchedulerConfig {
            batch_size: 4,
            retry_delay: Duration::from_millis(1),
            earliest_block: 0,
        };
        let scheduler = SyncScheduler::new(service.clone(), status.clone(), config);
        scheduler.start(&downloader).await.unwrap();
        Setup {
            fake,
            downloader,
            scheduler,
            service,
            status,
        }
    }

    fn synced_numbers(service: &RecordingService) -> Vec<u64> {
        service.synced.lock().iter().map(|b| b.number).collect()
    }

    #[tokio::test]
    async fn syncs_backfill_in_batches() {
        let setup = setup(10, Some(2), 0).await;
        eventually(|| setup.status.last_synced() == Some(10)).await;

        assert_eq!(
            *setup.service.calls.lock(),
            vec![
                Call::DiscardAfter(2),
                Call::Sync(3, 7),
                Call::Sync(7, 11)
            ]
        );
        assert_eq!(synced_numbers(&setup.service), (3..=10).collect::<Vec<_>>());
        eventually(|| !setup.scheduler.state().is_processing).await;
    }

    #[tokio::test]
    async fn syncs_new_blocks() {
        let setup = setup(4, None, 0).await;
        eventually(|| setup.status.last_synced() == Some(4)).await;

        let main = chain("main", 0..=6, "main");
        setup.fake.set_blocks(&main);
        setup.downloader.handle_new_block(main[6]).await.unwrap();
        eventually(|| setup.status.last_synced() == Some(6)).await;
        assert_eq!(synced_numbers(&setup.service), (1..=6).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn retries_failed_syncs() {
        let setup = setup(3, None, 2).await;
        eventually(|| setup.status.last_synced() == Some(3)).await;
        assert_eq!(
            setup
                .service
                .calls
                .lock()
                .iter()
                .filter(|call| **call == Call::Sync(1, 4))
                .count(),
            3
        );
    }

    #[tokio::test]
    async fn discards_data_of_reorganized_blocks() {
        let setup = setup(10, None, 0).await;
        eventually(|| setup.status.last_synced() == Some(10)).await;

        let fork = chain("fork", 7..=11, "main");
        setup.fake.set_blocks(&fork);
        setup.downloader.handle_new_block(fork[4]).await.unwrap();
        eventually(|| setup.status.last_synced() == Some(11)).await;

        assert!(setup.service.calls.lock().contains(&Call::DiscardAfter(6)));
        let synced = setup.service.synced.lock().clone();
        assert_eq!(synced.len(), 11);
        assert_eq!(synced[5], known("main", 6));
        assert_eq!(synced[6], known("fork", 7));
        assert_eq!(synced[10], known("fork", 11));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let setup = setup(2, None, 0).await;
        eventually(|| setup.status.last_synced() == Some(2)).await;
        assert_eq!(
            setup.scheduler.dispatch(SyncAction::Init(Vec::new())),
            Err(SyncSchedulerError::AlreadyInitialized)
        );
    }
}
