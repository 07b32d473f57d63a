use std::collections::BTreeMap;
use std::future::Future;

use parking_lot::{Mutex, RwLock};

use crate::block::KnownBlock;

/// Storage of the blocks accepted by the downloader. Stored blocks always
/// form one consistent chain.
pub trait BlockRepository: Send + Sync + 'static {
    fn get_last(&self) -> impl Future<Output = anyhow::Result<Option<KnownBlock>>> + Send;

    fn get_first(&self) -> impl Future<Output = anyhow::Result<Option<KnownBlock>>> + Send;

    fn get_by_number(
        &self,
        number: u64,
    ) -> impl Future<Output = anyhow::Result<Option<KnownBlock>>> + Send;

    /// Blocks numbered `from..=to`.
    fn get_all_in_range(
        &self,
        from: u64,
        to: u64,
    ) -> impl Future<Output = anyhow::Result<Vec<KnownBlock>>> + Send;

    fn add(&self, blocks: &[KnownBlock]) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn delete_all_after(&self, number: u64) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Where a data sync consumer records how far it got.
pub trait SyncStatusRepository: Send + Sync + 'static {
    fn get_last_synced(&self) -> impl Future<Output = anyhow::Result<Option<u64>>> + Send;

    fn set_last_synced(&self, number: u64) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[derive(Debug, Default)]
pub struct InMemoryBlockRepository {
    blocks: RwLock<BTreeMap<u64, KnownBlock>>,
}

impl InMemoryBlockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    pub fn all(&self) -> Vec<KnownBlock> {
        self.blocks.read().values().copied().collect()
    }
}

impl BlockRepository for InMemoryBlockRepository {
    async fn get_last(&self) -> anyhow::Result<Option<KnownBlock>> {
        Ok(self.blocks.read().values().next_back().copied())
    }

    async fn get_first(&self) -> anyhow::Result<Option<KnownBlock>> {
        Ok(self.blocks.read().values().next().copied())
    }

    async fn get_by_number(&self, number: u64) -> anyhow::Result<Option<KnownBlock>> {
        Ok(self.blocks.read().get(&number).copied())
    }

    async fn get_all_in_range(&self, from: u64, to: u64) -> anyhow::Result<Vec<KnownBlock>> {
        if to < from {
            return Ok(Vec::new());
        }
        Ok(self.blocks.read().range(from..=to).map(|(_, b)| *b).collect())
    }

    async fn add(&self, blocks: &[KnownBlock]) -> anyhow::Result<()> {
        self.blocks
            .write()
            .extend(blocks.iter().map(|block| (block.number, *block)));
        Ok(())
    }

    async fn delete_all_after(&self, number: u64) -> anyhow::Result<()> {
        if let Some(first_deleted) = number.checked_add(1) {
            self.blocks.write().split_off(&first_deleted);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySyncStatus {
    last_synced: Mutex<Option<u64>>,
}

impl InMemorySyncStatus {
    pub fn new(last_synced: Option<u64>) -> Self {
        Self {
            last_synced: Mutex::new(last_synced),
        }
    }

    pub fn last_synced(&self) -> Option<u64> {
        *self.last_synced.lock()
    }
}

impl SyncStatusRepository for InMemorySyncStatus {
    async fn get_last_synced(&self) -> anyhow::Result<Option<u64>> {
        Ok(*self.last_synced.lock())
    }

    async fn set_last_synced(&self, number: u64) -> anyhow::Result<()> {
        *self.last_synced.lock() = Some(number);
        Ok(())
    }
}
