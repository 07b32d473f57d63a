use std::collections::{BTreeMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{keccak256, TxHash, B256};
use alloy::rpc::types::{BlockId, BlockNumberOrTag, Filter, Log, Transaction};
use anyhow::{bail, Context as _};
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::StreamExt as _;
use parking_lot::Mutex;

use crate::block::{Block, KnownBlock};
use crate::block_range::BlockRange;
use crate::provider::ChainClient;

pub(crate) fn block_hash(fork: &str, number: u64) -> B256 {
    keccak256(format!("{fork}-{number}"))
}

pub(crate) fn known(fork: &str, number: u64) -> KnownBlock {
    KnownBlock::new(number, block_hash(fork, number))
}

/// Blocks of `fork`, the first one a child of `parent_fork`.
pub(crate) fn chain(fork: &str, numbers: RangeInclusive<u64>, parent_fork: &str) -> Vec<Block> {
    let first = *numbers.start();
    numbers
        .map(|number| {
            let parent = if number == first { parent_fork } else { fork };
            Block {
                number,
                hash: block_hash(fork, number),
                parent_hash: block_hash(parent, number.wrapping_sub(1)),
                timestamp: 1_700_000_000 + number * 12,
            }
        })
        .collect()
}

pub(crate) fn known_chain(blocks: &[Block]) -> Vec<KnownBlock> {
    blocks.iter().map(KnownBlock::from).collect()
}

/// Polls `check` until it holds, yielding to spawned tasks in between.
pub(crate) async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Chain whose answers are set by the test.
#[derive(Default)]
pub(crate) struct FakeChain {
    /// Successive answers per number; the last one repeats.
    blocks: Mutex<BTreeMap<u64, VecDeque<Block>>>,
    feed: Mutex<Option<mpsc::UnboundedSender<anyhow::Result<Block>>>>,
    requests: Mutex<Vec<u64>>,
}

impl FakeChain {
    pub(crate) fn with_blocks(blocks: &[Block]) -> Arc<Self> {
        let chain = Arc::new(Self::default());
        chain.set_blocks(blocks);
        chain
    }

    /// Makes `blocks` the canonical answer for their numbers.
    pub(crate) fn set_blocks(&self, blocks: &[Block]) {
        let mut stored = self.blocks.lock();
        for block in blocks {
            stored.insert(block.number, VecDeque::from([*block]));
        }
    }

    pub(crate) fn answer_in_sequence(&self, number: u64, answers: Vec<Block>) {
        self.blocks.lock().insert(number, answers.into());
    }

    pub(crate) fn emit(&self, block: Block) {
        if let Some(feed) = self.feed.lock().as_ref() {
            let _ = feed.unbounded_send(Ok(block));
        }
    }

    pub(crate) fn emit_error(&self, message: &str) {
        if let Some(feed) = self.feed.lock().as_ref() {
            let _ = feed.unbounded_send(Err(anyhow::anyhow!(message.to_owned())));
        }
    }

    pub(crate) fn close_feed(&self) {
        self.feed.lock().take();
    }

    pub(crate) fn requests(&self) -> Vec<u64> {
        self.requests.lock().clone()
    }

    fn block(&self, number: u64) -> anyhow::Result<Block> {
        self.requests.lock().push(number);
        let mut blocks = self.blocks.lock();
        let answers = blocks
            .get_mut(&number)
            .with_context(|| format!("block {number} does not exist"))?;
        let answer = if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().copied()
        };
        answer.with_context(|| format!("block {number} does not exist"))
    }
}

impl ChainClient for FakeChain {
    async fn get_block_number(&self) -> anyhow::Result<u64> {
        self.blocks
            .lock()
            .keys()
            .next_back()
            .copied()
            .context("empty chain")
    }

    async fn get_block(&self, id: BlockId) -> anyhow::Result<Block> {
        match id {
            BlockId::Number(BlockNumberOrTag::Number(number)) => self.block(number),
            BlockId::Hash(hash) => self
                .blocks
                .lock()
                .values()
                .filter_map(|answers| answers.front())
                .find(|block| block.hash == hash.block_hash)
                .copied()
                .with_context(|| format!("block {} does not exist", hash.block_hash)),
            other => bail!("unsupported block id {other:?}"),
        }
    }

    fn new_blocks(&self) -> BoxStream<'static, anyhow::Result<Block>> {
        let (sender, receiver) = mpsc::unbounded();
        *self.feed.lock() = Some(sender);
        receiver.boxed()
    }

    async fn get_logs_in_range(
        &self,
        _range: &BlockRange,
        _filter: &Filter,
    ) -> anyhow::Result<Vec<Log>> {
        Ok(Vec::new())
    }

    async fn get_transaction(&self, _hash: TxHash) -> anyhow::Result<Option<Transaction>> {
        Ok(None)
    }
}
