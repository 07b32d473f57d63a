use std::collections::BTreeMap;
use std::fmt::Display;
use std::ops::Range;

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::KnownBlock;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("Invalid block range: end {end} is before start {start}")]
pub struct BlockRangeError {
    pub start: u64,
    pub end: u64,
}

/// Half-open range of block numbers `[start, end)` together with the hashes
/// known for some of them.
///
/// A range is used both to describe what was accepted from the chain and to
/// constrain what later queries may return: a number inside the range with
/// no recorded hash accepts any hash.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    start: u64,
    end: u64,
    hashes: BTreeMap<u64, B256>,
}

/// Result of [`BlockRange::split_by_known_hashes`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SplitRange {
    /// Leading numbers whose hash is not pinned.
    pub unknown: Range<u64>,
    /// Every block from `unknown.end` to the end of the range.
    pub known: Vec<KnownBlock>,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Result<Self, BlockRangeError> {
        if end < start {
            return Err(BlockRangeError { start, end });
        }
        Ok(Self {
            start,
            end,
            hashes: BTreeMap::new(),
        })
    }

    /// `[start, end)` with the hashes of `blocks` that fall inside it.
    pub fn with_blocks(
        start: u64,
        end: u64,
        blocks: impl IntoIterator<Item = KnownBlock>,
    ) -> Result<Self, BlockRangeError> {
        let mut range = Self::new(start, end)?;
        range.hashes = blocks
            .into_iter()
            .filter(|block| (start..end).contains(&block.number))
            .map(|block| (block.number, block.hash))
            .collect();
        Ok(range)
    }

    /// The tightest range covering `blocks`, with all of their hashes.
    pub fn from_blocks(blocks: impl IntoIterator<Item = KnownBlock>) -> Self {
        let hashes: BTreeMap<_, _> = blocks
            .into_iter()
            .map(|block| (block.number, block.hash))
            .collect();
        match (hashes.first_key_value(), hashes.last_key_value()) {
            (Some((&start, _)), Some((&last, _))) => Self {
                start,
                end: last + 1,
                hashes,
            },
            _ => Self::default(),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn contains(&self, number: u64) -> bool {
        (self.start..self.end).contains(&number)
    }

    pub fn hash(&self, number: u64) -> Option<B256> {
        self.hashes.get(&number).copied()
    }

    /// Whether a block with this number and hash can belong to the range.
    pub fn has(&self, number: u64, hash: B256) -> bool {
        self.contains(number) && self.hash(number).map_or(true, |known| known == hash)
    }

    pub fn has_all(&self, blocks: impl IntoIterator<Item = KnownBlock>) -> bool {
        blocks
            .into_iter()
            .all(|block| self.has(block.number, block.hash))
    }

    /// Blocks with a recorded hash, in number order.
    pub fn blocks(&self) -> Vec<KnownBlock> {
        self.hashes
            .iter()
            .map(|(&number, &hash)| KnownBlock::new(number, hash))
            .collect()
    }

    /// Smallest range covering both. Hashes of `other` win where both know
    /// one.
    pub fn merge(&self, other: &BlockRange) -> BlockRange {
        if self.is_empty() {
            return other.clone();
        }
        if other.is_empty() {
            return self.clone();
        }
        let mut hashes = self.hashes.clone();
        hashes.extend(&other.hashes);
        BlockRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            hashes,
        }
    }

    /// Splits off the first `count` numbers.
    pub fn take(&self, count: u64) -> (BlockRange, BlockRange) {
        let middle = self.start.saturating_add(count).min(self.end);
        let mut head = self.hashes.clone();
        let tail = head.split_off(&middle);
        (
            BlockRange {
                start: self.start,
                end: middle,
                hashes: head,
            },
            BlockRange {
                start: middle,
                end: self.end,
                hashes: tail,
            },
        )
    }

    /// The part of the range below `number`.
    pub fn truncate(&self, number: u64) -> BlockRange {
        self.take(number.saturating_sub(self.start)).0
    }

    /// Splits the range into the longest suffix whose hashes are all pinned
    /// and the prefix before it.
    pub fn split_by_known_hashes(&self) -> SplitRange {
        let unknown_end = (self.start..self.end)
            .rev()
            .take_while(|number| self.hashes.contains_key(number))
            .last()
            .unwrap_or(self.end);
        SplitRange {
            unknown: self.start..unknown_end,
            known: (unknown_end..self.end)
                .filter_map(|number| {
                    self.hash(number)
                        .map(|hash| KnownBlock::new(number, hash))
                })
                .collect(),
        }
    }
}

impl Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
