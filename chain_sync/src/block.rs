use alloy::primitives::B256;
use serde::{Deserialize, Serialize};

/// Header fields of a block the downloader needs to follow the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
}

/// Identity of a stored block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KnownBlock {
    pub number: u64,
    pub hash: B256,
}

impl KnownBlock {
    pub const fn new(number: u64, hash: B256) -> Self {
        Self { number, hash }
    }
}

impl From<Block> for KnownBlock {
    fn from(block: Block) -> Self {
        Self::new(block.number, block.hash)
    }
}

impl From<&Block> for KnownBlock {
    fn from(block: &Block) -> Self {
        Self::new(block.number, block.hash)
    }
}

impl From<&alloy::rpc::types::Block> for Block {
    fn from(block: &alloy::rpc::types::Block) -> Self {
        Self {
            number: block.header.number,
            hash: block.header.hash,
            parent_hash: block.header.parent_hash,
            timestamp: block.header.timestamp,
        }
    }
}

/// Whether every block's parent hash is the hash of the block before it.
pub fn is_consistent_chain(blocks: &[Block]) -> bool {
    blocks
        .windows(2)
        .all(|pair| pair[1].parent_hash == pair[0].hash && pair[1].number == pair[0].number + 1)
}
