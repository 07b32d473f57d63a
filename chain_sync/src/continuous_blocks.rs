use thiserror::Error;

use crate::block::KnownBlock;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("Blocks are not continuous. Gap found at index: {index}")]
pub struct ContinuityError {
    pub index: usize,
}

/// A gap-free, ascending run of blocks waiting to be synced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContinuousBlocks {
    blocks: Vec<KnownBlock>,
}

impl ContinuousBlocks {
    pub fn new(blocks: Vec<KnownBlock>) -> Result<Self, ContinuityError> {
        if let Some(index) = blocks
            .windows(2)
            .position(|pair| pair[1].number != pair[0].number + 1)
        {
            return Err(ContinuityError { index: index + 1 });
        }
        Ok(Self { blocks })
    }

    pub fn first(&self) -> Option<&KnownBlock> {
        self.blocks.first()
    }

    pub fn last(&self) -> Option<&KnownBlock> {
        self.blocks.last()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn as_slice(&self) -> &[KnownBlock] {
        &self.blocks
    }

    /// Puts the blocks of `earlier` numbered below the current first block
    /// in front.
    pub fn prepend_earlier(&self, earlier: &[KnownBlock]) -> Result<Self, ContinuityError> {
        let blocks = earlier
            .iter()
            .filter(|block| self.first().map_or(true, |first| block.number < first.number))
            .chain(&self.blocks)
            .copied()
            .collect();
        Self::new(blocks)
    }

    /// Drops every block from the first number of `replacement` on and
    /// appends `replacement`.
    pub fn replace_tail(&self, replacement: &[KnownBlock]) -> Result<Self, ContinuityError> {
        let Some(from) = replacement.first() else {
            return Ok(self.clone());
        };
        let blocks = self
            .blocks
            .iter()
            .filter(|block| block.number < from.number)
            .chain(replacement)
            .copied()
            .collect();
        Self::new(blocks)
    }

    pub fn concat(&self, blocks: &[KnownBlock]) -> Result<Self, ContinuityError> {
        Self::new(self.blocks.iter().chain(blocks).copied().collect())
    }

    /// Splits off up to `count` blocks from the front.
    pub fn take(&self, count: usize) -> (Vec<KnownBlock>, Self) {
        let count = count.min(self.blocks.len());
        let (taken, rest) = self.blocks.split_at(count);
        (
            taken.to_vec(),
            Self {
                blocks: rest.to_vec(),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::keccak256;

    use super::*;

    fn blocks(numbers: impl IntoIterator<Item = u64>, fork: &str) -> Vec<KnownBlock> {
        numbers
            .into_iter()
            .map(|n| KnownBlock::new(n, keccak256(format!("{fork}{n}"))))
            .collect()
    }

    #[test]
    fn detects_gaps() {
        let mut run = blocks(1..4, "a");
        run.extend(blocks(5..6, "a"));
        let err = ContinuousBlocks::new(run).unwrap_err();
        assert_eq!(err.index, 3);
        assert_eq!(
            err.to_string(),
            "Blocks are not continuous. Gap found at index: 3"
        );
        assert!(ContinuousBlocks::new(vec![]).is_ok());
    }

    #[test]
    fn prepend_keeps_only_earlier() {
        let queue = ContinuousBlocks::new(blocks(5..8, "a")).unwrap();
        let merged = queue.prepend_earlier(&blocks(3..7, "b")).unwrap();
        assert_eq!(merged.len(), 5);
        assert_eq!(merged.first().unwrap().hash, keccak256("b3"));
        assert_eq!(merged.as_slice()[2].hash, keccak256("a5"));

        let empty = ContinuousBlocks::default();
        assert_eq!(empty.prepend_earlier(&blocks(3..5, "b")).unwrap().len(), 2);
        assert!(queue.prepend_earlier(&blocks(1..3, "b")).is_err());
    }

    #[test]
    fn replace_tail_overwrites_from_fork() {
        let queue = ContinuousBlocks::new(blocks(5..10, "a")).unwrap();
        let replaced = queue.replace_tail(&blocks(7..9, "b")).unwrap();
        assert_eq!(replaced.len(), 4);
        assert_eq!(replaced.last().unwrap().hash, keccak256("b8"));
        assert_eq!(replaced.as_slice()[1].hash, keccak256("a6"));
        assert_eq!(queue.replace_tail(&[]).unwrap(), queue);
        assert!(queue.replace_tail(&blocks(12..13, "b")).is_err());
    }

    #[test]
    fn concat_and_take() {
        let queue = ContinuousBlocks::new(blocks(1..3, "a")).unwrap();
        let queue = queue.concat(&blocks(3..6, "a")).unwrap();
        assert!(queue.concat(&blocks(7..8, "a")).is_err());

        let (taken, rest) = queue.take(2);
        assert_eq!(taken, blocks(1..3, "a"));
        assert_eq!(rest.first().unwrap().number, 3);
        let (taken, rest) = rest.take(10);
        assert_eq!(taken.len(), 3);
        assert!(rest.is_empty());
    }
}
