//! Pure state machine deciding which blocks to sync next and when synced
//! data has to be discarded.

use thiserror::Error;

use crate::block::KnownBlock;
use crate::block_range::BlockRange;
use crate::continuous_blocks::{ContinuityError, ContinuousBlocks};

/// Maximum number of blocks handed to one `sync` effect.
pub const SYNC_BATCH_SIZE: usize = 6000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncSchedulerError {
    #[error("Sync scheduler already initialized")]
    AlreadyInitialized,

    #[error("Reorg reported without any blocks")]
    EmptyReorg,

    #[error(transparent)]
    Continuity(#[from] ContinuityError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncState {
    pub is_initialized: bool,
    pub is_processing: bool,
    pub discard_required: bool,
    pub latest_block_processed: u64,
    pub blocks_to_process: ContinuousBlocks,
    pub blocks_processing: Vec<KnownBlock>,
    /// Block after which the in-flight discard removes data.
    pub pending_discard: Option<u64>,
}

impl SyncState {
    /// State of a scheduler whose data is synced up to
    /// `latest_block_processed`.
    pub fn new(latest_block_processed: u64) -> Self {
        Self {
            latest_block_processed,
            ..Self::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncAction {
    Init(Vec<KnownBlock>),
    NewBlocks(Vec<KnownBlock>),
    /// Blocks of the new fork, starting at the first changed block.
    Reorg(Vec<KnownBlock>),
    SyncFinished { success: bool },
    DiscardFinished { success: bool },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEffect {
    Sync(BlockRange),
    DiscardAfter(u64),
}

/// Applies `action` to `state`. The returned effects must be run by the
/// caller, which reports back with the matching `*Finished` action.
pub fn reduce(
    state: &SyncState,
    action: SyncAction,
    batch_size: usize,
) -> Result<(SyncState, Vec<SyncEffect>), SyncSchedulerError> {
    let next = match action {
        SyncAction::Init(blocks) => {
            if state.is_initialized {
                return Err(SyncSchedulerError::AlreadyInitialized);
            }
            SyncState {
                is_initialized: true,
                blocks_to_process: state.blocks_to_process.prepend_earlier(&blocks)?,
                ..state.clone()
            }
        }
        SyncAction::NewBlocks(blocks) => SyncState {
            blocks_to_process: state.blocks_to_process.concat(&blocks)?,
            ..state.clone()
        },
        SyncAction::Reorg(blocks) => {
            let fork = blocks.first().ok_or(SyncSchedulerError::EmptyReorg)?.number;
            if state.latest_block_processed >= fork {
                SyncState {
                    discard_required: true,
                    latest_block_processed: fork.saturating_sub(1),
                    blocks_processing: state
                        .blocks_processing
                        .iter()
                        .filter(|block| block.number < fork)
                        .copied()
                        .collect(),
                    blocks_to_process: ContinuousBlocks::new(blocks)?,
                    ..state.clone()
                }
            } else {
                SyncState {
                    blocks_to_process: state.blocks_to_process.replace_tail(&blocks)?,
                    ..state.clone()
                }
            }
        }
        SyncAction::SyncFinished { success: true } => SyncState {
            is_processing: false,
            blocks_processing: Vec::new(),
            ..state.clone()
        },
        SyncAction::SyncFinished { success: false } => SyncState {
            is_processing: false,
            blocks_processing: Vec::new(),
            blocks_to_process: state
                .blocks_to_process
                .prepend_earlier(&state.blocks_processing)?,
            ..state.clone()
        },
        SyncAction::DiscardFinished { success } => {
            // A reorg below the discarded block arrived meanwhile.
            let deeper_reorg = state
                .pending_discard
                .map_or(false, |after| state.latest_block_processed < after);
            SyncState {
                is_processing: false,
                discard_required: state.discard_required && (!success || deeper_reorg),
                pending_discard: None,
                ..state.clone()
            }
        }
    };
    Ok(process(next, batch_size))
}

fn process(state: SyncState, batch_size: usize) -> (SyncState, Vec<SyncEffect>) {
    if !state.is_initialized || state.is_processing {
        return (state, Vec::new());
    }

    if state.discard_required {
        let discard_after = state
            .blocks_to_process
            .first()
            .map_or(state.latest_block_processed, |first| {
                state
                    .latest_block_processed
                    .min(first.number.saturating_sub(1))
            });
        return (
            SyncState {
                is_processing: true,
                latest_block_processed: discard_after,
                pending_discard: Some(discard_after),
                ..state
            },
            vec![SyncEffect::DiscardAfter(discard_after)],
        );
    }

    let (batch, rest) = state.blocks_to_process.take(batch_size);
    let Some(last) = batch.last() else {
        return (state, Vec::new());
    };
    let range = BlockRange::from_blocks(batch.iter().copied());
    (
        SyncState {
            is_processing: true,
            latest_block_processed: last.number,
            blocks_to_process: rest,
            blocks_processing: batch,
            ..state
        },
        vec![SyncEffect::Sync(range)],
    )
}
