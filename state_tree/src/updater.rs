//! Keeps the position tree in step with state transitions published
//! on-chain.

use std::sync::Arc;

use hex_literal::hex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    db::MerkleStorage,
    funding::{calculate_updated_positions, PositionTransition, UpdateError},
    hash::{pedersen, PedersenHash},
    leaf::MerkleLeaf,
    position::PositionLeaf,
    tree::{MerkleTree, MerkleTreeError},
};

/// Height of the perpetual position tree.
pub const POSITION_TREE_HEIGHT: u8 = 64;

/// Root of a position tree of [`POSITION_TREE_HEIGHT`] holding only empty
/// positions.
pub const EMPTY_POSITION_TREE_HASH: PedersenHash = PedersenHash(hex!(
    "052ddcbdd431a044cf838a71d194248640210b316d7b1a568997ecad9dec9626"
));

#[derive(Debug, Error)]
pub enum StateUpdateError {
    #[error(
        "State transition calculated incorrectly (expected: {expected}, calculated: {calculated})"
    )]
    RootMismatch {
        expected: PedersenHash,
        calculated: PedersenHash,
    },

    #[error(transparent)]
    Update(#[from] UpdateError),

    #[error(transparent)]
    Tree(#[from] MerkleTreeError),
}

/// A verified state transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub id: u64,
    pub block_number: u64,
    pub root_hash: PedersenHash,
}

/// Root of a tree of `height` filled with `empty`.
pub fn empty_root<T: MerkleLeaf>(height: u8, empty: &T) -> PedersenHash {
    (0..height).fold(empty.hash(), |hash, _| pedersen(&hash, &hash))
}

/// Applies state transitions to the position tree and checks every new root
/// against the commitment published with the transition.
pub struct StateUpdater<S> {
    storage: Arc<S>,
    height: u8,
    tree: Option<MerkleTree<PositionLeaf, S>>,
    history: Vec<StateUpdate>,
}

impl<S: MerkleStorage<PositionLeaf>> StateUpdater<S> {
    pub fn new(storage: Arc<S>, height: u8) -> Self {
        Self {
            storage,
            height,
            tree: None,
            history: Vec::new(),
        }
    }

    /// Resumes from previously verified updates.
    pub fn with_history(storage: Arc<S>, height: u8, history: Vec<StateUpdate>) -> Self {
        Self {
            history,
            ..Self::new(storage, height)
        }
    }

    pub fn last_update(&self) -> Option<&StateUpdate> {
        self.history.last()
    }

    pub fn history(&self) -> &[StateUpdate] {
        &self.history
    }

    /// The root the next transition must start from.
    pub fn current_root(&self) -> PedersenHash {
        match self.history.last() {
            Some(update) => update.root_hash,
            None => empty_root(self.height, &PositionLeaf::empty()),
        }
    }

    /// Returns a tree rooted at `old_root`, creating the empty tree or
    /// recovering a stored one as needed.
    pub async fn ensure_state_tree(
        &mut self,
        old_root: PedersenHash,
    ) -> Result<MerkleTree<PositionLeaf, S>, StateUpdateError> {
        if let Some(tree) = &self.tree {
            if tree.hash() == old_root {
                return Ok(tree.clone());
            }
        }
        let tree = if old_root == empty_root(self.height, &PositionLeaf::empty()) {
            MerkleTree::create(self.storage.clone(), self.height, PositionLeaf::empty()).await?
        } else {
            MerkleTree::recover(self.storage.clone(), self.height, old_root)?
        };
        self.tree = Some(tree.clone());
        Ok(tree)
    }

    /// Applies one transition included in `block_number`. Nothing is stored
    /// unless the resulting root equals `expected_root`.
    pub async fn apply(
        &mut self,
        block_number: u64,
        transition: &PositionTransition,
        expected_root: PedersenHash,
    ) -> Result<StateUpdate, StateUpdateError> {
        let tree = self.ensure_state_tree(self.current_root()).await?;
        let updates = calculate_updated_positions(&tree, transition).await?;
        let (tree, values) = tree.update(updates).await?;

        let calculated = tree.hash();
        if calculated != expected_root {
            warn!(%expected_root, %calculated, block_number, "state root mismatch");
            return Err(StateUpdateError::RootMismatch {
                expected: expected_root,
                calculated,
            });
        }
        tree.persist(&values).await?;

        let update = StateUpdate {
            id: self.history.last().map_or(1, |last| last.id + 1),
            block_number,
            root_hash: calculated,
        };
        info!(id = update.id, block_number, root = %calculated, "State updated");
        self.history.push(update.clone());
        self.tree = Some(tree);
        Ok(update)
    }

    /// Forgets transitions included after `block_number` and rewinds the
    /// tree to the last surviving root.
    pub async fn discard_after(&mut self, block_number: u64) -> Result<(), StateUpdateError> {
        let before = self.history.len();
        self.history
            .retain(|update| update.block_number <= block_number);
        info!(
            block_number,
            discarded = before - self.history.len(),
            "discarded state updates"
        );
        self.ensure_state_tree(self.current_root()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::MemoryDb,
        funding::{AssetBalance, FundingEntry, FundingIndex, PositionUpdate},
        hash::StarkKey,
        position::AssetId,
        tree::MerkleUpdate,
    };

    const HEIGHT: u8 = 4;

    fn transition(position_id: u64, collateral: i64) -> PositionTransition {
        let btc = AssetId::new("BTC-10").unwrap();
        PositionTransition {
            positions: vec![PositionUpdate {
                position_id,
                stark_key: StarkKey::from_hex("cafe").unwrap(),
                collateral_balance: collateral,
                funding_timestamp: 5,
                balances: vec![AssetBalance {
                    asset_id: btc.clone(),
                    balance: 2,
                }],
            }],
            funding: vec![FundingEntry {
                timestamp: 5,
                indices: vec![FundingIndex {
                    asset_id: btc,
                    value: 3,
                }],
            }],
            old_state: FundingEntry {
                timestamp: 1,
                indices: vec![],
            },
        }
    }

    async fn expected_root(
        storage: Arc<MemoryDb<PositionLeaf>>,
        from: PedersenHash,
        transition: &PositionTransition,
    ) -> PedersenHash {
        let tree = if from == empty_root(HEIGHT, &PositionLeaf::empty()) {
            MerkleTree::create(storage, HEIGHT, PositionLeaf::empty())
                .await
                .unwrap()
        } else {
            MerkleTree::recover(storage, HEIGHT, from).unwrap()
        };
        let updates: Vec<MerkleUpdate<PositionLeaf>> =
            calculate_updated_positions(&tree, transition).await.unwrap();
        tree.update(updates).await.unwrap().0.hash()
    }

    #[tokio::test]
    async fn empty_position_tree_hash_matches_constant() {
        assert_eq!(
            empty_root(POSITION_TREE_HEIGHT, &PositionLeaf::empty()),
            EMPTY_POSITION_TREE_HASH
        );
        let tree = MerkleTree::create(
            Arc::new(MemoryDb::default()),
            POSITION_TREE_HEIGHT,
            PositionLeaf::empty(),
        )
        .await
        .unwrap();
        assert_eq!(tree.hash(), EMPTY_POSITION_TREE_HASH);
    }

    #[tokio::test]
    async fn applies_transitions_and_discards() {
        let storage = Arc::new(MemoryDb::default());
        let mut updater = StateUpdater::new(storage.clone(), HEIGHT);

        let first = transition(3, 10);
        let root1 = expected_root(storage.clone(), updater.current_root(), &first).await;
        let update = updater.apply(100, &first, root1).await.unwrap();
        assert_eq!(update.id, 1);
        assert_eq!(updater.current_root(), root1);

        let second = transition(9, 20);
        let root2 = expected_root(storage.clone(), root1, &second).await;
        updater.apply(105, &second, root2).await.unwrap();
        assert_eq!(updater.history().len(), 2);

        updater.discard_after(104).await.unwrap();
        assert_eq!(updater.current_root(), root1);
        let tree = updater.ensure_state_tree(root1).await.unwrap();
        assert_eq!(tree.get_leaf(3).await.unwrap().collateral_balance, 10);
        assert_eq!(tree.get_leaf(9).await.unwrap(), PositionLeaf::empty());
    }

    #[tokio::test]
    async fn rejects_wrong_root() {
        let storage = Arc::new(MemoryDb::default());
        let mut updater = StateUpdater::new(storage, HEIGHT);
        let err = updater
            .apply(100, &transition(3, 10), PedersenHash::from_u64(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StateUpdateError::RootMismatch { .. }));
        assert!(err
            .to_string()
            .starts_with("State transition calculated incorrectly"));
        assert!(updater.last_update().is_none());
    }
}
