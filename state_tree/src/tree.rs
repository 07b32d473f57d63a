use std::sync::Arc;

use hashbrown::HashSet;
use thiserror::Error;
use tracing::trace;

use crate::{
    db::{MerkleStorage, StorageError},
    hash::PedersenHash,
    leaf::MerkleLeaf,
    node::{Child, MerkleNode, NodeOrLeaf},
    proof::{MerkleProof, MerkleProofNode},
};

/// Deepest supported tree: indices span the whole `u64` range.
pub const MAX_HEIGHT: u8 = 64;

/// Errors raised by tree operations.
#[derive(Debug, Error)]
pub enum MerkleTreeError {
    /// The index does not address a leaf of this tree.
    #[error("Index out of bounds: {index} (max: {max})")]
    IndexOutOfBounds { index: u64, max: u64 },

    #[error("Invalid tree height: {0} (max: {MAX_HEIGHT})")]
    InvalidHeight(u8),

    /// A leaf was found where a node was expected, or the reverse.
    #[error("Tree structure corrupted")]
    Corrupted,

    #[error("Path of length {0} descends below the leaves")]
    PathTooLong(usize),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Replace the leaf at `index` with `value`.
#[derive(Clone, Debug, PartialEq)]
pub struct MerkleUpdate<T> {
    pub index: u64,
    pub value: T,
}

impl<T> MerkleUpdate<T> {
    pub fn new(index: u64, value: T) -> Self {
        Self { index, value }
    }
}

/// An immutable sparse Merkle tree of fixed height.
///
/// Nodes are loaded from the storage on demand. Updates return a new tree
/// that shares every untouched subtree with the receiver, so older trees
/// remain readable snapshots.
pub struct MerkleTree<T, S> {
    storage: Arc<S>,
    height: u8,
    root: Child<T>,
}

impl<T: MerkleLeaf, S> Clone for MerkleTree<T, S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            height: self.height,
            root: self.root.share(),
        }
    }
}

impl<T: MerkleLeaf, S> std::fmt::Debug for MerkleTree<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerkleTree")
            .field("height", &self.height)
            .field("root", &self.root.hash())
            .finish()
    }
}

impl<T: MerkleLeaf, S: MerkleStorage<T>> MerkleTree<T, S> {
    /// Builds a tree with `empty` at every index and persists its single
    /// chain of distinct nodes, leaf first.
    pub async fn create(storage: Arc<S>, height: u8, empty: T) -> Result<Self, MerkleTreeError> {
        check_height(height)?;
        let mut current = NodeOrLeaf::Leaf(Arc::new(empty));
        let mut values = vec![current.clone()];
        for _ in 0..height {
            current = NodeOrLeaf::Node(Arc::new(MerkleNode::new(current.clone(), current)));
            values.push(current.clone());
        }
        storage.persist(&values).await?;
        Ok(Self {
            storage,
            height,
            root: Child::Resolved(current),
        })
    }

    /// A tree whose nodes are loaded from `storage` as they are visited.
    pub fn recover(storage: Arc<S>, height: u8, root: PedersenHash) -> Result<Self, MerkleTreeError> {
        check_height(height)?;
        Ok(Self {
            storage,
            height,
            root: Child::unresolved(root),
        })
    }

    pub fn hash(&self) -> PedersenHash {
        self.root.hash()
    }

    pub fn height(&self) -> u8 {
        self.height
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// The largest valid leaf index.
    pub fn max_index(&self) -> u64 {
        match self.height {
            MAX_HEIGHT => u64::MAX,
            height => (1 << height) - 1,
        }
    }

    fn check_index(&self, index: u64) -> Result<(), MerkleTreeError> {
        let max = self.max_index();
        if index > max {
            return Err(MerkleTreeError::IndexOutOfBounds { index, max });
        }
        Ok(())
    }

    pub async fn get_leaf(&self, index: u64) -> Result<T, MerkleTreeError> {
        let mut leaves = self.get_leaves(&[index]).await?;
        leaves.pop().ok_or(MerkleTreeError::Corrupted)
    }

    /// Returns the leaves at `indices`, in the order requested.
    pub async fn get_leaves(&self, indices: &[u64]) -> Result<Vec<T>, MerkleTreeError> {
        for index in indices {
            self.check_index(*index)?;
        }
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let leaves = self
            .root
            .read(self.storage.as_ref(), self.height, 0, &sorted)
            .await?;
        indices
            .iter()
            .map(|index| {
                sorted
                    .binary_search(index)
                    .ok()
                    .and_then(|position| leaves.get(position))
                    .map(|leaf| leaf.as_ref().clone())
                    .ok_or(MerkleTreeError::Corrupted)
            })
            .collect()
    }

    /// Applies `updates` and returns the new tree together with every newly
    /// built node and leaf, children before parents. When an index repeats,
    /// the last update for it wins.
    pub async fn update(
        &self,
        mut updates: Vec<MerkleUpdate<T>>,
    ) -> Result<(Self, Vec<NodeOrLeaf<T>>), MerkleTreeError> {
        for update in &updates {
            self.check_index(update.index)?;
        }
        // Stable, so repeated indices keep their submission order.
        updates.sort_by_key(|update| update.index);

        let (root, values) = self
            .root
            .update(self.storage.as_ref(), self.height, 0, &updates)
            .await?;
        trace!(
            updates = updates.len(),
            new_values = values.len(),
            "updated merkle tree"
        );
        let tree = Self {
            storage: self.storage.clone(),
            height: self.height,
            root,
        };
        Ok((tree, values))
    }

    /// Writes `values` to the storage, skipping repeated hashes.
    pub async fn persist(&self, values: &[NodeOrLeaf<T>]) -> Result<(), MerkleTreeError> {
        let mut seen = HashSet::with_capacity(values.len());
        let unique: Vec<_> = values
            .iter()
            .filter(|value| seen.insert(value.hash()))
            .cloned()
            .collect();
        trace!(
            values = values.len(),
            unique = unique.len(),
            "persisting merkle values"
        );
        self.storage.persist(&unique).await?;
        Ok(())
    }

    /// [`MerkleTree::update`] followed by [`MerkleTree::persist`].
    pub async fn update_and_persist(
        &self,
        updates: Vec<MerkleUpdate<T>>,
    ) -> Result<Self, MerkleTreeError> {
        let (tree, values) = self.update(updates).await?;
        tree.persist(&values).await?;
        Ok(tree)
    }

    /// Follows `path` from the root, `false` descending left and `true`
    /// descending right.
    pub async fn get_node(&self, path: &[bool]) -> Result<NodeOrLeaf<T>, MerkleTreeError> {
        let storage = self.storage.as_ref();
        let mut current = self.root.resolve(storage).await?;
        for go_right in path {
            let NodeOrLeaf::Node(node) = current else {
                return Err(MerkleTreeError::PathTooLong(path.len()));
            };
            let child = if *go_right { &node.right } else { &node.left };
            current = child.resolve(storage).await?;
        }
        Ok(current)
    }

    pub async fn get_merkle_proof_for_leaf(
        &self,
        index: u64,
    ) -> Result<MerkleProof<T>, MerkleTreeError> {
        self.check_index(index)?;
        let storage = self.storage.as_ref();

        let mut levels = Vec::with_capacity(self.height as usize);
        let mut current = self.root.resolve(storage).await?;
        let mut start = 0u64;
        for height in (1..=self.height).rev() {
            let NodeOrLeaf::Node(node) = current else {
                return Err(MerkleTreeError::Corrupted);
            };
            levels.push(MerkleProofNode {
                left: node.left_hash(),
                right: node.right_hash(),
            });
            let center = start + (1 << (height - 1));
            current = if index < center {
                node.left.resolve(storage).await?
            } else {
                start = center;
                node.right.resolve(storage).await?
            };
        }
        let NodeOrLeaf::Leaf(leaf) = current else {
            return Err(MerkleTreeError::Corrupted);
        };

        let mut path = leaf.proof_prefix();
        let leaf_prefix_length = path.len();
        path.extend(levels.into_iter().rev());
        Ok(MerkleProof {
            leaf_index: index,
            leaf_prefix_length,
            path,
            perpetual_asset_count: leaf.perpetual_asset_count(),
            root: self.hash(),
            leaf: leaf.as_ref().clone(),
        })
    }
}

fn check_height(height: u8) -> Result<(), MerkleTreeError> {
    if height > MAX_HEIGHT {
        return Err(MerkleTreeError::InvalidHeight(height));
    }
    Ok(())
}
