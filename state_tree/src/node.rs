//! Tree nodes and their lazily resolved children.
//!
//! Nodes store neither their height nor their position. Both are derived
//! while descending from the root: a node of height `h` whose subtree starts
//! at index `start` sends indices below `start + 2^(h-1)` to its left child
//! and the rest to its right child.

use std::{fmt, sync::Arc};

use futures::{future::BoxFuture, try_join, FutureExt};
use once_cell::sync::OnceCell;

use crate::{
    db::MerkleStorage,
    hash::{pedersen, PedersenHash},
    leaf::MerkleLeaf,
    tree::{MerkleTreeError, MerkleUpdate},
};

/// Either an internal node or a leaf; the unit of persistence.
#[derive(Clone, Debug)]
pub enum NodeOrLeaf<T> {
    Node(Arc<MerkleNode<T>>),
    Leaf(Arc<T>),
}

impl<T: MerkleLeaf> NodeOrLeaf<T> {
    pub fn hash(&self) -> PedersenHash {
        match self {
            Self::Node(node) => node.hash(),
            Self::Leaf(leaf) => leaf.hash(),
        }
    }
}

/// A child reference. Unresolved children are fetched from storage on first
/// use and memoized in place.
#[derive(Clone, Debug)]
pub(crate) enum Child<T> {
    Resolved(NodeOrLeaf<T>),
    Unresolved {
        hash: PedersenHash,
        value: tokio::sync::OnceCell<NodeOrLeaf<T>>,
    },
}

impl<T: MerkleLeaf> Child<T> {
    pub(crate) fn unresolved(hash: PedersenHash) -> Self {
        Self::Unresolved {
            hash,
            value: tokio::sync::OnceCell::new(),
        }
    }

    pub(crate) fn hash(&self) -> PedersenHash {
        match self {
            Self::Resolved(value) => value.hash(),
            Self::Unresolved { hash, .. } => *hash,
        }
    }

    /// A copy for another tree, carrying over anything already resolved.
    pub(crate) fn share(&self) -> Self {
        match self {
            Self::Unresolved { value, .. } => match value.get() {
                Some(resolved) => Self::Resolved(resolved.clone()),
                None => self.clone(),
            },
            Self::Resolved(_) => self.clone(),
        }
    }

    pub(crate) async fn resolve<S: MerkleStorage<T>>(
        &self,
        storage: &S,
    ) -> Result<NodeOrLeaf<T>, MerkleTreeError> {
        match self {
            Self::Resolved(value) => Ok(value.clone()),
            Self::Unresolved { hash, value } => {
                let resolved = value.get_or_try_init(|| storage.recover(*hash)).await?;
                Ok(resolved.clone())
            }
        }
    }

    /// Reads `indices` (sorted) from the subtree of `height` rooted here.
    pub(crate) async fn read<S: MerkleStorage<T>>(
        &self,
        storage: &S,
        height: u8,
        start: u64,
        indices: &[u64],
    ) -> Result<Vec<Arc<T>>, MerkleTreeError> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        match self.resolve(storage).await? {
            NodeOrLeaf::Leaf(leaf) if height == 0 => Ok(vec![leaf; indices.len()]),
            NodeOrLeaf::Node(node) if height > 0 => {
                node.get_leaves(storage, height, start, indices).await
            }
            _ => Err(MerkleTreeError::Corrupted),
        }
    }

    /// Applies `updates` (stably sorted by index) to the subtree of `height`
    /// rooted here. Returns the replacement child and every new value in
    /// post-order.
    pub(crate) async fn update<S: MerkleStorage<T>>(
        &self,
        storage: &S,
        height: u8,
        start: u64,
        updates: &[MerkleUpdate<T>],
    ) -> Result<(Self, Vec<NodeOrLeaf<T>>), MerkleTreeError> {
        let Some(last) = updates.last() else {
            return Ok((self.share(), Vec::new()));
        };
        if height == 0 {
            let leaf = NodeOrLeaf::Leaf(Arc::new(last.value.clone()));
            return Ok((Self::Resolved(leaf.clone()), vec![leaf]));
        }
        match self.resolve(storage).await? {
            NodeOrLeaf::Node(node) => {
                let (node, values) = node.update(storage, height, start, updates).await?;
                Ok((Self::Resolved(NodeOrLeaf::Node(node)), values))
            }
            NodeOrLeaf::Leaf(_) => Err(MerkleTreeError::Corrupted),
        }
    }
}

/// An internal node. Its hash is `H(left, right)`, computed once.
pub struct MerkleNode<T> {
    pub(crate) left: Child<T>,
    pub(crate) right: Child<T>,
    hash: OnceCell<PedersenHash>,
}

impl<T: MerkleLeaf> MerkleNode<T> {
    pub fn new(left: NodeOrLeaf<T>, right: NodeOrLeaf<T>) -> Self {
        Self::with_children(Child::Resolved(left), Child::Resolved(right))
    }

    /// A node whose children are only known by hash.
    pub fn from_hashes(left: PedersenHash, right: PedersenHash) -> Self {
        Self::with_children(Child::unresolved(left), Child::unresolved(right))
    }

    pub(crate) fn with_children(left: Child<T>, right: Child<T>) -> Self {
        Self {
            left,
            right,
            hash: OnceCell::new(),
        }
    }

    pub fn with_known_hash(self, hash: PedersenHash) -> Self {
        let _ = self.hash.set(hash);
        self
    }

    pub fn hash(&self) -> PedersenHash {
        *self
            .hash
            .get_or_init(|| pedersen(&self.left.hash(), &self.right.hash()))
    }

    pub fn left_hash(&self) -> PedersenHash {
        self.left.hash()
    }

    pub fn right_hash(&self) -> PedersenHash {
        self.right.hash()
    }

    fn center(height: u8, start: u64) -> u64 {
        start + (1 << (height - 1))
    }

    fn get_leaves<'a, S: MerkleStorage<T>>(
        &'a self,
        storage: &'a S,
        height: u8,
        start: u64,
        indices: &'a [u64],
    ) -> BoxFuture<'a, Result<Vec<Arc<T>>, MerkleTreeError>> {
        async move {
            let center = Self::center(height, start);
            let (left, right) = indices.split_at(indices.partition_point(|i| *i < center));
            let (mut leaves, right) = try_join!(
                self.left.read(storage, height - 1, start, left),
                self.right.read(storage, height - 1, center, right),
            )?;
            leaves.extend(right);
            Ok(leaves)
        }
        .boxed()
    }

    fn update<'a, S: MerkleStorage<T>>(
        &'a self,
        storage: &'a S,
        height: u8,
        start: u64,
        updates: &'a [MerkleUpdate<T>],
    ) -> BoxFuture<'a, Result<(Arc<Self>, Vec<NodeOrLeaf<T>>), MerkleTreeError>> {
        async move {
            let center = Self::center(height, start);
            let (left, right) = updates.split_at(updates.partition_point(|u| u.index < center));
            let ((left, mut values), (right, right_values)) = try_join!(
                self.left.update(storage, height - 1, start, left),
                self.right.update(storage, height - 1, center, right),
            )?;
            values.extend(right_values);
            let node = Arc::new(Self::with_children(left, right));
            values.push(NodeOrLeaf::Node(node.clone()));
            Ok((node, values))
        }
        .boxed()
    }
}

impl<T> fmt::Debug for MerkleNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MerkleNode")
            .field("hash", &self.hash.get())
            .finish_non_exhaustive()
    }
}
