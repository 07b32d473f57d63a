//! The contract between tree leaves and the tree, plus the shared leaf error
//! type.

use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{
    hash::{pedersen, PedersenHash},
    proof::MerkleProofNode,
};

/// Errors raised while constructing leaf values.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum LeafError {
    /// Asset ids are ASCII strings of at most 15 characters.
    #[error("Invalid asset id: {0:?}")]
    InvalidAssetId(String),

    /// The asset count is packed into two bytes.
    #[error("Position holds too many assets: {0}")]
    TooManyAssets(usize),
}

/// A domain record stored at a tree index.
///
/// Implementors must memoize [`MerkleLeaf::hash`]: the tree calls it freely
/// and expects repeated calls to be free.
pub trait MerkleLeaf:
    Clone + Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// The value occupying every index of a freshly created tree.
    fn empty() -> Self;

    /// The canonical hash of this leaf.
    fn hash(&self) -> PedersenHash;

    /// Seeds the hash memo with a value read back from storage.
    fn with_known_hash(self, hash: PedersenHash) -> Self;

    /// The items folded into [`MerkleLeaf::hash`], in order. Leaves hashed
    /// directly from their fields return nothing.
    fn hash_items(&self) -> Vec<PedersenHash> {
        Vec::new()
    }

    /// Number of perpetual assets reported alongside proofs.
    fn perpetual_asset_count(&self) -> usize {
        0
    }

    /// Intermediate `{left, right}` pairs of the item fold, so a verifier can
    /// recompute the leaf hash from its packed items.
    fn proof_prefix(&self) -> Vec<MerkleProofNode> {
        let mut acc = PedersenHash::ZERO;
        self.hash_items()
            .into_iter()
            .map(|item| {
                let node = MerkleProofNode {
                    left: acc,
                    right: item,
                };
                acc = pedersen(&acc, &item);
                node
            })
            .collect()
    }
}
