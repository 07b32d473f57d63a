use serde::{Deserialize, Serialize};

use crate::{
    hash::{pedersen, PedersenHash},
    leaf::MerkleLeaf,
};

/// One hashing step of a proof: `H(left, right)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProofNode {
    pub left: PedersenHash,
    pub right: PedersenHash,
}

impl MerkleProofNode {
    pub fn hash(&self) -> PedersenHash {
        pedersen(&self.left, &self.right)
    }
}

/// Inclusion proof of a leaf.
///
/// `path` starts with the `leaf_prefix_length` steps that rebuild the leaf
/// hash from its packed items, followed by one step per tree level from the
/// leaf up to the root.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof<T> {
    pub leaf: T,
    pub leaf_index: u64,
    pub leaf_prefix_length: usize,
    pub path: Vec<MerkleProofNode>,
    pub perpetual_asset_count: usize,
    pub root: PedersenHash,
}

impl<T: MerkleLeaf> MerkleProof<T> {
    /// Recomputes the root from the leaf and the path.
    pub fn verify(&self) -> bool {
        if self.path.len() < self.leaf_prefix_length {
            return false;
        }
        let (prefix, levels) = self.path.split_at(self.leaf_prefix_length);

        let mut acc = PedersenHash::ZERO;
        for step in prefix {
            if step.left != acc {
                return false;
            }
            acc = step.hash();
        }
        let mut current = self.leaf.hash();
        if !prefix.is_empty() && acc != current {
            return false;
        }

        let mut index = self.leaf_index;
        for step in levels {
            let side = if index & 1 == 0 { step.left } else { step.right };
            if side != current {
                return false;
            }
            current = step.hash();
            index >>= 1;
        }
        current == self.root
    }
}
