//! Spot vault leaves.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::{
    hash::{pedersen, PedersenHash, StarkKey},
    leaf::MerkleLeaf,
};

/// A spot vault: one owner, one token, one balance.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultLeaf {
    pub stark_key: StarkKey,
    pub token: PedersenHash,
    pub balance: u64,
    #[serde(skip)]
    hash: OnceCell<PedersenHash>,
}

impl VaultLeaf {
    pub fn new(stark_key: StarkKey, token: PedersenHash, balance: u64) -> Self {
        Self {
            stark_key,
            token,
            balance,
            hash: OnceCell::new(),
        }
    }
}

impl PartialEq for VaultLeaf {
    fn eq(&self, other: &Self) -> bool {
        self.stark_key == other.stark_key
            && self.token == other.token
            && self.balance == other.balance
    }
}

impl Eq for VaultLeaf {}

impl MerkleLeaf for VaultLeaf {
    fn empty() -> Self {
        Self::new(StarkKey::ZERO, PedersenHash::ZERO, 0)
    }

    /// `H(H(stark_key, token), balance)`.
    fn hash(&self) -> PedersenHash {
        *self.hash.get_or_init(|| {
            pedersen(
                &pedersen(&self.stark_key.as_hash(), &self.token),
                &PedersenHash::from_u64(self.balance),
            )
        })
    }

    fn with_known_hash(self, hash: PedersenHash) -> Self {
        let _ = self.hash.set(hash);
        self
    }
}
