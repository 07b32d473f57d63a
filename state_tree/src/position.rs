//! Perpetual position leaves.

use std::fmt;

use itertools::Itertools;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::{
    hash::{PedersenHash, StarkKey},
    leaf::{LeafError, MerkleLeaf},
    utils::{bias_i64, hash_chain, pack_bytes},
};

const MAX_ASSET_ID_LEN: usize = 15;

/// Ticker-like identifier of a synthetic asset, e.g. `BTC-10`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AssetId(String);

impl AssetId {
    pub fn new(id: impl Into<String>) -> Result<Self, LeafError> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_ASSET_ID_LEN || !id.is_ascii() {
            return Err(LeafError::InvalidAssetId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// ASCII bytes right-padded with zeros to 15 bytes, inside a 16-byte
    /// field.
    pub fn encode(&self) -> [u8; 16] {
        let mut bytes = [0; 16];
        bytes[1..1 + self.0.len()].copy_from_slice(self.0.as_bytes());
        bytes
    }
}

impl TryFrom<String> for AssetId {
    type Error = LeafError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<AssetId> for String {
    fn from(value: AssetId) -> Self {
        value.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Balance of one synthetic asset held by a position.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionAsset {
    pub asset_id: AssetId,
    pub balance: i64,
    pub funding_index: i64,
}

impl PositionAsset {
    /// `asset_id:16 | funding_index:8 | balance:8`.
    pub fn pack(&self) -> PedersenHash {
        pack_bytes(&[
            &self.asset_id.encode(),
            &bias_i64(self.funding_index),
            &bias_i64(self.balance),
        ])
    }
}

/// A perpetual trading position: collateral plus synthetic asset balances.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionLeaf {
    pub stark_key: StarkKey,
    pub collateral_balance: i64,
    pub assets: Vec<PositionAsset>,
    #[serde(skip)]
    hash: OnceCell<PedersenHash>,
}

impl PositionLeaf {
    pub fn new(
        stark_key: StarkKey,
        collateral_balance: i64,
        assets: Vec<PositionAsset>,
    ) -> Result<Self, LeafError> {
        if assets.len() > u16::MAX as usize {
            return Err(LeafError::TooManyAssets(assets.len()));
        }
        Ok(Self {
            stark_key,
            collateral_balance,
            assets,
            hash: OnceCell::new(),
        })
    }

    /// `collateral_balance:8 | asset_count:2`.
    fn pack_position(&self) -> PedersenHash {
        // Bounded by the constructor.
        let count = self.assets.len() as u16;
        pack_bytes(&[&bias_i64(self.collateral_balance), &count.to_be_bytes()])
    }
}

impl PartialEq for PositionLeaf {
    fn eq(&self, other: &Self) -> bool {
        self.stark_key == other.stark_key
            && self.collateral_balance == other.collateral_balance
            && self.assets == other.assets
    }
}

impl Eq for PositionLeaf {}

impl MerkleLeaf for PositionLeaf {
    fn empty() -> Self {
        Self {
            stark_key: StarkKey::ZERO,
            collateral_balance: 0,
            assets: Vec::new(),
            hash: OnceCell::new(),
        }
    }

    fn hash(&self) -> PedersenHash {
        *self.hash.get_or_init(|| hash_chain(&self.hash_items()))
    }

    fn with_known_hash(self, hash: PedersenHash) -> Self {
        let _ = self.hash.set(hash);
        self
    }

    /// Sorted packed assets, then the stark key, then the packed position.
    fn hash_items(&self) -> Vec<PedersenHash> {
        self.assets
            .iter()
            .map(PositionAsset::pack)
            .sorted()
            .chain([self.stark_key.as_hash(), self.pack_position()])
            .collect()
    }

    fn perpetual_asset_count(&self) -> usize {
        self.assets.len()
    }
}

#[cfg(test)]
mod tests {
    use hex_literal::hex;

    use super::*;

    fn asset(id: &str, balance: i64, funding_index: i64) -> PositionAsset {
        PositionAsset {
            asset_id: AssetId::new(id).unwrap(),
            balance,
            funding_index,
        }
    }

    #[test]
    fn encodes_asset_ids() {
        assert_eq!(
            AssetId::new("BTC-10").unwrap().encode(),
            hex!("004254432d3130000000000000000000")
        );
        assert!(AssetId::new("").is_err());
        assert!(AssetId::new("A-VERY-LONG-ASSET").is_err());
    }

    #[test]
    fn packs_assets() {
        assert_eq!(
            asset("BTC-10", 3, 4).pack(),
            PedersenHash(hex!(
                "004254432d313000000000000000000080000000000000048000000000000003"
            ))
        );
    }

    #[test]
    fn hashes_empty_leaf() {
        assert_eq!(
            PositionLeaf::empty().hash(),
            PedersenHash(hex!(
                "028109b4e56fad0455aa4b316045c93937b1e7e4e0fc663db375b9e67c80c620"
            ))
        );
    }

    #[test]
    fn hashes_leaf_with_asset() {
        let leaf = PositionLeaf::new(
            StarkKey::from_hex("1").unwrap(),
            2,
            vec![asset("BTC-10", 3, 4)],
        )
        .unwrap();
        assert_eq!(
            leaf.hash(),
            PedersenHash(hex!(
                "0221150d3ed66e22364cfcaa34e69e2d6bc11ee0c0b90ab0b64e511b71eef16d"
            ))
        );
    }

    #[test]
    fn asset_order_does_not_change_hash() {
        let key = StarkKey::from_hex("1").unwrap();
        let a = PositionLeaf::new(key, 2, vec![asset("ETH-9", 3, 4), asset("BTC-10", 5, 6)])
            .unwrap();
        let b = PositionLeaf::new(key, 2, vec![asset("BTC-10", 5, 6), asset("ETH-9", 3, 4)])
            .unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(
            a.hash(),
            PedersenHash(hex!(
                "0421f86905759640afc3e73a02b5cd26088be2d3e84995f4ff4b950ca0487cca"
            ))
        );
    }

    #[test]
    fn known_hash_is_not_recomputed() {
        let bogus = PedersenHash::from_u64(42);
        let leaf = PositionLeaf::empty().with_known_hash(bogus);
        assert_eq!(leaf.hash(), bogus);
        assert_eq!(leaf, PositionLeaf::empty());
    }

    #[test]
    fn json_round_trip_keeps_fields() {
        let leaf = PositionLeaf::new(
            StarkKey::from_hex("dead").unwrap(),
            -7,
            vec![asset("ETH-9", -3, 11)],
        )
        .unwrap();
        let json = serde_json::to_value(&leaf).unwrap();
        assert_eq!(json["collateralBalance"], -7);
        assert_eq!(json["assets"][0]["assetId"], "ETH-9");
        let back: PositionLeaf = serde_json::from_value(json).unwrap();
        assert_eq!(back, leaf);
        assert_eq!(back.hash(), leaf.hash());
    }

    #[test]
    fn proof_prefix_folds_items() {
        let leaf = PositionLeaf::new(
            StarkKey::from_hex("1").unwrap(),
            2,
            vec![asset("BTC-10", 3, 4)],
        )
        .unwrap();
        let prefix = leaf.proof_prefix();
        assert_eq!(prefix.len(), 3);
        assert_eq!(prefix[0].left, PedersenHash::ZERO);
        assert_eq!(prefix[0].right, asset("BTC-10", 3, 4).pack());
        assert_eq!(prefix[1].right, leaf.stark_key.as_hash());
        let last = &prefix[2];
        assert_eq!(crate::hash::pedersen(&last.left, &last.right), leaf.hash());
    }
}
