//! Derivation of position leaf updates from on-chain state transition data.

use hashbrown::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    db::MerkleStorage,
    hash::StarkKey,
    leaf::LeafError,
    position::{AssetId, PositionAsset, PositionLeaf},
    tree::{MerkleTree, MerkleTreeError, MerkleUpdate},
};

/// Seconds since the unix epoch, as published with funding ticks.
pub type Timestamp = u64;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Missing funding for timestamp: {0}!")]
    MissingFundingTimestamp(Timestamp),

    #[error("Missing funding for asset: {0}!")]
    MissingFundingAsset(AssetId),

    #[error(transparent)]
    Leaf(#[from] LeafError),

    #[error(transparent)]
    Tree(#[from] MerkleTreeError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub asset_id: AssetId,
    pub balance: i64,
}

/// The new state of one position as published in a state transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub position_id: u64,
    pub stark_key: StarkKey,
    pub collateral_balance: i64,
    pub funding_timestamp: Timestamp,
    pub balances: Vec<AssetBalance>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingIndex {
    pub asset_id: AssetId,
    pub value: i64,
}

/// Funding indices valid at `timestamp`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingEntry {
    pub timestamp: Timestamp,
    pub indices: Vec<FundingIndex>,
}

/// The position-related part of one on-chain state transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionTransition {
    pub positions: Vec<PositionUpdate>,
    pub funding: Vec<FundingEntry>,
    /// Funding in force before the transition.
    pub old_state: FundingEntry,
}

type FundingByTimestamp<'a> = HashMap<Timestamp, HashMap<&'a AssetId, i64>>;

fn funding_by_timestamp(transition: &PositionTransition) -> FundingByTimestamp<'_> {
    std::iter::once(&transition.old_state)
        .chain(&transition.funding)
        .map(|entry| {
            let indices = entry
                .indices
                .iter()
                .map(|index| (&index.asset_id, index.value))
                .collect();
            (entry.timestamp, indices)
        })
        .collect()
}

/// Builds the leaf updates a transition applies to `tree`.
///
/// Assets mentioned by an update replace the old ones, zero balances drop
/// the asset, and every asset of the resulting position takes the funding
/// index in force at the update's funding timestamp.
pub async fn calculate_updated_positions<S: MerkleStorage<PositionLeaf>>(
    tree: &MerkleTree<PositionLeaf, S>,
    transition: &PositionTransition,
) -> Result<Vec<MerkleUpdate<PositionLeaf>>, UpdateError> {
    let funding = funding_by_timestamp(transition);
    let ids: Vec<_> = transition.positions.iter().map(|p| p.position_id).collect();
    let old_positions = tree.get_leaves(&ids).await?;

    old_positions
        .into_iter()
        .zip(&transition.positions)
        .map(|(old, update)| {
            // Some published positions carry a zero timestamp; the funding
            // of the previous state is the one that reproduces the root.
            let timestamp = match update.funding_timestamp {
                0 => transition.old_state.timestamp,
                timestamp => timestamp,
            };
            let indices = funding
                .get(&timestamp)
                .ok_or(UpdateError::MissingFundingTimestamp(timestamp))?;

            let kept = old.assets.into_iter().filter(|asset| {
                !update
                    .balances
                    .iter()
                    .any(|changed| changed.asset_id == asset.asset_id)
            });
            let added = update
                .balances
                .iter()
                .filter(|changed| changed.balance != 0)
                .map(|changed| PositionAsset {
                    asset_id: changed.asset_id.clone(),
                    balance: changed.balance,
                    funding_index: 0,
                });
            let assets = kept
                .chain(added)
                .map(|asset| {
                    let funding_index = *indices
                        .get(&asset.asset_id)
                        .ok_or_else(|| UpdateError::MissingFundingAsset(asset.asset_id.clone()))?;
                    Ok(PositionAsset {
                        funding_index,
                        ..asset
                    })
                })
                .collect::<Result<Vec<_>, UpdateError>>()?;

            let leaf = PositionLeaf::new(update.stark_key, update.collateral_balance, assets)?;
            Ok(MerkleUpdate::new(update.position_id, leaf))
        })
        .collect()
}
