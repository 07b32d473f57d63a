use std::{future::Future, marker::PhantomData, sync::Arc};

use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    hash::PedersenHash,
    leaf::MerkleLeaf,
    node::{MerkleNode, NodeOrLeaf},
};

/// Errors surfaced by [`MerkleStorage`] implementations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A hash referenced by the tree is absent. The stored tree is broken.
    #[error("Tree structure corrupted: cannot find node or leaf {0}")]
    Missing(PedersenHash),

    /// A stored record could not be decoded back into a leaf.
    #[error("Cannot decode stored value {hash}: {source}")]
    Decode {
        hash: PedersenHash,
        #[source]
        source: serde_json::Error,
    },

    /// A leaf could not be serialized into a record.
    #[error("Cannot encode leaf {hash}: {source}")]
    Encode {
        hash: PedersenHash,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Content-addressed persistence of tree nodes and leaves.
pub trait MerkleStorage<T: MerkleLeaf>: Send + Sync {
    /// Loads the node or leaf with the given hash. Children of recovered
    /// nodes stay unresolved.
    fn recover(
        &self,
        hash: PedersenHash,
    ) -> impl Future<Output = Result<NodeOrLeaf<T>, StorageError>> + Send;

    /// Upserts values keyed by their hash.
    fn persist(
        &self,
        values: &[NodeOrLeaf<T>],
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// The serialized form of a [`NodeOrLeaf`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StoredValue {
    Node {
        left: PedersenHash,
        right: PedersenHash,
    },
    Leaf {
        value: serde_json::Value,
    },
}

impl StoredValue {
    pub fn encode<T: MerkleLeaf>(value: &NodeOrLeaf<T>) -> Result<Self, StorageError> {
        Ok(match value {
            NodeOrLeaf::Node(node) => Self::Node {
                left: node.left_hash(),
                right: node.right_hash(),
            },
            NodeOrLeaf::Leaf(leaf) => Self::Leaf {
                value: serde_json::to_value(leaf.as_ref()).map_err(|source| {
                    StorageError::Encode {
                        hash: leaf.hash(),
                        source,
                    }
                })?,
            },
        })
    }

    pub fn decode<T: MerkleLeaf>(self, hash: PedersenHash) -> Result<NodeOrLeaf<T>, StorageError> {
        Ok(match self {
            Self::Node { left, right } => NodeOrLeaf::Node(Arc::new(
                MerkleNode::from_hashes(left, right).with_known_hash(hash),
            )),
            Self::Leaf { value } => {
                let leaf: T = serde_json::from_value(value)
                    .map_err(|source| StorageError::Decode { hash, source })?;
                NodeOrLeaf::Leaf(Arc::new(leaf.with_known_hash(hash)))
            }
        })
    }
}

/// Storage backed by an in-process map of serialized records.
#[derive(Debug)]
pub struct MemoryDb<T> {
    records: RwLock<HashMap<PedersenHash, StoredValue>>,
    _leaf: PhantomData<fn() -> T>,
}

impl<T> Default for MemoryDb<T> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            _leaf: PhantomData,
        }
    }
}

impl<T> MemoryDb<T> {
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn contains(&self, hash: &PedersenHash) -> bool {
        self.records.read().contains_key(hash)
    }
}

impl<T: MerkleLeaf> MerkleStorage<T> for MemoryDb<T> {
    async fn recover(&self, hash: PedersenHash) -> Result<NodeOrLeaf<T>, StorageError> {
        let record = self
            .records
            .read()
            .get(&hash)
            .cloned()
            .ok_or(StorageError::Missing(hash))?;
        record.decode(hash)
    }

    async fn persist(&self, values: &[NodeOrLeaf<T>]) -> Result<(), StorageError> {
        let encoded = values
            .iter()
            .map(|value| Ok((value.hash(), StoredValue::encode(value)?)))
            .collect::<Result<Vec<_>, StorageError>>()?;
        self.records.write().extend(encoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde::{ser, Serializer};

    use super::*;
    use crate::vault::VaultLeaf;

    #[derive(Clone, Debug, PartialEq, Deserialize)]
    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(ser::Error::custom("not serializable"))
        }
    }

    impl MerkleLeaf for Unserializable {
        fn empty() -> Self {
            Self
        }

        fn hash(&self) -> PedersenHash {
            PedersenHash::ZERO
        }

        fn with_known_hash(self, _hash: PedersenHash) -> Self {
            self
        }
    }

    #[test]
    fn serialization_failure_is_an_encode_error() {
        let err = StoredValue::encode(&NodeOrLeaf::Leaf(Arc::new(Unserializable))).unwrap_err();
        assert!(matches!(err, StorageError::Encode { .. }));
        assert!(err.to_string().starts_with("Cannot encode leaf"));
    }

    #[test]
    fn malformed_record_is_a_decode_error() {
        let record = StoredValue::Leaf {
            value: serde_json::json!(42),
        };
        let err = record.decode::<VaultLeaf>(PedersenHash::ZERO).unwrap_err();
        assert!(matches!(err, StorageError::Decode { .. }));
    }
}
