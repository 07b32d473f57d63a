//! Persistent sparse Merkle trees over Pedersen hashes, used to mirror the
//! state of a StarkEx rollup and check it against the roots committed
//! on-chain.
//!
//! A [`MerkleTree`][tree::MerkleTree] is immutable: updating it yields a new
//! tree sharing every untouched subtree with the old one. Nodes that are not
//! in memory are referenced by hash and loaded through a
//! [`MerkleStorage`][db::MerkleStorage] the first time they are visited.

#![allow(clippy::too_long_first_doc_paragraph)]

pub mod db;
pub mod funding;
pub mod hash;
pub mod leaf;
pub mod node;
pub mod position;
pub mod proof;
pub mod tree;
pub mod updater;
mod utils;
pub mod vault;
