//! Reorg-safe ingestion of an Ethereum-like chain.
//!
//! A [`BlockDownloader`][downloader::BlockDownloader] keeps a consistent copy
//! of the canonical chain's block identities, repairing it when the chain
//! reorganizes. A [`SyncScheduler`][scheduler::SyncScheduler] hands the
//! accepted blocks to a data sync service in batches and has it discard
//! whatever a reorganization invalidated.

pub mod block;
pub mod block_range;
pub mod continuous_blocks;
pub mod downloader;
pub mod env;
pub mod job_queue;
pub mod provider;
pub mod repository;
pub mod retry;
pub mod scheduler;
#[cfg(test)]
mod test_utils;
pub mod tracing;
