use alloy::primitives::Address;
use chain_sync::scheduler::SYNC_BATCH_SIZE;
use clap::{Parser, ValueHint};
use url::Url;

const RPC_HELP_HEADING: &str = "RPC options";

/// Follows the chain of an Ethereum JSON-RPC node and syncs its logs in
/// batches, undoing whatever a reorganization invalidates.
#[derive(Parser)]
#[command(version, propagate_version = true)]
pub(crate) struct Cli {
    /// The node RPC URL.
    #[arg(short = 'u', long, env = "CHAIN_FOLLOWER_RPC_URL", value_hint = ValueHint::Url, help_heading = RPC_HELP_HEADING)]
    pub(crate) rpc_url: Url,
    /// Seconds to wait before polling the chain head again.
    #[arg(long, env = "CHAIN_FOLLOWER_POLL_INTERVAL", default_value_t = 5, help_heading = RPC_HELP_HEADING)]
    pub(crate) poll_interval: u64,
    /// Retries of a failed RPC request after its first attempt.
    #[arg(long, env = "CHAIN_FOLLOWER_RPC_MAX_RETRIES", default_value_t = 3, help_heading = RPC_HELP_HEADING)]
    pub(crate) rpc_max_retries: u32,
    /// Milliseconds to wait before the first RPC retry. Doubles with every
    /// following one.
    #[arg(long, env = "CHAIN_FOLLOWER_RPC_BACKOFF", default_value_t = 500, help_heading = RPC_HELP_HEADING)]
    pub(crate) rpc_backoff: u64,

    /// The first block to download.
    #[arg(short = 's', long, env = "CHAIN_FOLLOWER_EARLIEST_BLOCK", default_value_t = 0)]
    pub(crate) earliest_block: u64,
    /// Deepest reorganization repaired before giving up.
    #[arg(long, env = "CHAIN_FOLLOWER_MAX_REORG_OFFSET", default_value_t = 1000)]
    pub(crate) max_reorg_offset: u64,
    /// Blocks handed to the log sync at once.
    #[arg(long, env = "CHAIN_FOLLOWER_SYNC_BATCH_SIZE", default_value_t = SYNC_BATCH_SIZE)]
    pub(crate) sync_batch_size: usize,
    /// Only sync the logs of this contract. Without it, only block ranges are
    /// reported.
    #[arg(short = 'a', long, env = "CHAIN_FOLLOWER_ADDRESS")]
    pub(crate) address: Option<Address>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn rpc_retries_follow_the_first_attempt() {
        Cli::command().debug_assert();
        let command = Cli::command();
        let retries = command
            .get_arguments()
            .find(|arg| arg.get_id() == "rpc_max_retries")
            .unwrap();
        assert!(retries
            .get_help()
            .unwrap()
            .to_string()
            .contains("after its first attempt"));

        let cli = Cli::try_parse_from(["chain_follower", "--rpc-url", "http://localhost:8545"])
            .unwrap();
        assert_eq!(cli.rpc_max_retries, 3);
        assert_eq!(cli.sync_batch_size, SYNC_BATCH_SIZE);
    }
}
