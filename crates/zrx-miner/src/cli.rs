//! Command-line surface.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "zrx-miner", about = "RandomX CPU miner", version)]
pub struct Args {
    /// Node RPC URL, e.g. http://127.0.0.1:8232
    #[arg(long, default_value = "http://127.0.0.1:8232")]
    pub rpc_url: String,

    /// RPC username
    #[arg(long)]
    pub rpc_user: Option<String>,

    /// RPC password. If `--rpc-user` is given without this, it is read
    /// interactively so it never lands in shell history.
    #[arg(long)]
    pub rpc_password: Option<String>,

    /// ZMQ notification endpoint. Accepted for compatibility; this miner
    /// polls `getblockchaininfo` instead of subscribing to push notifications.
    #[arg(long)]
    pub zmq_url: Option<String>,

    /// Number of mining threads (defaults to logical CPU count).
    #[arg(long)]
    pub threads: Option<usize>,

    /// Seconds between unconditional template refreshes.
    #[arg(long, default_value_t = 5)]
    pub update_interval: u64,

    /// Seconds between chain-tip polls used to detect a new block.
    #[arg(long, default_value_t = 2)]
    pub block_check: u64,

    /// Use full mode (~2GB shared dataset) instead of light mode.
    #[arg(long)]
    pub fast_mode: bool,

    /// Enable NUMA-aware cache/thread placement.
    #[arg(long)]
    pub numa: bool,

    /// Don't query/display the wallet balance.
    #[arg(long)]
    pub no_balance: bool,

    #[arg(long)]
    pub debug: bool,

    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[arg(long, default_value_t = true)]
    pub log_console: bool,
}

impl Args {
    pub fn resolved_threads(&self) -> usize {
        self.threads.unwrap_or_else(default_threads)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval)
    }

    pub fn block_check_interval(&self) -> Duration {
        Duration::from_secs(self.block_check)
    }
}

fn default_threads() -> usize {
    num_cpus::get()
}
