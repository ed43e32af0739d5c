use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use cdn_types::{ItemId, ItemType, UnitId};

#[derive(Parser)]
#[command(
    name = "cdn",
    about = "Buffer, replicate and evict CI content across storage units",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Service configuration file
    #[arg(short, long, global = true, default_value = "cdn.toml")]
    pub config: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate the configuration and initialize every unit
    Check,
    /// Show unit health, replication backlog, and failures
    Status,
    /// Store a file in the buffer unit
    Put(PutArgs),
    /// Read an item back
    Get(GetArgs),
    /// Run one replication and eviction cycle
    Sync(SyncArgs),
    /// Run one eviction pass
    Evict,
    /// Clear a failure that needs attention
    Retry(RetryArgs),
    /// Print a new random encryption secret
    Keygen,
}

#[derive(Args)]
pub struct PutArgs {
    pub file: PathBuf,
    #[arg(long = "type", default_value = "step-log")]
    pub item_type: ItemType,
}

#[derive(Args)]
pub struct GetArgs {
    pub item: ItemId,
    /// Unit to read from (default: the first unit holding the item)
    #[arg(long)]
    pub unit: Option<UnitId>,
    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

#[derive(Args)]
pub struct SyncArgs {
    /// Keep running on the configured interval until interrupted
    #[arg(long)]
    pub watch: bool,
}

#[derive(Args)]
pub struct RetryArgs {
    pub item: ItemId,
    pub unit: UnitId,
}
