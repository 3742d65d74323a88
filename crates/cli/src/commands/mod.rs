// CLI subcommand dispatch.
//
// Every command attaches through one `Lifecycle` and shuts it down before
// returning, so handles the command drops are cleaned up before exit.

use anyhow::Context;
use clap::{Args, Subcommand};
use redmap_core::{Lifecycle, Liveness, MapConfig, SharedMap};

use crate::output::{self, OutputFormat};

pub mod hold;
pub mod read;
pub mod subscribers;
pub mod write;

#[derive(Subcommand)]
pub enum Command {
    /// Print the value stored under a key
    Get(read::GetArgs),
    /// Store a value, printing the one it replaced
    Put(write::PutArgs),
    /// Remove a key, printing the value it held
    Remove(write::RemoveArgs),
    /// List keys
    Keys(CollectionArgs),
    /// List values
    Values(CollectionArgs),
    /// List key/value pairs
    Entries(CollectionArgs),
    /// Count entries
    Size(CollectionArgs),
    /// Remove every entry
    Clear(CollectionArgs),
    /// Show how many handles are attached across all processes
    Subscribers(CollectionArgs),
    /// Keep a handle attached until ctrl-c or a timeout
    Hold(hold::HoldArgs),
}

#[derive(Debug, Args)]
pub struct CollectionArgs {
    /// Collection name.
    pub name: String,
}

pub async fn run(command: Command, config: MapConfig, format: OutputFormat) -> anyhow::Result<()> {
    let location = format!("{}:{}", config.host, config.port);
    let lifecycle = Lifecycle::connect(config)
        .await
        .with_context(|| format!("failed to connect to redis at {location}"))?;

    let result = match command {
        Command::Get(args) => read::get(&lifecycle, args, format).await,
        Command::Put(args) => write::put(&lifecycle, args, format).await,
        Command::Remove(args) => write::remove(&lifecycle, args, format).await,
        Command::Keys(args) => read::keys(&lifecycle, args, format).await,
        Command::Values(args) => read::values(&lifecycle, args, format).await,
        Command::Entries(args) => read::entries(&lifecycle, args, format).await,
        Command::Size(args) => read::size(&lifecycle, args, format).await,
        Command::Clear(args) => write::clear(&lifecycle, args, format).await,
        Command::Subscribers(args) => subscribers::run(&lifecycle, args, format).await,
        Command::Hold(args) => hold::run(&lifecycle, args, format).await,
    };

    lifecycle.shutdown().await;
    result
}

/// Attach to `name`, warning when liveness tracking could not be set up.
pub(crate) async fn attach(lifecycle: &Lifecycle, name: &str, format: OutputFormat) -> SharedMap {
    let map = lifecycle.open(name).await;
    if map.liveness() == Liveness::Degraded {
        output::print_warning(format, "LIVENESS_DEGRADED", &degraded_warning(name));
    }
    map
}

fn degraded_warning(name: &str) -> String {
    format!(
        "could not subscribe to `{name}`; other processes will not count this handle \
         and may delete the collection while it is in use"
    )
}
