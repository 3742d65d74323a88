// `redmap hold`: keep one handle attached, then release it and report what
// the cleanup did.

use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Args;
use redmap_core::Lifecycle;
use serde::Serialize;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct HoldArgs {
    /// Collection name.
    pub name: String,

    /// Release after this many seconds instead of waiting for ctrl-c.
    #[arg(long)]
    pub seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HoldResult {
    pub collection: String,
    pub handle: String,
    pub held_ms: u64,
    pub deleted: bool,
    pub remaining_subscribers: Option<usize>,
}

pub async fn run(lifecycle: &Lifecycle, args: HoldArgs, format: OutputFormat) -> anyhow::Result<()> {
    let map = super::attach(lifecycle, &args.name, format).await;
    let handle = map.id().to_string();
    if format == OutputFormat::Human {
        eprintln!("holding `{}` as {handle}; press ctrl-c to release", args.name);
    }
    tracing::info!(collection = %args.name, %handle, "holding collection");

    let started = Instant::now();
    let deadline = async {
        match args.seconds {
            Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.context("failed to listen for ctrl-c")?,
        () = deadline => {}
    }

    drop(map);
    lifecycle.shutdown().await;

    let remaining_subscribers = lifecycle.subscriber_count(&args.name).await.ok();
    let result = HoldResult {
        collection: args.name,
        handle,
        held_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        deleted: lifecycle.stats().deleted > 0,
        remaining_subscribers,
    };
    output::print_output(format, &result, format_human)?;
    Ok(())
}

fn format_human(result: &HoldResult) -> String {
    if result.deleted {
        return format!("released {}; it was the last handle, collection deleted", result.collection);
    }
    match result.remaining_subscribers {
        Some(n) => format!("released {}; {n} other handle(s) still attached", result.collection),
        None => format!("released {}; cleanup still pending", result.collection),
    }
}
