// `redmap put|remove|clear`: mutate through an attached handle.

use anyhow::Context;
use clap::Args;
use redmap_core::Lifecycle;
use serde::Serialize;

use super::{attach, CollectionArgs};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct PutArgs {
    /// Collection name.
    pub name: String,

    pub key: String,

    pub value: String,
}

#[derive(Debug, Args)]
pub struct RemoveArgs {
    /// Collection name.
    pub name: String,

    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct PutResult {
    pub collection: String,
    pub key: String,
    pub previous: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RemoveResult {
    pub collection: String,
    pub key: String,
    pub removed: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClearResult {
    pub collection: String,
    pub cleared: usize,
}

pub async fn put(lifecycle: &Lifecycle, args: PutArgs, format: OutputFormat) -> anyhow::Result<()> {
    let map = attach(lifecycle, &args.name, format).await;
    let previous = map
        .put(&args.key, &args.value)
        .await
        .with_context(|| format!("failed to store key `{}`", args.key))?;
    let result = PutResult { collection: args.name, key: args.key, previous };
    output::print_output(format, &result, format_put)?;
    Ok(())
}

pub async fn remove(
    lifecycle: &Lifecycle,
    args: RemoveArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let map = attach(lifecycle, &args.name, format).await;
    let removed =
        map.remove(&args.key).await.with_context(|| format!("failed to remove key `{}`", args.key))?;
    let result = RemoveResult { collection: args.name, key: args.key, removed };
    output::print_output(format, &result, format_remove)?;
    Ok(())
}

pub async fn clear(
    lifecycle: &Lifecycle,
    args: CollectionArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let map = attach(lifecycle, &args.name, format).await;
    let cleared = map.size().await.context("failed to count entries")?;
    map.clear().await.context("failed to clear collection")?;
    let result = ClearResult { collection: args.name, cleared };
    output::print_output(format, &result, |r| format!("cleared {} entries", r.cleared))?;
    Ok(())
}

fn format_put(result: &PutResult) -> String {
    match &result.previous {
        Some(previous) => format!("{} = updated (was {previous})", result.key),
        None => format!("{} = added", result.key),
    }
}

fn format_remove(result: &RemoveResult) -> String {
    match &result.removed {
        Some(value) => format!("removed {} ({value})", result.key),
        None => format!("{} was not present", result.key),
    }
}
