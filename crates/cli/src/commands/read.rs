// `redmap get|keys|values|entries|size`: read through an attached handle.

use std::collections::BTreeMap;

use anyhow::Context;
use clap::Args;
use redmap_core::Lifecycle;
use serde::Serialize;

use super::{attach, CollectionArgs};
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct GetArgs {
    /// Collection name.
    pub name: String,

    /// Key to look up.
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct ValueResult {
    pub collection: String,
    pub key: String,
    pub value: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct KeysResult {
    pub collection: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ValuesResult {
    pub collection: String,
    pub values: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct EntriesResult {
    pub collection: String,
    pub entries: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct SizeResult {
    pub collection: String,
    pub size: usize,
}

pub async fn get(lifecycle: &Lifecycle, args: GetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let map = attach(lifecycle, &args.name, format).await;
    let value =
        map.get(&args.key).await.with_context(|| format!("failed to read key `{}`", args.key))?;
    let result = ValueResult { collection: args.name, key: args.key, value };
    output::print_output(format, &result, format_value)?;
    Ok(())
}

pub async fn keys(
    lifecycle: &Lifecycle,
    args: CollectionArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let map = attach(lifecycle, &args.name, format).await;
    let mut keys: Vec<String> =
        map.keys().await.context("failed to list keys")?.into_iter().collect();
    keys.sort();
    let result = KeysResult { collection: args.name, keys };
    output::print_output(format, &result, |r| r.keys.join("\n"))?;
    Ok(())
}

pub async fn values(
    lifecycle: &Lifecycle,
    args: CollectionArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let map = attach(lifecycle, &args.name, format).await;
    let mut values = map.values().await.context("failed to list values")?;
    values.sort();
    let result = ValuesResult { collection: args.name, values };
    output::print_output(format, &result, |r| r.values.join("\n"))?;
    Ok(())
}

pub async fn entries(
    lifecycle: &Lifecycle,
    args: CollectionArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let map = attach(lifecycle, &args.name, format).await;
    let entries = map.entries().await.context("failed to list entries")?.into_iter().collect();
    let result = EntriesResult { collection: args.name, entries };
    output::print_output(format, &result, format_entries)?;
    Ok(())
}

pub async fn size(
    lifecycle: &Lifecycle,
    args: CollectionArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let map = attach(lifecycle, &args.name, format).await;
    let size = map.size().await.context("failed to count entries")?;
    let result = SizeResult { collection: args.name, size };
    output::print_output(format, &result, |r| r.size.to_string())?;
    Ok(())
}

fn format_value(result: &ValueResult) -> String {
    match &result.value {
        Some(value) => value.clone(),
        None => format!("(no value for `{}` in {})", result.key, result.collection),
    }
}

fn format_entries(result: &EntriesResult) -> String {
    if result.entries.is_empty() {
        return format!("({} is empty)", result.collection);
    }
    let width = result.entries.keys().map(|k| k.chars().count()).max().unwrap_or(0);
    result
        .entries
        .iter()
        .map(|(key, value)| format!("{key:<width$}  {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}
