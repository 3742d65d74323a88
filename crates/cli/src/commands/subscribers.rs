// `redmap subscribers`: distributed reference count for a collection.
//
// Reads the count without attaching, so the command itself does not show up
// in the number it prints.

use anyhow::Context;
use redmap_core::Lifecycle;
use serde::Serialize;

use super::CollectionArgs;
use crate::output::{self, OutputFormat};

#[derive(Debug, Serialize)]
pub struct SubscribersResult {
    pub collection: String,
    pub subscribers: usize,
}

pub async fn run(
    lifecycle: &Lifecycle,
    args: CollectionArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let subscribers = lifecycle
        .subscriber_count(&args.name)
        .await
        .with_context(|| format!("failed to count subscribers of `{}`", args.name))?;
    let result = SubscribersResult { collection: args.name, subscribers };
    output::print_output(format, &result, format_human)?;
    Ok(())
}

fn format_human(result: &SubscribersResult) -> String {
    match result.subscribers {
        0 => format!("{}: no handles attached", result.collection),
        1 => format!("{}: 1 handle attached", result.collection),
        n => format!("{}: {n} handles attached", result.collection),
    }
}
