//! `runway inventory`: the dynamic inventory interface.
//!
//! Prints JSON with sorted keys: the group index for `--list`, a host
//! record (or `{}`) for `--host`.

use anyhow::Result;
use clap::Parser;
use runway::inventory::{check_access, DynamicInventory};
use serde_json::Value;

use super::CommandContext;

#[derive(Parser, Debug, Clone)]
pub struct InventoryArgs {
    /// List all groups and their hosts (default)
    #[arg(long, conflicts_with = "host")]
    pub list: bool,

    /// Show the record of one host
    #[arg(long)]
    pub host: Option<String>,

    /// Refresh the cache from the directory service first
    #[arg(long)]
    pub refresh_cache: bool,
}

impl InventoryArgs {
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        if let Err(e) = check_access(&ctx.config.directory.deny_users) {
            eprintln!("{}", e);
            return Ok(1);
        }

        let inventory = DynamicInventory::from_config(&ctx.config.directory)?;
        if self.refresh_cache {
            inventory.refresh().await?;
        }

        let value = inventory.query(self.host.as_deref()).await?;
        println!("{}", render(&value)?);
        Ok(0)
    }
}

/// Two-space indented JSON with object keys sorted.
fn render(value: &Value) -> Result<String> {
    Ok(serde_json::to_string_pretty(&sort_keys(value))?)
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k.clone(), sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}
