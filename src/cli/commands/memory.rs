//! `fixloop memory` - read-only inspection of the fix memory.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::adapters::sqlite::{initialize_database_at, SqliteFixMemory};
use crate::cli::output::{format_memory_table, output, CommandOutput};
use crate::domain::models::MemoryEntry;
use crate::domain::ports::FixMemory;
use crate::infrastructure::config::{resolve_database_path, ConfigLoader};

#[derive(Args, Debug)]
pub struct MemoryArgs {
    #[command(subcommand)]
    pub command: MemoryCommands,
}

#[derive(Subcommand, Debug)]
pub enum MemoryCommands {
    /// List remembered fixes, most recently used first
    List {
        /// Maximum number of entries to display
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Show one entry and its patch
    Show {
        /// Fingerprint or a unique prefix of one
        fingerprint: String,
    },
}

#[derive(Debug, Serialize)]
pub struct MemoryListOutput {
    pub entries: Vec<MemoryEntry>,
    pub total: usize,
}

impl CommandOutput for MemoryListOutput {
    fn to_human(&self) -> String {
        if self.entries.is_empty() {
            return "No fixes remembered yet.".to_string();
        }
        format!(
            "{}\n\nShowing {} entr{}",
            format_memory_table(&self.entries),
            self.total,
            if self.total == 1 { "y" } else { "ies" }
        )
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
pub struct MemoryShowOutput {
    #[serde(flatten)]
    pub entry: MemoryEntry,
}

impl CommandOutput for MemoryShowOutput {
    fn to_human(&self) -> String {
        let entry = &self.entry;
        let location = entry
            .top_frame
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        [
            "\nFix Details:".to_string(),
            "─────────────────────────────────────────".to_string(),
            format!("Fingerprint: {}", entry.fingerprint),
            format!("Class:       {}", entry.error_class),
            format!("Location:    {location}"),
            format!("Uses:        {}", entry.success_count),
            format!("Created at:  {}", entry.created_at.format("%Y-%m-%d %H:%M:%S UTC")),
            format!("Last used:   {}", entry.last_used.format("%Y-%m-%d %H:%M:%S UTC")),
            "\nPatch:".to_string(),
            entry.patch.trim_end().to_string(),
        ]
        .join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn execute(args: MemoryArgs, json_mode: bool) -> Result<()> {
    let root = std::env::current_dir().context("Failed to get current directory")?;
    let config = ConfigLoader::load(&root).context("Failed to load configuration")?;
    let db_path = resolve_database_path(&config.memory)?;
    let pool = initialize_database_at(&db_path, None)
        .await
        .with_context(|| format!("Failed to open fix memory at {}", db_path.display()))?;
    let memory = SqliteFixMemory::new(pool);

    match args.command {
        MemoryCommands::List { limit } => handle_list(&memory, limit, json_mode).await,
        MemoryCommands::Show { fingerprint } => handle_show(&memory, &fingerprint, json_mode).await,
    }
}

/// Handle memory list command
pub async fn handle_list(memory: &dyn FixMemory, limit: usize, json_mode: bool) -> Result<()> {
    let entries = memory.list(limit).await.context("Failed to list fixes")?;
    let total = entries.len();
    output(&MemoryListOutput { entries, total }, json_mode);
    Ok(())
}

/// Handle memory show command
pub async fn handle_show(memory: &dyn FixMemory, fingerprint: &str, json_mode: bool) -> Result<()> {
    let entry = find_entry(memory, fingerprint).await?;
    output(&MemoryShowOutput { entry }, json_mode);
    Ok(())
}

async fn find_entry(memory: &dyn FixMemory, fingerprint: &str) -> Result<MemoryEntry> {
    if let Some(entry) = memory.lookup(fingerprint).await? {
        return Ok(entry);
    }
    let mut matches: Vec<MemoryEntry> = memory
        .list(usize::MAX)
        .await?
        .into_iter()
        .filter(|entry| entry.fingerprint.starts_with(fingerprint))
        .collect();
    match matches.len() {
        0 => anyhow::bail!("No remembered fix matches '{fingerprint}'"),
        1 => Ok(matches.remove(0)),
        n => anyhow::bail!("'{fingerprint}' is ambiguous ({n} fixes match)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::models::{ErrorSignature, Frame, Patch, PatchOrigin, RecordMeta};

    async fn seeded() -> (SqliteFixMemory, String) {
        let memory = SqliteFixMemory::new(create_migrated_test_pool().await.unwrap());
        let signature = ErrorSignature::new(
            "KeyError",
            "'x'",
            Some(Frame::new("app.py", 9)),
            vec!["app.py".to_string()],
        );
        let patch = Patch::parse(
            "--- a/app.py\n+++ b/app.py\n@@ -1 +1 @@\n-d['x']\n+d.get('x')\n",
            PatchOrigin::Generated,
        )
        .unwrap();
        memory
            .record(&signature, &patch, RecordMeta::passed_now())
            .await
            .unwrap();
        (memory, signature.fingerprint().to_string())
    }

    #[tokio::test]
    async fn test_find_entry_by_prefix() {
        let (memory, fingerprint) = seeded().await;
        let entry = find_entry(&memory, &fingerprint[..10]).await.unwrap();
        assert_eq!(entry.fingerprint, fingerprint);
        assert!(find_entry(&memory, "zzzz").await.is_err());
    }

    #[test]
    fn test_empty_list_message() {
        let out = MemoryListOutput {
            entries: Vec::new(),
            total: 0,
        };
        assert_eq!(out.to_human(), "No fixes remembered yet.");
    }
}
