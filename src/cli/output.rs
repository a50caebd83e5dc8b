//! Output formatting utilities for the CLI.

use comfy_table::{presets, Attribute, Cell, ContentArrangement, Table};
use serde::Serialize;
use std::env;

use crate::domain::models::MemoryEntry;

pub trait CommandOutput: Serialize {
    fn to_human(&self) -> String;
    fn to_json(&self) -> serde_json::Value;
}

/// Print a command result on stdout, as pretty JSON in `--json` mode.
pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&result.to_json()).unwrap_or_default());
    } else {
        println!("{}", result.to_human());
    }
}

/// Truncate a string to at most `max_len` characters, appending "..." if truncated.
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

/// Table of memory entries for `fixloop memory list`.
pub fn format_memory_table(entries: &[MemoryEntry]) -> String {
    let mut table = Table::new();
    table
        .load_preset(if supports_color() {
            presets::UTF8_FULL
        } else {
            presets::ASCII_FULL
        })
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Fingerprint").add_attribute(Attribute::Bold),
            Cell::new("Class").add_attribute(Attribute::Bold),
            Cell::new("Location").add_attribute(Attribute::Bold),
            Cell::new("Uses").add_attribute(Attribute::Bold),
            Cell::new("Last used").add_attribute(Attribute::Bold),
        ]);

    for entry in entries {
        let location = entry
            .top_frame
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        table.add_row(vec![
            Cell::new(&entry.fingerprint[..12.min(entry.fingerprint.len())]),
            Cell::new(truncate(&entry.error_class, 32)),
            Cell::new(truncate(&location, 40)),
            Cell::new(entry.success_count),
            Cell::new(entry.last_used.format("%Y-%m-%d %H:%M")),
        ]);
    }
    table.to_string()
}

/// Whether the terminal should get colors and box-drawing characters.
pub fn supports_color() -> bool {
    if env::var_os("NO_COLOR").is_some() {
        return false;
    }
    if env::var("TERM").is_ok_and(|term| term == "dumb") {
        return false;
    }
    console::colors_enabled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Frame;
    use chrono::Utc;

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééé", 6), "ééé...");
    }

    #[test]
    fn test_memory_table_lists_entries() {
        let entry = MemoryEntry {
            fingerprint: "abcdef0123456789".to_string(),
            error_class: "ZeroDivisionError".to_string(),
            top_frame: Some(Frame::new("calc.py", 4)),
            patch: String::new(),
            success_count: 2,
            last_used: Utc::now(),
            created_at: Utc::now(),
        };
        let table = format_memory_table(&[entry]);
        assert!(table.contains("abcdef012345"));
        assert!(table.contains("calc.py:4"));
        assert!(table.contains("ZeroDivisionError"));
    }
}
