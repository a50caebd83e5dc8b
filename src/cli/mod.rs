//! Command-line interface.

pub mod approval;
pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};

use commands::{fix::FixArgs, init::InitArgs, memory::MemoryArgs};

#[derive(Parser, Debug)]
#[command(name = "fixloop")]
#[command(about = "fixloop - run a command, patch what breaks, remember what works", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output in JSON format
    #[arg(short, long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command and try to fix it until it passes
    Fix(FixArgs),
    /// Write ~/.fixloop/config.yaml and create the fix memory
    Init(InitArgs),
    /// Print the version
    Version,
    /// Inspect remembered fixes
    Memory(MemoryArgs),
}

/// Print an error the way the selected output mode expects.
pub fn handle_error(err: &anyhow::Error, json_mode: bool) {
    if json_mode {
        let body = serde_json::json!({
            "status": "error",
            "error": format!("{err:#}"),
        });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("{} {err:#}", console::style("error:").red().bold());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_fix() {
        let cli = Cli::parse_from(["fixloop", "--json", "fix", "--cmd", "cargo test", "--verify", "cargo test -q"]);
        assert!(cli.json);
        let Commands::Fix(args) = cli.command else {
            panic!("expected fix");
        };
        assert_eq!(args.command, "cargo test");
        assert_eq!(args.verify.as_deref(), Some("cargo test -q"));
        assert!(!args.yes);
    }

    #[test]
    fn test_fix_requires_cmd() {
        assert!(Cli::try_parse_from(["fixloop", "fix"]).is_err());
    }

    #[test]
    fn test_memory_show() {
        let cli = Cli::parse_from(["fixloop", "memory", "show", "abc123"]);
        assert!(matches!(cli.command, Commands::Memory(_)));
    }
}
