//! Implementation of the `fixloop init` command.

use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::adapters::sqlite::initialize_database_at;
use crate::cli::output::{output, CommandOutput};
use crate::domain::models::Config;
use crate::infrastructure::config::{CONFIG_FILE, FIXLOOP_DIR};
use crate::infrastructure::credentials::API_KEY_ENV;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Overwrite an existing configuration
    #[arg(long, short)]
    pub force: bool,

    /// Patch attempts per run written to the new configuration
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,
}

#[derive(Debug, serde::Serialize)]
pub struct InitOutput {
    pub success: bool,
    pub message: String,
    pub config_path: PathBuf,
    pub database_path: Option<PathBuf>,
    pub api_key_stored: bool,
}

impl CommandOutput for InitOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![self.message.clone()];
        lines.push(format!("\nConfiguration: {}", self.config_path.display()));
        if let Some(db) = &self.database_path {
            lines.push(format!("Fix memory:    {}", db.display()));
        }
        if self.success && !self.api_key_stored {
            lines.push(format!(
                "\nNo API key stored; set {API_KEY_ENV} or provider.api_key before running `fixloop fix`."
            ));
        }
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub async fn execute(args: InitArgs, json_mode: bool) -> Result<()> {
    let home = dirs::home_dir().context("Could not determine the home directory")?;
    let result = initialize(&home, &args, std::env::var(API_KEY_ENV).ok()).await?;
    output(&result, json_mode);
    Ok(())
}

/// Write `<home>/.fixloop/config.yaml` and create the fix memory database.
pub async fn initialize(home: &Path, args: &InitArgs, api_key: Option<String>) -> Result<InitOutput> {
    if args.max_attempts == 0 {
        anyhow::bail!("--max-attempts must be at least 1");
    }
    let fixloop_dir = home.join(FIXLOOP_DIR);
    let config_path = fixloop_dir.join(CONFIG_FILE);

    if config_path.exists() && !args.force {
        return Ok(InitOutput {
            success: false,
            message: "Already initialized. Use --force to overwrite the configuration.".to_string(),
            config_path,
            database_path: None,
            api_key_stored: false,
        });
    }

    fs::create_dir_all(&fixloop_dir)
        .await
        .with_context(|| format!("Failed to create {}", fixloop_dir.display()))?;

    let mut config = Config::default();
    config.fix_loop.max_attempts = Some(args.max_attempts);
    config.provider.api_key = api_key.filter(|key| !key.trim().is_empty());
    let api_key_stored = config.provider.api_key.is_some();

    let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
    fs::write(&config_path, yaml)
        .await
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    // The file may hold an API key
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600)).await;
    }

    let database_path = fixloop_dir.join("fixloop.db");
    let pool = initialize_database_at(&database_path, None)
        .await
        .context("Failed to initialize fix memory")?;
    pool.close().await;

    Ok(InitOutput {
        success: true,
        message: if args.force {
            "fixloop reinitialized.".to_string()
        } else {
            "fixloop initialized.".to_string()
        },
        config_path,
        database_path: Some(database_path),
        api_key_stored,
    })
}
