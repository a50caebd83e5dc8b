//! Implementation of the `fixloop version` command.

use serde::Serialize;

use crate::cli::output::{output, CommandOutput};

#[derive(Debug, Serialize)]
pub struct VersionOutput {
    pub name: &'static str,
    pub version: &'static str,
}

impl VersionOutput {
    pub const fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

impl CommandOutput for VersionOutput {
    fn to_human(&self) -> String {
        format!("{} {}", self.name, self.version)
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub fn execute(json_mode: bool) {
    output(&VersionOutput::current(), json_mode);
}
