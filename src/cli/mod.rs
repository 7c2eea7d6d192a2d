//! Command-line interface for inspecting configuration and dispatching events.

pub mod commands;
pub mod output;
pub mod types;

pub use types::{Cli, Commands};

use crate::infrastructure::config::ConfigLoader;
use crate::domain::models::Config;
use std::path::Path;

/// Load configuration from an explicit file or from the default project locations.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    path.map_or_else(ConfigLoader::load, ConfigLoader::load_with_overrides)
}

/// Print an error in the requested format and exit with a failure code.
pub fn handle_error(err: anyhow::Error, json_mode: bool) -> ! {
    if json_mode {
        let chain: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        let body = serde_json::json!({
            "success": false,
            "error": err.to_string(),
            "causes": chain,
        });
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    } else {
        eprintln!("Error: {err:#}");
    }
    std::process::exit(1);
}
