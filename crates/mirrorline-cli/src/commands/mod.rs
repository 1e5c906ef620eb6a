pub mod channel;
pub mod cms;

use std::path::Path;

use anyhow::{Context, Result};
use mirrorline_engine::config::parser;
use mirrorline_engine::config::types::MirrorConfig;
use mirrorline_engine::config::validator;
use serde::Serialize;

pub const DEFAULT_CONFIG: &str = "config/mirrorline.yml";

/// Load and validate the config file.
///
/// An explicit `--config` must exist. Without one, the default path is used
/// when present and built-in defaults otherwise.
pub fn load_config(explicit: Option<&Path>) -> Result<MirrorConfig> {
    let path = match explicit {
        Some(path) => path,
        None => {
            let default = Path::new(DEFAULT_CONFIG);
            if !default.is_file() {
                tracing::debug!(path = DEFAULT_CONFIG, "No config file, using defaults");
                return Ok(MirrorConfig::default());
            }
            default
        }
    };

    let config = parser::parse_config(path)
        .with_context(|| format!("Failed to parse config: {}", path.display()))?;
    validator::validate_config(&config)
        .with_context(|| format!("Invalid config: {}", path.display()))?;
    Ok(config)
}

/// Print one summary as an object, several as an array.
pub fn print_summaries<T: Serialize>(summaries: &[T]) -> Result<()> {
    let json = match summaries {
        [single] => serde_json::to_string_pretty(single)?,
        many => serde_json::to_string_pretty(many)?,
    };
    println!("{json}");
    Ok(())
}
