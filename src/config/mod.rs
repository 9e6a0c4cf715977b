pub mod schema;

pub use schema::PantheonConfig;

use anyhow::{Context, Result};
use std::path::Path;

/// Load config from the given path, or return defaults.
pub fn load_config(path: &Path) -> Result<PantheonConfig> {
    if path.exists() {
        let contents =
            std::fs::read_to_string(path).context("Failed to read pantheon config file")?;
        let config: PantheonConfig =
            toml::from_str(&contents).context("Failed to parse pantheon config (TOML)")?;
        Ok(config)
    } else {
        Ok(PantheonConfig::default())
    }
}

/// Save config to the given path (TOML format).
pub fn save_config(config: &PantheonConfig, path: &Path) -> Result<()> {
    let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).context("Failed to write config file")?;
    Ok(())
}
