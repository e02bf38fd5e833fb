// Configuration management for the dmail CLI
//
// The config file is the engine configuration itself, stored as JSON in:
// - Linux:   ~/.config/dmail/config.json
// - macOS:   ~/Library/Application Support/dmail/config.json
// - Windows: %APPDATA%\dmail\config.json

use anyhow::{Context, Result};
use dmail_core::EngineConfig;
use std::path::{Path, PathBuf};

/// Get the config directory path (cross-platform)
pub fn config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Failed to determine config directory")?
        .join("dmail");
    std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    Ok(config_dir)
}

/// Get the data directory path (cross-platform)
pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_local_dir()
        .context("Failed to determine data directory")?
        .join("dmail");
    std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
    Ok(data_dir)
}

pub fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Defaults for a CLI installation: mail and peers live in the data directory
pub fn defaults(data_dir: &Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.storage_path = Some(data_dir.join("mail"));
    config.peers.peer_file = Some(data_dir.join("peers.txt"));
    config
}

/// Load the config file, or create it from `defaults` if it does not exist
pub fn load() -> Result<EngineConfig> {
    load_from(&config_file()?, &data_dir()?)
}

pub fn load_from(path: &Path, data_dir: &Path) -> Result<EngineConfig> {
    if path.exists() {
        return EngineConfig::load(path);
    }
    let config = defaults(data_dir);
    config.save(path)?;
    tracing::debug!(path = %path.display(), "Created default config");
    Ok(config)
}

pub fn save(config: &EngineConfig) -> Result<()> {
    config.save(&config_file()?)
}

/// Where identities and mail are kept
pub fn storage_path(config: &EngineConfig) -> Result<PathBuf> {
    config
        .storage_path
        .clone()
        .context("storage_path is not set; set it with `dmail config set storage_path <dir>`")
}
