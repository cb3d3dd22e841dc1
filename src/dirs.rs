//! Application directory paths for the agent.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! # Environment Overrides
//!
//! - `VIGIL_DATA_DIR` overrides [`data_dir`]
//! - `VIGIL_CONFIG_DIR` overrides [`config_dir`]

use std::path::PathBuf;

/// Application data root directory.
///
/// Holds the persisted agent state.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("VIGIL_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("vigil"))
        .unwrap_or_else(|| PathBuf::from("/tmp/vigil-data"))
}

/// Application config directory (holds `config.toml`).
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("VIGIL_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("vigil"))
        .unwrap_or_else(|| PathBuf::from("/tmp/vigil-config"))
}

/// Default persisted state file (`data_dir()/agent-state.json`).
#[must_use]
pub fn state_file() -> PathBuf {
    data_dir().join("agent-state.json")
}
