//! Settings file loading.

use std::fs;
use std::path::Path;

use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::model::{Settings, SettingsSnapshot};
use crate::validate;

/// Load, parse, and validate the settings file at `path`.
///
/// The returned snapshot is immutable; a configuration change requires a
/// restart. The parent directory of `path` becomes the configuration
/// directory holding all durable daemon state.
///
/// # Errors
///
/// Returns `Io` when the file cannot be read, `Parse` when the YAML is
/// malformed or contains unknown keys, and `InvalidField` when a value is
/// out of range.
pub fn load(path: &Path) -> ConfigResult<SettingsSnapshot> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::io("read", path, source))?;
    let settings: Settings = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate::validate(&settings)?;

    let config_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| Path::new(".").to_path_buf(), Path::to_path_buf);

    info!(
        path = %path.display(),
        fast_root = %settings.fast_root.display(),
        fast_limit_bytes = settings.fast_limit_bytes,
        lists = settings.lists.len(),
        "settings loaded"
    );

    Ok(SettingsSnapshot {
        settings,
        config_dir,
    })
}
