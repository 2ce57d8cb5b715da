// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Application name, used for the config file name and its directories.
pub const APP_NAME: &str = "uwb-gateway";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config file {0}: {1}")]
    ParseError(PathBuf, String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Default search paths for `uwb-gateway.toml`
/// (current directory, XDG config, /etc).
fn config_search_paths() -> Vec<PathBuf> {
    let file = format!("{APP_NAME}.toml");
    let mut paths = vec![PathBuf::from(&file)];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join(APP_NAME).join(&file));
    }
    paths.push(PathBuf::from("/etc").join(APP_NAME).join(&file));
    paths
}

/// Extract and deserialize a named section from a TOML file.
///
/// Returns `Ok(Some(cfg))` when the section is present and parses cleanly,
/// `Ok(None)` when the section is absent, or `Err` on I/O / parse failure.
fn load_section_from_file<T: DeserializeOwned>(
    path: &Path,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

    let table: toml::Table = toml::from_str(&content)
        .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;

    let Some(section) = table.get(key) else {
        return Ok(None);
    };

    // Round-trip through a string so serde defaults apply to the section.
    let section_toml = toml::to_string(section)
        .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
    let cfg = toml::from_str::<T>(&section_toml)
        .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
    Ok(Some(cfg))
}

/// Trait for loading configuration from a section of `uwb-gateway.toml`.
pub trait ConfigFile: Sized + Default + DeserializeOwned {
    /// Section key, e.g. `"uwb-gateway"`.
    fn section_key() -> &'static str;

    /// Load the section from a specific file path.
    ///
    /// Fails if the file cannot be read, is not valid TOML, or lacks the
    /// `[<section_key>]` table.
    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        load_section_from_file::<Self>(path, Self::section_key())?.ok_or_else(|| {
            ConfigError::ParseError(
                path.to_path_buf(),
                format!("missing [{}] section", Self::section_key()),
            )
        })
    }

    /// Load the first default-path file that contains the section.
    ///
    /// Returns `(config, path_where_found)` or `(Default::default(), None)`
    /// when no config file is found.
    fn load_from_default_paths() -> Result<(Self, Option<PathBuf>), ConfigError> {
        for path in config_search_paths() {
            if path.exists() {
                if let Some(cfg) = load_section_from_file::<Self>(&path, Self::section_key())? {
                    return Ok((cfg, Some(path)));
                }
            }
        }
        Ok((Self::default(), None))
    }

    /// Load from `explicit` when given, otherwise search the default paths.
    fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        match explicit {
            Some(path) => Ok((Self::load_from_file(path)?, Some(path.to_path_buf()))),
            None => Self::load_from_default_paths(),
        }
    }
}
