//! Indicator configuration consumed by the compiler.
//!
//! Groups are read from JSON (a top-level array of groups) or TOML (a
//! `[[groups]]` array of tables).

mod indicator;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub use indicator::{IndicatorDefinition, IndicatorGroup, IndicatorSubtype, IndicatorType};

/// Errors raised while loading indicator configuration.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Indicator file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read indicator file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse indicator JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to parse indicator TOML: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// TOML layout of an indicator file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct IndicatorFile {
    #[serde(default)]
    pub groups: Vec<IndicatorGroup>,
}

/// Load indicator groups from a `.json` or `.toml` file.
///
/// Any extension other than `.toml` is read as JSON.
pub fn load_groups<P: AsRef<Path>>(path: P) -> Result<Vec<IndicatorGroup>, ModelError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ModelError::FileNotFound(path.to_path_buf()));
    }
    let content = fs::read_to_string(path)?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    if is_toml {
        parse_groups_toml(&content)
    } else {
        parse_groups_json(&content)
    }
}

pub fn parse_groups_json(content: &str) -> Result<Vec<IndicatorGroup>, ModelError> {
    Ok(serde_json::from_str(content)?)
}

pub fn parse_groups_toml(content: &str) -> Result<Vec<IndicatorGroup>, ModelError> {
    let file: IndicatorFile = toml::from_str(content)?;
    Ok(file.groups)
}
