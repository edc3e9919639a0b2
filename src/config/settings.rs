//! TOML-based deployment configuration.
//!
//! Each deployment (country/customer instance) has its own file, selected at
//! startup through the `ZEN_ENV` environment variable. The deployment name and
//! the `[druid]` column names support `${ENV_VAR}` expansion after parsing;
//! everything else, comments included, is read literally.
//!
//! Example configuration:
//! ```toml
//! deployment = "mz"
//!
//! [druid]
//! field_dimension = "field"
//! value_field = "sum"
//!
//! [stock]
//! strategy = "aggregate_last"
//!
//! [theta_sketch]
//! default_size = 65536
//!
//! [formula]
//! placeholder_markers = ["XXX"]
//! post_aggregation_style = "arithmetic"
//!
//! [composite]
//! optimize = true
//! ```

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::druid::{BucketEdge, Granularity};
use crate::formula::{FormulaValidator, DEFAULT_PLACEHOLDER_MARKER};

/// Environment variable naming the active deployment.
pub const DEPLOYMENT_ENV_VAR: &str = "ZEN_ENV";

/// Environment variable overriding the directory holding deployment files.
pub const CONFIG_DIR_ENV_VAR: &str = "HARMONY_CONFIG_DIR";

const DEFAULT_CONFIG_DIR: &str = "config";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Per-deployment compiler configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Deployment name (e.g. `br`, `mz`).
    pub deployment: String,

    pub druid: DruidSettings,

    pub stock: StockSettings,

    pub theta_sketch: ThetaSketchSettings,

    pub formula: FormulaSettings,

    pub composite: CompositeSettings,
}

/// Datasource layout.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DruidSettings {
    /// Generic dimension holding the indicator ID of each row.
    pub field_dimension: String,

    /// Metric column holding each row's value.
    pub value_field: String,

    /// Row timestamp column.
    pub time_column: String,
}

impl Default for DruidSettings {
    fn default() -> Self {
        Self {
            field_dimension: "field".to_string(),
            value_field: "sum".to_string(),
            time_column: "__time".to_string(),
        }
    }
}

/// How STOCK indicators pick their value at query time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStrategy {
    /// Sum only the rows in the first/last bucket of the queried interval.
    #[default]
    EdgeBucket,
    /// Sum only the rows at the latest timestamp seen for the field.
    AggregateLast,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StockSettings {
    pub strategy: StockStrategy,

    /// Edge used by the edge-bucket strategy.
    pub edge: BucketEdge,

    /// Bucket size used when an indicator sets no `stock_granularity`.
    pub granularity: Granularity,
}

impl Default for StockSettings {
    fn default() -> Self {
        Self {
            strategy: StockStrategy::EdgeBucket,
            edge: BucketEdge::Last,
            granularity: Granularity::Month,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ThetaSketchSettings {
    /// Sketch size used when an indicator sets no `theta_sketch_size`.
    /// Must be a power of two.
    pub default_size: u32,
}

impl Default for ThetaSketchSettings {
    fn default() -> Self {
        Self {
            default_size: 16384,
        }
    }
}

/// How calculated-indicator formulas are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostAggregationStyle {
    /// Parsed into nested `arithmetic` post-aggregators.
    #[default]
    Arithmetic,
    /// Passed verbatim as an `expression` post-aggregator.
    Expression,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FormulaSettings {
    /// Substrings marking a formula as not yet computable.
    pub placeholder_markers: Vec<String>,

    pub post_aggregation_style: PostAggregationStyle,
}

impl Default for FormulaSettings {
    fn default() -> Self {
        Self {
            placeholder_markers: vec![DEFAULT_PLACEHOLDER_MARKER.to_string()],
            post_aggregation_style: PostAggregationStyle::Arithmetic,
        }
    }
}

impl FormulaSettings {
    pub fn validator(&self) -> FormulaValidator {
        FormulaValidator::new(self.placeholder_markers.iter().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CompositeSettings {
    /// Collapse sum-of-children composites into one filtered aggregation when
    /// that is provably equivalent.
    pub optimize: bool,
}

impl Default for CompositeSettings {
    fn default() -> Self {
        Self { optimize: true }
    }
}

impl DeploymentConfig {
    /// Load a deployment config from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse a deployment config and expand environment variables in its
    /// expandable string values.
    pub fn from_toml_str(content: &str) -> Result<Self, SettingsError> {
        let mut config: DeploymentConfig = toml::from_str(content)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// Expand `${VAR}` in the deployment name and datasource column names.
    /// Placeholder markers are matched literally and stay untouched.
    fn resolve_env_vars(&mut self) -> Result<(), SettingsError> {
        for value in [
            &mut self.deployment,
            &mut self.druid.field_dimension,
            &mut self.druid.value_field,
            &mut self.druid.time_column,
        ] {
            *value = expand_env_vars(value)?;
        }
        Ok(())
    }

    /// Load the config of the deployment named by `ZEN_ENV`.
    ///
    /// The file is `<dir>/<ZEN_ENV>.toml`, where `<dir>` is
    /// `HARMONY_CONFIG_DIR` or `./config`. The deployment name defaults to
    /// the `ZEN_ENV` value when the file does not set one.
    pub fn from_env() -> Result<Self, SettingsError> {
        let deployment = env::var(DEPLOYMENT_ENV_VAR)
            .map_err(|_| SettingsError::MissingEnvVar(DEPLOYMENT_ENV_VAR.to_string()))?;
        let dir = env::var(CONFIG_DIR_ENV_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_string());
        let path = PathBuf::from(dir).join(format!("{}.toml", deployment));

        let mut config = Self::from_file(&path)?;
        if config.deployment.is_empty() {
            config.deployment = deployment;
        }
        Ok(config)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.druid.field_dimension.is_empty() {
            return Err(SettingsError::InvalidConfig(
                "druid.field_dimension must not be empty".to_string(),
            ));
        }
        if self.druid.value_field.is_empty() {
            return Err(SettingsError::InvalidConfig(
                "druid.value_field must not be empty".to_string(),
            ));
        }
        if !self.theta_sketch.default_size.is_power_of_two() {
            return Err(SettingsError::InvalidConfig(format!(
                "theta_sketch.default_size must be a power of two, got {}",
                self.theta_sketch.default_size
            )));
        }
        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let mut var_name = String::new();
        if chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                var_name.push(ch);
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch.is_alphanumeric() || ch == '_' {
                    var_name.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            if var_name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
        }

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
