//! Configuration module.
//!
//! Handles the per-deployment compiler settings and environment variables.

mod settings;

pub use settings::{
    expand_env_vars, CompositeSettings, DeploymentConfig, DruidSettings, FormulaSettings,
    PostAggregationStyle, SettingsError, StockSettings, StockStrategy, ThetaSketchSettings,
    CONFIG_DIR_ENV_VAR, DEPLOYMENT_ENV_VAR,
};
