//! # Harmony Calc
//!
//! Compiles indicator definitions into Druid aggregation plans.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          Indicator groups (JSON / TOML config)           │
//! │   raw indicators, formulas, composites, deployment cfg   │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [calculation builders]
//! ┌─────────────────────────────────────────────────────────┐
//! │          Raw calculations (filtered aggregations)        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [dependency order + formula / composite]
//! ┌─────────────────────────────────────────────────────────┐
//! │      Field lookup table: field ID → Calculation          │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [merge + resolve intervals]
//! ┌─────────────────────────────────────────────────────────┐
//! │     Druid `aggregations` / `postAggregations` JSON       │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod calculation;
pub mod compile;
pub mod config;
pub mod dependency;
pub mod druid;
pub mod evaluate;
pub mod formula;
pub mod model;

pub use calculation::{Calculation, CalculationError};
pub use compile::{compile_all, CompileError, CompileWarning, CompiledIndicators};
pub use config::DeploymentConfig;
pub use model::{IndicatorDefinition, IndicatorGroup, IndicatorType};
