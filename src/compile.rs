//! End-to-end compilation of indicator groups into a field lookup table.
//!
//! ```text
//! Groups → Cache raw → Order calculated → Compile calculated → Freeze
//! ```
//!
//! Indicator-local problems (bad formulas, unknown types, key conflicts) skip
//! or degrade that one indicator and are collected as [`CompileWarning`]s. A
//! dependency cycle aborts the whole compile.
//!
//! # Example
//!
//! ```ignore
//! use harmony_calc::compile::compile_all;
//! use harmony_calc::config::DeploymentConfig;
//! use harmony_calc::model::{IndicatorDefinition, IndicatorGroup};
//!
//! let groups = vec![IndicatorGroup::new("cases", vec![
//!     IndicatorDefinition::new("flu_cases"),
//!     IndicatorDefinition::new("measles_cases"),
//!     IndicatorDefinition::new("total_cases").with_formula("flu_cases + measles_cases"),
//! ])];
//!
//! let compiled = compile_all(&groups, &DeploymentConfig::default())?;
//! let query = compiled.calculation_for(["total_cases"])?.to_druid_json()?;
//! ```

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error, info, warn};

use crate::calculation::{
    build_calculation, build_composite, compile_formula, merge, BuildWarning, Calculation,
    CalculationError, CalculationResult, Unoptimizable,
};
use crate::config::DeploymentConfig;
use crate::dependency::{sort_calculated_indicators, GraphError};
use crate::formula::{tokenize, FormulaError};
use crate::model::{IndicatorDefinition, IndicatorGroup};

// ============================================================================
// Error Types
// ============================================================================

/// Errors that abort a compile.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("{0}")]
    CyclicDependency(#[from] GraphError),
}

impl CompileError {
    /// The dependency cycles that aborted the compile.
    pub fn cycles(&self) -> &[Vec<String>] {
        match self {
            CompileError::CyclicDependency(GraphError::CyclicDependency { cycles }) => cycles,
        }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Indicator-local problems. The compile carries on without (or with a
/// degraded version of) the indicator concerned.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileWarning {
    #[error(transparent)]
    Build(#[from] BuildWarning),

    #[error("Skipping '{indicator}': {source}")]
    InvalidFormula {
        indicator: String,
        #[source]
        source: FormulaError,
    },

    #[error("Skipping '{indicator}': constituents not available: {}", .missing.join(", "))]
    UnresolvedConstituent {
        indicator: String,
        missing: Vec<String>,
    },

    #[error("Skipping '{indicator}': {source}")]
    MergeConflict {
        indicator: String,
        #[source]
        source: CalculationError,
    },

    /// Any other calculation error raised while compiling the indicator.
    #[error("Skipping '{indicator}': {source}")]
    CalculationFailed {
        indicator: String,
        #[source]
        source: CalculationError,
    },

    #[error("Indicator '{indicator}' in group '{group}' repeats an earlier definition; ignored")]
    DuplicateIndicator { indicator: String, group: String },

    #[error("Composite '{indicator}' compiled as a sum of children: {reason}")]
    CompositeNotOptimized {
        indicator: String,
        reason: Unoptimizable,
    },
}

impl CompileWarning {
    /// Whether the indicator concerned is missing from the lookup table.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            CompileWarning::InvalidFormula { .. }
                | CompileWarning::UnresolvedConstituent { .. }
                | CompileWarning::MergeConflict { .. }
                | CompileWarning::CalculationFailed { .. }
        )
    }

    fn log(&self) {
        match self {
            CompileWarning::Build(
                BuildWarning::UnknownIndicatorType { .. } | BuildWarning::MissingParameter { .. },
            ) => error!("{}", self),
            CompileWarning::MergeConflict { indicator, .. }
            | CompileWarning::CalculationFailed { indicator, .. } => {
                error!(indicator = %indicator, "{}", self)
            }
            CompileWarning::CompositeNotOptimized { indicator, .. } => {
                debug!(indicator = %indicator, "{}", self)
            }
            _ => warn!("{}", self),
        }
    }

    fn from_calculation_error(indicator: &str, err: CalculationError) -> Self {
        match err {
            CalculationError::InvalidFormula { source, .. } => CompileWarning::InvalidFormula {
                indicator: indicator.to_string(),
                source,
            },
            CalculationError::MissingKeys { keys, .. } => CompileWarning::UnresolvedConstituent {
                indicator: indicator.to_string(),
                missing: keys,
            },
            err @ CalculationError::MergeKeyConflict { .. } => CompileWarning::MergeConflict {
                indicator: indicator.to_string(),
                source: err,
            },
            err @ (CalculationError::UnknownField(_) | CalculationError::Druid(_)) => {
                CompileWarning::CalculationFailed {
                    indicator: indicator.to_string(),
                    source: err,
                }
            }
        }
    }
}

// ============================================================================
// Compiled Output
// ============================================================================

/// The frozen result of a compile: every registered field's calculation.
///
/// Immutable once built; a config reload compiles a fresh one.
#[derive(Debug, Clone, Default)]
pub struct CompiledIndicators {
    calculations_for_field: BTreeMap<String, Calculation>,
    calculated_indicator_constituents: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
    warnings: Vec<CompileWarning>,
}

impl CompiledIndicators {
    /// Field ID → calculation, for every indicator that compiled.
    pub fn calculations_for_field(&self) -> &BTreeMap<String, Calculation> {
        &self.calculations_for_field
    }

    /// Calculated-indicator ID → the field IDs its formula (or child list)
    /// references, for every calculated indicator that compiled.
    pub fn calculated_indicator_constituents(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.calculated_indicator_constituents
    }

    /// The order calculated indicators were compiled in.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn warnings(&self) -> &[CompileWarning] {
        &self.warnings
    }

    pub fn get(&self, id: &str) -> Option<&Calculation> {
        self.calculations_for_field.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.calculations_for_field.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.calculations_for_field.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calculations_for_field.is_empty()
    }

    pub fn field_ids(&self) -> impl Iterator<Item = &str> {
        self.calculations_for_field.keys().map(String::as_str)
    }

    /// One calculation answering every field in `ids`, for a single query.
    pub fn calculation_for<I, S>(&self, ids: I) -> CalculationResult<Calculation>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let calculations = ids
            .into_iter()
            .map(|id| {
                let id = id.as_ref();
                self.calculations_for_field
                    .get(id)
                    .ok_or_else(|| CalculationError::UnknownField(id.to_string()))
            })
            .collect::<CalculationResult<Vec<_>>>()?;
        merge(calculations)
    }
}

// ============================================================================
// Compilation Context
// ============================================================================

/// Builder for [`CompiledIndicators`].
///
/// Registration happens only through the compile steps; [`freeze`](Self::freeze)
/// hands out the finished table.
pub struct CompilationContext<'a> {
    config: &'a DeploymentConfig,
    compiled: CompiledIndicators,
}

impl<'a> CompilationContext<'a> {
    pub fn new(config: &'a DeploymentConfig) -> Self {
        Self {
            config,
            compiled: CompiledIndicators::default(),
        }
    }

    /// Build and register every raw indicator.
    ///
    /// Returns the calculated indicators, still to be compiled. A composite
    /// with neither children nor a formula is built like a raw indicator so
    /// that it degrades to SUM with a warning.
    fn cache_raw<'g>(&mut self, indicators: &[&'g IndicatorDefinition]) -> Vec<&'g IndicatorDefinition> {
        let mut calculated = Vec::new();
        for &indicator in indicators {
            if indicator.effective_formula().is_some() {
                calculated.push(indicator);
                continue;
            }
            let outcome = build_calculation(indicator, self.config);
            for warning in outcome.warnings {
                self.warn(warning.into());
            }
            self.register(&indicator.id, outcome.calculation);
        }
        calculated
    }

    /// Compile one calculated indicator against everything registered so far.
    fn compile_calculated(&mut self, indicator: &IndicatorDefinition) {
        let id = indicator.id.as_str();
        let Some(formula) = indicator.effective_formula() else {
            return;
        };

        let constituents = match self.config.formula.validator().validate(&formula) {
            Ok(tokens) => tokens,
            Err(source) => {
                self.warn(CompileWarning::InvalidFormula {
                    indicator: id.to_string(),
                    source,
                });
                return;
            }
        };

        let missing: Vec<String> = constituents
            .iter()
            .filter(|c| !self.compiled.calculations_for_field.contains_key(*c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            self.warn(CompileWarning::UnresolvedConstituent {
                indicator: id.to_string(),
                missing,
            });
            return;
        }

        let merged = merge(
            constituents
                .iter()
                .filter_map(|c| self.compiled.calculations_for_field.get(c)),
        );
        let result = merged.and_then(|merged| {
            // A composite declared through an explicit formula compiles that formula.
            if indicator.is_composite() && !indicator.children.is_empty() {
                build_composite(id, &merged, &constituents, self.config)
            } else {
                compile_formula(id, &formula, &merged, self.config).map(|c| (c, None))
            }
        });

        match result {
            Ok((calculation, reason)) => {
                if let Some(reason) = reason.filter(|r| *r != Unoptimizable::Disabled) {
                    self.warn(CompileWarning::CompositeNotOptimized {
                        indicator: id.to_string(),
                        reason,
                    });
                }
                self.register(id, calculation);
                self.compiled
                    .calculated_indicator_constituents
                    .insert(id.to_string(), constituents);
            }
            Err(err) => self.warn(CompileWarning::from_calculation_error(id, err)),
        }
    }

    fn register(&mut self, id: &str, calculation: Calculation) {
        self.compiled
            .calculations_for_field
            .insert(id.to_string(), calculation);
    }

    fn warn(&mut self, warning: CompileWarning) {
        warning.log();
        self.compiled.warnings.push(warning);
    }

    pub fn freeze(self) -> CompiledIndicators {
        self.compiled
    }
}

/// Compile every indicator in `groups`.
///
/// When an ID is defined more than once, the first definition wins.
pub fn compile_all(
    groups: &[IndicatorGroup],
    config: &DeploymentConfig,
) -> CompileResult<CompiledIndicators> {
    let mut ctx = CompilationContext::new(config);

    let (indicators, duplicates) = unique_indicators(groups);
    for duplicate in duplicates {
        ctx.warn(duplicate);
    }

    let calculated = ctx.cache_raw(&indicators);

    let formulas: BTreeMap<String, String> = calculated
        .iter()
        .filter_map(|i| i.effective_formula().map(|f| (i.id.clone(), f.into_owned())))
        .collect();
    let order = sort_calculated_indicators(&formulas).inspect_err(|err| error!("{}", err))?;

    let by_id: BTreeMap<&str, &IndicatorDefinition> =
        calculated.iter().map(|i| (i.id.as_str(), *i)).collect();
    for id in &order {
        if let Some(indicator) = by_id.get(id.as_str()) {
            ctx.compile_calculated(indicator);
        }
    }
    ctx.compiled.order = order;

    let compiled = ctx.freeze();
    info!(
        fields = compiled.len(),
        calculated = compiled.calculated_indicator_constituents.len(),
        warnings = compiled.warnings.len(),
        "compiled indicators"
    );
    Ok(compiled)
}

/// First definition of every ID in group order, plus a warning per repeat.
fn unique_indicators(
    groups: &[IndicatorGroup],
) -> (Vec<&IndicatorDefinition>, Vec<CompileWarning>) {
    let mut seen = BTreeSet::new();
    let mut indicators = Vec::new();
    let mut duplicates = Vec::new();
    for group in groups {
        for indicator in &group.indicators {
            if seen.insert(indicator.id.as_str()) {
                indicators.push(indicator);
            } else {
                duplicates.push(CompileWarning::DuplicateIndicator {
                    indicator: indicator.id.clone(),
                    group: group.group_id.clone(),
                });
            }
        }
    }
    (indicators, duplicates)
}

/// Constituent IDs of every calculated indicator, whether or not it compiles.
/// Repeated IDs resolve to their first definition, as in [`compile_all`].
pub fn formula_constituents(groups: &[IndicatorGroup]) -> BTreeMap<String, BTreeSet<String>> {
    unique_indicators(groups)
        .0
        .into_iter()
        .filter_map(|i| {
            i.effective_formula()
                .map(|f| (i.id.clone(), tokenize(&f)))
        })
        .collect()
}
