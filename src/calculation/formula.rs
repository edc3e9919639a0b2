//! Calculated-indicator compilation.

use crate::config::{DeploymentConfig, PostAggregationStyle};
use crate::druid::PostAggExpr;
use crate::formula::{parse_formula, FormulaError};

use super::{Calculation, CalculationError, CalculationResult};

/// Compile the calculated indicator `id` from `formula`.
///
/// `constituents` must already hold every key the formula references (the
/// merged calculations of its constituent indicators). The result is a copy
/// of `constituents` with one extra post-aggregation named `id`; the shared
/// constituent calculation is left untouched.
pub fn compile_formula(
    id: &str,
    formula: &str,
    constituents: &Calculation,
    config: &DeploymentConfig,
) -> CalculationResult<Calculation> {
    let invalid = |source: FormulaError| CalculationError::InvalidFormula {
        indicator: id.to_string(),
        source,
    };

    let tokens = config.formula.validator().validate(formula).map_err(invalid)?;

    let missing: Vec<String> = tokens
        .into_iter()
        .filter(|token| !constituents.contains_key(token))
        .collect();
    if !missing.is_empty() {
        return Err(CalculationError::MissingKeys {
            indicator: id.to_string(),
            keys: missing,
        });
    }

    // Parse even in expression style so malformed formulas never reach Druid.
    let parsed = parse_formula(formula).map_err(invalid)?;
    let expr = match config.formula.post_aggregation_style {
        PostAggregationStyle::Arithmetic => parsed,
        PostAggregationStyle::Expression => PostAggExpr::Expression(formula.trim().to_string()),
    };

    let mut calculation = constituents.clone();
    calculation.add_post_aggregation(id, expr)?;
    Ok(calculation)
}
