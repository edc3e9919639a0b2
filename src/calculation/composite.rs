//! Composite (sum-of-children) indicators.
//!
//! When every child is a bare filtered sum over the generic field dimension,
//! the composite is a single filtered sum whose filter matches the union of
//! the children's fields: one aggregation instead of N aggregations plus a
//! summing post-aggregation. Anything short of that shape takes the formula
//! path.

use std::collections::BTreeSet;
use std::fmt;

use tracing::debug;

use crate::config::DeploymentConfig;
use crate::druid::{Aggregation, AggregatorSpec, FilterSpec};

use super::{compile_formula, Calculation, CalculationResult};

/// Why a composite could not be collapsed into one aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unoptimizable {
    Disabled,
    NoChildren,
    HasPostAggregations,
    /// The children calculation holds aggregations other than one per child.
    UnexpectedAggregations,
    NotAFilteredSum { child: String },
    NotAFieldFilter { child: String },
    MixedValueFields,
    /// Two children match the same field; a union would count its rows once
    /// where the sum counts them twice.
    OverlappingChildren { field: String },
}

impl fmt::Display for Unoptimizable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unoptimizable::Disabled => write!(f, "composite optimization is disabled"),
            Unoptimizable::NoChildren => write!(f, "composite has no children"),
            Unoptimizable::HasPostAggregations => {
                write!(f, "a child is itself a formula or derived value")
            }
            Unoptimizable::UnexpectedAggregations => {
                write!(f, "children do not map one-to-one onto aggregations")
            }
            Unoptimizable::NotAFilteredSum { child } => {
                write!(f, "child '{}' is not a filtered sum", child)
            }
            Unoptimizable::NotAFieldFilter { child } => {
                write!(f, "child '{}' is not filtered on the field dimension alone", child)
            }
            Unoptimizable::MixedValueFields => write!(f, "children sum different value fields"),
            Unoptimizable::OverlappingChildren { field } => {
                write!(f, "field '{}' is matched by more than one child", field)
            }
        }
    }
}

/// Build the calculation of composite `id` from its children.
///
/// Tries [`try_optimize`] first and falls back to compiling the formula
/// `child_1 + child_2 + ... + child_n`.
pub fn build_composite_calculation(
    id: &str,
    children_calculation: &Calculation,
    child_field_ids: &BTreeSet<String>,
    config: &DeploymentConfig,
) -> CalculationResult<Calculation> {
    build_composite(id, children_calculation, child_field_ids, config)
        .map(|(calculation, _)| calculation)
}

/// Like [`build_composite_calculation`], also returning why the fast path was
/// not taken.
pub(crate) fn build_composite(
    id: &str,
    children_calculation: &Calculation,
    child_field_ids: &BTreeSet<String>,
    config: &DeploymentConfig,
) -> CalculationResult<(Calculation, Option<Unoptimizable>)> {
    match try_optimize(id, children_calculation, child_field_ids, config) {
        Ok(calculation) => {
            debug!(indicator = %id, children = child_field_ids.len(), "composite collapsed into one aggregation");
            Ok((calculation, None))
        }
        Err(reason) => {
            debug!(indicator = %id, %reason, "composite compiled as formula");
            let formula = child_field_ids
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(" + ");
            let calculation = compile_formula(id, &formula, children_calculation, config)?;
            Ok((calculation, Some(reason)))
        }
    }
}

/// Collapse a composite into a single filtered-sum aggregation, or explain why
/// that would not be equivalent.
///
/// Applies only when the children calculation has no post-aggregations, holds
/// exactly one aggregation per child, and every such aggregation is a sum of
/// the same value field filtered by an equality or membership test on the
/// field dimension, with no field matched twice.
pub fn try_optimize(
    id: &str,
    children_calculation: &Calculation,
    child_field_ids: &BTreeSet<String>,
    config: &DeploymentConfig,
) -> Result<Calculation, Unoptimizable> {
    if !config.composite.optimize {
        return Err(Unoptimizable::Disabled);
    }
    if child_field_ids.is_empty() {
        return Err(Unoptimizable::NoChildren);
    }
    if !children_calculation.post_aggregations().is_empty() {
        return Err(Unoptimizable::HasPostAggregations);
    }

    let aggregations = children_calculation.aggregations();
    if aggregations.len() != child_field_ids.len()
        || !child_field_ids.iter().all(|child| aggregations.contains_key(child))
    {
        return Err(Unoptimizable::UnexpectedAggregations);
    }

    let field_dimension = &config.druid.field_dimension;
    let mut value_field: Option<&str> = None;
    let mut fields: BTreeSet<&str> = BTreeSet::new();

    for child in child_field_ids {
        let Some(aggregation) = aggregations.get(child) else {
            return Err(Unoptimizable::UnexpectedAggregations);
        };
        let (filter, field_name) = match aggregation {
            Aggregation {
                filter: Some(filter),
                aggregator: AggregatorSpec::DoubleSum { field_name },
            } => (filter, field_name.as_str()),
            _ => {
                return Err(Unoptimizable::NotAFilteredSum {
                    child: child.clone(),
                })
            }
        };

        match value_field {
            None => value_field = Some(field_name),
            Some(existing) if existing != field_name => {
                return Err(Unoptimizable::MixedValueFields)
            }
            Some(_) => {}
        }

        let values = filter
            .field_values(field_dimension)
            .ok_or_else(|| Unoptimizable::NotAFieldFilter {
                child: child.clone(),
            })?;
        for value in values {
            if !fields.insert(value) {
                return Err(Unoptimizable::OverlappingChildren {
                    field: value.to_string(),
                });
            }
        }
    }

    let Some(value_field) = value_field else {
        return Err(Unoptimizable::NoChildren);
    };

    let aggregation = Aggregation::filtered(
        FilterSpec::any_of(field_dimension.as_str(), fields),
        AggregatorSpec::double_sum(value_field),
    );
    Ok(Calculation::new()
        .with_aggregation(id, aggregation)
        .with_strict_null_field(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculation::{build_calculation, merge};
    use crate::config::CompositeSettings;
    use crate::druid::{ArithmeticOp, PostAggExpr};
    use crate::model::{IndicatorDefinition, IndicatorType};

    fn children(indicators: &[IndicatorDefinition]) -> (Calculation, BTreeSet<String>) {
        let config = DeploymentConfig::default();
        let built: Vec<_> = indicators
            .iter()
            .map(|i| build_calculation(i, &config).calculation)
            .collect();
        let ids = indicators.iter().map(|i| i.id.clone()).collect();
        (merge(&built).unwrap(), ids)
    }

    #[test]
    fn test_sum_children_collapse_to_one_aggregation() {
        let (calc, ids) = children(&[IndicatorDefinition::new("a"), IndicatorDefinition::new("b")]);
        let optimized = try_optimize("ab", &calc, &ids, &DeploymentConfig::default()).unwrap();

        assert_eq!(optimized.aggregations().len(), 1);
        assert!(optimized.post_aggregations().is_empty());
        assert_eq!(
            optimized.aggregations()["ab"],
            Aggregation::filtered(
                FilterSpec::In {
                    dimension: "field".to_string(),
                    values: vec!["a".to_string(), "b".to_string()],
                },
                AggregatorSpec::double_sum("sum"),
            )
        );
        assert!(optimized.strict_null_fields().contains("ab"));
    }

    #[test]
    fn test_nested_composite_unions_membership_filters() {
        let (ab, ab_ids) =
            children(&[IndicatorDefinition::new("a"), IndicatorDefinition::new("b")]);
        let config = DeploymentConfig::default();
        let ab = try_optimize("ab", &ab, &ab_ids, &config).unwrap();
        let (c, _) = children(&[IndicatorDefinition::new("c")]);

        let merged = merge([&ab, &c]).unwrap();
        let ids: BTreeSet<String> = ["ab", "c"].iter().map(|s| s.to_string()).collect();
        let abc = try_optimize("abc", &merged, &ids, &config).unwrap();
        assert_eq!(
            abc.aggregations()["abc"].filter,
            Some(FilterSpec::In {
                dimension: "field".to_string(),
                values: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            })
        );
    }

    #[test]
    fn test_average_child_is_not_optimized() {
        let (calc, ids) = children(&[
            IndicatorDefinition::new("a"),
            IndicatorDefinition::new("b").with_type(IndicatorType::Average),
        ]);
        assert_eq!(
            try_optimize("ab", &calc, &ids, &DeploymentConfig::default()),
            Err(Unoptimizable::HasPostAggregations)
        );
    }

    #[test]
    fn test_max_child_is_not_optimized() {
        let (calc, ids) = children(&[
            IndicatorDefinition::new("a"),
            IndicatorDefinition::new("b").with_type(IndicatorType::Max),
        ]);
        assert_eq!(
            try_optimize("ab", &calc, &ids, &DeploymentConfig::default()),
            Err(Unoptimizable::NotAFilteredSum {
                child: "b".to_string()
            })
        );
    }

    #[test]
    fn test_stock_child_filter_is_not_a_field_filter() {
        let (calc, ids) = children(&[
            IndicatorDefinition::new("a"),
            IndicatorDefinition::new("beds").with_type(IndicatorType::Stock),
        ]);
        assert_eq!(
            try_optimize("x", &calc, &ids, &DeploymentConfig::default()),
            Err(Unoptimizable::NotAFieldFilter {
                child: "beds".to_string()
            })
        );
    }

    #[test]
    fn test_other_dimension_filter_is_not_optimized() {
        let calc = Calculation::new()
            .with_aggregation(
                "a",
                Aggregation::filtered(
                    FilterSpec::selector("region", "north"),
                    AggregatorSpec::double_sum("sum"),
                ),
            )
            .with_aggregation(
                "b",
                Aggregation::filtered(
                    FilterSpec::selector("field", "b"),
                    AggregatorSpec::double_sum("sum"),
                ),
            );
        let ids: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            try_optimize("ab", &calc, &ids, &DeploymentConfig::default()),
            Err(Unoptimizable::NotAFieldFilter {
                child: "a".to_string()
            })
        );
    }

    #[test]
    fn test_overlapping_children_are_not_optimized() {
        let calc = Calculation::new()
            .with_aggregation(
                "ab",
                Aggregation::filtered(
                    FilterSpec::any_of("field", ["a", "b"]),
                    AggregatorSpec::double_sum("sum"),
                ),
            )
            .with_aggregation(
                "b",
                Aggregation::filtered(
                    FilterSpec::selector("field", "b"),
                    AggregatorSpec::double_sum("sum"),
                ),
            );
        let ids: BTreeSet<String> = ["ab", "b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(
            try_optimize("x", &calc, &ids, &DeploymentConfig::default()),
            Err(Unoptimizable::OverlappingChildren {
                field: "b".to_string()
            })
        );
    }

    #[test]
    fn test_fallback_sums_children() {
        let (calc, ids) = children(&[
            IndicatorDefinition::new("a"),
            IndicatorDefinition::new("b").with_type(IndicatorType::Max),
        ]);
        let result =
            build_composite_calculation("ab", &calc, &ids, &DeploymentConfig::default()).unwrap();
        assert_eq!(result.aggregations().len(), 2);
        assert_eq!(
            result.post_aggregations()["ab"],
            PostAggExpr::Arithmetic {
                op: ArithmeticOp::Add,
                fields: vec![PostAggExpr::field("a"), PostAggExpr::field("b")],
            }
        );
    }

    #[test]
    fn test_disabled_optimization_uses_formula() {
        let config = DeploymentConfig {
            composite: CompositeSettings { optimize: false },
            ..DeploymentConfig::default()
        };
        let (calc, ids) = children(&[IndicatorDefinition::new("a"), IndicatorDefinition::new("b")]);
        let result = build_composite_calculation("ab", &calc, &ids, &config).unwrap();
        assert_eq!(result.aggregations().len(), 2);
        assert!(result.post_aggregations().contains_key("ab"));
    }
}
