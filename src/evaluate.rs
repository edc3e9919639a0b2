//! In-memory evaluation of calculations.
//!
//! Computes a calculation over a slice of rows the way a Druid timeseries
//! query with a single `all` bucket would. Used to check that alternative
//! compilations of the same indicator agree, and by the CLI to try a
//! configuration against sample data without a cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calculation::Calculation;
use crate::druid::{
    Aggregation, AggregatorSpec, ArithmeticOp, DruidError, FilterSpec, PostAggExpr, TimeInterval,
};
use crate::formula::{parse_formula, FormulaError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Druid(#[from] DruidError),

    #[error("Post-aggregation '{key}' reads unknown key '{reference}'")]
    UnknownKey { key: String, reference: String },

    #[error("Expression post-aggregation '{key}' is invalid: {source}")]
    Formula {
        key: String,
        #[source]
        source: FormulaError,
    },
}

pub type EvalResult<T> = Result<T, EvalError>;

/// One datasource row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub dimensions: HashMap<String, String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

impl Row {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            dimensions: HashMap::new(),
            metrics: HashMap::new(),
        }
    }

    pub fn with_dimension(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(name.into(), value.into());
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Evaluate every key of `calculation` over `rows`.
///
/// Aggregations see only the rows their filter matches. Sums, maxima and
/// minima over no values are null, counts are zero. Post-aggregations read
/// null operands as zero and divide by zero to zero, except that a
/// post-aggregation is null when every strict-null key it reads, directly or
/// through other post-aggregations, is null. Fields merged into one query
/// therefore evaluate exactly as they would alone.
pub fn evaluate(
    calculation: &Calculation,
    rows: &[Row],
    time_column: &str,
) -> EvalResult<BTreeMap<String, Option<f64>>> {
    let mut values: BTreeMap<String, Option<f64>> = BTreeMap::new();

    for (key, aggregation) in calculation.aggregations() {
        let value = aggregate(aggregation, rows, time_column)?;
        values.insert(key.clone(), value);
    }

    let mut reach_memo = HashMap::new();
    for (key, expr) in calculation.post_aggregations() {
        let strict = strict_reach(key, calculation, &mut reach_memo, &mut BTreeSet::new())?;
        let all_strict_null = !strict.is_empty()
            && strict
                .iter()
                .all(|strict_key| values.get(strict_key).copied().flatten().is_none());

        let value = if all_strict_null {
            None
        } else {
            Some(post_aggregate(key, expr, &values)?)
        };
        values.insert(key.clone(), value);
    }

    Ok(values)
}

/// Evaluate `calculation` as a query over `interval`: edge-bucket filters are
/// resolved against it and rows outside it are ignored.
pub fn evaluate_interval(
    calculation: &Calculation,
    rows: &[Row],
    interval: &TimeInterval,
    time_column: &str,
) -> EvalResult<BTreeMap<String, Option<f64>>> {
    let resolved = calculation.resolve_intervals(interval, time_column);
    let in_range: Vec<Row> = rows
        .iter()
        .filter(|row| interval.contains(row.timestamp))
        .cloned()
        .collect();
    evaluate(&resolved, &in_range, time_column)
}

fn aggregate(aggregation: &Aggregation, rows: &[Row], time_column: &str) -> EvalResult<Option<f64>> {
    let mut matched = Vec::new();
    for row in rows {
        let keep = match &aggregation.filter {
            Some(filter) => matches(filter, row, time_column)?,
            None => true,
        };
        if keep {
            matched.push(row);
        }
    }
    Ok(apply(&aggregation.aggregator, &matched, time_column))
}

fn matches(filter: &FilterSpec, row: &Row, time_column: &str) -> EvalResult<bool> {
    let dimension_value = |dimension: &str| row.dimensions.get(dimension).map(String::as_str);
    let matched = match filter {
        FilterSpec::Selector { dimension, value } => {
            dimension_value(dimension) == Some(value.as_str())
        }
        FilterSpec::In { dimension, values } => {
            dimension_value(dimension).is_some_and(|v| values.iter().any(|x| x == v))
        }
        FilterSpec::And(filters) => {
            for f in filters {
                if !matches(f, row, time_column)? {
                    return Ok(false);
                }
            }
            true
        }
        FilterSpec::Or(filters) => {
            for f in filters {
                if matches(f, row, time_column)? {
                    return Ok(true);
                }
            }
            false
        }
        FilterSpec::Not(inner) => !matches(inner, row, time_column)?,
        FilterSpec::Interval {
            dimension,
            intervals,
        } => {
            let instant = if dimension == time_column {
                Some(row.timestamp)
            } else {
                dimension_value(dimension)
                    .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                    .map(|t| t.with_timezone(&Utc))
            };
            instant.is_some_and(|t| intervals.iter().any(|i| i.contains(t)))
        }
        FilterSpec::EdgeBucket { edge, granularity } => {
            return Err(DruidError::UnresolvedIntervalFilter {
                edge: *edge,
                granularity: *granularity,
            }
            .into())
        }
    };
    Ok(matched)
}

fn apply(aggregator: &AggregatorSpec, rows: &[&Row], time_column: &str) -> Option<f64> {
    let metric = |field_name: &str| -> Vec<f64> {
        rows.iter()
            .filter_map(|row| row.metrics.get(field_name).copied())
            .collect()
    };
    // `long*` aggregators over the time column read the row timestamp.
    let long_metric = |field_name: &str| -> Vec<f64> {
        if field_name == time_column {
            rows.iter()
                .map(|row| row.timestamp.timestamp_millis() as f64)
                .collect()
        } else {
            metric(field_name).into_iter().map(f64::trunc).collect()
        }
    };

    match aggregator {
        AggregatorSpec::DoubleSum { field_name } => {
            let values = metric(field_name);
            (!values.is_empty()).then(|| values.iter().sum())
        }
        AggregatorSpec::DoubleMax { field_name } => metric(field_name).into_iter().reduce(f64::max),
        AggregatorSpec::DoubleMin { field_name } => metric(field_name).into_iter().reduce(f64::min),
        AggregatorSpec::LongMax { field_name } => long_metric(field_name).into_iter().reduce(f64::max),
        AggregatorSpec::LongMin { field_name } => long_metric(field_name).into_iter().reduce(f64::min),
        AggregatorSpec::Count => Some(rows.len() as f64),
        AggregatorSpec::ThetaSketch { field_name, .. } => {
            let distinct: BTreeSet<&str> = rows
                .iter()
                .filter_map(|row| row.dimensions.get(field_name.as_str()).map(String::as_str))
                .collect();
            Some(distinct.len() as f64)
        }
        AggregatorSpec::AggregateLast(inner) => {
            let latest = rows.iter().map(|row| row.timestamp).max();
            let last_rows: Vec<&Row> = rows
                .iter()
                .copied()
                .filter(|row| Some(row.timestamp) == latest)
                .collect();
            apply(inner, &last_rows, time_column)
        }
    }
}

/// Strict-null keys that `key` reads, directly or through other
/// post-aggregations.
fn strict_reach(
    key: &str,
    calculation: &Calculation,
    memo: &mut HashMap<String, BTreeSet<String>>,
    visiting: &mut BTreeSet<String>,
) -> EvalResult<BTreeSet<String>> {
    if let Some(known) = memo.get(key) {
        return Ok(known.clone());
    }

    let mut reach = BTreeSet::new();
    if calculation.strict_null_fields().contains(key) {
        reach.insert(key.to_string());
    }
    let Some(expr) = calculation.post_aggregations().get(key) else {
        return Ok(reach);
    };
    if !visiting.insert(key.to_string()) {
        return Ok(reach);
    }

    let mut references = BTreeSet::new();
    collect_references(key, expr, &mut references)?;
    for reference in &references {
        reach.extend(strict_reach(reference, calculation, memo, visiting)?);
    }

    visiting.remove(key);
    memo.insert(key.to_string(), reach.clone());
    Ok(reach)
}

/// Keys read by `expr`, looking inside expression post-aggregations.
fn collect_references(
    key: &str,
    expr: &PostAggExpr,
    references: &mut BTreeSet<String>,
) -> EvalResult<()> {
    match expr {
        PostAggExpr::FieldAccess(reference) => {
            references.insert(reference.clone());
        }
        PostAggExpr::Constant(_) => {}
        PostAggExpr::Arithmetic { fields, .. } => {
            for field in fields {
                collect_references(key, field, references)?;
            }
        }
        PostAggExpr::Expression(formula) => {
            let parsed = parse_formula(formula).map_err(|source| EvalError::Formula {
                key: key.to_string(),
                source,
            })?;
            collect_references(key, &parsed, references)?;
        }
    }
    Ok(())
}

fn post_aggregate(
    key: &str,
    expr: &PostAggExpr,
    values: &BTreeMap<String, Option<f64>>,
) -> EvalResult<f64> {
    match expr {
        PostAggExpr::FieldAccess(reference) => match values.get(reference) {
            Some(value) => Ok(value.unwrap_or(0.0)),
            None => Err(EvalError::UnknownKey {
                key: key.to_string(),
                reference: reference.clone(),
            }),
        },
        PostAggExpr::Constant(value) => Ok(*value),
        PostAggExpr::Arithmetic { op, fields } => {
            let mut operands = fields.iter();
            let Some(first) = operands.next() else {
                return Ok(0.0);
            };
            let mut acc = post_aggregate(key, first, values)?;
            for operand in operands {
                let rhs = post_aggregate(key, operand, values)?;
                acc = match op {
                    ArithmeticOp::Add => acc + rhs,
                    ArithmeticOp::Subtract => acc - rhs,
                    ArithmeticOp::Multiply => acc * rhs,
                    ArithmeticOp::Divide if rhs == 0.0 => 0.0,
                    ArithmeticOp::Divide => acc / rhs,
                };
            }
            Ok(acc)
        }
        PostAggExpr::Expression(formula) => {
            let parsed = parse_formula(formula).map_err(|source| EvalError::Formula {
                key: key.to_string(),
                source,
            })?;
            post_aggregate(key, &parsed, values)
        }
    }
}
