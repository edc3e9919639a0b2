//! Compiled calculations.
//!
//! A [`Calculation`] is the unit of query work for one or more fields: the
//! aggregations Druid computes per bucket, the post-aggregations computed from
//! them, and the set of aggregation keys whose all-null state nulls the
//! result.
//!
//! Calculations are built once and never changed after registration;
//! extending one (formula or composite compilation) clones it first.

mod builders;
mod composite;
mod formula;
mod merge;

use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;
use serde_json::{json, Value};

use crate::druid::{Aggregation, DruidError, PostAggExpr, TimeInterval};
use crate::formula::FormulaError;

pub use builders::{build_calculation, BuildOutcome, BuildWarning};
pub(crate) use composite::build_composite;
pub use composite::{build_composite_calculation, try_optimize, Unoptimizable};
pub use formula::compile_formula;
pub use merge::merge;

/// A key definition, reported on both sides of a merge conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyDefinition {
    Aggregation(Aggregation),
    PostAggregation(PostAggExpr),
}

impl fmt::Display for KeyDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyDefinition::Aggregation(agg) => match &agg.filter {
                Some(filter) => write!(f, "aggregation {:?} where {:?}", agg.aggregator, filter),
                None => write!(f, "aggregation {:?}", agg.aggregator),
            },
            KeyDefinition::PostAggregation(expr) => write!(f, "post-aggregation {}", expr),
        }
    }
}

/// Errors that can occur while building or combining calculations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CalculationError {
    #[error("Conflicting definitions for key '{key}': existing {existing}, incoming {incoming}")]
    MergeKeyConflict {
        key: String,
        existing: Box<KeyDefinition>,
        incoming: Box<KeyDefinition>,
    },

    #[error("Invalid formula for '{indicator}': {source}")]
    InvalidFormula {
        indicator: String,
        #[source]
        source: FormulaError,
    },

    #[error("Formula for '{indicator}' references keys not present in its constituents: {}", .keys.join(", "))]
    MissingKeys {
        indicator: String,
        keys: Vec<String>,
    },

    #[error("No calculation registered for field '{0}'")]
    UnknownField(String),

    #[error(transparent)]
    Druid(#[from] DruidError),
}

pub type CalculationResult<T> = Result<T, CalculationError>;

/// Aggregations, post-aggregations and strict-null keys for one or more fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Calculation {
    aggregations: IndexMap<String, Aggregation>,
    /// Insertion order is evaluation order: a post-aggregation may only refer
    /// to keys defined before it.
    post_aggregations: IndexMap<String, PostAggExpr>,
    strict_null_fields: BTreeSet<String>,
}

impl Calculation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregations(&self) -> &IndexMap<String, Aggregation> {
        &self.aggregations
    }

    pub fn post_aggregations(&self) -> &IndexMap<String, PostAggExpr> {
        &self.post_aggregations
    }

    pub fn strict_null_fields(&self) -> &BTreeSet<String> {
        &self.strict_null_fields
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.aggregations.contains_key(key) || self.post_aggregations.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.aggregations.is_empty() && self.post_aggregations.is_empty()
    }

    /// Add an aggregation. Re-adding an identical definition is a no-op; any
    /// other reuse of `key` is a conflict.
    pub fn add_aggregation(
        &mut self,
        key: impl Into<String>,
        aggregation: Aggregation,
    ) -> CalculationResult<()> {
        let key = key.into();
        if let Some(existing) = self.definition(&key) {
            let incoming = KeyDefinition::Aggregation(aggregation);
            if existing == incoming {
                return Ok(());
            }
            return Err(CalculationError::MergeKeyConflict {
                key,
                existing: Box::new(existing),
                incoming: Box::new(incoming),
            });
        }
        self.aggregations.insert(key, aggregation);
        Ok(())
    }

    /// Add a post-aggregation, with the same conflict rules as
    /// [`Calculation::add_aggregation`].
    pub fn add_post_aggregation(
        &mut self,
        key: impl Into<String>,
        expr: PostAggExpr,
    ) -> CalculationResult<()> {
        let key = key.into();
        if let Some(existing) = self.definition(&key) {
            let incoming = KeyDefinition::PostAggregation(expr);
            if existing == incoming {
                return Ok(());
            }
            return Err(CalculationError::MergeKeyConflict {
                key,
                existing: Box::new(existing),
                incoming: Box::new(incoming),
            });
        }
        self.post_aggregations.insert(key, expr);
        Ok(())
    }

    pub fn add_strict_null_field(&mut self, key: impl Into<String>) {
        self.strict_null_fields.insert(key.into());
    }

    /// Builder-style insertion for freshly created calculations, where keys are
    /// known not to collide.
    pub(crate) fn with_aggregation(mut self, key: impl Into<String>, aggregation: Aggregation) -> Self {
        self.aggregations.insert(key.into(), aggregation);
        self
    }

    pub(crate) fn with_post_aggregation(mut self, key: impl Into<String>, expr: PostAggExpr) -> Self {
        self.post_aggregations.insert(key.into(), expr);
        self
    }

    pub(crate) fn with_strict_null_field(mut self, key: impl Into<String>) -> Self {
        self.strict_null_fields.insert(key.into());
        self
    }

    fn definition(&self, key: &str) -> Option<KeyDefinition> {
        if let Some(agg) = self.aggregations.get(key) {
            return Some(KeyDefinition::Aggregation(agg.clone()));
        }
        self.post_aggregations
            .get(key)
            .map(|expr| KeyDefinition::PostAggregation(expr.clone()))
    }

    /// True if any aggregation still carries an edge-bucket placeholder.
    pub fn needs_query_interval(&self) -> bool {
        self.aggregations
            .values()
            .any(|agg| agg.filter.as_ref().is_some_and(|f| f.has_edge_bucket()))
    }

    /// Copy of this calculation with every edge-bucket placeholder resolved
    /// against `query_interval`.
    pub fn resolve_intervals(&self, query_interval: &TimeInterval, time_column: &str) -> Self {
        let aggregations = self
            .aggregations
            .iter()
            .map(|(key, agg)| {
                let filter = agg
                    .filter
                    .as_ref()
                    .map(|f| f.resolve_intervals(query_interval, time_column));
                (
                    key.clone(),
                    Aggregation {
                        filter,
                        aggregator: agg.aggregator.clone(),
                    },
                )
            })
            .collect();
        Self {
            aggregations,
            post_aggregations: self.post_aggregations.clone(),
            strict_null_fields: self.strict_null_fields.clone(),
        }
    }

    /// Render the `aggregations` and `postAggregations` sections of a Druid
    /// native query.
    pub fn to_druid_json(&self) -> CalculationResult<Value> {
        let aggregations = self
            .aggregations
            .iter()
            .map(|(key, agg)| agg.to_druid_json(key))
            .collect::<Result<Vec<_>, _>>()?;
        let post_aggregations: Vec<Value> = self
            .post_aggregations
            .iter()
            .map(|(key, expr)| expr.to_druid_json(Some(key)))
            .collect();
        Ok(json!({
            "aggregations": aggregations,
            "postAggregations": post_aggregations,
        }))
    }
}
