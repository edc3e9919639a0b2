//! Dimension filters attached to filtered aggregators.

use std::collections::BTreeSet;

use serde_json::{json, Value};

use super::interval::{BucketEdge, Granularity, TimeInterval};
use super::{DruidError, DruidResult};

/// A Druid dimension filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterSpec {
    /// `dimension == value`
    Selector { dimension: String, value: String },

    /// `dimension IN values`. Values are kept sorted and unique.
    In {
        dimension: String,
        values: Vec<String>,
    },

    And(Vec<FilterSpec>),

    Or(Vec<FilterSpec>),

    Not(Box<FilterSpec>),

    /// Rows whose time column falls inside any of the intervals.
    Interval {
        dimension: String,
        intervals: Vec<TimeInterval>,
    },

    /// Placeholder for the first/last bucket of the queried interval.
    ///
    /// Resolved into an [`FilterSpec::Interval`] by [`FilterSpec::resolve_intervals`]
    /// once the query interval is known; it has no wire representation.
    EdgeBucket {
        edge: BucketEdge,
        granularity: Granularity,
    },
}

impl FilterSpec {
    pub fn selector(dimension: impl Into<String>, value: impl Into<String>) -> Self {
        FilterSpec::Selector {
            dimension: dimension.into(),
            value: value.into(),
        }
    }

    /// Membership filter over `values`.
    ///
    /// Collapses to a plain [`FilterSpec::Selector`] when only one distinct
    /// value remains.
    pub fn any_of<I, S>(dimension: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut values: Vec<String> = values
            .into_iter()
            .map(Into::into)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let dimension = dimension.into();
        if values.len() == 1 {
            return FilterSpec::Selector {
                dimension,
                value: values.remove(0),
            };
        }
        FilterSpec::In { dimension, values }
    }

    /// Conjunction that flattens nested `And` filters.
    pub fn and(filters: impl IntoIterator<Item = FilterSpec>) -> Self {
        let mut flat = Vec::new();
        for filter in filters {
            match filter {
                FilterSpec::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.remove(0)
        } else {
            FilterSpec::And(flat)
        }
    }

    /// The values this filter matches on `dimension`, if the filter is a plain
    /// equality or membership test against that dimension.
    ///
    /// Any other filter shape returns `None`, including compound filters that
    /// happen to mention the dimension.
    pub fn field_values(&self, dimension: &str) -> Option<Vec<&str>> {
        match self {
            FilterSpec::Selector {
                dimension: dim,
                value,
            } if dim == dimension => Some(vec![value.as_str()]),
            FilterSpec::In {
                dimension: dim,
                values,
            } if dim == dimension => Some(values.iter().map(String::as_str).collect()),
            _ => None,
        }
    }

    /// True if an unresolved edge-bucket placeholder remains anywhere in the filter.
    pub fn has_edge_bucket(&self) -> bool {
        match self {
            FilterSpec::EdgeBucket { .. } => true,
            FilterSpec::And(filters) | FilterSpec::Or(filters) => {
                filters.iter().any(FilterSpec::has_edge_bucket)
            }
            FilterSpec::Not(inner) => inner.has_edge_bucket(),
            _ => false,
        }
    }

    /// Replace every edge-bucket placeholder with a concrete interval filter on
    /// `time_column`, computed against the queried interval.
    pub fn resolve_intervals(&self, query_interval: &TimeInterval, time_column: &str) -> Self {
        match self {
            FilterSpec::EdgeBucket { edge, granularity } => FilterSpec::Interval {
                dimension: time_column.to_string(),
                intervals: vec![query_interval.edge_bucket(*edge, *granularity)],
            },
            FilterSpec::And(filters) => FilterSpec::And(
                filters
                    .iter()
                    .map(|f| f.resolve_intervals(query_interval, time_column))
                    .collect(),
            ),
            FilterSpec::Or(filters) => FilterSpec::Or(
                filters
                    .iter()
                    .map(|f| f.resolve_intervals(query_interval, time_column))
                    .collect(),
            ),
            FilterSpec::Not(inner) => {
                FilterSpec::Not(Box::new(inner.resolve_intervals(query_interval, time_column)))
            }
            other => other.clone(),
        }
    }

    /// Render as Druid native filter JSON.
    pub fn to_druid_json(&self) -> DruidResult<Value> {
        let value = match self {
            FilterSpec::Selector { dimension, value } => json!({
                "type": "selector",
                "dimension": dimension,
                "value": value,
            }),
            FilterSpec::In { dimension, values } => json!({
                "type": "in",
                "dimension": dimension,
                "values": values,
            }),
            FilterSpec::And(filters) => json!({
                "type": "and",
                "fields": filters
                    .iter()
                    .map(FilterSpec::to_druid_json)
                    .collect::<DruidResult<Vec<_>>>()?,
            }),
            FilterSpec::Or(filters) => json!({
                "type": "or",
                "fields": filters
                    .iter()
                    .map(FilterSpec::to_druid_json)
                    .collect::<DruidResult<Vec<_>>>()?,
            }),
            FilterSpec::Not(inner) => json!({
                "type": "not",
                "field": inner.to_druid_json()?,
            }),
            FilterSpec::Interval {
                dimension,
                intervals,
            } => json!({
                "type": "interval",
                "dimension": dimension,
                "intervals": intervals
                    .iter()
                    .map(TimeInterval::to_druid_interval)
                    .collect::<Vec<_>>(),
            }),
            FilterSpec::EdgeBucket { edge, granularity } => {
                return Err(DruidError::UnresolvedIntervalFilter {
                    edge: *edge,
                    granularity: *granularity,
                })
            }
        };
        Ok(value)
    }
}
