//! Aggregators and filtered aggregations.

use serde_json::{json, Value};

use super::filter::FilterSpec;
use super::DruidResult;

/// The base operation of an aggregation.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorSpec {
    DoubleSum { field_name: String },
    DoubleMax { field_name: String },
    DoubleMin { field_name: String },
    LongMax { field_name: String },
    LongMin { field_name: String },
    /// Number of matching rows.
    Count,
    ThetaSketch {
        field_name: String,
        size: u32,
        is_input_theta_sketch: bool,
    },
    /// Apply the inner aggregator only to rows carrying the latest timestamp
    /// among the rows the aggregation matches.
    AggregateLast(Box<AggregatorSpec>),
}

impl AggregatorSpec {
    pub fn double_sum(field_name: impl Into<String>) -> Self {
        AggregatorSpec::DoubleSum {
            field_name: field_name.into(),
        }
    }

    pub fn druid_type(&self) -> &'static str {
        match self {
            AggregatorSpec::DoubleSum { .. } => "doubleSum",
            AggregatorSpec::DoubleMax { .. } => "doubleMax",
            AggregatorSpec::DoubleMin { .. } => "doubleMin",
            AggregatorSpec::LongMax { .. } => "longMax",
            AggregatorSpec::LongMin { .. } => "longMin",
            AggregatorSpec::Count => "count",
            AggregatorSpec::ThetaSketch { .. } => "thetaSketch",
            AggregatorSpec::AggregateLast(_) => "aggregateLast",
        }
    }

    pub fn to_druid_json(&self, name: &str) -> Value {
        match self {
            AggregatorSpec::DoubleSum { field_name }
            | AggregatorSpec::DoubleMax { field_name }
            | AggregatorSpec::DoubleMin { field_name }
            | AggregatorSpec::LongMax { field_name }
            | AggregatorSpec::LongMin { field_name } => json!({
                "type": self.druid_type(),
                "name": name,
                "fieldName": field_name,
            }),
            AggregatorSpec::Count => json!({
                "type": "count",
                "name": name,
            }),
            AggregatorSpec::ThetaSketch {
                field_name,
                size,
                is_input_theta_sketch,
            } => json!({
                "type": "thetaSketch",
                "name": name,
                "fieldName": field_name,
                "size": size,
                "isInputThetaSketch": is_input_theta_sketch,
            }),
            AggregatorSpec::AggregateLast(inner) => json!({
                "type": "aggregateLast",
                "name": name,
                "aggregator": inner.to_druid_json(name),
            }),
        }
    }
}

/// An aggregator with an optional row filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregation {
    pub filter: Option<FilterSpec>,
    pub aggregator: AggregatorSpec,
}

impl Aggregation {
    pub fn new(aggregator: AggregatorSpec) -> Self {
        Self {
            filter: None,
            aggregator,
        }
    }

    pub fn filtered(filter: FilterSpec, aggregator: AggregatorSpec) -> Self {
        Self {
            filter: Some(filter),
            aggregator,
        }
    }

    /// Render as Druid aggregator JSON, wrapped in a `filtered` aggregator when
    /// a filter is present.
    pub fn to_druid_json(&self, name: &str) -> DruidResult<Value> {
        let aggregator = self.aggregator.to_druid_json(name);
        match &self.filter {
            Some(filter) => Ok(json!({
                "type": "filtered",
                "name": name,
                "filter": filter.to_druid_json()?,
                "aggregator": aggregator,
            })),
            None => Ok(aggregator),
        }
    }
}
