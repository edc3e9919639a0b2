//! Primitive calculations for raw indicators.
//!
//! Every builder exposes the indicator's value under the indicator ID, either
//! as an aggregation or as a post-aggregation over helper keys that carry the
//! ID as a prefix.

use crate::config::{DeploymentConfig, StockStrategy};
use crate::druid::{
    Aggregation, AggregatorSpec, ArithmeticOp, BucketEdge, FilterSpec, Granularity, PostAggExpr,
    MILLIS_PER_DAY,
};
use crate::model::{IndicatorDefinition, IndicatorSubtype, IndicatorType};

use super::Calculation;

/// A degraded build: the calculation was still produced, but not the way the
/// indicator asked for.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildWarning {
    #[error("Indicator '{indicator}' has unknown type '{type_name}'; falling back to SUM")]
    UnknownIndicatorType { indicator: String, type_name: String },

    #[error("Indicator '{indicator}' has subtype '{subtype}', which does not apply to {indicator_type}; subtype ignored")]
    UnsupportedSubtype {
        indicator: String,
        indicator_type: String,
        subtype: String,
    },

    #[error("Indicator '{indicator}' of type {indicator_type} is missing '{parameter}'; falling back to SUM")]
    MissingParameter {
        indicator: String,
        indicator_type: String,
        parameter: &'static str,
    },
}

/// Result of building one raw indicator.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOutcome {
    pub calculation: Calculation,
    pub warnings: Vec<BuildWarning>,
}

/// Build the calculation for a raw indicator, dispatching on its type and
/// subtype.
///
/// Never fails: an unusable definition degrades to SUM and says so in
/// [`BuildOutcome::warnings`].
pub fn build_calculation(indicator: &IndicatorDefinition, config: &DeploymentConfig) -> BuildOutcome {
    let builder = Builder {
        id: &indicator.id,
        config,
    };
    let indicator_type = indicator.indicator_type();
    let indicator_type: &IndicatorType = &indicator_type;
    let mut warnings = Vec::new();

    let subtype = match (indicator_type, &indicator.subtype) {
        (_, None) => None,
        (IndicatorType::Average, Some(IndicatorSubtype::TimeBucket))
        | (IndicatorType::Stock, Some(IndicatorSubtype::LastBucket)) => indicator.subtype.as_ref(),
        (other, Some(subtype)) => {
            warnings.push(BuildWarning::UnsupportedSubtype {
                indicator: indicator.id.clone(),
                indicator_type: other.to_string(),
                subtype: subtype.to_string(),
            });
            None
        }
    };

    let missing = |parameter: &'static str| BuildWarning::MissingParameter {
        indicator: indicator.id.clone(),
        indicator_type: indicator_type.to_string(),
        parameter,
    };

    let calculation = match indicator_type {
        IndicatorType::Sum => builder.sum(),
        IndicatorType::Max => builder.max(),
        IndicatorType::Average => match subtype {
            Some(IndicatorSubtype::TimeBucket) => builder.time_bucket_average(),
            _ => builder.average(),
        },
        IndicatorType::Stock => {
            let granularity = indicator
                .stock_granularity
                .unwrap_or(config.stock.granularity);
            match (subtype, config.stock.strategy) {
                (Some(IndicatorSubtype::LastBucket), _) => {
                    builder.edge_bucket_stock(BucketEdge::Last, granularity)
                }
                (_, StockStrategy::EdgeBucket) => {
                    builder.edge_bucket_stock(config.stock.edge, granularity)
                }
                (_, StockStrategy::AggregateLast) => builder.last_value_stock(),
            }
        }
        IndicatorType::WeightedAvg => match &indicator.weight_field {
            Some(weight_field) => builder.weighted_average(weight_field),
            None => {
                warnings.push(missing("weight_field"));
                builder.sum()
            }
        },
        IndicatorType::ThetaSketchUniqueCount => match &indicator.theta_sketch_field {
            Some(sketch_field) => builder.theta_sketch(
                sketch_field,
                indicator.filter_field.as_deref(),
                indicator
                    .theta_sketch_size
                    .unwrap_or(config.theta_sketch.default_size),
            ),
            None => {
                warnings.push(missing("theta_sketch_field"));
                builder.sum()
            }
        },
        // Composites are compiled from their children; one that reaches this
        // point declared neither children nor a formula.
        IndicatorType::Composite => {
            warnings.push(missing("children"));
            builder.sum()
        }
        IndicatorType::Unknown(type_name) => {
            warnings.push(BuildWarning::UnknownIndicatorType {
                indicator: indicator.id.clone(),
                type_name: type_name.clone(),
            });
            builder.sum()
        }
    };

    BuildOutcome {
        calculation,
        warnings,
    }
}

struct Builder<'a> {
    id: &'a str,
    config: &'a DeploymentConfig,
}

impl Builder<'_> {
    fn field_filter(&self, field: &str) -> FilterSpec {
        FilterSpec::selector(&self.config.druid.field_dimension, field)
    }

    fn value_sum(&self) -> AggregatorSpec {
        AggregatorSpec::double_sum(&self.config.druid.value_field)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}{}", self.id, suffix)
    }

    fn sum(&self) -> Calculation {
        Calculation::new()
            .with_aggregation(
                self.id,
                Aggregation::filtered(self.field_filter(self.id), self.value_sum()),
            )
            .with_strict_null_field(self.id)
    }

    fn max(&self) -> Calculation {
        let aggregator = AggregatorSpec::DoubleMax {
            field_name: self.config.druid.value_field.clone(),
        };
        Calculation::new()
            .with_aggregation(
                self.id,
                Aggregation::filtered(self.field_filter(self.id), aggregator),
            )
            .with_strict_null_field(self.id)
    }

    fn average(&self) -> Calculation {
        let sum_key = self.key("_for_average");
        let count_key = self.key("_event_count_for_average");
        Calculation::new()
            .with_aggregation(
                &sum_key,
                Aggregation::filtered(self.field_filter(self.id), self.value_sum()),
            )
            .with_aggregation(
                &count_key,
                Aggregation::filtered(self.field_filter(self.id), AggregatorSpec::Count),
            )
            .with_post_aggregation(
                self.id,
                PostAggExpr::divide(PostAggExpr::field(&sum_key), PostAggExpr::field(&count_key)),
            )
            .with_strict_null_field(sum_key)
    }

    /// Average over elapsed report days: the denominator is the number of days
    /// between the first and last row reported for the field, inclusive.
    fn time_bucket_average(&self) -> Calculation {
        let sum_key = self.key("_for_average");
        let max_time_key = self.key("_max_time_for_average");
        let min_time_key = self.key("_min_time_for_average");
        let count_key = self.key("_event_count_for_average");
        let time_column = &self.config.druid.time_column;

        let day_span = PostAggExpr::divide(
            PostAggExpr::Arithmetic {
                op: ArithmeticOp::Subtract,
                fields: vec![
                    PostAggExpr::field(&max_time_key),
                    PostAggExpr::field(&min_time_key),
                ],
            },
            PostAggExpr::Constant(MILLIS_PER_DAY),
        );
        let bucket_count =
            PostAggExpr::arithmetic(ArithmeticOp::Add, [day_span, PostAggExpr::Constant(1.0)]);

        Calculation::new()
            .with_aggregation(
                &sum_key,
                Aggregation::filtered(self.field_filter(self.id), self.value_sum()),
            )
            .with_aggregation(
                &max_time_key,
                Aggregation::filtered(
                    self.field_filter(self.id),
                    AggregatorSpec::LongMax {
                        field_name: time_column.clone(),
                    },
                ),
            )
            .with_aggregation(
                &min_time_key,
                Aggregation::filtered(
                    self.field_filter(self.id),
                    AggregatorSpec::LongMin {
                        field_name: time_column.clone(),
                    },
                ),
            )
            .with_post_aggregation(&count_key, bucket_count)
            .with_post_aggregation(
                self.id,
                PostAggExpr::divide(PostAggExpr::field(&sum_key), PostAggExpr::field(&count_key)),
            )
            .with_strict_null_field(sum_key)
    }

    /// Stock read from the first/last bucket of the queried interval. The
    /// bucket filter is a placeholder until the query interval is known.
    fn edge_bucket_stock(&self, edge: BucketEdge, granularity: Granularity) -> Calculation {
        let filter = FilterSpec::and([
            self.field_filter(self.id),
            FilterSpec::EdgeBucket { edge, granularity },
        ]);
        Calculation::new()
            .with_aggregation(self.id, Aggregation::filtered(filter, self.value_sum()))
            .with_strict_null_field(self.id)
    }

    /// Stock read from the rows at the latest timestamp of the field.
    fn last_value_stock(&self) -> Calculation {
        Calculation::new()
            .with_aggregation(
                self.id,
                Aggregation::filtered(
                    self.field_filter(self.id),
                    AggregatorSpec::AggregateLast(Box::new(self.value_sum())),
                ),
            )
            .with_strict_null_field(self.id)
    }

    fn weighted_average(&self, weight_field: &str) -> Calculation {
        let numerator_key = self.key("_numerator");
        let denominator_key = self.key("_denominator");
        Calculation::new()
            .with_aggregation(
                &numerator_key,
                Aggregation::filtered(self.field_filter(self.id), self.value_sum()),
            )
            .with_aggregation(
                &denominator_key,
                Aggregation::filtered(self.field_filter(weight_field), self.value_sum()),
            )
            .with_post_aggregation(
                self.id,
                PostAggExpr::divide(
                    PostAggExpr::field(&numerator_key),
                    PostAggExpr::field(&denominator_key),
                ),
            )
            .with_strict_null_field(numerator_key)
    }

    /// Distinct count of `sketch_field` values. The sketch is always built
    /// from raw dimension values here, never from pre-aggregated sketches.
    fn theta_sketch(&self, sketch_field: &str, filter_field: Option<&str>, size: u32) -> Calculation {
        let aggregator = AggregatorSpec::ThetaSketch {
            field_name: sketch_field.to_string(),
            size,
            is_input_theta_sketch: false,
        };
        let aggregation = Aggregation {
            filter: filter_field.map(|field| self.field_filter(field)),
            aggregator,
        };
        Calculation::new().with_aggregation(self.id, aggregation)
    }
}
