//! Typed model of the Druid native-query pieces a calculation is made of.
//!
//! Filters, aggregators and post-aggregators are closed enums rather than
//! loose JSON objects, so every shape the compiler can emit is listed here
//! and rendered to wire JSON in one place.

mod aggregation;
mod filter;
mod interval;
mod post_aggregation;

pub use aggregation::{Aggregation, AggregatorSpec};
pub use filter::FilterSpec;
pub use interval::{BucketEdge, Granularity, TimeInterval};
pub use post_aggregation::{ArithmeticOp, PostAggExpr};

/// Milliseconds in one day, used to turn `__time` spans into day counts.
pub const MILLIS_PER_DAY: f64 = 86_400_000.0;

/// Errors raised while rendering Druid query JSON.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DruidError {
    #[error("Edge-bucket filter ({edge} {granularity}) must be resolved against a query interval before serialization")]
    UnresolvedIntervalFilter {
        edge: BucketEdge,
        granularity: Granularity,
    },
}

pub type DruidResult<T> = Result<T, DruidError>;
