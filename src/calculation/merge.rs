//! Combining calculations.

use super::{Calculation, CalculationResult};

/// Merge `calculations` into a new calculation holding the union of their
/// aggregations, post-aggregations and strict-null fields.
///
/// Keys shared between inputs must carry identical definitions; anything else
/// is a [`MergeKeyConflict`](super::CalculationError::MergeKeyConflict).
/// Key order follows first appearance, which keeps every post-aggregation
/// after the keys it reads.
pub fn merge<'a, I>(calculations: I) -> CalculationResult<Calculation>
where
    I: IntoIterator<Item = &'a Calculation>,
{
    let mut merged = Calculation::new();
    for calculation in calculations {
        merged.merge_from(calculation)?;
    }
    Ok(merged)
}

impl Calculation {
    /// Merge `other` into this calculation.
    ///
    /// On conflict the keys added before the conflicting one are kept, so
    /// callers that need all-or-nothing should merge into a scratch copy.
    pub fn merge_from(&mut self, other: &Calculation) -> CalculationResult<()> {
        for (key, aggregation) in &other.aggregations {
            self.add_aggregation(key.clone(), aggregation.clone())?;
        }
        for (key, expr) in &other.post_aggregations {
            self.add_post_aggregation(key.clone(), expr.clone())?;
        }
        self.strict_null_fields
            .extend(other.strict_null_fields.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculation::{CalculationError, KeyDefinition};
    use crate::druid::{Aggregation, AggregatorSpec, FilterSpec, PostAggExpr};

    fn sum_calc(key: &str, value: &str) -> Calculation {
        Calculation::new()
            .with_aggregation(
                key,
                Aggregation::filtered(
                    FilterSpec::selector("field", value),
                    AggregatorSpec::double_sum("sum"),
                ),
            )
            .with_strict_null_field(key)
    }

    #[test]
    fn test_merge_unions_keys_and_strict_nulls() {
        let a = sum_calc("a", "a");
        let b = sum_calc("b", "b").with_post_aggregation("b_pct", PostAggExpr::field("b"));

        let merged = merge([&a, &b]).unwrap();
        assert_eq!(merged.aggregations().len(), 2);
        assert_eq!(merged.post_aggregations().len(), 1);
        assert_eq!(merged.strict_null_fields().len(), 2);
    }

    #[test]
    fn test_merge_is_idempotent_for_shared_constituents() {
        let a = sum_calc("a", "a");
        let merged = merge([&a, &a, &a]).unwrap();
        assert_eq!(merged, a);
    }

    #[test]
    fn test_merge_conflict_exposes_both_definitions() {
        let first = sum_calc("x", "x");
        let second = sum_calc("x", "other");

        match merge([&first, &second]) {
            Err(CalculationError::MergeKeyConflict {
                key,
                existing,
                incoming,
            }) => {
                assert_eq!(key, "x");
                assert_eq!(
                    *existing,
                    KeyDefinition::Aggregation(first.aggregations()["x"].clone())
                );
                assert_eq!(
                    *incoming,
                    KeyDefinition::Aggregation(second.aggregations()["x"].clone())
                );
            }
            other => panic!("expected merge conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_merge_of_nothing_is_empty() {
        let merged = merge(std::iter::empty::<&Calculation>()).unwrap();
        assert!(merged.is_empty());
    }
}
