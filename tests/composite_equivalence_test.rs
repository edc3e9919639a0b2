//! Optimized and unoptimized composite compilations must agree numerically.
//!
//! Each case compiles the same composite twice, once with the single
//! aggregation fast path and once as a sum of children, then evaluates both
//! over the same synthetic rows.

use std::collections::BTreeSet;

use chrono::{Duration, TimeZone, Utc};
use harmony_calc::calculation::{
    build_calculation, build_composite_calculation, merge, try_optimize, Calculation,
};
use harmony_calc::compile::compile_all;
use harmony_calc::config::DeploymentConfig;
use harmony_calc::evaluate::{evaluate, Row};
use harmony_calc::model::{IndicatorDefinition, IndicatorGroup, IndicatorType};

const FIELDS: [&str; 5] = ["a", "b", "c", "d", "noise"];

/// Deterministic pseudo-random rows spread over the fields above.
fn synthetic_rows(count: usize, seed: u64) -> Vec<Row> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let mut state = seed;
    let mut next = move || {
        // xorshift64
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        state
    };

    (0..count)
        .map(|i| {
            let field = FIELDS[(next() % FIELDS.len() as u64) as usize];
            let value = (next() % 10_000) as f64 / 100.0 - 20.0;
            Row::new(start + Duration::hours(i as i64))
                .with_dimension("field", field)
                .with_metric("sum", value)
        })
        .collect()
}

fn children(ids: &[&str], config: &DeploymentConfig) -> (Calculation, BTreeSet<String>) {
    let built: Vec<Calculation> = ids
        .iter()
        .map(|id| build_calculation(&IndicatorDefinition::new(*id), config).calculation)
        .collect();
    let merged = merge(&built).unwrap();
    (merged, ids.iter().map(|id| id.to_string()).collect())
}

fn composite_value(calculation: &Calculation, rows: &[Row], id: &str) -> Option<f64> {
    evaluate(calculation, rows, "__time").unwrap()[id]
}

fn assert_close(left: Option<f64>, right: Option<f64>) {
    match (left, right) {
        (Some(l), Some(r)) => assert!((l - r).abs() < 1e-6, "{} != {}", l, r),
        (l, r) => assert_eq!(l, r),
    }
}

#[test]
fn test_optimized_and_fallback_agree_on_synthetic_data() {
    let optimized_config = DeploymentConfig::default();
    let mut fallback_config = DeploymentConfig::default();
    fallback_config.composite.optimize = false;

    let (calc, ids) = children(&["a", "b", "c"], &optimized_config);
    let optimized =
        build_composite_calculation("abc", &calc, &ids, &optimized_config).unwrap();
    let fallback = build_composite_calculation("abc", &calc, &ids, &fallback_config).unwrap();

    assert_eq!(optimized.aggregations().len(), 1);
    assert!(optimized.post_aggregations().is_empty());
    assert_eq!(fallback.aggregations().len(), 3);
    assert_eq!(fallback.post_aggregations().len(), 1);

    for seed in [1_u64, 7, 42, 1234, 98765] {
        for count in [0, 1, 5, 50, 500] {
            let rows = synthetic_rows(count, seed);
            assert_close(
                composite_value(&optimized, &rows, "abc"),
                composite_value(&fallback, &rows, "abc"),
            );
        }
    }
}

#[test]
fn test_no_matching_rows_is_null_on_both_paths() {
    let config = DeploymentConfig::default();
    let mut fallback_config = DeploymentConfig::default();
    fallback_config.composite.optimize = false;

    let (calc, ids) = children(&["a", "b"], &config);
    let optimized = build_composite_calculation("ab", &calc, &ids, &config).unwrap();
    let fallback = build_composite_calculation("ab", &calc, &ids, &fallback_config).unwrap();

    let rows: Vec<Row> = synthetic_rows(100, 3)
        .into_iter()
        .filter(|row| row.dimensions["field"] == "noise")
        .collect();
    assert_eq!(composite_value(&optimized, &rows, "ab"), None);
    assert_eq!(composite_value(&fallback, &rows, "ab"), None);
}

#[test]
fn test_nested_composites_agree_through_compile_all() {
    let groups = vec![IndicatorGroup::new(
        "g",
        vec![
            IndicatorDefinition::new("a"),
            IndicatorDefinition::new("b"),
            IndicatorDefinition::new("c"),
            IndicatorDefinition::new("ab").with_children(["a", "b"]),
            IndicatorDefinition::new("abc").with_children(["ab", "c"]),
        ],
    )];
    let optimized_config = DeploymentConfig::default();
    let mut fallback_config = DeploymentConfig::default();
    fallback_config.composite.optimize = false;

    let optimized = compile_all(&groups, &optimized_config).unwrap();
    let fallback = compile_all(&groups, &fallback_config).unwrap();
    assert_eq!(optimized.get("abc").unwrap().aggregations().len(), 1);

    let rows = synthetic_rows(300, 11);
    for id in ["ab", "abc"] {
        assert_close(
            composite_value(optimized.get(id).unwrap(), &rows, id),
            composite_value(fallback.get(id).unwrap(), &rows, id),
        );
    }
}

#[test]
fn test_overlapping_children_are_not_collapsed() {
    // `ab` already covers `b`; a union filter would count `b` rows once where
    // the sum of children counts them twice.
    let groups = vec![IndicatorGroup::new(
        "g",
        vec![
            IndicatorDefinition::new("a"),
            IndicatorDefinition::new("b"),
            IndicatorDefinition::new("ab").with_children(["a", "b"]),
            IndicatorDefinition::new("ab_plus_b").with_children(["ab", "b"]),
        ],
    )];
    let config = DeploymentConfig::default();
    let compiled = compile_all(&groups, &config).unwrap();

    let ab_plus_b = compiled.get("ab_plus_b").unwrap();
    assert!(ab_plus_b.post_aggregations().contains_key("ab_plus_b"));

    let rows = synthetic_rows(200, 5);
    let sum_of = |field: &str| -> f64 {
        rows.iter()
            .filter(|row| row.dimensions["field"] == field)
            .map(|row| row.metrics["sum"])
            .sum()
    };
    let expected = sum_of("a") + 2.0 * sum_of("b");
    assert_close(
        composite_value(ab_plus_b, &rows, "ab_plus_b"),
        Some(expected),
    );
}

#[test]
fn test_non_sum_children_are_not_collapsed() {
    let config = DeploymentConfig::default();
    let built: Vec<Calculation> = [
        IndicatorDefinition::new("a"),
        IndicatorDefinition::new("b").with_type(IndicatorType::Max),
    ]
    .iter()
    .map(|i| build_calculation(i, &config).calculation)
    .collect();
    let merged = merge(&built).unwrap();
    let ids: BTreeSet<String> = ["a", "b"].iter().map(|s| s.to_string()).collect();

    assert!(try_optimize("ab", &merged, &ids, &config).is_err());

    let composite = build_composite_calculation("ab", &merged, &ids, &config).unwrap();
    let rows = synthetic_rows(200, 9);
    let values = evaluate(&composite, &rows, "__time").unwrap();
    let expected = values["a"].unwrap_or(0.0) + values["b"].unwrap_or(0.0);
    assert_close(values["ab"], Some(expected));
}
