//! Integration tests for the end-to-end indicator → Druid compilation flow.
//!
//! Indicator groups are read from JSON the way deployment configs ship them,
//! compiled with `compile_all`, and checked against the Druid wire format.

use chrono::{TimeZone, Utc};
use harmony_calc::calculation::CalculationError;
use harmony_calc::compile::{compile_all, CompileWarning};
use harmony_calc::config::{DeploymentConfig, PostAggregationStyle};
use harmony_calc::druid::{DruidError, TimeInterval};
use harmony_calc::model::parse_groups_json;
use serde_json::json;

const INDICATORS: &str = r#"[
    {
        "groupId": "cases",
        "groupText": "Cases",
        "indicators": [
            { "id": "flu_cases", "text": "Flu cases" },
            { "id": "measles_cases", "text": "Measles cases" },
            { "id": "wait_days", "type": "AVERAGE" },
            { "id": "beds", "type": "STOCK", "stock_granularity": "month" }
        ]
    },
    {
        "groupId": "calculations",
        "indicators": [
            { "id": "total_cases", "formula": "flu_cases + measles_cases" },
            { "id": "flu_share", "formula": "flu_cases / total_cases * 100", "value_type": "PERCENT" },
            { "id": "pending", "formula": "flu_cases + XXXXX" },
            { "id": "all_cases", "type": "COMPOSITE", "children": ["flu_cases", "measles_cases"] }
        ]
    }
]"#;

// ============================================================================
// Lookup Table
// ============================================================================

#[test]
fn test_end_to_end_lookup_table() {
    let groups = parse_groups_json(INDICATORS).unwrap();
    let compiled = compile_all(&groups, &DeploymentConfig::default()).unwrap();

    let fields: Vec<_> = compiled.field_ids().collect();
    assert_eq!(
        fields,
        vec![
            "all_cases",
            "beds",
            "flu_cases",
            "flu_share",
            "measles_cases",
            "total_cases",
            "wait_days"
        ]
    );
    assert!(!compiled.contains("pending"));
    assert_eq!(compiled.order(), ["all_cases", "pending", "total_cases", "flu_share"]);

    assert_eq!(compiled.warnings().len(), 1);
    assert!(matches!(
        &compiled.warnings()[0],
        CompileWarning::InvalidFormula { indicator, .. } if indicator == "pending"
    ));

    let constituents = compiled.calculated_indicator_constituents();
    assert_eq!(
        constituents["flu_share"].iter().collect::<Vec<_>>(),
        vec!["flu_cases", "total_cases"]
    );
    assert!(!constituents.contains_key("pending"));
}

#[test]
fn test_total_cases_wire_format() {
    let groups = parse_groups_json(INDICATORS).unwrap();
    let compiled = compile_all(&groups, &DeploymentConfig::default()).unwrap();

    let query = compiled.get("total_cases").unwrap().to_druid_json().unwrap();
    assert_eq!(
        query,
        json!({
            "aggregations": [
                {
                    "type": "filtered",
                    "name": "flu_cases",
                    "filter": { "type": "selector", "dimension": "field", "value": "flu_cases" },
                    "aggregator": { "type": "doubleSum", "name": "flu_cases", "fieldName": "sum" }
                },
                {
                    "type": "filtered",
                    "name": "measles_cases",
                    "filter": { "type": "selector", "dimension": "field", "value": "measles_cases" },
                    "aggregator": { "type": "doubleSum", "name": "measles_cases", "fieldName": "sum" }
                }
            ],
            "postAggregations": [
                {
                    "type": "arithmetic",
                    "name": "total_cases",
                    "fn": "+",
                    "fields": [
                        { "type": "fieldAccess", "fieldName": "flu_cases" },
                        { "type": "fieldAccess", "fieldName": "measles_cases" }
                    ]
                }
            ]
        })
    );
}

#[test]
fn test_composite_wire_format() {
    let groups = parse_groups_json(INDICATORS).unwrap();
    let compiled = compile_all(&groups, &DeploymentConfig::default()).unwrap();

    let query = compiled.get("all_cases").unwrap().to_druid_json().unwrap();
    assert_eq!(
        query,
        json!({
            "aggregations": [
                {
                    "type": "filtered",
                    "name": "all_cases",
                    "filter": {
                        "type": "in",
                        "dimension": "field",
                        "values": ["flu_cases", "measles_cases"]
                    },
                    "aggregator": { "type": "doubleSum", "name": "all_cases", "fieldName": "sum" }
                }
            ],
            "postAggregations": []
        })
    );
}

#[test]
fn test_nested_formula_keeps_dependency_order() {
    let groups = parse_groups_json(INDICATORS).unwrap();
    let compiled = compile_all(&groups, &DeploymentConfig::default()).unwrap();

    let flu_share = compiled.get("flu_share").unwrap();
    assert_eq!(
        flu_share.post_aggregations().keys().collect::<Vec<_>>(),
        vec!["total_cases", "flu_share"]
    );
    assert_eq!(
        flu_share.post_aggregations()["flu_share"].to_string(),
        "((flu_cases / total_cases) * 100)"
    );
}

// ============================================================================
// Query-time Behaviour
// ============================================================================

#[test]
fn test_multi_field_query_merges_shared_aggregations() {
    let groups = parse_groups_json(INDICATORS).unwrap();
    let compiled = compile_all(&groups, &DeploymentConfig::default()).unwrap();

    let query = compiled
        .calculation_for(["flu_cases", "total_cases", "wait_days"])
        .unwrap();
    assert_eq!(
        query.aggregations().keys().collect::<Vec<_>>(),
        vec![
            "flu_cases",
            "measles_cases",
            "wait_days_for_average",
            "wait_days_event_count_for_average"
        ]
    );
    assert_eq!(
        query.post_aggregations().keys().collect::<Vec<_>>(),
        vec!["total_cases", "wait_days"]
    );

    assert_eq!(
        compiled.calculation_for(["pending"]),
        Err(CalculationError::UnknownField("pending".to_string()))
    );
}

#[test]
fn test_stock_needs_query_interval() {
    let groups = parse_groups_json(INDICATORS).unwrap();
    let compiled = compile_all(&groups, &DeploymentConfig::default()).unwrap();
    let beds = compiled.get("beds").unwrap();

    assert!(beds.needs_query_interval());
    assert!(matches!(
        beds.to_druid_json(),
        Err(CalculationError::Druid(DruidError::UnresolvedIntervalFilter { .. }))
    ));

    let interval = TimeInterval::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
    );
    let resolved = beds.resolve_intervals(&interval, "__time");
    assert!(!resolved.needs_query_interval());

    let query = resolved.to_druid_json().unwrap();
    assert_eq!(
        query["aggregations"][0]["filter"],
        json!({
            "type": "and",
            "fields": [
                { "type": "selector", "dimension": "field", "value": "beds" },
                {
                    "type": "interval",
                    "dimension": "__time",
                    "intervals": ["2024-06-01T00:00:00.000Z/2024-07-01T00:00:00.000Z"]
                }
            ]
        })
    );
}

// ============================================================================
// Deployment Options
// ============================================================================

#[test]
fn test_expression_style_post_aggregation() {
    let mut config = DeploymentConfig::default();
    config.formula.post_aggregation_style = PostAggregationStyle::Expression;

    let groups = parse_groups_json(INDICATORS).unwrap();
    let compiled = compile_all(&groups, &config).unwrap();

    let query = compiled.get("total_cases").unwrap().to_druid_json().unwrap();
    assert_eq!(
        query["postAggregations"],
        json!([{
            "type": "expression",
            "name": "total_cases",
            "expression": "flu_cases + measles_cases"
        }])
    );
}

#[test]
fn test_unoptimized_composite_sums_children() {
    let mut config = DeploymentConfig::default();
    config.composite.optimize = false;

    let groups = parse_groups_json(INDICATORS).unwrap();
    let compiled = compile_all(&groups, &config).unwrap();

    let all_cases = compiled.get("all_cases").unwrap();
    assert_eq!(all_cases.aggregations().len(), 2);
    assert_eq!(
        all_cases.post_aggregations()["all_cases"].to_string(),
        "(flu_cases + measles_cases)"
    );
    // disabled is a deployment choice, not something to report
    assert_eq!(compiled.warnings().len(), 1);
}

#[test]
fn test_cycle_aborts_compile() {
    let groups = parse_groups_json(
        r#"[{
            "groupId": "broken",
            "indicators": [
                { "id": "raw" },
                { "id": "x", "formula": "raw + y" },
                { "id": "y", "formula": "x * 2" }
            ]
        }]"#,
    )
    .unwrap();

    let err = compile_all(&groups, &DeploymentConfig::default()).unwrap_err();
    assert_eq!(err.cycles(), [vec!["x".to_string(), "y".to_string()]]);
    assert!(err.to_string().contains("x -> y"));
}
