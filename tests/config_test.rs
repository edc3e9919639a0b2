//! Deployment config loading from files and the environment.

use std::env;
use std::fs;
use std::path::PathBuf;

use harmony_calc::compile::compile_all;
use harmony_calc::config::{
    DeploymentConfig, SettingsError, StockStrategy, CONFIG_DIR_ENV_VAR, DEPLOYMENT_ENV_VAR,
};
use harmony_calc::druid::AggregatorSpec;
use harmony_calc::model::{load_groups, IndicatorDefinition, IndicatorGroup, IndicatorType};

fn temp_dir(name: &str) -> PathBuf {
    let dir = env::temp_dir().join(format!("harmony_calc_{}_{}", name, std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_from_file() {
    let dir = temp_dir("from_file");
    let path = dir.join("br.toml");
    fs::write(
        &path,
        r#"
deployment = "br"

[druid]
value_field = "value"

[stock]
strategy = "aggregate_last"
"#,
    )
    .unwrap();

    let config = DeploymentConfig::from_file(&path).unwrap();
    assert_eq!(config.deployment, "br");
    assert_eq!(config.druid.value_field, "value");
    assert_eq!(config.druid.field_dimension, "field");
    assert_eq!(config.stock.strategy, StockStrategy::AggregateLast);

    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_missing_file() {
    let path = env::temp_dir().join("harmony_calc_definitely_missing.toml");
    assert!(matches!(
        DeploymentConfig::from_file(&path),
        Err(SettingsError::FileNotFound(p)) if p == path
    ));
}

#[test]
fn test_invalid_values_are_rejected() {
    assert!(matches!(
        DeploymentConfig::from_toml_str("[theta_sketch]\ndefault_size = 1000\n"),
        Err(SettingsError::InvalidConfig(_))
    ));
    assert!(matches!(
        DeploymentConfig::from_toml_str("[druid]\nfield_dimension = \"\"\n"),
        Err(SettingsError::InvalidConfig(_))
    ));
    assert!(matches!(
        DeploymentConfig::from_toml_str("[stock]\nstrategy = \"sometimes\"\n"),
        Err(SettingsError::ParseError(_))
    ));
}

// Everything that touches ZEN_ENV lives in this one test so parallel tests
// never observe a half-set environment.
#[test]
fn test_from_env() {
    let dir = temp_dir("from_env");
    fs::write(
        dir.join("mz.toml"),
        r#"
[druid]
field_dimension = "${HARMONY_TEST_FIELD_DIMENSION}"
"#,
    )
    .unwrap();

    env::remove_var(DEPLOYMENT_ENV_VAR);
    assert!(matches!(
        DeploymentConfig::from_env(),
        Err(SettingsError::MissingEnvVar(var)) if var == DEPLOYMENT_ENV_VAR
    ));

    env::set_var(DEPLOYMENT_ENV_VAR, "mz");
    env::set_var(CONFIG_DIR_ENV_VAR, &dir);

    assert!(matches!(
        DeploymentConfig::from_env(),
        Err(SettingsError::MissingEnvVar(var)) if var == "HARMONY_TEST_FIELD_DIMENSION"
    ));

    env::set_var("HARMONY_TEST_FIELD_DIMENSION", "indicator");
    let config = DeploymentConfig::from_env().unwrap();
    assert_eq!(config.deployment, "mz");
    assert_eq!(config.druid.field_dimension, "indicator");

    env::remove_var(DEPLOYMENT_ENV_VAR);
    env::remove_var(CONFIG_DIR_ENV_VAR);
    env::remove_var("HARMONY_TEST_FIELD_DIMENSION");
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_config_drives_compilation() {
    let config = DeploymentConfig::from_toml_str(
        r#"
[druid]
field_dimension = "indicator"
value_field = "value"

[stock]
strategy = "aggregate_last"
"#,
    )
    .unwrap();

    let groups = vec![IndicatorGroup::new(
        "g",
        vec![IndicatorDefinition::new("beds").with_type(IndicatorType::Stock)],
    )];
    let compiled = compile_all(&groups, &config).unwrap();
    let beds = &compiled.get("beds").unwrap().aggregations()["beds"];

    assert_eq!(
        beds.aggregator,
        AggregatorSpec::AggregateLast(Box::new(AggregatorSpec::double_sum("value")))
    );
    assert_eq!(
        beds.filter.as_ref().and_then(|f| f.field_values("indicator")),
        Some(vec!["beds"])
    );
}

#[test]
fn test_load_groups_from_toml() {
    let dir = temp_dir("groups");
    let path = dir.join("indicators.toml");
    fs::write(
        &path,
        r#"
[[groups]]
groupId = "cases"
groupText = "Cases"

[[groups.indicators]]
id = "flu_cases"

[[groups.indicators]]
id = "wait_days"
type = "avg"

[[groups.indicators]]
id = "total"
formula = "flu_cases + wait_days"
"#,
    )
    .unwrap();

    let groups = load_groups(&path).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].indicators.len(), 3);
    assert_eq!(
        groups[0].indicators[1].indicator_type().into_owned(),
        IndicatorType::Average
    );

    let compiled = compile_all(&groups, &DeploymentConfig::default()).unwrap();
    assert_eq!(compiled.len(), 3);

    fs::remove_dir_all(&dir).ok();
}
