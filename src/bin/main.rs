//! Harmony Calc CLI - Compile indicator definitions to Druid aggregations
//!
//! Usage:
//!   harmony-calc compile <indicators.json> [--config <deployment.toml>] [--field <id>...]
//!   harmony-calc order <indicators.json>
//!   harmony-calc evaluate <indicators.json> --rows <rows.json> --field <id>...
//!
//! Examples:
//!   harmony-calc compile config/indicators.toml --config config/mz.toml --pretty
//!   harmony-calc compile indicators.json --field beds --interval 2024-01-01/2024-04-01
//!   harmony-calc evaluate indicators.json --rows sample_rows.json --field total_cases

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use harmony_calc::compile::{compile_all, formula_constituents, CompiledIndicators};
use harmony_calc::config::{DeploymentConfig, DEPLOYMENT_ENV_VAR};
use harmony_calc::druid::TimeInterval;
use harmony_calc::evaluate::{evaluate, evaluate_interval, Row};
use harmony_calc::model::{load_groups, IndicatorGroup};
use harmony_calc::Calculation;
use serde_json::{json, Map, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "harmony-calc")]
#[command(about = "Harmony Calc - Compile indicator definitions to Druid aggregations")]
#[command(version)]
struct Cli {
    /// Deployment config (defaults to $ZEN_ENV's config, then built-in defaults)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile indicators and print their Druid aggregations
    Compile {
        /// Path to the indicator groups (.json or .toml)
        file: PathBuf,

        /// Fields to print (all compiled fields if not specified)
        #[arg(short, long)]
        field: Vec<String>,

        /// Query interval (start/end) for edge-bucket stock indicators
        #[arg(short, long)]
        interval: Option<TimeInterval>,

        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Print the compile order of calculated indicators
    Order {
        /// Path to the indicator groups (.json or .toml)
        file: PathBuf,
    },

    /// Evaluate fields over sample rows
    Evaluate {
        /// Path to the indicator groups (.json or .toml)
        file: PathBuf,

        /// JSON array of rows
        #[arg(short, long)]
        rows: PathBuf,

        /// Fields to evaluate
        #[arg(short, long, required = true)]
        field: Vec<String>,

        /// Restrict rows to this interval (start/end) and resolve stock buckets against it
        #[arg(short, long)]
        interval: Option<TimeInterval>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Commands::Compile {
            file,
            field,
            interval,
            pretty,
        } => cmd_compile(&file, &config, &field, interval.as_ref(), pretty),
        Commands::Order { file } => cmd_order(&file, &config),
        Commands::Evaluate {
            file,
            rows,
            field,
            interval,
        } => cmd_evaluate(&file, &config, &rows, &field, interval.as_ref()),
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<DeploymentConfig> {
    if let Some(path) = path {
        return DeploymentConfig::from_file(path)
            .with_context(|| format!("loading deployment config '{}'", path.display()));
    }
    if env::var_os(DEPLOYMENT_ENV_VAR).is_some() {
        return DeploymentConfig::from_env().context("loading deployment config from environment");
    }
    Ok(DeploymentConfig::default())
}

fn load(file: &Path) -> anyhow::Result<Vec<IndicatorGroup>> {
    load_groups(file).with_context(|| format!("loading indicators '{}'", file.display()))
}

fn compile(file: &Path, config: &DeploymentConfig) -> anyhow::Result<CompiledIndicators> {
    let groups = load(file)?;
    Ok(compile_all(&groups, config)?)
}

fn requested<'a>(compiled: &'a CompiledIndicators, fields: &'a [String]) -> Vec<&'a str> {
    if fields.is_empty() {
        compiled.field_ids().collect()
    } else {
        fields.iter().map(String::as_str).collect()
    }
}

fn cmd_compile(
    file: &Path,
    config: &DeploymentConfig,
    fields: &[String],
    interval: Option<&TimeInterval>,
    pretty: bool,
) -> anyhow::Result<()> {
    let compiled = compile(file, config)?;

    let mut output = Map::new();
    for id in requested(&compiled, fields) {
        let calculation = compiled.calculation_for([id])?;
        let calculation = resolve(id, calculation, interval, config)?;
        output.insert(id.to_string(), calculation.to_druid_json()?);
    }

    let output = Value::Object(output);
    let rendered = if pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{}", rendered);

    if !compiled.warnings().is_empty() {
        eprintln!("{} warning(s):", compiled.warnings().len());
        for warning in compiled.warnings() {
            eprintln!("  - {}", warning);
        }
    }
    Ok(())
}

fn resolve(
    id: &str,
    calculation: Calculation,
    interval: Option<&TimeInterval>,
    config: &DeploymentConfig,
) -> anyhow::Result<Calculation> {
    if !calculation.needs_query_interval() {
        return Ok(calculation);
    }
    match interval {
        Some(interval) => Ok(calculation.resolve_intervals(interval, &config.druid.time_column)),
        None => bail!("field '{}' reads an edge bucket; pass --interval start/end", id),
    }
}

fn cmd_order(file: &Path, config: &DeploymentConfig) -> anyhow::Result<()> {
    let groups = load(file)?;
    let compiled = compile_all(&groups, config)?;
    let constituents = formula_constituents(&groups);

    for (position, id) in compiled.order().iter().enumerate() {
        let uses = constituents
            .get(id)
            .map(|c| c.iter().cloned().collect::<Vec<_>>().join(", "))
            .unwrap_or_default();
        println!("{:>4}. {} ({})", position + 1, id, uses);
    }
    Ok(())
}

fn cmd_evaluate(
    file: &Path,
    config: &DeploymentConfig,
    rows_file: &Path,
    fields: &[String],
    interval: Option<&TimeInterval>,
) -> anyhow::Result<()> {
    let compiled = compile(file, config)?;
    let content = fs::read_to_string(rows_file)
        .with_context(|| format!("reading rows '{}'", rows_file.display()))?;
    let rows: Vec<Row> = serde_json::from_str(&content)
        .with_context(|| format!("parsing rows '{}'", rows_file.display()))?;

    let calculation = compiled.calculation_for(fields)?;
    let time_column = &config.druid.time_column;
    let values = match interval {
        Some(interval) => evaluate_interval(&calculation, &rows, interval, time_column)?,
        None => evaluate(&calculation, &rows, time_column)?,
    };

    let output: Map<String, Value> = fields
        .iter()
        .map(|id| (id.clone(), json!(values.get(id).copied().flatten())))
        .collect();
    println!("{}", serde_json::to_string_pretty(&Value::Object(output))?);
    Ok(())
}
