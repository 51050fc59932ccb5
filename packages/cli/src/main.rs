#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the areal crime risk analysis.
//!
//! Loads areal units from GeoJSON and incidents from CSV, runs the
//! pipeline and writes the report. Uses `indicatif-log-bridge` (via
//! [`crime_risk_cli_utils::init_logger`]) so log lines and the stage bar
//! share the terminal.

mod input;

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, Subcommand};
use crime_risk_areal_models::{ArealUnit, EventPoint, ReferenceFrame};
use crime_risk_cli_utils::IndicatifProgress;
use crime_risk_pipeline::{Outcome, PipelineConfig, PipelineReport, run_pipeline};
use crime_risk_spatial::{aggregate, build_contiguity};

#[derive(Parser)]
#[command(name = "crime_risk", about = "Areal crime risk analysis")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct InputArgs {
    /// GeoJSON `FeatureCollection` of unit polygons with `id` and
    /// `exposure` properties
    #[arg(long)]
    units: PathBuf,
    /// CSV of incidents with `x` and `y` columns
    #[arg(long)]
    events: PathBuf,
    /// Reference frame of the unit polygons (e.g. "EPSG:3857")
    #[arg(long)]
    frame: String,
    /// Reference frame of the incidents, if different from `--frame`.
    /// No reprojection is done; a mismatch aborts the run.
    #[arg(long)]
    events_frame: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full analysis and write the report
    Run {
        #[command(flatten)]
        input: InputArgs,
        /// TOML configuration file. Defaults apply to anything omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Where to write the JSON report (stdout if omitted)
        #[arg(long)]
        output: Option<PathBuf>,
        /// Where to write the per-unit CSV table
        #[arg(long)]
        units_csv: Option<PathBuf>,
    },
    /// Aggregate events and build the contiguity graph without fitting
    /// anything
    Validate {
        #[command(flatten)]
        input: InputArgs,
        /// TOML configuration file (only `[contiguity]` is used)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as TOML
    Config,
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    })
}

type Inputs = (Vec<ArealUnit>, Vec<EventPoint>);

fn load_inputs(input: &InputArgs) -> Result<Inputs, Box<dyn std::error::Error>> {
    let frame = ReferenceFrame::new(&input.frame);
    let events_frame = input
        .events_frame
        .as_deref()
        .map_or_else(|| frame.clone(), ReferenceFrame::new);

    let units = input::load_units(&input.units, &frame)?;
    let events = input::load_events(&input.events, &events_frame)?;
    Ok((units, events))
}

fn print_summary(report: &PipelineReport) {
    let agg = &report.aggregation;
    println!(
        "Events: {} total, {} matched, {} dropped",
        agg.events_total, agg.events_matched, agg.events_dropped
    );
    println!(
        "Graph: {} units, {} edges, {} components, {} isolates",
        report.graph.units,
        report.graph.edges,
        report.graph.components,
        report.graph.isolates.len()
    );

    match &report.autocorrelation {
        Outcome::Completed { result } => {
            let global = &result.global;
            match global.z_score.zip(global.p_value) {
                Some((z, p)) => println!(
                    "Moran's I of counts: {:.4} (z = {z:.3}, p = {p:.4})",
                    global.statistic
                ),
                None => println!("Moran's I of counts: {:.4} (degenerate)", global.statistic),
            }
        }
        Outcome::Failed { message, .. } => println!("Moran's I of counts: failed ({message})"),
        Outcome::Skipped { reason } => println!("Moran's I of counts: skipped ({reason})"),
    }

    let comparison = &report.comparison;
    for (label, model) in [
        ("Baseline", comparison.baseline.as_ref()),
        ("Spatial", comparison.spatial.as_ref()),
    ] {
        match model {
            Some(c) => println!(
                "{label:<9} {}: {:.4} [{:.4}, {:.4}]  rate ratio {:.3}{}",
                comparison.coefficient,
                c.estimate,
                c.lower,
                c.upper,
                c.rate_ratio.estimate,
                if c.converged { "" } else { "  (not converged)" }
            ),
            None => println!("{label:<9} {}: unavailable", comparison.coefficient),
        }
    }
}

fn run(
    input: &InputArgs,
    config: Option<&Path>,
    output: Option<&Path>,
    units_csv: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let multi = crime_risk_cli_utils::init_logger();
    let config = load_config(config)?;
    let (units, events) = load_inputs(input)?;

    let start = Instant::now();
    let progress = IndicatifProgress::stages_bar(&multi, "Running analysis");
    let report = run_pipeline(&units, &events, &config, progress.as_ref())?;
    progress.finish(format!(
        "Analysis finished in {:.1}s",
        start.elapsed().as_secs_f64()
    ));

    match output {
        Some(path) => {
            report.write_json(BufWriter::new(File::create(path)?))?;
            log::info!("Wrote report to {}", path.display());
        }
        None => {
            report.write_json(std::io::stdout().lock())?;
            println!();
        }
    }

    if let Some(path) = units_csv {
        report.write_units_csv(BufWriter::new(File::create(path)?))?;
        log::info!("Wrote per-unit table to {}", path.display());
    }

    if output.is_some() {
        print_summary(&report);
    }

    Ok(())
}

fn validate(input: &InputArgs, config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    crime_risk_cli_utils::init_logger();
    let config = load_config(config)?;
    let (units, events) = load_inputs(input)?;

    let aggregation = aggregate(&units, &events)?;
    let graph = build_contiguity(&aggregation.geometries, config.contiguity.rule)?;
    let missing = aggregation
        .table
        .records()
        .iter()
        .filter(|r| r.exposure.is_none())
        .count();

    println!(
        "Frame: {}",
        aggregation
            .frame
            .as_ref()
            .map_or_else(|| "(none)".to_string(), ToString::to_string)
    );
    println!(
        "Units: {} ({missing} with missing exposure)",
        aggregation.table.len()
    );
    println!(
        "Events: {} total, {} matched, {} dropped",
        aggregation.summary.events_total,
        aggregation.summary.events_matched,
        aggregation.summary.events_dropped
    );
    println!(
        "Graph ({}): {} edges, {} components",
        config.contiguity.rule,
        graph.edge_count(),
        graph.connected_components().len()
    );

    let isolates = graph.isolates();
    if !isolates.is_empty() {
        println!("Isolated units:");
        for index in isolates {
            if let Some(record) = aggregation.table.get(index) {
                println!("  {index}  {}", record.id);
            }
        }
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            input,
            config,
            output,
            units_csv,
        } => run(
            &input,
            config.as_deref(),
            output.as_deref(),
            units_csv.as_deref(),
        ),
        Commands::Validate { input, config } => validate(&input, config.as_deref()),
        Commands::Config => {
            print!("{}", toml::to_string(&PipelineConfig::default())?);
            Ok(())
        }
    }
}
