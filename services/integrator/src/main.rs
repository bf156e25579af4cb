//! Integrator Service - builds integrated education datasets
//!
//! Responsibilities:
//! - Resolve configuration (.env, environment, flags)
//! - Run the requested levels for one reference year, concurrently
//! - Write each successful level's dataset and report
//! - Print and persist an end-of-run summary; exit non-zero on any failure

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use integrator::output::{self, RunSummary};
use integrator::{
    DirectoryCatalog, Integrator, Level, ManifestCatalog, MappingSet, PipelineConfig,
    SourceCatalog,
};

#[derive(Parser, Debug)]
#[command(
    name = "integrator",
    about = "Integrates education microdata into per-level datasets"
)]
struct Args {
    /// Reference year
    #[arg(long)]
    year: i32,

    /// Level to build: school, municipality, student or all
    #[arg(long, default_value = "all")]
    level: String,

    /// Skip indicator and socioeconomic tables
    #[arg(long, default_value = "false")]
    no_indicators: bool,

    /// Skip the household survey
    #[arg(long, default_value = "false")]
    no_survey: bool,

    /// Deduplicate secondary tables (first row wins) instead of rejecting them
    #[arg(long, default_value = "false")]
    dedup_secondary: bool,

    /// Fill missing values (numeric mean, categorical "unknown")
    #[arg(long, default_value = "false")]
    impute: bool,

    /// Raw sources directory (overrides RAW_DIR)
    #[arg(long)]
    raw_dir: Option<PathBuf>,

    /// Output directory (overrides PROCESSED_DIR)
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// JSON code mappings (overrides CODE_MAPPINGS)
    #[arg(long)]
    mappings: Option<PathBuf>,

    /// JSON source manifest, instead of the directory naming convention
    #[arg(long)]
    manifest: Option<PathBuf>,
}

fn parse_levels(raw: &str) -> Result<Vec<Level>> {
    if raw.trim().eq_ignore_ascii_case("all") {
        return Ok(Level::ALL.to_vec());
    }
    raw.split(',')
        .map(|s| s.parse::<Level>().map_err(anyhow::Error::msg))
        .collect()
}

fn build_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env(args.year);
    config.levels = parse_levels(&args.level)?;
    config.include_indicators = !args.no_indicators;
    config.include_survey = !args.no_survey;
    config.dedup_secondary = args.dedup_secondary;
    config.impute_missing = args.impute;
    if let Some(dir) = &args.raw_dir {
        config.raw_dir = dir.clone();
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(path) = &args.mappings {
        config.mapping_path = Some(path.clone());
    }
    Ok(config)
}

fn build_catalog(args: &Args, config: &PipelineConfig) -> Result<Arc<dyn SourceCatalog>> {
    match &args.manifest {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read manifest {}", path.display()))?;
            let base = path.parent().map(PathBuf::from).unwrap_or_default();
            let catalog = ManifestCatalog::from_json(&content, &base)
                .with_context(|| format!("Invalid manifest {}", path.display()))?;
            info!(manifest = %path.display(), version = catalog.version(), "using source manifest");
            Ok(Arc::new(catalog))
        }
        None => Ok(Arc::new(DirectoryCatalog::new(&config.raw_dir))),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let mappings = match &config.mapping_path {
        Some(path) => MappingSet::from_json_file(path)?,
        None => MappingSet::census(),
    };
    info!(
        year = config.year,
        levels = ?config.levels,
        raw_dir = %config.raw_dir.display(),
        output_dir = %config.output_dir.display(),
        mappings = %mappings.version,
        "integration run starting"
    );

    let catalog = build_catalog(&args, &config)?;
    let integrator = Integrator::new(catalog, Arc::new(mappings), config.clone());

    // Levels share nothing mutable; each runs on its own blocking thread.
    let mut handles = Vec::with_capacity(config.levels.len());
    for level in config.levels.iter().copied() {
        let integrator = integrator.clone();
        handles.push((
            level,
            tokio::task::spawn_blocking(move || integrator.integrate(level)),
        ));
    }

    let mut summary = RunSummary::new(config.year);
    for (level, handle) in handles {
        match handle.await {
            Ok(Ok(dataset)) => {
                match output::write_dataset(&config.output_dir, &dataset, summary.run_id) {
                    Ok(written) => summary.record_success(&dataset, &written),
                    Err(e) => {
                        error!(level = %level, year = config.year, error = %e, "failed to write dataset");
                        summary.record_failure(level, format!("{:#}", e));
                    }
                }
            }
            Ok(Err(e)) => {
                error!(level = %level, year = config.year, error = %e, "level integration failed");
                summary.record_failure(level, e.to_string());
            }
            Err(e) => {
                error!(level = %level, year = config.year, error = %e, "level task aborted");
                summary.record_failure(level, format!("task aborted: {}", e));
            }
        }
    }
    summary.finish();

    println!("{}", summary.render());
    let path = output::write_summary(&config.output_dir, &summary)?;
    info!(path = %path.display(), "run summary written");

    if summary.has_failures() {
        bail!("{} level(s) failed", summary.failed.len());
    }
    Ok(())
}
