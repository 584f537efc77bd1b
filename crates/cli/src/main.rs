//! Research pipeline CLI entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Parse configuration**: load the TOML config file, apply environment
//!    overrides (`OLLAMA_HOST`, `MIN_QUALITY_SCORE`, `MAX_SOURCES`) and
//!    validate the result.
//! 2. **Wire observability**: JSON `tracing-subscriber` output plus an
//!    OpenTelemetry OTLP exporter when `OTEL_EXPORTER_OTLP_ENDPOINT` is set.
//! 3. **Construct infrastructure**: the Ollama connector, the enabled
//!    literature sources and the checkpoint store, injected into
//!    `PipelineExecutor` through [`nodes::build_pipeline`].
//! 4. **Dispatch the command**: `run`, `resume` or `status`. Ctrl-C cancels
//!    an in-flight run; the partial state is still written out.

mod output;
mod telemetry;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use nodes::{build_pipeline, JsonFileCheckpointStore, PipelineExecutor, RunOutcome};
use pipeline::{
    PipelineRunId, PipelineState, ResearchConfig, ResearchDomain, ResearchQuery, YearRange,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Automated literature research pipeline.
#[derive(Debug, Parser)]
#[command(name = "research-pipeline", version, about)]
struct Cli {
    /// Configuration file. Missing files fall back to built-in defaults
    /// unless the path was given explicitly.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the full pipeline for one research question.
    Run(RunArgs),
    /// Continue an interrupted run from its latest checkpoint.
    Resume {
        /// Identifier printed when the run started.
        run_id: String,
    },
    /// Show the latest checkpointed status of a run.
    Status {
        run_id: String,
    },
}

#[derive(Debug, clap::Args)]
struct RunArgs {
    /// The research question.
    question: String,

    #[arg(long, default_value = "physics-education")]
    domain: String,

    #[arg(long)]
    max_sources: Option<usize>,

    #[arg(long)]
    min_sources: Option<usize>,

    /// Extra search keyword; repeatable.
    #[arg(long = "keyword", short = 'k')]
    keywords: Vec<String>,

    /// Drop documents mentioning this keyword; repeatable.
    #[arg(long = "exclude")]
    exclude_keywords: Vec<String>,

    /// Preferred publication years, e.g. `2015-2024`.
    #[arg(long)]
    years: Option<String>,

    /// Directory for `state.json` and `report.md`.
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

const DEFAULT_CONFIG_FILE: &str = "research.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let telemetry = telemetry::init()?;
    let result = dispatch(cli).await;
    telemetry.shutdown();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run(args) => {
            if let Some(dir) = &args.output_dir {
                config.output_dir = dir.clone();
            }
            let query = build_query(&args, &config)?;
            let executor = assemble(&config)?;
            let run_id = PipelineRunId::new_random();
            println!("run id: {run_id}");
            let cancel = cancel_on_ctrl_c();
            let outcome = executor
                .run_as(run_id, PipelineState::new(query), cancel)
                .await
                .context("starting pipeline run")?;
            finish(&config, &outcome)
        }
        Command::Resume { run_id } => {
            let run_id = parse_run_id(&run_id)?;
            let executor = assemble(&config)?;
            let outcome = executor
                .resume(run_id, cancel_on_ctrl_c())
                .await
                .with_context(|| format!("resuming run {run_id}"))?;
            finish(&config, &outcome)
        }
        Command::Status { run_id } => {
            let run_id = parse_run_id(&run_id)?;
            let executor = assemble(&config)?;
            let report = executor
                .status(run_id)
                .await
                .with_context(|| format!("reading status of run {run_id}"))?;
            println!("run {}: {}", report.run_id, report.status);
            if let Some(stage) = &report.current_stage {
                println!("current stage: {stage}");
            }
            for outcome in &report.outcomes {
                println!(
                    "  {:<20} {:?} ({} ms)",
                    outcome.stage.as_str(),
                    outcome.status,
                    outcome.elapsed.as_millis()
                );
            }
            for error in &report.errors {
                println!("  error: {error}");
            }
            Ok(())
        }
    }
}

/// Loads the config file (if any), applies environment overrides and validates.
fn load_config(path: Option<&Path>) -> anyhow::Result<ResearchConfig> {
    let mut config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            ResearchConfig::from_toml_str(&text)?
        }
        None => match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
            Ok(text) => ResearchConfig::from_toml_str(&text)
                .with_context(|| format!("parsing {DEFAULT_CONFIG_FILE}"))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ResearchConfig::default(),
            Err(e) => return Err(e).with_context(|| format!("reading {DEFAULT_CONFIG_FILE}")),
        },
    };
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn build_query(args: &RunArgs, config: &ResearchConfig) -> anyhow::Result<ResearchQuery> {
    let domain: ResearchDomain = args.domain.parse()?;
    let mut builder = ResearchQuery::builder(args.question.clone())
        .domain(domain)
        .max_sources(args.max_sources.unwrap_or(config.query.max_sources))
        .min_sources(args.min_sources.unwrap_or(config.query.min_sources))
        .keywords(args.keywords.iter().cloned())
        .exclude_keywords(args.exclude_keywords.iter().cloned());
    if let Some(years) = &args.years {
        builder = builder.preferred_years(parse_years(years)?);
    }
    Ok(builder.build()?)
}

/// Parses `START-END` (or a single year) into a [`YearRange`].
fn parse_years(raw: &str) -> anyhow::Result<YearRange> {
    let (start, end) = match raw.split_once('-') {
        Some((start, end)) => (start.trim(), end.trim()),
        None => (raw.trim(), raw.trim()),
    };
    let start: i32 = start.parse().with_context(|| format!("invalid start year '{start}'"))?;
    let end: i32 = end.parse().with_context(|| format!("invalid end year '{end}'"))?;
    YearRange::new(start, end).ok_or_else(|| anyhow!("year range {start}-{end} is reversed"))
}

fn parse_run_id(raw: &str) -> anyhow::Result<PipelineRunId> {
    PipelineRunId::parse(raw).ok_or_else(|| anyhow!("'{raw}' is not a run id"))
}

fn assemble(config: &ResearchConfig) -> anyhow::Result<PipelineExecutor> {
    let connector =
        llm::OllamaConnector::new(config.ollama_host.clone(), config.retry.per_attempt_timeout());
    let adapters = sources::from_settings(&config.sources)?;
    let checkpoint_dir = config
        .checkpoint_dir
        .clone()
        .unwrap_or_else(|| config.output_dir.join("checkpoints"));
    let checkpoints = JsonFileCheckpointStore::new(checkpoint_dir);
    Ok(build_pipeline(
        config,
        Arc::new(connector),
        adapters,
        Arc::new(checkpoints),
    )?)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling run");
            trigger.cancel();
        }
    });
    cancel
}

fn finish(config: &ResearchConfig, outcome: &RunOutcome) -> anyhow::Result<()> {
    let files = output::write_run(&config.output_dir, outcome)?;
    info!(
        run_id = %outcome.run_id,
        status = %outcome.status,
        papers = outcome.state.papers.len(),
        errors = outcome.state.errors.len(),
        warnings = outcome.state.warnings.len(),
        "Run finished"
    );

    println!("status: {}", outcome.status);
    if let Some(quality) = &outcome.state.quality {
        println!("quality: {} ({:?})", quality.overall, quality.level);
    }
    println!("state: {}", files.state.display());
    if let Some(report) = &files.report {
        println!("report: {}", report.display());
    }
    for warning in &outcome.state.warnings {
        println!("  warning: {warning}");
    }
    for error in &outcome.state.errors {
        println!("  error: {error}");
    }

    if let Some(error) = outcome.run_error() {
        bail!(error);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_arguments_parse() {
        let cli = Cli::try_parse_from([
            "research-pipeline",
            "run",
            "How do labs help?",
            "--domain",
            "pedagogy",
            "-k",
            "optics",
            "-k",
            "lenses",
            "--years",
            "2015-2024",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.keywords, vec!["optics", "lenses"]);

        let query = build_query(&args, &ResearchConfig::default()).unwrap();
        assert_eq!(query.domain, ResearchDomain::Pedagogy);
        assert_eq!(query.preferred_years, YearRange::new(2015, 2024));
        assert_eq!(query.max_sources, ResearchConfig::default().query.max_sources);
    }

    #[test]
    fn test_small_max_sources_flag_builds_a_query() {
        let cli = Cli::try_parse_from(["research-pipeline", "run", "q", "--max-sources", "3"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        let query = build_query(&args, &ResearchConfig::default()).unwrap();
        assert_eq!(query.max_sources, 3);
        assert_eq!(query.min_sources, 3);
    }

    #[test]
    fn test_year_parsing() {
        assert_eq!(parse_years("2020").unwrap(), YearRange::new(2020, 2020).unwrap());
        assert!(parse_years("2024-2015").is_err());
        assert!(parse_years("recent").is_err());
    }

    #[test]
    fn test_explicit_missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_config(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_config_file_values_are_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("research.toml");
        std::fs::write(&path, "[engine]\nmax_reworks = 0\n").unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.engine.max_reworks, 0);
    }

    #[test]
    fn test_status_requires_valid_run_id() {
        assert!(parse_run_id("not-a-uuid").is_err());
        assert!(parse_run_id("67e55044-10b1-426f-9247-bb680e5fe0c8").is_ok());
    }
}
