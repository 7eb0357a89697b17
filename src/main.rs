use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

use cxmedic::config::{EngineConfig, LoggingConfig};
use cxmedic::detect::engine::DetectionEngine;
use cxmedic::detect::incident::IncidentManager;
use cxmedic::detect::{Incident, IncidentStatus, Severity};
use cxmedic::metrics::{Cohort, MetricKind, TimeRange};
use cxmedic::rca::{RcaEngine, RcaReport};
use cxmedic::storage;

#[derive(Parser)]
#[command(
    name = "cxmedic",
    about = "Detection and root cause analysis for delivery CX metrics",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides CXMEDIC_CONFIG and the system path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path (overrides the configured one)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (HTTP API over the order and incident store)
    Serve {
        /// Bind address; defaults to the configured one
        #[arg(long)]
        bind: Option<String>,
    },

    /// Load order observations from a JSON Lines file
    Ingest {
        /// Path to the .jsonl file, one order per line
        #[arg(long)]
        orders: PathBuf,
    },

    /// Run a detection pass over a time range
    Detect {
        /// Metric to evaluate, e.g. on_time_rate
        #[arg(long, conflicts_with = "all_metrics")]
        metric: Option<String>,

        /// Evaluate the whole configured watchlist instead
        #[arg(long)]
        all_metrics: bool,

        /// Range start, RFC3339; defaults to end minus the configured lookback
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Range end, RFC3339; defaults to now
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        /// Cohort filter; repeat for multiple dimensions
        #[arg(long, value_name = "DIM=VALUE")]
        cohort: Vec<String>,
    },

    /// Run root cause analysis against a detected incident
    Rca {
        /// Incident id (inc_...)
        #[arg(long)]
        incident: String,
    },

    /// Inspect and manage incidents
    Incidents {
        #[command(subcommand)]
        action: IncidentAction,
    },
}

#[derive(Subcommand)]
enum IncidentAction {
    /// List incidents, newest first
    List {
        /// Filter by status (new, investigating, resolved)
        #[arg(long)]
        status: Option<String>,

        /// Filter by severity (LOW, MEDIUM, HIGH)
        #[arg(long)]
        severity: Option<String>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Show one incident in full
    Show { id: String },

    /// Advance an incident's status (forward only)
    SetStatus { id: String, status: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default(),
    };
    config.validate()?;
    init_tracing(&config.logging);

    let db_path = cli.db.clone().unwrap_or_else(|| config.database.path.clone());
    let db = db_path.to_string_lossy().into_owned();

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.server.bind.clone());
            tracing::info!(%bind, %db, "starting cxmedic daemon");
            cxmedic::serve(&bind, &db, config).await?;
        }

        Commands::Ingest { orders } => {
            let pool = storage::open_pool(&db)?;
            let n = storage::ingest_jsonl(&pool, &orders)
                .with_context(|| format!("ingesting {}", orders.display()))?;
            println!("Ingested {n} orders into {db}");
        }

        Commands::Detect {
            metric,
            all_metrics,
            start,
            end,
            cohort,
        } => {
            let pool = storage::open_pool(&db)?;
            let engine = DetectionEngine::new(pool, &config);

            let end = end.unwrap_or_else(Utc::now);
            let start = start
                .unwrap_or_else(|| end - chrono::Duration::hours(config.detection.lookback_hours));
            anyhow::ensure!(start < end, "--start must precede --end");
            let range = TimeRange::new(start, end);

            let cohort = parse_cohort_args(&cohort)?;
            let metrics: Vec<MetricKind> = if all_metrics {
                config.detection.watch_metrics.clone()
            } else {
                let name = metric
                    .as_deref()
                    .ok_or_else(|| anyhow!("pass --metric <name> or --all-metrics"))?;
                vec![name.parse()?]
            };

            let found = engine.run_pass(&metrics, &[cohort], range).await?;
            if found.is_empty() {
                println!("No regressions detected over {range}");
            } else {
                println!("\n{} regression(s) detected:", found.len());
                print_incident_table(&found);
            }
        }

        Commands::Rca { incident } => {
            let pool = storage::open_pool(&db)?;
            let engine = RcaEngine::new(pool, &config);
            let report = engine.run_rca(&incident).await?;
            print_report(&report);
        }

        Commands::Incidents { action } => {
            let pool = storage::open_pool(&db)?;
            let manager = IncidentManager::new(pool);

            match action {
                IncidentAction::List {
                    status,
                    severity,
                    limit,
                } => {
                    let status = parse_opt::<IncidentStatus>(status.as_deref(), "status")?;
                    let severity = parse_opt::<Severity>(severity.as_deref(), "severity")?;
                    let incidents = manager.list(status, severity, limit)?;
                    if incidents.is_empty() {
                        println!("No incidents found.");
                    } else {
                        print_incident_table(&incidents);
                    }
                }
                IncidentAction::Show { id } => {
                    let incident = manager
                        .get(&id)?
                        .ok_or_else(|| anyhow!("incident '{id}' not found"))?;
                    println!("{}", serde_json::to_string_pretty(&incident)?);
                }
                IncidentAction::SetStatus { id, status } => {
                    let next: IncidentStatus =
                        status.parse().map_err(|s| anyhow!("unknown status '{s}'"))?;
                    let updated = manager.set_status(&id, next)?;
                    println!("{} -> {}", updated.id, updated.status);
                }
            }
        }
    }

    Ok(())
}

/// RUST_LOG wins when set; the configured level is the fallback.
fn init_tracing(cfg: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cfg.level.clone()));
    if cfg.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn parse_opt<T: std::str::FromStr<Err = String>>(
    value: Option<&str>,
    what: &str,
) -> Result<Option<T>> {
    value
        .map(|s| s.parse::<T>())
        .transpose()
        .map_err(|s| anyhow!("unknown {what} '{s}'"))
}

fn parse_cohort_args(pairs: &[String]) -> Result<Cohort> {
    let mut cohort = Cohort::root();
    for pair in pairs {
        let (dim, value) = Cohort::parse_pair(pair)?;
        cohort = cohort.with(dim, value);
    }
    Ok(cohort)
}

fn print_incident_table(incidents: &[Incident]) {
    println!(
        "{:<16} | {:<17} | {:<20} | {:<8} | {:<13} | {:>8}",
        "ID", "Metric", "Cohort", "Severity", "Status", "Delta%"
    );
    println!(
        "{:-<16}-|-{:-<17}-|-{:-<20}-|-{:-<8}-|-{:-<13}-|-{:-<8}",
        "", "", "", "", "", ""
    );
    for inc in incidents {
        println!(
            "{:<16} | {:<17} | {:<20} | {:<8} | {:<13} | {:>7.1}%",
            inc.id,
            inc.metric.as_str(),
            inc.cohort.key(),
            inc.severity.as_str(),
            inc.status.as_str(),
            inc.delta_percent
        );
    }
}

fn print_report(report: &RcaReport) {
    println!("\nRCA report for {} ({})", report.incident_id, report.metric);
    println!(
        "Generated {} | {} hypotheses tested",
        report.generated_at.to_rfc3339(),
        report.hypotheses_tested
    );
    println!();
    println!(
        "{:<28} | {:<12} | {:>10} | {:>7} | {:>8}",
        "Hypothesis", "Category", "Confidence", "Impact", "Combined"
    );
    println!(
        "{:-<28}-|-{:-<12}-|-{:-<10}-|-{:-<7}-|-{:-<8}",
        "", "", "", "", ""
    );
    for cause in &report.ranked_causes {
        println!(
            "{:<28} | {:<12} | {:>10.3} | {:>7.3} | {:>8.3}",
            cause.hypothesis,
            cause.category.as_str(),
            cause.confidence,
            cause.impact,
            cause.combined
        );
    }
    println!("\n{}", report.narrative);
    println!("{}", report.summary);
}
