use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

use meshtest::config::{LoggingConfig, MeshtestConfig};
use meshtest::controlplane::HttpControlPlane;
use meshtest::network_test::TestStatus;
use meshtest::scheduler::Scheduler;
use meshtest::storage::ExecutionFilter;

#[derive(Parser)]
#[command(
    name = "meshtest",
    about = "Scheduled throughput tests for mesh networks",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (overrides MESHTEST_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (recovery + schedules + API server)
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Inspect scheduled tests
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Inspect test executions
    Execution {
        #[command(subcommand)]
        action: ExecutionAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all schedules
    List,

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[derive(Subcommand)]
enum ExecutionAction {
    /// List executions, newest first
    List {
        /// Only executions with this status (RUNNING, FINISHED, ABORTED, FAILED)
        #[arg(long)]
        status: Option<String>,

        /// Only executions on this network
        #[arg(long)]
        network: Option<String>,

        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show per-session results of one execution
    Results {
        /// Execution id
        id: i64,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn open_scheduler(config: &MeshtestConfig) -> Result<Scheduler> {
    let pool = meshtest::storage::open_pool(&config.database.path)?;
    let control_plane = Arc::new(HttpControlPlane::new(&config.control_plane)?);
    Ok(Scheduler::new(pool, control_plane))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MeshtestConfig::load(path)?,
        None => MeshtestConfig::load_or_default(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting meshtest daemon");
            meshtest::serve(&config).await?;
        }
        Commands::Schedule { action } => {
            let scheduler = open_scheduler(&config)?;

            match action {
                ScheduleAction::List => {
                    let list = scheduler.list_schedules().await?;
                    if list.is_empty() {
                        println!("No schedules found.");
                    } else {
                        println!(
                            "{:<6} | {:<15} | {:<16} | {:<16} | Enabled",
                            "Id", "Cron", "Network", "Test"
                        );
                        println!("{:-<6}-|-{:-<15}-|-{:-<16}-|-{:-<16}-|-{:-<7}", "", "", "", "", "");
                        for s in list {
                            println!(
                                "{:<6} | {:<15} | {:<16} | {:<16} | {}",
                                s.id, s.cron_expr, s.definition.network_name, s.definition.test_type, s.enabled
                            );
                        }
                    }
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview_next_runs(hours).await?;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for run in preview {
                            println!(
                                "{} : schedule {} on {} ({})",
                                run.at, run.schedule_id, run.network_name, run.test_type
                            );
                        }
                    }
                }
            }
        }
        Commands::Execution { action } => {
            let scheduler = open_scheduler(&config)?;

            match action {
                ExecutionAction::List { status, network, limit } => {
                    let filter = ExecutionFilter {
                        status: status.as_deref().map(str::parse::<TestStatus>).transpose()?,
                        network_name: network,
                        limit: Some(limit),
                    };
                    let executions = scheduler.list_executions(&filter).await?;
                    if executions.is_empty() {
                        println!("No executions found.");
                    } else {
                        println!(
                            "{:<6} | {:<16} | {:<16} | {:<9} | Started",
                            "Id", "Network", "Test", "Status"
                        );
                        println!("{:-<6}-|-{:-<16}-|-{:-<16}-|-{:-<9}-|-{:-<25}", "", "", "", "", "");
                        for e in executions {
                            println!(
                                "{:<6} | {:<16} | {:<16} | {:<9} | {}",
                                e.id,
                                e.network_name,
                                e.test_type,
                                e.status,
                                e.start_time.to_rfc3339()
                            );
                        }
                    }
                }
                ExecutionAction::Results { id, json } => {
                    let results = scheduler.list_results(id).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&results)?);
                    } else if results.is_empty() {
                        println!("No results for execution {}.", id);
                    } else {
                        println!(
                            "{:<24} | {:<9} | {:>10} | {:>8} | Session",
                            "Asset", "Status", "Avg Mbps", "Loss %"
                        );
                        println!("{:-<24}-|-{:-<9}-|-{:->10}-|-{:->8}-|-{:-<20}", "", "", "", "", "");
                        for r in results {
                            let avg = r
                                .metrics
                                .throughput_avg_mbps
                                .map(|v| format!("{:.1}", v))
                                .unwrap_or_else(|| "-".into());
                            let loss = r
                                .metrics
                                .lost_percent_avg
                                .map(|v| format!("{:.2}", v))
                                .unwrap_or_else(|| "-".into());
                            println!(
                                "{:<24} | {:<9} | {:>10} | {:>8} | {}",
                                r.asset_name,
                                r.status,
                                avg,
                                loss,
                                r.session_id.as_deref().unwrap_or("-")
                            );
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
