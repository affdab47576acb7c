use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chartkeep_feed::load_identity_file;
use chartkeep_pipeline::{DailyPipeline, DailyRequest, PipelineConfig, PipelineError, RunOutcome, SystemClock};
use chartkeep_storage::{
    BackoffPolicy, HttpFetcher, IdentityAuthority, MemoryStore, PgStore, PoolConfig, Store,
    StoreError,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "chartkeep-cli")]
#[command(about = "Daily artist chart pipeline")]
struct Cli {
    /// Postgres connection string. Without one, state lives in CHARTKEEP_STATE_FILE.
    #[arg(long, global = true, env = "DATABASE_URL")]
    database_url: Option<String>,
    /// YAML identity mappings to seed the offline store with.
    #[arg(long, global = true)]
    identities: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compute (and unless --dry-run, publish) the chart for one date.
    Run {
        #[arg(long)]
        date: NaiveDate,
        /// Feed file path or http(s) URL. Omit to rank the snapshots already stored.
        #[arg(long)]
        feed: Option<String>,
        #[arg(long)]
        dry_run: bool,
        /// Recompute a frozen date. Recorded on the run.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        algorithm_version: Option<String>,
        #[arg(long, env = "USER", default_value = "operator")]
        actor: String,
    },
    Weekly {
        #[arg(long)]
        week_end: NaiveDate,
    },
    Cumulative {
        #[arg(long)]
        date: NaiveDate,
    },
    /// List dates that have snapshots, rankings and weekly rollups.
    Dates,
    Runs {
        #[arg(long)]
        date: NaiveDate,
    },
    /// Mark a pending or running run failed.
    Abort {
        #[arg(long)]
        run_id: Uuid,
        #[arg(long, default_value = "operator abort")]
        cause: String,
    },
    Migrate,
}

enum Backend {
    Postgres(Arc<PgStore>),
    Memory(Arc<MemoryStore>),
}

impl Backend {
    async fn open(cli: &Cli, config: &PipelineConfig) -> Result<Self> {
        if let Some(url) = cli.database_url.as_deref().filter(|u| !u.trim().is_empty()) {
            let pool = PoolConfig {
                max_connections: config.concurrency as u32,
                ..PoolConfig::default()
            };
            let store = PgStore::connect(url, pool, BackoffPolicy::default())
                .await
                .context("connecting to postgres")?;
            return Ok(Self::Postgres(Arc::new(store)));
        }

        let store = MemoryStore::open(&config.state_file).await?;
        if let Some(path) = &cli.identities {
            for mapping in load_identity_file(path)? {
                store.add_identity(mapping).await;
            }
        }
        info!(state_file = %config.state_file.display(), "using offline state file");
        Ok(Self::Memory(Arc::new(store)))
    }

    fn store(&self) -> Arc<dyn Store> {
        match self {
            Self::Postgres(store) => Arc::clone(store) as Arc<dyn Store>,
            Self::Memory(store) => Arc::clone(store) as Arc<dyn Store>,
        }
    }

    fn identities(&self) -> Arc<dyn IdentityAuthority> {
        match self {
            Self::Postgres(store) => Arc::clone(store) as Arc<dyn IdentityAuthority>,
            Self::Memory(store) => Arc::clone(store) as Arc<dyn IdentityAuthority>,
        }
    }

    async fn persist(&self) -> Result<()> {
        match self {
            Self::Postgres(_) => Ok(()),
            Self::Memory(store) => store.persist().await,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "chartkeep=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let code = execute(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn execute(cli: Cli) -> Result<i32> {
    let mut config = PipelineConfig::from_env();
    if cli.database_url.is_some() {
        config.database_url = cli.database_url.clone();
    }
    let backend = match Backend::open(&cli, &config).await {
        Ok(backend) => backend,
        Err(err) if err.downcast_ref::<StoreError>().is_some_and(StoreError::is_retryable) => {
            eprintln!("{err:#}");
            return Ok(3);
        }
        Err(err) => return Err(err),
    };

    if let Commands::Migrate = cli.command {
        let Backend::Postgres(store) = &backend else {
            bail!("migrate needs --database-url or DATABASE_URL");
        };
        store.migrate().await?;
        println!("migrations applied");
        return Ok(0);
    }

    let policy = config.load_policy()?;
    let http = HttpFetcher::new(config.http_client_config())?;
    let pipeline = DailyPipeline::new(
        &config,
        policy,
        backend.store(),
        backend.identities(),
        Arc::new(SystemClock),
    )
    .with_http(Arc::new(http));
    let store = backend.store();

    let code = match cli.command {
        Commands::Run {
            date,
            feed,
            dry_run,
            force,
            algorithm_version,
            actor,
        } => {
            let request = DailyRequest {
                snapshot_date: date,
                feed,
                dry_run,
                force,
                algorithm_version,
                actor,
            };
            match pipeline.run(request).await {
                Ok(outcome) => {
                    print_outcome(&outcome);
                    outcome.exit_code()
                }
                Err(err) => report_error(err),
            }
        }
        Commands::Weekly { week_end } => match pipeline.rollups().compute_weekly(week_end).await {
            Ok(entries) => {
                println!("weekly rollup {week_end}: {} entities", entries.len());
                for entry in entries.iter().take(20) {
                    println!(
                        "{:>3}. {} total={:.2} avg={:.2} days={} {}",
                        entry.rank,
                        entry.entity_id,
                        entry.total_score,
                        entry.average_score,
                        entry.days_counted,
                        entry.movement.as_str()
                    );
                }
                0
            }
            Err(err) => report_error(err),
        },
        Commands::Cumulative { date } => match pipeline.rollups().compute_cumulative(date).await {
            Ok(entries) => {
                println!("cumulative rollup {date}: {} entities", entries.len());
                for entry in entries.iter().take(20) {
                    println!(
                        "{:>3}. {} total={:.2} days={}",
                        entry.rank, entry.entity_id, entry.cumulative_score, entry.days_counted
                    );
                }
                0
            }
            Err(err) => report_error(err),
        },
        Commands::Dates => {
            print_dates("snapshots", &store.snapshot_dates().await?);
            print_dates("rankings", &store.ranking_dates().await?);
            print_dates("weekly", &store.weekly_dates().await?);
            0
        }
        Commands::Runs { date } => {
            let ledger = pipeline.ledger();
            let effective = ledger.effective_run(date).await?.map(|run| run.run_id);
            for run in ledger.runs_for(date).await? {
                println!(
                    "{} {:<9} actor={} algo={} ingested={} rejected={} written={}{}{}{}",
                    run.run_id,
                    run.status,
                    run.actor,
                    run.algorithm_version,
                    run.rows_ingested,
                    run.rows_rejected,
                    run.rows_written,
                    if run.dry_run { " dry-run" } else { "" },
                    if run.forced { " forced" } else { "" },
                    if Some(run.run_id) == effective { " effective" } else { "" },
                );
                if let Some(cause) = &run.cause {
                    println!("    cause: {cause}");
                }
            }
            println!(
                "{date}: {}",
                if ledger.is_frozen(date).await? { "frozen" } else { "open" }
            );
            0
        }
        Commands::Abort { run_id, cause } => match pipeline.ledger().abort(run_id, &cause).await {
            Ok(run) => {
                println!("aborted run {} for {}", run.run_id, run.snapshot_date);
                0
            }
            Err(err) => report_error(err),
        },
        Commands::Migrate => 0,
    };

    backend.persist().await?;
    Ok(code)
}

fn print_outcome(outcome: &RunOutcome) {
    let run = &outcome.run;
    println!(
        "run {} date={} status={} ingested={} rejected={} written={} algo={}{}",
        run.run_id,
        run.snapshot_date,
        run.status,
        run.rows_ingested,
        run.rows_rejected,
        run.rows_written,
        run.algorithm_version,
        if run.dry_run { " (dry run)" } else { "" },
    );
    for issue in &run.issues {
        println!("  rejected {}/{}: {}", issue.service, issue.external_id, issue.reason);
    }
    if let Some(ranking) = &outcome.ranking {
        for entry in ranking.entries.iter().take(10) {
            println!(
                "{:>3}. {} score={:.2} {}",
                entry.rank,
                entry.entity_id,
                entry.score,
                entry.movement.as_str()
            );
        }
    }
    if let Some(dir) = &outcome.report_dir {
        println!("report: {}", dir.display());
    }
    if let Some(err) = &outcome.error {
        eprintln!("{}", err.cause());
    }
}

fn print_dates(label: &str, dates: &[NaiveDate]) {
    let joined = dates
        .iter()
        .map(NaiveDate::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    println!("{label}: {joined}");
}

fn report_error(err: PipelineError) -> i32 {
    eprintln!("{}", err.cause());
    if err.is_retryable() {
        3
    } else {
        1
    }
}
