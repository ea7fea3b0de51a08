use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::NaiveDate;
use clap::{ArgAction, Parser, Subcommand};
use logjam_importer::config::{DateInfo, ImporterConfig, format_date, split_delimited};
use logjam_importer::indexer::DatabaseProvisioner;
use logjam_importer::metrics::render_prometheus;
use logjam_importer::schema::{SchemaPlan, database_plan};
use logjam_importer::storage::StorageLedger;
use logjam_importer::store::{PgConnector, StoreConnector};
use logjam_importer::{ImporterPool, StaticStreamRegistry, StreamInfo, StreamRegistry};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "logjam-importer", version, about = "logjam importer storage tail")]
struct Cli {
    /// Postgres connection string per database shard (repeatable). Falls back
    /// to LOGJAM_DATABASES, separated by commas or spaces.
    #[arg(long = "database-url", action = ArgAction::Append)]
    database_urls: Vec<String>,

    /// Stream to import, as app-env[@shard] (repeatable)
    #[arg(long = "stream", action = ArgAction::Append)]
    streams: Vec<String>,

    /// Parse and log, but do not issue store commands
    #[arg(long)]
    dry_run: bool,

    /// Soft storage limit in bytes
    #[arg(long)]
    soft_limit: Option<u64>,

    /// Hard storage limit in bytes
    #[arg(long)]
    hard_limit: Option<u64>,

    /// Wait for synchronous replication on every upsert
    #[arg(long)]
    wait_for_replication: bool,

    /// Build indexes in the foreground (blocks writes to the table)
    #[arg(long)]
    foreground_indexes: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the DDL a day database needs, without applying it
    Plan {
        #[arg(long, default_value = "today")]
        date: String,
    },

    /// Create every database and index for a date, then exit
    Provision {
        #[arg(long, default_value = "today")]
        date: String,
    },

    /// Sample storage of today's databases and print the classification
    Storage,

    /// Start the indexer and updaters, ticking once per second until Ctrl-C
    Run {
        /// Number of stats updaters
        #[arg(long, default_value_t = 4)]
        updaters: usize,

        /// Print metrics in Prometheus text format on exit
        #[arg(long)]
        metrics: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut urls = cli.database_urls.clone();
    if urls.is_empty() {
        if let Ok(list) = std::env::var("LOGJAM_DATABASES") {
            urls = split_delimited(&list);
        }
    }
    if urls.is_empty() {
        bail!("--database-url or env LOGJAM_DATABASES is required");
    }

    let streams = cli
        .streams
        .iter()
        .map(|s| StreamInfo::parse(s))
        .collect::<Result<Vec<_>, _>>()?;
    for stream in &streams {
        if stream.db_shard >= urls.len() {
            bail!(
                "stream {} uses shard {}, but only {} database url(s) given",
                stream.name,
                stream.db_shard,
                urls.len()
            );
        }
    }
    let registry: Arc<dyn StreamRegistry> = Arc::new(StaticStreamRegistry::new(streams));

    let mut builder = ImporterConfig::builder()
        .database_urls(urls)
        .dry_run(cli.dry_run)
        .wait_for_replication(cli.wait_for_replication)
        .background_index_builds(!cli.foreground_indexes);
    let defaults = ImporterConfig::default().storage_limits;
    if cli.soft_limit.is_some() || cli.hard_limit.is_some() {
        builder = builder.storage_limits(
            cli.soft_limit.unwrap_or(defaults.soft),
            cli.hard_limit.unwrap_or(defaults.hard),
        );
    }
    if let Commands::Run { updaters, .. } = &cli.command {
        builder = builder.updater_count(*updaters);
    }
    let config = Arc::new(builder.build()?);
    let connector: Arc<dyn StoreConnector> = Arc::new(PgConnector::from_config(&config));

    match cli.command {
        Commands::Plan { date } => {
            let date = resolve_date(&date)?;
            for stream in registry.active_streams() {
                let plan = database_plan(
                    &stream.database_name(date),
                    config.background_index_builds,
                );
                print_plan(&plan);
            }
        }
        Commands::Provision { date } => {
            let date = resolve_date(&date)?;
            let provisioner = DatabaseProvisioner::connect(
                0,
                config.clone(),
                &connector,
                registry.clone(),
                StorageLedger::new(),
            )
            .await?;
            let reports = provisioner
                .create_all_indexes(
                    &format_date(date),
                    &DateInfo::new().today_str(),
                    Duration::ZERO,
                    &CancellationToken::new(),
                )
                .await;
            for r in &reports {
                println!(
                    "{}: {} indexes ({} failed)",
                    r.database, r.indexes_created, r.index_failures
                );
            }
        }
        Commands::Storage => {
            let provisioner = DatabaseProvisioner::connect(
                0,
                config.clone(),
                &connector,
                registry.clone(),
                StorageLedger::new(),
            )
            .await?;
            let reports = provisioner
                .refresh_storage_sizes(&DateInfo::new().today_str())
                .await;
            for r in &reports {
                println!("{} {} {} bytes", r.class.marker(), r.database, r.size);
            }
        }
        Commands::Run { metrics, .. } => {
            let pool = ImporterPool::start(config.clone(), connector, registry)
                .await
                .context("starting importer pool")?;
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);
            loop {
                tokio::select! {
                    _ = &mut ctrl_c => break,
                    _ = ticker.tick() => pool.tick().await?,
                }
            }
            pool.shutdown().await?;
            if metrics {
                print!("{}", render_prometheus());
            }
        }
    }

    Ok(())
}

fn resolve_date(arg: &str) -> anyhow::Result<NaiveDate> {
    let dates = DateInfo::new();
    match arg {
        "today" => Ok(dates.today()),
        "tomorrow" => Ok(dates.tomorrow()),
        other => NaiveDate::parse_from_str(other, "%Y-%m-%d")
            .with_context(|| format!("invalid date '{other}', expected today, tomorrow or YYYY-MM-DD")),
    }
}

fn print_plan(plan: &SchemaPlan) {
    if plan.actions().is_empty() {
        println!("No pending DDL actions.");
        return;
    }

    println!("DDL actions ({}):", plan.actions().len());
    for (i, action) in plan.actions().iter().enumerate() {
        println!("{}. {}", i + 1, action.description());
        println!("{}\n", action.sql());
    }
}
