//! The indexer makes sure every day database exists with all of its indexes
//! before write traffic for it arrives. Today's databases are created
//! synchronously at startup; tomorrow's are pre-provisioned in the background
//! so that building indexes never competes with writers.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::GenerationCache;
use crate::config::{DateInfo, ImporterConfig};
use crate::control::{ControlCommand, TickSchedule};
use crate::metrics;
use crate::schema::database_indexes;
use crate::storage::{StorageClass, StorageLedger, StorageReport, extract_storage_size};
use crate::store::{Shards, StoreConnector};
use crate::streams::{StreamInfo, StreamRegistry};
use crate::Result;

/// A parser saw a database it has not written to before.
#[derive(Clone, Debug)]
pub struct IndexRequest {
    pub database: String,
    pub stream_name: String,
    pub stream: Arc<StreamInfo>,
}

impl IndexRequest {
    pub fn new(database: impl Into<String>, stream: Arc<StreamInfo>) -> Self {
        Self {
            database: database.into(),
            stream_name: stream.name.clone(),
            stream,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub database: String,
    pub indexes_created: usize,
    pub index_failures: usize,
}

/// Index creation and storage sampling against a private set of shard
/// connections.
pub struct DatabaseProvisioner {
    id: usize,
    config: Arc<ImporterConfig>,
    shards: Shards,
    registry: Arc<dyn StreamRegistry>,
    ledger: StorageLedger,
}

impl DatabaseProvisioner {
    pub async fn connect(
        id: usize,
        config: Arc<ImporterConfig>,
        connector: &Arc<dyn StoreConnector>,
        registry: Arc<dyn StreamRegistry>,
        ledger: StorageLedger,
    ) -> Result<Self> {
        let shards = Shards::connect(connector).await?;
        Ok(Self {
            id,
            config,
            shards,
            registry,
            ledger,
        })
    }

    pub fn ledger(&self) -> &StorageLedger {
        &self.ledger
    }

    pub async fn ping_all(&self) -> usize {
        self.shards.ping_all().await
    }

    /// Create every catalogued index for `database`. Databases of `today` are
    /// registered in the store catalog first. Failures are logged and
    /// counted; they never abort the pass.
    pub async fn create_indexes(
        &self,
        database: &str,
        stream: &StreamInfo,
        today: &str,
    ) -> ProvisionReport {
        let mut report = ProvisionReport {
            database: database.to_string(),
            ..Default::default()
        };
        if self.config.dry_run {
            return report;
        }
        let store = match self.shards.get(stream.db_shard) {
            Ok(store) => store,
            Err(err) => {
                error!(target: "logjam::indexer", worker = self.id, database, error = %err, "no connection for stream");
                return report;
            }
        };

        if database.contains(today) {
            info!(target: "logjam::indexer", worker = self.id, database, "ensuring known database");
            if let Err(err) = store.ensure_known_database(database).await {
                let code = err.code();
                error!(
                    target: "logjam::indexer",
                    worker = self.id,
                    database,
                    code = code.as_deref().unwrap_or("-"),
                    error = %err,
                    "could not register database"
                );
            }
        }

        info!(target: "logjam::indexer", worker = self.id, database, "creating indexes");
        for entry in database_indexes(self.config.background_index_builds) {
            for index in &entry.indexes {
                match store.create_index(database, entry.collection, index).await {
                    Ok(()) => {
                        metrics::record_index_result(true);
                        report.indexes_created += 1;
                    }
                    Err(err) => {
                        metrics::record_index_result(false);
                        report.index_failures += 1;
                        let code = err.code();
                        error!(
                            target: "logjam::indexer",
                            worker = self.id,
                            database,
                            collection = entry.collection,
                            index = %index.name,
                            code = code.as_deref().unwrap_or("-"),
                            error = %err,
                            "index creation failed"
                        );
                    }
                }
            }
        }
        metrics::metrics()
            .databases_provisioned_total
            .fetch_add(1, Ordering::Relaxed);
        report
    }

    /// Provision the `iso_date` database of every active stream, sampling
    /// storage after each and pausing `delay` in between. Stops early when
    /// `cancel` fires.
    #[instrument(skip_all, fields(worker = self.id, date = %iso_date))]
    pub async fn create_all_indexes(
        &self,
        iso_date: &str,
        today: &str,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Vec<ProvisionReport> {
        let mut reports = Vec::new();
        if self.config.dry_run {
            return reports;
        }
        for stream in self.registry.active_streams() {
            if cancel.is_cancelled() {
                break;
            }
            let database = stream.database_name_for(iso_date);
            reports.push(self.create_indexes(&database, &stream, today).await);
            self.check_disk_usage(&database, &stream).await;
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
        reports
    }

    /// Register every active stream's `iso_date` database in the catalog.
    pub async fn ensure_databases_are_known(&self, iso_date: &str) {
        if self.config.dry_run {
            return;
        }
        for stream in self.registry.active_streams() {
            let database = stream.database_name_for(iso_date);
            let result = match self.shards.get(stream.db_shard) {
                Ok(store) => store.ensure_known_database(&database).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                error!(target: "logjam::indexer", worker = self.id, database = %database, error = %err, "could not register database");
            }
        }
    }

    /// Sample the size of `database` and record its classification.
    pub async fn check_disk_usage(
        &self,
        database: &str,
        stream: &StreamInfo,
    ) -> Option<StorageReport> {
        if self.config.dry_run {
            return None;
        }
        let stats = match self.shards.get(stream.db_shard) {
            Ok(store) => store.database_stats(database).await,
            Err(err) => Err(err),
        };
        let stats = match stats {
            Ok(stats) => stats,
            Err(err) => {
                let code = err.code();
                error!(
                    target: "logjam::indexer",
                    database,
                    code = code.as_deref().unwrap_or("-"),
                    error = %err,
                    "could not retrieve database statistics"
                );
                return None;
            }
        };
        let size = extract_storage_size(&stats).unwrap_or_else(|| {
            warn!(target: "logjam::indexer", database, stats = %stats, "unexpected storageSize in database statistics");
            0
        });
        let class = StorageClass::classify(size, &self.config.storage_limits);
        match class {
            StorageClass::HardLimit => {
                error!(target: "logjam::indexer", worker = self.id, database, size, "hard limiting")
            }
            StorageClass::SoftLimit => {
                warn!(target: "logjam::indexer", worker = self.id, database, size, "soft limiting")
            }
            StorageClass::Normal => {
                debug!(target: "logjam::indexer", worker = self.id, database, size, "not limiting")
            }
        }
        let report = StorageReport {
            database: database.to_string(),
            size,
            class,
        };
        self.ledger.record(report.clone());
        Some(report)
    }

    /// Sample today's database of every active stream.
    pub async fn refresh_storage_sizes(&self, today: &str) -> Vec<StorageReport> {
        let mut reports = Vec::new();
        if self.config.dry_run {
            return reports;
        }
        for stream in self.registry.active_streams() {
            let database = stream.database_name_for(today);
            if let Some(report) = self.check_disk_usage(&database, &stream).await {
                reports.push(report);
            }
        }
        let (soft, hard) = self.ledger.counts();
        metrics::set_storage_limit_gauges(soft, hard);
        reports
    }
}

/// Result of one background provisioning run.
#[derive(Clone, Debug)]
pub struct BackgroundRun {
    pub run: usize,
    pub date: String,
    pub reports: Vec<ProvisionReport>,
    pub cancelled: bool,
}

/// Owns the background provisioning tasks spawned by the indexer.
pub struct ProvisioningSupervisor {
    config: Arc<ImporterConfig>,
    connector: Arc<dyn StoreConnector>,
    registry: Arc<dyn StreamRegistry>,
    ledger: StorageLedger,
    tasks: JoinSet<BackgroundRun>,
    cancel: CancellationToken,
    runs: usize,
}

impl ProvisioningSupervisor {
    pub fn new(
        config: Arc<ImporterConfig>,
        connector: Arc<dyn StoreConnector>,
        registry: Arc<dyn StreamRegistry>,
        ledger: StorageLedger,
    ) -> Self {
        Self {
            config,
            connector,
            registry,
            ledger,
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            runs: 0,
        }
    }

    /// Number of runs spawned so far.
    pub fn runs(&self) -> usize {
        self.runs
    }

    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Provision `iso_date` on fresh connections in a background task.
    pub fn spawn(&mut self, iso_date: String, today: String) {
        self.runs += 1;
        let run = self.runs;
        let config = self.config.clone();
        let connector = self.connector.clone();
        let registry = self.registry.clone();
        let ledger = self.ledger.clone();
        let cancel = self.cancel.child_token();
        info!(target: "logjam::indexer", worker = run, date = %iso_date, "spawning background indexer");
        self.tasks.spawn(async move {
            let delay = config.provision_delay;
            let reports =
                match DatabaseProvisioner::connect(run, config, &connector, registry, ledger).await {
                    Ok(provisioner) => {
                        provisioner
                            .create_all_indexes(&iso_date, &today, delay, &cancel)
                            .await
                    }
                    Err(err) => {
                        error!(target: "logjam::indexer", worker = run, error = %err, "background indexer could not connect");
                        Vec::new()
                    }
                };
            BackgroundRun {
                run,
                date: iso_date,
                reports,
                cancelled: cancel.is_cancelled(),
            }
        });
    }

    /// Collect runs that have finished, without waiting.
    pub fn reap(&mut self) -> Vec<BackgroundRun> {
        let mut finished = Vec::new();
        while let Some(result) = self.tasks.try_join_next() {
            if let Some(run) = Self::completed(result) {
                finished.push(run);
            }
        }
        finished
    }

    /// Wait for every outstanding run to finish on its own.
    pub async fn wait_idle(&mut self) -> Vec<BackgroundRun> {
        let mut finished = Vec::new();
        while let Some(result) = self.tasks.join_next().await {
            if let Some(run) = Self::completed(result) {
                finished.push(run);
            }
        }
        finished
    }

    /// Cancel every outstanding run and wait for them to stop.
    pub async fn shutdown(&mut self) -> Vec<BackgroundRun> {
        self.cancel.cancel();
        self.wait_idle().await
    }

    fn completed(result: std::result::Result<BackgroundRun, tokio::task::JoinError>) -> Option<BackgroundRun> {
        match result {
            Ok(run) => {
                info!(
                    target: "logjam::indexer",
                    worker = run.run,
                    date = %run.date,
                    databases = run.reports.len(),
                    cancelled = run.cancelled,
                    "background indexer finished"
                );
                Some(run)
            }
            Err(err) => {
                error!(target: "logjam::indexer", error = %err, "background indexer failed");
                None
            }
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum Clock {
    System,
    Fixed(NaiveDate),
}

impl Clock {
    fn today(self) -> NaiveDate {
        match self {
            Clock::System => Local::now().date_naive(),
            Clock::Fixed(date) => date,
        }
    }
}

enum Event {
    Control(Option<String>),
    Request(Option<IndexRequest>),
}

/// The primary indexer worker.
pub struct Indexer {
    id: usize,
    config: Arc<ImporterConfig>,
    provisioner: DatabaseProvisioner,
    supervisor: ProvisioningSupervisor,
    known: GenerationCache<()>,
    schedule: TickSchedule,
    dates: DateInfo,
    clock: Clock,
}

impl Indexer {
    pub async fn connect(
        config: Arc<ImporterConfig>,
        connector: Arc<dyn StoreConnector>,
        registry: Arc<dyn StreamRegistry>,
        ledger: StorageLedger,
    ) -> Result<Self> {
        let id = 0;
        let provisioner = DatabaseProvisioner::connect(
            id,
            config.clone(),
            &connector,
            registry.clone(),
            ledger.clone(),
        )
        .await?;
        let supervisor = ProvisioningSupervisor::new(config.clone(), connector, registry, ledger);
        let schedule = TickSchedule::from_config(id, &config);
        let mut known = GenerationCache::new();
        known.set_generation(schedule.initial_generation());
        Ok(Self {
            id,
            config,
            provisioner,
            supervisor,
            known,
            schedule,
            dates: DateInfo::new(),
            clock: Clock::System,
        })
    }

    /// Pin the indexer's notion of today instead of reading the local clock.
    pub fn set_date(&mut self, today: NaiveDate) {
        self.clock = Clock::Fixed(today);
    }

    pub fn dates(&self) -> &DateInfo {
        &self.dates
    }

    pub fn supervisor(&mut self) -> &mut ProvisioningSupervisor {
        &mut self.supervisor
    }

    pub fn provisioner(&self) -> &DatabaseProvisioner {
        &self.provisioner
    }

    /// Databases currently remembered as provisioned.
    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn is_known(&mut self, database: &str) -> bool {
        self.known.contains(database)
    }

    fn refresh_dates(&mut self) -> bool {
        self.dates.update_at(self.clock.today())
    }

    /// Synchronously provision today's databases, then start pre-provisioning
    /// tomorrow's in the background. The indexer is ready once this returns.
    pub async fn start(&mut self) -> Vec<ProvisionReport> {
        info!(target: "logjam::indexer", worker = self.id, "starting");
        self.refresh_dates();
        let today = self.dates.today_str();
        let reports = self
            .provisioner
            .create_all_indexes(&today, &today, Duration::ZERO, &CancellationToken::new())
            .await;
        for report in &reports {
            self.known.insert(report.database.clone(), ());
        }
        self.supervisor.spawn(self.dates.tomorrow_str(), today);
        reports
    }

    /// Serve control commands and index requests until `$TERM`, a closed
    /// control channel, or a protocol violation. Waits at most
    /// `poll_timeout` per iteration.
    pub async fn run(
        mut self,
        mut control: mpsc::Receiver<String>,
        mut requests: mpsc::Receiver<IndexRequest>,
    ) -> Result<()> {
        let mut requests_open = true;
        let outcome = loop {
            let event = tokio::time::timeout(self.config.poll_timeout, async {
                tokio::select! {
                    biased;
                    cmd = control.recv() => Event::Control(cmd),
                    req = requests.recv(), if requests_open => Event::Request(req),
                }
            })
            .await;
            match event {
                Err(_) => continue,
                Ok(Event::Control(None)) => break Ok(()),
                Ok(Event::Control(Some(cmd))) => match cmd.parse::<ControlCommand>() {
                    Ok(ControlCommand::Tick) => self.tick().await,
                    Ok(ControlCommand::Terminate) => break Ok(()),
                    Err(err) => {
                        error!(target: "logjam::indexer", worker = self.id, command = %cmd, "received unknown command");
                        break Err(err);
                    }
                },
                Ok(Event::Request(Some(request))) => {
                    self.handle_request(request).await;
                }
                Ok(Event::Request(None)) => {
                    debug!(target: "logjam::indexer", worker = self.id, "request queue closed");
                    requests_open = false;
                }
            }
        };
        info!(target: "logjam::indexer", worker = self.id, "shutting down");
        self.supervisor.shutdown().await;
        outcome
    }

    /// Returns true when the request triggered an index pass.
    pub async fn handle_request(&mut self, request: IndexRequest) -> bool {
        metrics::metrics()
            .index_requests_total
            .fetch_add(1, Ordering::Relaxed);
        if self.known.contains(&request.database) {
            debug!(target: "logjam::indexer", database = %request.database, "indexes already created");
            return false;
        }
        self.known.insert(request.database.clone(), ());
        let today = self.dates.today_str();
        self.provisioner
            .create_indexes(&request.database, &request.stream, &today)
            .await;
        true
    }

    pub async fn tick(&mut self) {
        debug!(target: "logjam::indexer", worker = self.id, "tick");
        if self.refresh_dates() {
            let today = self.dates.today_str();
            info!(target: "logjam::indexer", worker = self.id, today = %today, "date change detected");
            self.provisioner.ensure_databases_are_known(&today).await;
            self.provisioner
                .ledger()
                .retain(|database| database.ends_with(today.as_str()));
            self.supervisor.spawn(self.dates.tomorrow_str(), today);
        }
        let actions = self.schedule.tick();
        if actions.ping {
            self.provisioner.ping_all().await;
        }
        if actions.sample_storage {
            self.provisioner
                .refresh_storage_sizes(&self.dates.today_str())
                .await;
        }
        if self.known.set_generation(actions.generation) {
            let freed = self.known.purge_stale();
            info!(target: "logjam::indexer", worker = self.id, freed, "freeing database info");
        }
        self.supervisor.reap();
    }
}
