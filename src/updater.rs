//! Stats updater workers: fold per-minute increments into the `totals`,
//! `minutes` and `quants` collections of a day database.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::GenerationCache;
use crate::config::{ImporterConfig, RetryPolicy};
use crate::control::{ControlCommand, TickSchedule};
use crate::increments::{Increments, MinuteKey, QuantCounts, QuantKey, totals_selector};
use crate::metrics;
use crate::store::{CollectionHandle, DocumentStore, Shards, StoreConnector, WriteConcern};
use crate::streams::StreamInfo;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Totals,
    Minutes,
    Quants,
}

impl TaskKind {
    pub fn as_byte(self) -> u8 {
        match self {
            TaskKind::Totals => b't',
            TaskKind::Minutes => b'm',
            TaskKind::Quants => b'q',
        }
    }

    pub fn collection(self) -> &'static str {
        match self {
            TaskKind::Totals => "totals",
            TaskKind::Minutes => "minutes",
            TaskKind::Quants => "quants",
        }
    }
}

impl TryFrom<u8> for TaskKind {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        match byte {
            b't' => Ok(TaskKind::Totals),
            b'm' => Ok(TaskKind::Minutes),
            b'q' => Ok(TaskKind::Quants),
            other => Err(Error::Protocol(format!(
                "unknown task type: {:?}",
                char::from(other)
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub enum TaskPayload {
    /// Keyed by page.
    Totals(HashMap<String, Increments>),
    /// Keyed by `"<minute>-<page>"`.
    Minutes(HashMap<String, Increments>),
    /// Keyed by `"<kind>-<quant>-<page>"`.
    Quants(HashMap<String, QuantCounts>),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::Totals(_) => TaskKind::Totals,
            TaskPayload::Minutes(_) => TaskKind::Minutes,
            TaskPayload::Quants(_) => TaskKind::Quants,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TaskPayload::Totals(m) | TaskPayload::Minutes(m) => m.len(),
            TaskPayload::Quants(m) => m.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone, Debug)]
pub struct UpdateTask {
    pub database: String,
    pub stream: Arc<StreamInfo>,
    pub payload: TaskPayload,
}

impl UpdateTask {
    pub fn new(database: impl Into<String>, stream: Arc<StreamInfo>, payload: TaskPayload) -> Self {
        Self {
            database: database.into(),
            stream,
            payload,
        }
    }

    /// Build a task from the wire kind byte; only `t` and `m` carry
    /// [`Increments`].
    pub fn from_increments(
        kind: u8,
        database: impl Into<String>,
        stream: Arc<StreamInfo>,
        updates: HashMap<String, Increments>,
    ) -> Result<Self> {
        let payload = match TaskKind::try_from(kind)? {
            TaskKind::Totals => TaskPayload::Totals(updates),
            TaskKind::Minutes => TaskPayload::Minutes(updates),
            TaskKind::Quants => {
                return Err(Error::Protocol(
                    "quants tasks carry counts, not increments".into(),
                ));
            }
        };
        Ok(Self::new(database, stream, payload))
    }

    pub fn kind(&self) -> TaskKind {
        self.payload.kind()
    }
}

/// Handles for the three rollup collections of one database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatsCollections {
    pub totals: CollectionHandle,
    pub minutes: CollectionHandle,
    pub quants: CollectionHandle,
}

impl StatsCollections {
    pub fn for_database(database: &str) -> Self {
        Self {
            totals: CollectionHandle::new(database, TaskKind::Totals.collection()),
            minutes: CollectionHandle::new(database, TaskKind::Minutes.collection()),
            quants: CollectionHandle::new(database, TaskKind::Quants.collection()),
        }
    }

    pub fn get(&self, kind: TaskKind) -> &CollectionHandle {
        match kind {
            TaskKind::Totals => &self.totals,
            TaskKind::Minutes => &self.minutes,
            TaskKind::Quants => &self.quants,
        }
    }

    fn all(&self) -> [&CollectionHandle; 3] {
        [&self.totals, &self.minutes, &self.quants]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskReport {
    pub database: String,
    pub kind: TaskKind,
    pub applied: usize,
    /// Extra attempts spent on lock contention across all entries.
    pub retried: usize,
    pub dropped: usize,
    pub skipped: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum UpsertOutcome {
    Applied { attempts: u32 },
    Dropped { attempts: u32, error: Error },
}

/// Upsert, retrying immediately (or after `policy.backoff`) while the store
/// reports lock contention and attempts remain.
pub async fn upsert_with_retry(
    store: &dyn DocumentStore,
    collection: &CollectionHandle,
    selector: &Map<String, Value>,
    update: &Value,
    concern: WriteConcern,
    policy: &RetryPolicy,
) -> UpsertOutcome {
    let mut attempts = 0;
    loop {
        attempts += 1;
        match store
            .upsert_increments(collection, selector, update, concern)
            .await
        {
            Ok(()) => return UpsertOutcome::Applied { attempts },
            Err(err) if err.is_lock_contention() && attempts < policy.max_attempts => {
                warn!(
                    target: "logjam::updater",
                    database = %collection.database,
                    collection = %collection.name,
                    attempt = attempts,
                    "retrying update operation"
                );
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
            Err(error) => return UpsertOutcome::Dropped { attempts, error },
        }
    }
}

pub struct StatsUpdater {
    id: usize,
    config: Arc<ImporterConfig>,
    shards: Shards,
    collections: GenerationCache<StatsCollections>,
    schedule: TickSchedule,
    concern: WriteConcern,
    tasks_since_tick: usize,
}

impl StatsUpdater {
    pub async fn connect(
        id: usize,
        config: Arc<ImporterConfig>,
        connector: &Arc<dyn StoreConnector>,
    ) -> Result<Self> {
        let shards = Shards::connect(connector).await?;
        let schedule = TickSchedule::from_config(id, &config);
        let mut collections = GenerationCache::new();
        collections.set_generation(schedule.initial_generation());
        Ok(Self {
            id,
            concern: WriteConcern::from_wait_for_replication(config.wait_for_replication),
            config,
            shards,
            collections,
            schedule,
            tasks_since_tick: 0,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Serve control commands and tasks until `$TERM`, a closed control
    /// channel, or a protocol violation. Control is always polled first.
    pub async fn run(
        mut self,
        mut control: mpsc::Receiver<String>,
        tasks: flume::Receiver<UpdateTask>,
    ) -> Result<()> {
        let id = self.id;
        let mut tasks_open = true;
        loop {
            tokio::select! {
                biased;
                cmd = control.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd.parse::<ControlCommand>() {
                        Ok(ControlCommand::Tick) => self.tick().await,
                        Ok(ControlCommand::Terminate) => break,
                        Err(err) => {
                            error!(target: "logjam::updater", worker = id, command = %cmd, "received unknown command");
                            return Err(err);
                        }
                    }
                }
                task = tasks.recv_async(), if tasks_open => match task {
                    Ok(task) => {
                        if let Err(err) = self.process_task(task).await {
                            error!(target: "logjam::updater", worker = id, error = %err, "task failed");
                        }
                    }
                    Err(_) => {
                        debug!(target: "logjam::updater", worker = id, "task queue closed");
                        tasks_open = false;
                    }
                },
            }
        }
        info!(target: "logjam::updater", worker = id, "shutting down");
        Ok(())
    }

    pub async fn tick(&mut self) {
        let actions = self.schedule.tick();
        if self.tasks_since_tick > 0 {
            info!(
                target: "logjam::updater",
                worker = self.id,
                updates = self.tasks_since_tick,
                "tick"
            );
        }
        if actions.ping {
            self.shards.ping_all().await;
        }
        if self.collections.set_generation(actions.generation) {
            let dropped = self.collections.purge_stale();
            debug!(target: "logjam::updater", worker = self.id, dropped, "refreshed collection handles");
        }
        self.tasks_since_tick = 0;
    }

    #[instrument(skip_all, fields(worker = self.id, database = %task.database, kind = ?task.kind()))]
    pub async fn process_task(&mut self, task: UpdateTask) -> Result<TaskReport> {
        let started = Instant::now();
        self.tasks_since_tick += 1;
        metrics::metrics()
            .tasks_processed_total
            .fetch_add(1, Ordering::Relaxed);

        let UpdateTask {
            database,
            stream,
            payload,
        } = task;
        let kind = payload.kind();
        let collections = self.collections_for(&database, &stream).await?;
        let collection = collections.get(kind);
        let store = self.shards.get(stream.db_shard)?;

        let mut report = TaskReport {
            database: database.clone(),
            kind,
            applied: 0,
            retried: 0,
            dropped: 0,
            skipped: 0,
            elapsed: Duration::ZERO,
        };

        let entries = match payload {
            TaskPayload::Totals(updates) => updates
                .into_iter()
                .map(|(page, inc)| Ok((totals_selector(&page), inc.to_update_document())))
                .collect::<Vec<_>>(),
            TaskPayload::Minutes(updates) => updates
                .into_iter()
                .map(|(key, inc)| {
                    MinuteKey::parse(&key).map(|k| (k.selector(), inc.to_update_document()))
                })
                .collect(),
            TaskPayload::Quants(updates) => updates
                .into_iter()
                .map(|(key, counts)| {
                    QuantKey::parse(&key).map(|k| (k.selector(), counts.to_update_document()))
                })
                .collect(),
        };

        for entry in entries {
            let (selector, update) = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(target: "logjam::updater", error = %err, "skipping entry");
                    metrics::metrics()
                        .keys_skipped_total
                        .fetch_add(1, Ordering::Relaxed);
                    report.skipped += 1;
                    continue;
                }
            };
            if self.config.dry_run {
                report.applied += 1;
                continue;
            }
            match upsert_with_retry(
                store,
                collection,
                &selector,
                &update,
                self.concern,
                &self.config.retry,
            )
            .await
            {
                UpsertOutcome::Applied { attempts } => {
                    metrics::record_upsert(attempts);
                    report.applied += 1;
                    report.retried += attempts as usize - 1;
                }
                UpsertOutcome::Dropped { attempts, error } => {
                    metrics::record_dropped_upsert(attempts);
                    report.dropped += 1;
                    report.retried += attempts as usize - 1;
                    let code = error.code();
                    let selector = Value::Object(selector);
                    error!(
                        target: "logjam::updater",
                        database = %collection.database,
                        collection = %collection.name,
                        selector = %selector,
                        document = %update,
                        code = code.as_deref().unwrap_or("-"),
                        attempts,
                        error = %error,
                        "update failed"
                    );
                }
            }
        }

        report.elapsed = started.elapsed();
        info!(
            target: "logjam::updater",
            worker = self.id,
            task = %char::from(kind.as_byte()),
            elapsed_ms = report.elapsed.as_millis() as u64,
            database = %database,
            "task processed"
        );
        Ok(report)
    }

    /// Cached handles for `database`; on a miss the collections are prepared
    /// in the store first. Handles are only cached once every collection was
    /// prepared, so a failed pass is repeated by the next task.
    async fn collections_for(
        &mut self,
        database: &str,
        stream: &StreamInfo,
    ) -> Result<StatsCollections> {
        if let Some(collections) = self.collections.get(database) {
            return Ok(collections.clone());
        }
        let collections = StatsCollections::for_database(database);
        let mut prepared = true;
        if !self.config.dry_run {
            let store = self.shards.get(stream.db_shard)?;
            for handle in collections.all() {
                if let Err(err) = store.prepare_collection(handle).await {
                    prepared = false;
                    let code = err.code();
                    error!(
                        target: "logjam::updater",
                        database = %handle.database,
                        collection = %handle.name,
                        code = code.as_deref().unwrap_or("-"),
                        error = %err,
                        "could not prepare collection"
                    );
                }
            }
        }
        if prepared {
            self.collections.insert(database, collections.clone());
        }
        Ok(collections)
    }
}
