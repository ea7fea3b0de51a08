use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::config::ImporterConfig;
use crate::control::ControlCommand;
use crate::indexer::{IndexRequest, Indexer, ProvisionReport};
use crate::storage::StorageLedger;
use crate::store::StoreConnector;
use crate::streams::StreamRegistry;
use crate::updater::{StatsUpdater, UpdateTask};
use crate::{Error, Result};

const CONTROL_CAPACITY: usize = 64;
const INDEX_QUEUE_CAPACITY: usize = 1024;

/// The indexer plus N stats updaters, wired to their queues and control
/// channels.
pub struct ImporterPool {
    indexer_control: mpsc::Sender<String>,
    updater_controls: Vec<mpsc::Sender<String>>,
    index_requests: mpsc::Sender<IndexRequest>,
    update_tasks: flume::Sender<UpdateTask>,
    workers: JoinSet<(String, Result<()>)>,
    ledger: StorageLedger,
    startup: Vec<ProvisionReport>,
}

impl ImporterPool {
    /// Connect every worker and provision today's databases. Returns once
    /// the indexer is ready, so writes can be accepted immediately after.
    pub async fn start(
        config: Arc<ImporterConfig>,
        connector: Arc<dyn StoreConnector>,
        registry: Arc<dyn StreamRegistry>,
    ) -> Result<Self> {
        Self::start_with(config, connector, registry, |_| {}).await
    }

    /// Like [`ImporterPool::start`], with a hook to adjust the indexer before
    /// it provisions anything.
    pub async fn start_with(
        config: Arc<ImporterConfig>,
        connector: Arc<dyn StoreConnector>,
        registry: Arc<dyn StreamRegistry>,
        prepare: impl FnOnce(&mut Indexer),
    ) -> Result<Self> {
        config.validate()?;
        if connector.shard_count() != config.shard_count() {
            return Err(Error::Config(format!(
                "connector has {} shards, configuration names {}",
                connector.shard_count(),
                config.shard_count()
            )));
        }
        let ledger = StorageLedger::new();
        let mut workers = JoinSet::new();

        let mut indexer =
            Indexer::connect(config.clone(), connector.clone(), registry, ledger.clone()).await?;
        prepare(&mut indexer);
        let startup = indexer.start().await;
        info!(target: "logjam::pool", databases = startup.len(), "indexer ready");

        let (indexer_control, indexer_control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let (index_requests, index_requests_rx) = mpsc::channel(INDEX_QUEUE_CAPACITY);
        workers.spawn(async move {
            let result = indexer.run(indexer_control_rx, index_requests_rx).await;
            ("indexer".to_string(), result)
        });

        let (update_tasks, update_tasks_rx) = flume::unbounded();
        let mut updater_controls = Vec::with_capacity(config.updater_count);
        for id in 0..config.updater_count {
            let updater = StatsUpdater::connect(id, config.clone(), &connector).await?;
            let (control, control_rx) = mpsc::channel(CONTROL_CAPACITY);
            let tasks = update_tasks_rx.clone();
            workers.spawn(async move {
                let result = updater.run(control_rx, tasks).await;
                (format!("updater[{id}]"), result)
            });
            updater_controls.push(control);
        }
        info!(target: "logjam::pool", updaters = config.updater_count, "workers started");

        Ok(Self {
            indexer_control,
            updater_controls,
            index_requests,
            update_tasks,
            workers,
            ledger,
            startup,
        })
    }

    pub fn index_requests(&self) -> mpsc::Sender<IndexRequest> {
        self.index_requests.clone()
    }

    pub fn update_tasks(&self) -> flume::Sender<UpdateTask> {
        self.update_tasks.clone()
    }

    pub fn ledger(&self) -> &StorageLedger {
        &self.ledger
    }

    /// Reports of the synchronous startup pass.
    pub fn startup_reports(&self) -> &[ProvisionReport] {
        &self.startup
    }

    /// Send a tick to every worker.
    pub async fn tick(&self) -> Result<()> {
        self.broadcast(ControlCommand::Tick.as_str()).await
    }

    /// Send a raw control string to every worker.
    pub async fn broadcast(&self, command: &str) -> Result<()> {
        for control in std::iter::once(&self.indexer_control).chain(&self.updater_controls) {
            control
                .send(command.to_string())
                .await
                .map_err(|_| Error::Protocol("worker control channel closed".into()))?;
        }
        Ok(())
    }

    /// Terminate every worker and wait for them. Queued but unprocessed tasks
    /// are discarded. Returns the first worker error.
    pub async fn shutdown(mut self) -> Result<()> {
        for control in std::iter::once(&self.indexer_control).chain(&self.updater_controls) {
            let _ = control.send(ControlCommand::Terminate.to_string()).await;
        }
        drop(self.index_requests);
        drop(self.update_tasks);

        let mut first_error = None;
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok((worker, Ok(()))) => info!(target: "logjam::pool", worker = %worker, "terminated"),
                Ok((worker, Err(err))) => {
                    error!(target: "logjam::pool", worker = %worker, error = %err, "worker failed");
                    first_error.get_or_insert(err);
                }
                Err(err) => {
                    error!(target: "logjam::pool", error = %err, "worker panicked");
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
