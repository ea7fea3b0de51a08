//! logjam-importer: the storage tail of the logjam pipeline. Index
//! provisioning for day databases and per-minute stats aggregation, on top
//! of a document store backed by Postgres.

pub mod cache;
pub mod config;
pub mod control;
mod error;
pub mod increments;
pub mod indexer;
pub mod metrics;
pub mod pool;
pub mod schema;
pub mod storage;
pub mod store;
pub mod streams;
pub mod testing;
pub mod updater;
pub mod wire;

pub use config::{DateInfo, ImporterConfig, RetryPolicy, StorageLimits};
pub use error::{Error, Result, WithContext};
pub use indexer::{IndexRequest, Indexer};
pub use pool::ImporterPool;
pub use store::{DocumentStore, StoreConnector};
pub use streams::{StaticStreamRegistry, StreamInfo, StreamRegistry};
pub use updater::{StatsUpdater, TaskKind, TaskPayload, UpdateTask};

pub mod prelude {
    pub use crate::{
        ImporterConfig, ImporterPool, IndexRequest, Result, StaticStreamRegistry, StreamInfo,
        TaskPayload, UpdateTask,
    };
}
