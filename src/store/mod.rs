//! The document-store command surface the importer relies on, and per-worker
//! shard connections.

mod postgres;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::schema::IndexSpec;
use crate::{Error, Result};

pub use postgres::{PgConnector, PgStore};

/// Whether an upsert waits for the write to be durable on replicas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WriteConcern {
    /// Return once the primary has the write in memory.
    #[default]
    Local,
    Replicated,
}

impl WriteConcern {
    pub fn from_wait_for_replication(wait: bool) -> Self {
        if wait {
            WriteConcern::Replicated
        } else {
            WriteConcern::Local
        }
    }
}

/// A collection inside one day database.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CollectionHandle {
    pub database: String,
    pub name: String,
}

impl CollectionHandle {
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CollectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.name)
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// Create `index` on `database.collection`, creating the collection if
    /// needed. Creating an index that already exists succeeds.
    async fn create_index(&self, database: &str, collection: &str, index: &IndexSpec)
    -> Result<()>;

    /// Statistics document for `database`; carries at least `storageSize`.
    async fn database_stats(&self, database: &str) -> Result<Value>;

    /// Register `database` in the store-wide catalog of known databases.
    async fn ensure_known_database(&self, database: &str) -> Result<()>;

    async fn prepare_collection(&self, collection: &CollectionHandle) -> Result<()>;

    /// Upsert the document matching `selector`, adding every field of the
    /// update's `$inc` object to the stored value (absent fields count as 0).
    async fn upsert_increments(
        &self,
        collection: &CollectionHandle,
        selector: &Map<String, Value>,
        update: &Value,
        concern: WriteConcern,
    ) -> Result<()>;
}

/// Opens worker-private connections to each database shard.
#[async_trait]
pub trait StoreConnector: Send + Sync {
    fn shard_count(&self) -> usize;

    async fn connect(&self, shard: usize) -> Result<Box<dyn DocumentStore>>;
}

/// One connection per shard, owned by a single worker.
pub struct Shards {
    stores: Vec<Box<dyn DocumentStore>>,
}

impl Shards {
    pub async fn connect(connector: &Arc<dyn StoreConnector>) -> Result<Self> {
        let mut stores = Vec::with_capacity(connector.shard_count());
        for shard in 0..connector.shard_count() {
            stores.push(connector.connect(shard).await?);
        }
        Ok(Self { stores })
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub fn get(&self, shard: usize) -> Result<&dyn DocumentStore> {
        self.stores
            .get(shard)
            .map(|s| s.as_ref())
            .ok_or(Error::UnknownShard {
                shard,
                shards: self.stores.len(),
            })
    }

    /// Ping every shard. Returns the number of failed pings.
    pub async fn ping_all(&self) -> usize {
        let mut failures = 0;
        for (shard, store) in self.stores.iter().enumerate() {
            if let Err(err) = store.ping().await {
                failures += 1;
                tracing::error!(target: "logjam::store", shard, error = %err, "ping failed");
            }
        }
        failures
    }
}

/// The `$inc` object of an update document.
pub fn increments_of(update: &Value) -> Result<&Map<String, Value>> {
    update
        .get("$inc")
        .and_then(Value::as_object)
        .ok_or_else(|| Error::Store {
            code: "bad-update".into(),
            message: format!("update document has no $inc object: {update}"),
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::MemoryStore;

    #[test]
    fn increments_require_inc_object() {
        let update = json!({"$inc": {"count": 1}});
        assert_eq!(increments_of(&update).unwrap()["count"], json!(1));
        assert!(increments_of(&json!({"$set": {"count": 1}})).is_err());
    }

    #[test]
    fn write_concern_follows_replication_flag() {
        assert_eq!(WriteConcern::from_wait_for_replication(false), WriteConcern::Local);
        assert_eq!(
            WriteConcern::from_wait_for_replication(true),
            WriteConcern::Replicated
        );
    }

    #[tokio::test]
    async fn shards_reject_unknown_index() {
        let connector: Arc<dyn StoreConnector> = Arc::new(MemoryStore::with_shards(2));
        let shards = Shards::connect(&connector).await.unwrap();
        assert_eq!(shards.len(), 2);
        assert!(shards.get(1).is_ok());
        assert!(matches!(
            shards.get(2),
            Err(Error::UnknownShard { shard: 2, shards: 2 })
        ));
        assert_eq!(shards.ping_all().await, 0);
    }
}
