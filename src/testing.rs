//! An in-process [`DocumentStore`] with scriptable failures and inspection
//! helpers, for driving workers without a database.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Number, Value, json};

use crate::schema::IndexSpec;
use crate::store::{CollectionHandle, DocumentStore, StoreConnector, WriteConcern, increments_of};
use crate::{Error, Result};

#[derive(Default)]
struct Collection {
    indexes: BTreeSet<String>,
    docs: BTreeMap<String, Value>,
}

#[derive(Default)]
struct State {
    databases: BTreeMap<String, BTreeMap<String, Collection>>,
    known: BTreeSet<String>,
    stats: HashMap<String, Value>,
    failing_indexes: BTreeSet<String>,
    contention_failures: u32,
    hard_failures: u32,
    prepare_failures: u32,
    pings: u64,
    connects: u64,
    index_calls: u64,
    prepare_calls: u64,
    upsert_attempts: u64,
    concerns: Vec<WriteConcern>,
    index_delay: Duration,
}

/// Cloning shares state, so a test can keep a handle while workers connect.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    shards: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_shards(1)
    }

    /// All shards share one state.
    pub fn with_shards(shards: usize) -> Self {
        Self {
            state: Arc::default(),
            shards,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory store poisoned")
    }

    // --- scripting ---

    /// The next `n` upserts fail with lock contention.
    pub fn fail_upserts_with_contention(&self, n: u32) {
        self.lock().contention_failures = n;
    }

    /// The next `n` upserts fail with a non-retryable store error.
    pub fn fail_upserts(&self, n: u32) {
        self.lock().hard_failures = n;
    }

    /// The next `n` collection preparations fail.
    pub fn fail_prepares(&self, n: u32) {
        self.lock().prepare_failures = n;
    }

    /// Every attempt to create an index with this name fails.
    pub fn fail_index(&self, name: impl Into<String>) {
        self.lock().failing_indexes.insert(name.into());
    }

    pub fn set_stats(&self, database: impl Into<String>, stats: Value) {
        self.lock().stats.insert(database.into(), stats);
    }

    pub fn set_index_delay(&self, delay: Duration) {
        self.lock().index_delay = delay;
    }

    // --- inspection ---

    pub fn databases(&self) -> Vec<String> {
        self.lock().databases.keys().cloned().collect()
    }

    pub fn collections(&self, database: &str) -> Vec<String> {
        self.lock()
            .databases
            .get(database)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn indexes(&self, database: &str, collection: &str) -> Vec<String> {
        self.lock()
            .databases
            .get(database)
            .and_then(|c| c.get(collection))
            .map(|c| c.indexes.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn index_count(&self, database: &str) -> usize {
        self.lock()
            .databases
            .get(database)
            .map(|c| c.values().map(|c| c.indexes.len()).sum())
            .unwrap_or(0)
    }

    pub fn document(&self, database: &str, collection: &str, selector: &Value) -> Option<Value> {
        let key = selector_key(selector.as_object()?);
        self.lock()
            .databases
            .get(database)?
            .get(collection)?
            .docs
            .get(&key)
            .cloned()
    }

    pub fn documents(&self, database: &str, collection: &str) -> Vec<Value> {
        self.lock()
            .databases
            .get(database)
            .and_then(|c| c.get(collection))
            .map(|c| c.docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn known_databases(&self) -> Vec<String> {
        self.lock().known.iter().cloned().collect()
    }

    pub fn ping_count(&self) -> u64 {
        self.lock().pings
    }

    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }

    pub fn index_calls(&self) -> u64 {
        self.lock().index_calls
    }

    pub fn prepare_calls(&self) -> u64 {
        self.lock().prepare_calls
    }

    pub fn upsert_attempts(&self) -> u64 {
        self.lock().upsert_attempts
    }

    pub fn write_concerns(&self) -> Vec<WriteConcern> {
        self.lock().concerns.clone()
    }
}

fn selector_key(selector: &Map<String, Value>) -> String {
    Value::Object(selector.clone()).to_string()
}

fn add_numbers(current: Option<&Value>, delta: &Value) -> Result<Value> {
    let Value::Number(delta_num) = delta else {
        return Err(Error::Store {
            code: "bad-update".into(),
            message: format!("cannot increment by non-number {delta}"),
        });
    };
    let current = match current {
        None | Some(Value::Null) => return Ok(Value::Number(delta_num.clone())),
        Some(Value::Number(n)) => n,
        Some(other) => {
            return Err(Error::Store {
                code: "bad-update".into(),
                message: format!("cannot increment non-number {other}"),
            });
        }
    };
    if let (Some(a), Some(b)) = (current.as_i64(), delta_num.as_i64()) {
        if let Some(sum) = a.checked_add(b) {
            return Ok(json!(sum));
        }
    }
    let sum = current.as_f64().unwrap_or(0.0) + delta_num.as_f64().unwrap_or(0.0);
    Ok(Number::from_f64(sum).map(Value::Number).unwrap_or(Value::Null))
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        self.lock().pings += 1;
        Ok(())
    }

    async fn create_index(
        &self,
        database: &str,
        collection: &str,
        index: &IndexSpec,
    ) -> Result<()> {
        let delay = self.lock().index_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        state.index_calls += 1;
        if state.failing_indexes.contains(&index.name) {
            return Err(Error::Store {
                code: "85".into(),
                message: format!("index {} cannot be built", index.name),
            });
        }
        state
            .databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
            .indexes
            .insert(index.name.clone());
        Ok(())
    }

    async fn database_stats(&self, database: &str) -> Result<Value> {
        let state = self.lock();
        if let Some(stats) = state.stats.get(database) {
            return Ok(stats.clone());
        }
        let collections = state.databases.get(database).map_or(0, |c| c.len());
        Ok(json!({"db": database, "collections": collections, "storageSize": 0}))
    }

    async fn ensure_known_database(&self, database: &str) -> Result<()> {
        self.lock().known.insert(database.to_string());
        Ok(())
    }

    async fn prepare_collection(&self, collection: &CollectionHandle) -> Result<()> {
        let mut state = self.lock();
        state.prepare_calls += 1;
        if state.prepare_failures > 0 {
            state.prepare_failures -= 1;
            return Err(Error::Store {
                code: "57P03".into(),
                message: format!("cannot prepare {collection} right now"),
            });
        }
        state
            .databases
            .entry(collection.database.clone())
            .or_default()
            .entry(collection.name.clone())
            .or_default();
        Ok(())
    }

    async fn upsert_increments(
        &self,
        collection: &CollectionHandle,
        selector: &Map<String, Value>,
        update: &Value,
        concern: WriteConcern,
    ) -> Result<()> {
        let increments = increments_of(update)?;
        let mut state = self.lock();
        state.upsert_attempts += 1;
        state.concerns.push(concern);
        if state.contention_failures > 0 {
            state.contention_failures -= 1;
            return Err(Error::LockContention {
                code: "40001".into(),
                message: "write conflict".into(),
            });
        }
        if state.hard_failures > 0 {
            state.hard_failures -= 1;
            return Err(Error::Store {
                code: "13".into(),
                message: "not authorized".into(),
            });
        }

        let docs = &mut state
            .databases
            .entry(collection.database.clone())
            .or_default()
            .entry(collection.name.clone())
            .or_default()
            .docs;
        let doc = docs
            .entry(selector_key(selector))
            .or_insert_with(|| Value::Object(selector.clone()));
        let Some(fields) = doc.as_object_mut() else {
            return Err(Error::Store {
                code: "bad-document".into(),
                message: "stored document is not an object".into(),
            });
        };
        let mut updated = Vec::with_capacity(increments.len());
        for (field, delta) in increments {
            updated.push((field.clone(), add_numbers(fields.get(field), delta)?));
        }
        fields.extend(updated);
        Ok(())
    }
}

#[async_trait]
impl StoreConnector for MemoryStore {
    fn shard_count(&self) -> usize {
        self.shards
    }

    async fn connect(&self, shard: usize) -> Result<Box<dyn DocumentStore>> {
        if shard >= self.shards {
            return Err(Error::UnknownShard {
                shard,
                shards: self.shards,
            });
        }
        self.lock().connects += 1;
        Ok(Box::new(self.clone()))
    }
}
