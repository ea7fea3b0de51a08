use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use indoc::formatdoc;
use serde_json::{Map, Value};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;

use super::{CollectionHandle, DocumentStore, StoreConnector, WriteConcern, increments_of};
use crate::config::ImporterConfig;
use crate::schema::{
    GLOBAL_SCHEMA, IndexSpec, build_catalog_table_sql, build_collection_table_sql,
    build_index_sql, build_schema_sql, check_identifier, qualified_name,
};
use crate::{Error, Result, WithContext};

/// SQLSTATEs raised when two workers race to create the same object.
const ALREADY_EXISTS_CODES: [&str; 3] = ["23505", "42P06", "42P07"];

/// Connects to Postgres, one pool per shard per worker.
#[derive(Clone, Debug)]
pub struct PgConnector {
    urls: Vec<String>,
    max_connections: u32,
}

impl PgConnector {
    pub fn new(urls: Vec<String>, max_connections: u32) -> Self {
        Self {
            urls,
            max_connections: max_connections.max(1),
        }
    }

    pub fn from_config(config: &ImporterConfig) -> Self {
        Self::new(config.database_urls.clone(), config.connections_per_shard)
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    fn shard_count(&self) -> usize {
        self.urls.len()
    }

    async fn connect(&self, shard: usize) -> Result<Box<dyn DocumentStore>> {
        let url = self.urls.get(shard).ok_or(Error::UnknownShard {
            shard,
            shards: self.urls.len(),
        })?;
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect(url)
            .await
            .map_err(Error::from)
            .context(format!("connecting to shard {shard}"))?;
        Ok(Box::new(PgStore::new(pool)))
    }
}

/// Document store on Postgres: each day database is a schema, each
/// collection a table of `(selector, doc)` jsonb pairs.
#[derive(Debug)]
pub struct PgStore {
    pool: PgPool,
    catalog_ready: AtomicBool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            catalog_ready: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run DDL, treating "already exists" races with other workers as success.
    async fn execute_ddl(&self, sql: &str) -> Result<()> {
        match sqlx::query(sql).execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db))
                if db
                    .code()
                    .is_some_and(|code| ALREADY_EXISTS_CODES.contains(&&*code)) =>
            {
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn ensure_collection(&self, database: &str, collection: &str) -> Result<()> {
        check_identifier(database)?;
        check_identifier(collection)?;
        self.execute_ddl(&build_schema_sql(database)).await?;
        self.execute_ddl(&build_collection_table_sql(database, collection))
            .await
    }

    async fn ensure_catalog(&self) -> Result<()> {
        if self.catalog_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        self.execute_ddl(&build_schema_sql(GLOBAL_SCHEMA)).await?;
        self.execute_ddl(&build_catalog_table_sql()).await?;
        self.catalog_ready.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn ping(&self) -> Result<()> {
        sqlx::query("select 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn create_index(
        &self,
        database: &str,
        collection: &str,
        index: &IndexSpec,
    ) -> Result<()> {
        self.ensure_collection(database, collection).await?;
        self.execute_ddl(&build_index_sql(database, collection, index))
            .await
    }

    async fn database_stats(&self, database: &str) -> Result<Value> {
        let stats: Value = sqlx::query_scalar(
            r#"
            select jsonb_build_object(
                'db', $1::text,
                'collections', count(c.oid),
                'storageSize', coalesce(sum(pg_total_relation_size(c.oid)), 0)
            )
            from pg_class c
            join pg_namespace n on n.oid = c.relnamespace
            where n.nspname = $1 and c.relkind = 'r'
            "#,
        )
        .bind(database)
        .fetch_one(&self.pool)
        .await?;
        Ok(stats)
    }

    async fn ensure_known_database(&self, database: &str) -> Result<()> {
        self.ensure_catalog().await?;
        let sql = format!(
            "insert into {} (name) values ($1) on conflict (name) do nothing",
            qualified_name(GLOBAL_SCHEMA, "databases")
        );
        sqlx::query(&sql).bind(database).execute(&self.pool).await?;
        Ok(())
    }

    async fn prepare_collection(&self, collection: &CollectionHandle) -> Result<()> {
        self.ensure_collection(&collection.database, &collection.name)
            .await
    }

    async fn upsert_increments(
        &self,
        collection: &CollectionHandle,
        selector: &Map<String, Value>,
        update: &Value,
        concern: WriteConcern,
    ) -> Result<()> {
        let increments = increments_of(update)?;
        check_identifier(&collection.database)?;
        let sql = formatdoc!(
            r#"
            insert into {table} as c (selector, doc, updated_at)
            values ($1::jsonb, $1::jsonb || $2::jsonb, now())
            on conflict (selector) do update set
                doc = c.doc || (
                    select coalesce(
                        jsonb_object_agg(
                            i.key,
                            to_jsonb(coalesce((c.doc ->> i.key)::numeric, 0) + (i.value #>> '{{}}')::numeric)
                        ),
                        '{{}}'::jsonb
                    )
                    from jsonb_each($2::jsonb) as i
                ),
                updated_at = now()
            "#,
            table = qualified_name(&collection.database, &collection.name),
        );

        let mut tx = self.pool.begin().await?;
        if concern == WriteConcern::Local {
            sqlx::query("set local synchronous_commit to off")
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(&sql)
            .bind(Json(selector))
            .bind(Json(increments))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
