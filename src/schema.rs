use std::fmt;

use indoc::formatdoc;

use crate::{Error, Result};

/// Schema holding the catalog of databases registered for the current day.
pub const GLOBAL_SCHEMA: &str = "logjam-global";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexOrder {
    Ascending,
    Descending,
}

impl IndexOrder {
    pub fn as_i32(self) -> i32 {
        match self {
            IndexOrder::Ascending => 1,
            IndexOrder::Descending => -1,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            IndexOrder::Ascending => "asc",
            IndexOrder::Descending => "desc",
        }
    }
}

use IndexOrder::{Ascending as Asc, Descending as Desc};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexKey {
    pub field: String,
    pub order: IndexOrder,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexSpec {
    pub keys: Vec<IndexKey>,
    pub name: String,
    pub background: bool,
}

impl IndexSpec {
    pub fn new(keys: &[(&str, IndexOrder)], background: bool) -> Self {
        let keys: Vec<IndexKey> = keys
            .iter()
            .map(|(field, order)| IndexKey {
                field: (*field).to_string(),
                order: *order,
            })
            .collect();
        let name = index_name(&keys);
        Self {
            keys,
            name,
            background,
        }
    }
}

impl fmt::Display for IndexSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// `field_direction` pairs joined by `_`, e.g. `page_1_minute_-1`.
pub fn index_name(keys: &[IndexKey]) -> String {
    keys.iter()
        .map(|k| format!("{}_{}", k.field, k.order.as_i32()))
        .collect::<Vec<_>>()
        .join("_")
}

/// A collection of a day database together with the indexes it must carry.
#[derive(Clone, Debug)]
pub struct CollectionIndexes {
    pub collection: &'static str,
    pub indexes: Vec<IndexSpec>,
}

const REQUEST_FIELDS: [&str; 4] = ["response_code", "severity", "exceptions", "soft_exceptions"];

/// Every index a day database needs, grouped by collection.
pub fn database_indexes(background: bool) -> Vec<CollectionIndexes> {
    let spec = |keys: &[(&str, IndexOrder)]| IndexSpec::new(keys, background);

    let mut requests = Vec::with_capacity(REQUEST_FIELDS.len() * 2);
    for field in REQUEST_FIELDS {
        requests.push(spec(&[("minute", Desc), (field, Asc)]));
        requests.push(spec(&[("page", Asc), ("minute", Desc), (field, Asc)]));
    }

    vec![
        CollectionIndexes {
            collection: "totals",
            indexes: vec![spec(&[("page", Asc)])],
        },
        CollectionIndexes {
            collection: "minutes",
            indexes: vec![spec(&[("page", Asc), ("minute", Asc)])],
        },
        CollectionIndexes {
            collection: "quants",
            indexes: vec![spec(&[("page", Asc), ("kind", Asc), ("quant", Asc)])],
        },
        CollectionIndexes {
            collection: "heatmaps",
            indexes: vec![spec(&[("page", Asc), ("minute", Asc)])],
        },
        CollectionIndexes {
            collection: "agents",
            indexes: vec![spec(&[("agent", Asc)])],
        },
        CollectionIndexes {
            collection: "metrics",
            indexes: vec![
                spec(&[("metric", Asc), ("value", Desc)]),
                spec(&[("page", Asc), ("metric", Asc), ("value", Desc)]),
                spec(&[("module", Asc), ("metric", Asc), ("value", Desc)]),
                spec(&[("minute", Asc), ("metric", Asc), ("value", Desc)]),
            ],
        },
        CollectionIndexes {
            collection: "requests",
            indexes: requests,
        },
        CollectionIndexes {
            collection: "js_exceptions",
            indexes: vec![
                spec(&[("logjam_request_id", Asc)]),
                spec(&[("description", Asc)]),
            ],
        },
    ]
}

#[derive(Clone, Debug)]
pub struct SchemaAction {
    description: String,
    sql: String,
}

impl SchemaAction {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// The DDL needed to bring one day database into shape.
#[derive(Clone, Debug, Default)]
pub struct SchemaPlan {
    actions: Vec<SchemaAction>,
}

impl SchemaPlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[SchemaAction] {
        &self.actions
    }

    fn push_action(&mut self, description: String, sql: String) {
        self.actions.push(SchemaAction { description, sql });
    }
}

/// Full DDL for `database`: schema, every catalogued collection and its indexes.
pub fn database_plan(database: &str, background: bool) -> SchemaPlan {
    let mut plan = SchemaPlan::default();
    plan.push_action(
        format!("create schema {}", quote_ident(database)),
        build_schema_sql(database),
    );
    for entry in database_indexes(background) {
        plan.push_action(
            format!("create table {}", qualified_name(database, entry.collection)),
            build_collection_table_sql(database, entry.collection),
        );
        for index in &entry.indexes {
            plan.push_action(
                format!(
                    "create index {} on {}",
                    quote_ident(&table_index_name(entry.collection, index)),
                    qualified_name(database, entry.collection)
                ),
                build_index_sql(database, entry.collection, index),
            );
        }
    }
    plan
}

pub fn build_schema_sql(schema: &str) -> String {
    formatdoc!(
        "create schema if not exists {schema}",
        schema = quote_ident(schema),
    )
}

pub fn build_collection_table_sql(database: &str, collection: &str) -> String {
    formatdoc!(
        r#"
        create table if not exists {table} (
            selector jsonb primary key,
            doc jsonb not null default '{{}}'::jsonb,
            updated_at timestamptz not null default now()
        )
        "#,
        table = qualified_name(database, collection),
    )
}

/// Postgres index names are per schema, so the collection is folded in.
pub fn table_index_name(collection: &str, index: &IndexSpec) -> String {
    format!("{collection}_{}", index.name)
}

pub fn build_index_sql(database: &str, collection: &str, index: &IndexSpec) -> String {
    let columns = index
        .keys
        .iter()
        .map(|k| format!("(doc -> {}) {}", quote_literal(&k.field), k.order.as_sql()))
        .collect::<Vec<_>>()
        .join(", ");
    formatdoc!(
        "create index {concurrently}if not exists {name} on {table} ({columns})",
        concurrently = if index.background { "concurrently " } else { "" },
        name = quote_ident(&table_index_name(collection, index)),
        table = qualified_name(database, collection),
        columns = columns,
    )
}

pub fn build_catalog_table_sql() -> String {
    formatdoc!(
        r#"
        create table if not exists {table} (
            name text primary key,
            registered_at timestamptz not null default now()
        )
        "#,
        table = qualified_name(GLOBAL_SCHEMA, "databases"),
    )
}

/// Longest identifier Postgres keeps; longer names are truncated silently.
pub const MAX_IDENTIFIER_LEN: usize = 63;

pub fn check_identifier(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::Config(format!(
            "identifier '{name}' must be between 1 and {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    Ok(())
}

pub fn qualified_name(schema: &str, ident: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(ident))
}

pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

pub fn quote_literal(value: &str) -> String {
    let escaped = value.replace('\'', "''");
    format!("'{}'", escaped)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified() {
        assert_eq!(
            qualified_name("logjam-shop-production-2024-03-01", "totals"),
            "\"logjam-shop-production-2024-03-01\".\"totals\""
        );
    }

    #[test]
    fn identifiers_fit_postgres_limit() {
        let longest = "x".repeat(MAX_IDENTIFIER_LEN);
        assert!(check_identifier(&longest).is_ok());
        assert!(check_identifier("logjam-shop-production-2024-03-01").is_ok());
        assert!(matches!(
            check_identifier(&format!("{longest}y")),
            Err(Error::Config(_))
        ));
        assert!(check_identifier("").is_err());
    }

    #[test]
    fn quote_handles_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
        assert_eq!(quote_literal("o'clock"), "'o''clock'");
    }

    #[test]
    fn names_follow_field_direction_convention() {
        let spec = IndexSpec::new(&[("page", Asc), ("minute", Desc)], true);
        assert_eq!(spec.name, "page_1_minute_-1");
    }

    #[test]
    fn catalogue_covers_every_collection() {
        let catalogue = database_indexes(true);
        let count: usize = catalogue.iter().map(|c| c.indexes.len()).sum();
        assert_eq!(count, 19);

        let requests = catalogue
            .iter()
            .find(|c| c.collection == "requests")
            .unwrap();
        let names: Vec<&str> = requests.indexes.iter().map(|i| i.name.as_str()).collect();
        assert!(names.contains(&"minute_-1_response_code_1"));
        assert!(names.contains(&"page_1_minute_-1_soft_exceptions_1"));

        let metrics = catalogue
            .iter()
            .find(|c| c.collection == "metrics")
            .unwrap();
        assert!(metrics
            .indexes
            .iter()
            .any(|i| i.name == "module_1_metric_1_value_-1"));
    }

    #[test]
    fn index_sql_uses_expression_keys() {
        let spec = IndexSpec::new(&[("page", Asc), ("minute", Desc)], true);
        let sql = build_index_sql("logjam-a-b-2024-01-01", "minutes", &spec);
        assert_eq!(
            sql,
            "create index concurrently if not exists \"minutes_page_1_minute_-1\" \
             on \"logjam-a-b-2024-01-01\".\"minutes\" ((doc -> 'page') asc, (doc -> 'minute') desc)"
        );

        let foreground = IndexSpec::new(&[("agent", Asc)], false);
        assert!(build_index_sql("db", "agents", &foreground).starts_with("create index if not exists"));
    }

    #[test]
    fn plan_creates_schema_then_tables_and_indexes() {
        let plan = database_plan("logjam-a-b-2024-01-01", false);
        assert!(!plan.is_empty());
        assert!(plan.actions()[0].sql().starts_with("create schema if not exists"));
        let tables = plan
            .actions()
            .iter()
            .filter(|a| a.description().starts_with("create table"))
            .count();
        assert_eq!(tables, 8);
        assert_eq!(plan.actions().len(), 1 + 8 + 19);
    }
}
