//! Relational persistence for bugs, solutions and clusters.
//!
//! The core only sees rows through [`Persistence`]; typed decoding happens in
//! the helpers at the bottom of this module.

pub mod sqlite;
pub mod supabase;

pub use self::sqlite::SqliteStore;
pub use self::supabase::SupabaseStore;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{BugRecord, ClusterRecord, Row, Solution};

/// Tables the core reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Bugs,
    Solutions,
    Clusters,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Bugs => "bugs",
            Table::Solutions => "solutions",
            Table::Clusters => "bug_clusters",
        }
    }

    /// Primary key column, also the upsert conflict key
    pub fn key(&self) -> &'static str {
        match self {
            Table::Bugs | Table::Solutions => "id",
            Table::Clusters => "cluster_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
}

impl Filter {
    /// Whether a row satisfies this filter. A missing column never matches.
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::Eq(column, expected) => row.get(column).is_some_and(|v| v == expected),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

/// Row selection: conjunctive filters and optional ordering
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order: Option<Order>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(column.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, column: &str, descending: bool) -> Self {
        self.order = Some(Order {
            column: column.to_string(),
            descending,
        });
        self
    }
}

/// Store of loosely typed rows keyed per table
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get(&self, table: Table, id: &str) -> Result<Option<Row>>;

    async fn query(&self, table: Table, query: &Query) -> Result<Vec<Row>>;

    /// Insert a new row; the key column must be present
    async fn insert(&self, table: Table, row: Row) -> Result<Row>;

    /// Merge `patch` into an existing row. `NotFound` if it does not exist.
    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<()>;

    /// Insert or merge rows by the table key. Columns absent from a row are
    /// left untouched on the stored row. Returns the number of rows written.
    async fn upsert(&self, table: Table, rows: Vec<Row>) -> Result<usize>;

    fn backend_name(&self) -> &'static str;
}

pub type SharedStore = Arc<dyn Persistence>;

/// Compare two JSON values for ordering; numbers numerically, strings
/// lexically, missing or mixed types last
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Null) | None, Some(Value::Null) | None) => Ordering::Equal,
        (Some(Value::Null) | None, _) => Ordering::Greater,
        (_, Some(Value::Null) | None) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

pub async fn load_bug(store: &dyn Persistence, id: &str) -> Result<BugRecord> {
    let row = store
        .get(Table::Bugs, id)
        .await?
        .ok_or_else(|| Error::not_found("bug", id))?;
    BugRecord::from_row(row)
}

/// Bugs matching `query`. Rows that fail to decode are skipped with a warning.
pub async fn load_bugs(store: &dyn Persistence, query: &Query) -> Result<Vec<BugRecord>> {
    let rows = store.query(Table::Bugs, query).await?;
    Ok(decode_rows(rows, BugRecord::from_row))
}

/// Solutions for one bug, oldest first
pub async fn load_solutions(store: &dyn Persistence, bug_id: &str) -> Result<Vec<Solution>> {
    let query = Query::new()
        .eq("bug_id", bug_id)
        .order_by("created_at", false);
    let rows = store.query(Table::Solutions, &query).await?;
    Ok(decode_rows(rows, Solution::from_row))
}

pub async fn load_clusters(store: &dyn Persistence) -> Result<Vec<ClusterRecord>> {
    let query = Query::new().order_by("cluster_id", false);
    let rows = store.query(Table::Clusters, &query).await?;
    Ok(decode_rows(rows, ClusterRecord::from_row))
}

fn decode_rows<T>(rows: Vec<Row>, decode: fn(Row) -> Result<T>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match decode(row) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Skipping row: {e}");
                None
            }
        })
        .collect()
}
