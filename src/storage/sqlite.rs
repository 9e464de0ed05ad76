use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use super::{compare_values, Persistence, Query, Table};
use crate::error::{Error, Result};
use crate::types::Row;

/// Local store keeping each row as a JSON document in SQLite
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| {
            Error::unavailable("sqlite", format!("failed to open {}: {e}", path.display()))
        })?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            -- One document per row; seq keeps insertion order
            CREATE TABLE IF NOT EXISTS records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                tbl TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                UNIQUE (tbl, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_tbl ON records(tbl);
        "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::unavailable("sqlite", "connection lock poisoned"))
    }
}

/// Text form of a key column value
fn key_text(table: Table, row: &Row) -> Result<String> {
    match row.get(table.key()) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::invalid(format!(
            "row for {} is missing key column '{}'",
            table.name(),
            table.key()
        ))),
    }
}

fn parse_body(body: &str) -> Result<Row> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::Decode {
            kind: "document",
            message: "stored body is not an object".into(),
        }),
        Err(e) => Err(Error::Decode {
            kind: "document",
            message: e.to_string(),
        }),
    }
}

fn select_body(conn: &Connection, table: Table, id: &str) -> Result<Option<Row>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM records WHERE tbl = ?1 AND id = ?2",
            (table.name(), id),
            |row| row.get(0),
        )
        .optional()?;
    body.as_deref().map(parse_body).transpose()
}

fn write_body(conn: &Connection, table: Table, id: &str, row: &Row) -> Result<()> {
    let body = serde_json::to_string(row).map_err(|e| Error::invalid(e.to_string()))?;
    conn.execute(
        r#"INSERT INTO records (tbl, id, body) VALUES (?1, ?2, ?3)
           ON CONFLICT(tbl, id) DO UPDATE SET body = excluded.body"#,
        (table.name(), id, body),
    )?;
    Ok(())
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn get(&self, table: Table, id: &str) -> Result<Option<Row>> {
        let conn = self.lock()?;
        select_body(&conn, table, id)
    }

    async fn query(&self, table: Table, query: &Query) -> Result<Vec<Row>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT body FROM records WHERE tbl = ?1 ORDER BY seq")?;
        let bodies = stmt
            .query_map([table.name()], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(bodies.len());
        for body in &bodies {
            let row = match parse_body(body) {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!("Skipping stored {} document: {e}", table.name());
                    continue;
                }
            };
            if query.filters.iter().all(|f| f.matches(&row)) {
                rows.push(row);
            }
        }

        if let Some(order) = &query.order {
            // Stable sort keeps insertion order among equal keys
            rows.sort_by(|a, b| {
                let ord = compare_values(a.get(&order.column), b.get(&order.column));
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        Ok(rows)
    }

    async fn insert(&self, table: Table, row: Row) -> Result<Row> {
        let id = key_text(table, &row)?;
        let body = serde_json::to_string(&row).map_err(|e| Error::invalid(e.to_string()))?;
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO records (tbl, id, body) VALUES (?1, ?2, ?3) ON CONFLICT(tbl, id) DO NOTHING",
            (table.name(), &id, body),
        )?;
        if inserted == 0 {
            return Err(Error::invalid(format!(
                "{} row '{id}' already exists",
                table.name()
            )));
        }
        Ok(row)
    }

    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<()> {
        let conn = self.lock()?;
        let mut row = select_body(&conn, table, id)?
            .ok_or_else(|| Error::not_found(table.name(), id))?;
        row.extend(patch);
        write_body(&conn, table, id, &row)
    }

    async fn upsert(&self, table: Table, rows: Vec<Row>) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let count = rows.len();
        for row in rows {
            let id = key_text(table, &row)?;
            let merged = match select_body(&tx, table, &id)? {
                Some(mut existing) => {
                    existing.extend(row);
                    existing
                }
                None => row,
            };
            write_body(&tx, table, &id, &merged)?;
        }
        tx.commit()?;
        Ok(count)
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
