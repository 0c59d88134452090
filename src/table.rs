//! Table export and import contract
//!
//! The relational data store is an external collaborator. The engine only
//! needs two operations from it: export the rows of a named table (optionally
//! only those changed since a point in time) and load rows back into a named
//! table. [`MemoryTableStore`] implements the contract in memory with per-row
//! change timestamps, for tests and embedding.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;

/// A single row: column name to value, ordered by column name
pub type Row = BTreeMap<String, Value>;

/// Errors raised by a table store
#[derive(Error, Debug, Clone)]
pub enum TableError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Temporary failure (connection reset, statement timeout)
    #[error("Data store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the operation; retrying will not help
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl TableError {
    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, TableError::Unavailable(_))
    }
}

/// Export/import access to the relational data store
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Rows of `table`; only rows changed after `since` when given
    async fn export_rows(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Row>, TableError>;

    /// Write `rows` into `table`, returning the number of rows written
    async fn import_rows(&self, table: &str, rows: Vec<Row>) -> Result<u64, TableError>;
}

/// Which side of the contract a fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultTarget {
    Export,
    Import,
}

/// Injected failure behaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with [`TableError::Unavailable`] for the next `remaining` calls
    Transient { remaining: u32 },
    /// Always fail with [`TableError::Rejected`]
    Permanent,
}

#[derive(Debug, Clone)]
struct StoredRow {
    row: Row,
    updated_at: DateTime<Utc>,
}

/// In-memory table store keyed by a primary key column
pub struct MemoryTableStore {
    key_column: String,
    tables: DashMap<String, BTreeMap<String, StoredRow>>,
    faults: Mutex<HashMap<(String, FaultTarget), Fault>>,
}

impl MemoryTableStore {
    /// Create a store whose rows are identified by `key_column`
    pub fn new(key_column: impl Into<String>) -> Self {
        Self {
            key_column: key_column.into(),
            tables: DashMap::new(),
            faults: Mutex::new(HashMap::new()),
        }
    }

    /// Create an empty table
    pub fn create_table(&self, table: &str) {
        self.tables.entry(table.to_string()).or_default();
    }

    /// Insert or replace rows, stamping them as changed now
    pub fn upsert_rows(
        &self,
        table: &str,
        rows: impl IntoIterator<Item = Row>,
    ) -> Result<u64, TableError> {
        let now = Utc::now();
        let mut keyed = Vec::new();
        for row in rows {
            keyed.push((self.row_key(table, &row)?, row));
        }

        let mut entry = self.tables.entry(table.to_string()).or_default();
        let mut written = 0;
        for (key, row) in keyed {
            entry.insert(key, StoredRow { row, updated_at: now });
            written += 1;
        }
        Ok(written)
    }

    /// Remove every row of a table, keeping the table
    pub fn truncate(&self, table: &str) {
        if let Some(mut rows) = self.tables.get_mut(table) {
            rows.clear();
        }
    }

    /// All rows of a table ordered by key
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .get(table)
            .map(|rows| rows.values().map(|r| r.row.clone()).collect())
            .unwrap_or_default()
    }

    /// Make calls against `table` fail
    pub fn inject_fault(&self, table: &str, target: FaultTarget, fault: Fault) {
        self.faults.lock().insert((table.to_string(), target), fault);
    }

    /// Remove any injected fault
    pub fn clear_fault(&self, table: &str, target: FaultTarget) {
        self.faults.lock().remove(&(table.to_string(), target));
    }

    fn check_fault(&self, table: &str, target: FaultTarget) -> Result<(), TableError> {
        let mut faults = self.faults.lock();
        let key = (table.to_string(), target);
        match faults.get_mut(&key) {
            Some(Fault::Permanent) => Err(TableError::Rejected(format!(
                "{:?} of '{}' rejected",
                target, table
            ))),
            Some(Fault::Transient { remaining }) => {
                if *remaining == 0 {
                    faults.remove(&key);
                    return Ok(());
                }
                *remaining -= 1;
                Err(TableError::Unavailable(format!(
                    "{:?} of '{}' timed out",
                    target, table
                )))
            }
            None => Ok(()),
        }
    }

    fn row_key(&self, table: &str, row: &Row) -> Result<String, TableError> {
        row.get(&self.key_column).map(key_string).ok_or_else(|| {
            TableError::Rejected(format!(
                "row for '{}' has no '{}' column",
                table, self.key_column
            ))
        })
    }
}

/// Render a key value so that numeric keys sort numerically
fn key_string(value: &Value) -> String {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => format!("{:020}", i as i128 - i64::MIN as i128),
            None => n.to_string(),
        },
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn export_rows(
        &self,
        table: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Row>, TableError> {
        self.check_fault(table, FaultTarget::Export)?;

        let rows = self
            .tables
            .get(table)
            .ok_or_else(|| TableError::UnknownTable(table.to_string()))?;

        Ok(rows
            .values()
            .filter(|r| since.map_or(true, |since| r.updated_at > since))
            .map(|r| r.row.clone())
            .collect())
    }

    async fn import_rows(&self, table: &str, rows: Vec<Row>) -> Result<u64, TableError> {
        self.check_fault(table, FaultTarget::Import)?;
        self.upsert_rows(table, rows)
    }
}
