//! Deterministic snapshot payloads
//!
//! A snapshot is the exported row set of every table in a backup. Tables and
//! columns are held in `BTreeMap`s so the same data always serializes to the
//! same bytes. The payload carries no timestamps or run ids.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::table::Row;
use crate::Result;

/// Current payload format
pub const FORMAT_VERSION: u32 = 1;

/// Rows of every exported table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub tables: BTreeMap<String, Vec<Row>>,
}

impl Snapshot {
    pub fn new(tables: BTreeMap<String, Vec<Row>>) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            tables,
        }
    }

    /// Row count per table
    pub fn row_counts(&self) -> BTreeMap<String, u64> {
        self.tables
            .iter()
            .map(|(name, rows)| (name.clone(), rows.len() as u64))
            .collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_serialization_is_independent_of_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("users".to_string(), vec![row(&[("id", json!(1)), ("name", json!("a"))])]);
        a.insert("orders".to_string(), vec![]);

        let mut b = BTreeMap::new();
        b.insert("orders".to_string(), vec![]);
        b.insert("users".to_string(), vec![row(&[("name", json!("a")), ("id", json!(1))])]);

        assert_eq!(
            Snapshot::new(a).to_bytes().unwrap(),
            Snapshot::new(b).to_bytes().unwrap()
        );
    }

    #[test]
    fn test_row_counts_and_decode() {
        let mut tables = BTreeMap::new();
        tables.insert(
            "users".to_string(),
            vec![row(&[("id", json!(1))]), row(&[("id", json!(2))])],
        );
        let snapshot = Snapshot::new(tables);
        assert_eq!(snapshot.row_counts()["users"], 2);

        let decoded = Snapshot::from_bytes(&snapshot.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, snapshot);
        assert!(Snapshot::from_bytes(b"not json").is_err());
    }
}
