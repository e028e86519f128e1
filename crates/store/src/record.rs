//! Records are opaque JSON documents grouped into named collections.
//! The engine never looks inside a body.

use std::fmt;

use rusqlite::{params, Connection, OptionalExtension, Params, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub collection: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self { collection: collection.into(), id: id.into() }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub collection: String,
    pub id: String,
    pub body: Value,
    /// RFC 3339 timestamp of the last committed change.
    pub updated_at: String,
}

impl Record {
    /// A record stamped with the current time.
    pub fn new(collection: impl Into<String>, id: impl Into<String>, body: Value) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            body,
            updated_at: now_timestamp(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.collection.clone(), self.id.clone())
    }
}

/// Fresh identifier for a new record.
pub fn new_record_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

// Row codec shared by the writer and the read handles

pub(crate) const SELECT_ONE: &str =
    "SELECT collection, id, body, updated_at FROM records WHERE collection = ?1 AND id = ?2";
pub(crate) const SELECT_COLLECTION: &str =
    "SELECT collection, id, body, updated_at FROM records WHERE collection = ?1 ORDER BY id";
pub(crate) const SELECT_ALL: &str =
    "SELECT collection, id, body, updated_at FROM records ORDER BY collection, id";

/// A row as stored: body still JSON text.
pub(crate) struct RawRecord {
    collection: String,
    id: String,
    body: String,
    updated_at: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            collection: row.get(0)?,
            id: row.get(1)?,
            body: row.get(2)?,
            updated_at: row.get(3)?,
        })
    }

    pub(crate) fn decode(self) -> Result<Record, serde_json::Error> {
        Ok(Record {
            body: serde_json::from_str(&self.body)?,
            collection: self.collection,
            id: self.id,
            updated_at: self.updated_at,
        })
    }
}

pub(crate) fn fetch_one(conn: &Connection, key: &RecordKey) -> rusqlite::Result<Option<RawRecord>> {
    conn.query_row(SELECT_ONE, params![key.collection, key.id], RawRecord::from_row)
        .optional()
}

pub(crate) fn fetch_many<P: Params>(conn: &Connection, sql: &str, params: P) -> rusqlite::Result<Vec<RawRecord>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, RawRecord::from_row)?;
    rows.collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_display() {
        let key = RecordKey::new("appointments", "a1");
        assert_eq!(key.to_string(), "appointments/a1");
    }

    #[test]
    fn test_new_record_is_timestamped() {
        let record = Record::new("contacts", "c1", json!({"name": "Dr. Okafor"}));
        assert!(chrono::DateTime::parse_from_rfc3339(&record.updated_at).is_ok());
        assert_eq!(record.key(), RecordKey::new("contacts", "c1"));
    }

    #[test]
    fn test_record_ids_are_unique() {
        assert_ne!(new_record_id(), new_record_id());
    }

    #[test]
    fn test_keys_order_by_collection_then_id() {
        let mut keys = vec![
            RecordKey::new("b", "1"),
            RecordKey::new("a", "2"),
            RecordKey::new("a", "1"),
        ];
        keys.sort();
        assert_eq!(keys[0], RecordKey::new("a", "1"));
        assert_eq!(keys[2], RecordKey::new("b", "1"));
    }
}
