// Store schema and migration ladder

use rusqlite::{params, Connection};
use serde_json::Value;

use crate::record::now_timestamp;

/// On-disk schema version this build expects (stored in `PRAGMA user_version`).
/// Increment together with a new step in `default_migrations`.
pub const STORE_SCHEMA_VERSION: i64 = 1;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    body TEXT NOT NULL,          -- JSON document, opaque to the engine
    updated_at TEXT NOT NULL,    -- RFC 3339
    PRIMARY KEY (collection, id)
);

CREATE TABLE IF NOT EXISTS store_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// One rung of the store migration ladder.
///
/// Steps run in ascending order inside the touch transaction, so a failing
/// step leaves the file exactly as it was.
#[derive(Debug, Clone, Copy)]
pub struct StoreMigration {
    pub version: i64,
    pub description: &'static str,
    pub apply: fn(&MigrationContext<'_>) -> Result<(), String>,
}

/// The ladder shipped with this build.
pub fn default_migrations() -> Vec<StoreMigration> {
    vec![StoreMigration {
        version: 1,
        description: "records and store_meta tables",
        apply: create_baseline_schema,
    }]
}

fn create_baseline_schema(ctx: &MigrationContext<'_>) -> Result<(), String> {
    ctx.execute_batch(SCHEMA)
}

/// What a migration step may do to the store.
pub struct MigrationContext<'a> {
    conn: &'a Connection,
    from_version: i64,
}

impl<'a> MigrationContext<'a> {
    pub(crate) fn new(conn: &'a Connection, from_version: i64) -> Self {
        Self { conn, from_version }
    }

    /// Version the store had before this touch started.
    pub fn from_version(&self) -> i64 {
        self.from_version
    }

    /// True when the ladder is running against a brand-new file.
    pub fn is_fresh(&self) -> bool {
        self.from_version == 0
    }

    pub fn execute_batch(&self, sql: &str) -> Result<(), String> {
        self.conn.execute_batch(sql).map_err(|e| e.to_string())
    }

    /// Rewrite every record of a collection.
    ///
    /// `transform` receives the id and current body. Returning a different
    /// body updates the record, returning the same body leaves it alone and
    /// returning `None` deletes it. Returns how many records changed.
    pub fn transform_records<F>(&self, collection: &str, mut transform: F) -> Result<usize, String>
    where
        F: FnMut(&str, Value) -> Option<Value>,
    {
        let rows: Vec<(String, String)> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id, body FROM records WHERE collection = ?1 ORDER BY id")
                .map_err(|e| e.to_string())?;
            let iter = stmt
                .query_map(params![collection], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| e.to_string())?;
            iter.collect::<Result<_, _>>().map_err(|e| e.to_string())?
        };

        let stamp = now_timestamp();
        let mut changed = 0;

        for (id, raw) in rows {
            let body: Value = serde_json::from_str(&raw)
                .map_err(|e| format!("record {collection}/{id}: {e}"))?;
            let original = body.clone();

            match transform(&id, body) {
                Some(new_body) if new_body == original => {}
                Some(new_body) => {
                    let json = serde_json::to_string(&new_body).map_err(|e| e.to_string())?;
                    self.conn
                        .execute(
                            "UPDATE records SET body = ?1, updated_at = ?2 WHERE collection = ?3 AND id = ?4",
                            params![json, stamp, collection, id],
                        )
                        .map_err(|e| e.to_string())?;
                    changed += 1;
                }
                None => {
                    self.conn
                        .execute(
                            "DELETE FROM records WHERE collection = ?1 AND id = ?2",
                            params![collection, id],
                        )
                        .map_err(|e| e.to_string())?;
                    changed += 1;
                }
            }
        }

        Ok(changed)
    }
}

/// Highest version in a ladder (0 for an empty ladder).
pub(crate) fn ladder_version(migrations: &[StoreMigration]) -> i64 {
    migrations.iter().map(|step| step.version).max().unwrap_or(0)
}

pub(crate) fn read_user_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
}

/// Run every step above `from` in ascending order and stamp the version.
/// The caller owns the surrounding transaction.
pub(crate) fn run_migrations(
    conn: &Connection,
    migrations: &[StoreMigration],
    from: i64,
) -> Result<i64, (i64, String)> {
    let mut steps: Vec<&StoreMigration> = migrations.iter().filter(|step| step.version > from).collect();
    steps.sort_by_key(|step| step.version);

    let ctx = MigrationContext::new(conn, from);
    let mut version = from;
    for step in steps {
        log::info!("Applying store migration {} ({})", step.version, step.description);
        (step.apply)(&ctx).map_err(|message| (step.version, message))?;
        version = step.version;
    }

    conn.pragma_update(None, "user_version", version)
        .map_err(|e| (version, e.to_string()))?;
    write_meta(conn, "last_migrated_at", &now_timestamp()).map_err(|e| (version, e))?;
    write_meta(conn, "app_version", env!("CARGO_PKG_VERSION")).map_err(|e| (version, e))?;

    Ok(version)
}

pub(crate) fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<(), String> {
    conn.execute(
        "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
        params![key, value],
    )
    .map(|_| ())
    .map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn migrated() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, &default_migrations(), 0).unwrap();
        conn
    }

    fn insert(conn: &Connection, collection: &str, id: &str, body: Value) {
        conn.execute(
            "INSERT INTO records (collection, id, body, updated_at) VALUES (?1, ?2, ?3, 'seed')",
            params![collection, id, body.to_string()],
        )
        .unwrap();
    }

    #[test]
    fn test_baseline_ladder_stamps_version() {
        let conn = migrated();
        assert_eq!(read_user_version(&conn).unwrap(), STORE_SCHEMA_VERSION);
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
        let app_version: String = conn
            .query_row("SELECT value FROM store_meta WHERE key = 'app_version'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(app_version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_failing_step_reports_its_version() {
        fn broken(_: &MigrationContext<'_>) -> Result<(), String> {
            Err("boom".to_string())
        }
        let mut ladder = default_migrations();
        ladder.push(StoreMigration { version: 2, description: "broken", apply: broken });

        let conn = Connection::open_in_memory().unwrap();
        let err = run_migrations(&conn, &ladder, 0).unwrap_err();
        assert_eq!(err, (2, "boom".to_string()));
    }

    #[test]
    fn test_transform_records_updates_and_deletes() {
        let conn = migrated();
        insert(&conn, "appointments", "a1", json!({"when": "2024-03-01", "clinic": "North"}));
        insert(&conn, "appointments", "a2", json!({"when": "2024-03-02"}));
        insert(&conn, "appointments", "a3", json!({"cancelled": true}));
        insert(&conn, "contacts", "c1", json!({"name": "Ana"}));

        let ctx = MigrationContext::new(&conn, 1);
        let changed = ctx
            .transform_records("appointments", |_, mut body| {
                if body.get("cancelled").is_some() {
                    return None;
                }
                if let Some(clinic) = body.get("clinic").cloned() {
                    body["location"] = clinic;
                    body.as_object_mut()?.remove("clinic");
                }
                Some(body)
            })
            .unwrap();

        // a1 rewritten, a3 deleted, a2 untouched
        assert_eq!(changed, 2);

        let a1: String = conn
            .query_row("SELECT body FROM records WHERE id = 'a1'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(serde_json::from_str::<Value>(&a1).unwrap(), json!({"when": "2024-03-01", "location": "North"}));

        let a2_stamp: String = conn
            .query_row("SELECT updated_at FROM records WHERE id = 'a2'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(a2_stamp, "seed");

        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM records WHERE collection = 'appointments'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(remaining, 2);

        let contacts: i64 = conn
            .query_row("SELECT COUNT(*) FROM records WHERE collection = 'contacts'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(contacts, 1);
    }

    #[test]
    fn test_ladder_version() {
        assert_eq!(ladder_version(&default_migrations()), STORE_SCHEMA_VERSION);
        assert_eq!(ladder_version(&[]), 0);
    }
}
