// First-run seed population

use rusqlite::{params, Connection};
use serde_json::json;
use vitalog_config::Scenario;

use crate::record::Record;

/// Fixed stamp for seeded records, so seeds are byte-for-byte reproducible.
const SEED_TIMESTAMP: &str = "2024-01-01T00:00:00+00:00";

fn seeded(collection: &str, id: &str, body: serde_json::Value) -> Record {
    Record {
        collection: collection.to_string(),
        id: id.to_string(),
        body,
        updated_at: SEED_TIMESTAMP.to_string(),
    }
}

/// Records every install starts with.
pub fn baseline_records() -> Vec<Record> {
    vec![
        seeded("profile", "self", json!({ "displayName": "", "pronouns": null })),
        seeded("preferences", "app", json!({ "units": "metric", "textSize": "default" })),
    ]
}

/// Deterministic demo content for the populated scenario.
pub fn demo_records() -> Vec<Record> {
    vec![
        seeded(
            "appointments",
            "demo-appointment-1",
            json!({
                "title": "Follow-up visit",
                "startsAt": "2024-02-12T09:30:00+00:00",
                "contactId": "demo-contact-1",
                "notes": "Bring medication list"
            }),
        ),
        seeded(
            "appointments",
            "demo-appointment-2",
            json!({
                "title": "Blood panel",
                "startsAt": "2024-02-19T08:00:00+00:00",
                "contactId": "demo-contact-2",
                "notes": "Fasting"
            }),
        ),
        seeded(
            "contacts",
            "demo-contact-1",
            json!({ "name": "Dr. Amara Okafor", "role": "Primary care", "phone": "555-0142" }),
        ),
        seeded(
            "contacts",
            "demo-contact-2",
            json!({ "name": "Riverside Lab", "role": "Laboratory", "phone": "555-0187" }),
        ),
        seeded(
            "diagnoses",
            "demo-diagnosis-1",
            json!({ "label": "Seasonal allergies", "since": "2019-04" }),
        ),
    ]
}

/// The records a new store gets for an optional scenario.
pub(crate) fn seed_records(scenario: Option<Scenario>) -> Vec<Record> {
    let mut records = baseline_records();
    if scenario.is_some_and(|s| s.has_demo_content()) {
        records.extend(demo_records());
    }
    records
}

/// Insert seed records. The caller owns the surrounding transaction.
pub(crate) fn populate(conn: &Connection, scenario: Option<Scenario>) -> Result<usize, String> {
    let records = seed_records(scenario);
    let mut stmt = conn
        .prepare(
            "INSERT OR IGNORE INTO records (collection, id, body, updated_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .map_err(|e| e.to_string())?;

    for record in &records {
        let body = serde_json::to_string(&record.body).map_err(|e| e.to_string())?;
        stmt.execute(params![record.collection, record.id, body, record.updated_at])
            .map_err(|e| e.to_string())?;
    }

    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{default_migrations, run_migrations};

    #[test]
    fn test_baseline_only_without_demo_scenario() {
        assert_eq!(seed_records(None).len(), baseline_records().len());
        assert_eq!(seed_records(Some(Scenario::Empty)).len(), baseline_records().len());
        assert_eq!(
            seed_records(Some(Scenario::Populated)).len(),
            baseline_records().len() + demo_records().len()
        );
    }

    #[test]
    fn test_seeds_are_deterministic() {
        assert_eq!(seed_records(Some(Scenario::Populated)), seed_records(Some(Scenario::Populated)));
    }

    #[test]
    fn test_demo_appointments_reference_demo_contacts() {
        let demo = demo_records();
        for appt in demo.iter().filter(|r| r.collection == "appointments") {
            let contact = appt.body["contactId"].as_str().unwrap();
            assert!(demo.iter().any(|r| r.collection == "contacts" && r.id == contact));
        }
    }

    #[test]
    fn test_populate_inserts_rows() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn, &default_migrations(), 0).unwrap();

        let inserted = populate(&conn, Some(Scenario::Populated)).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0)).unwrap();
        assert_eq!(count as usize, inserted);

        // Re-seeding an already seeded store changes nothing
        populate(&conn, Some(Scenario::Populated)).unwrap();
        let count_again: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0)).unwrap();
        assert_eq!(count_again, count);
    }
}
