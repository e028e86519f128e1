// Migration ladder properties for the versioned settings store.
// Run with: cargo test -p vitalog-config --test settings_migration

use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use tempfile::TempDir;

use vitalog_config::{
    JsonFileMedium, KeyValueMedium, MemoryMedium, MigrationKind, MigrationStep, SettingKey,
    SettingsStore, LATEST_SETTINGS_VERSION,
};

const LADDER_HEIGHT: i64 = 6;

/// A ladder whose steps record (version, kind) as they run.
fn recording_ladder(log: Arc<Mutex<Vec<(i64, MigrationKind)>>>) -> Vec<MigrationStep> {
    (1..=LADDER_HEIGHT)
        .map(|version| {
            let log = Arc::clone(&log);
            MigrationStep::new(version, "recorded", move |medium: &mut dyn KeyValueMedium, kind| {
                log.lock().push((version, kind));
                let key = format!("step.{version}");
                let runs = medium.get_int(&key);
                medium.set_int(&key, runs + 1);
            })
        })
        .collect()
}

proptest! {
    #[test]
    fn any_start_version_ends_at_latest(start in 0i64..LADDER_HEIGHT) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut medium = MemoryMedium::new();
        medium.set_int(SettingKey::SchemaVersion.as_str(), start);

        let mut store = SettingsStore::with_migrations(medium, recording_ladder(Arc::clone(&log)));
        prop_assert!(store.update(None));
        prop_assert_eq!(store.current_version(), LADDER_HEIGHT);

        let applied: Vec<i64> = log.lock().iter().map(|(v, _)| *v).collect();
        let expected: Vec<i64> = ((start + 1)..=LADDER_HEIGHT).collect();
        prop_assert_eq!(applied, expected);

        for version in 1..=LADDER_HEIGHT {
            let runs = store.medium().get_int(&format!("step.{version}"));
            prop_assert_eq!(runs, if version > start { 1 } else { 0 });
        }

        let expected_kind = if start == 0 {
            MigrationKind::FreshInstall
        } else {
            MigrationKind::Upgrade { from: start }
        };
        prop_assert!(log.lock().iter().all(|(_, kind)| *kind == expected_kind));

        // A second update is a no-op
        log.lock().clear();
        prop_assert!(!store.update(None));
        prop_assert!(log.lock().is_empty());
    }
}

#[test]
fn adding_a_step_later_runs_only_the_new_step() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut short = recording_ladder(Arc::clone(&log));
    short.truncate(3);

    let mut store = SettingsStore::with_migrations(MemoryMedium::new(), short);
    assert_eq!(store.latest_version(), 3);
    store.update(None);
    assert_eq!(store.current_version(), 3);

    log.lock().clear();
    let mut store = SettingsStore::with_migrations(store.into_medium(), recording_ladder(Arc::clone(&log)));
    assert_eq!(store.latest_version(), 6);
    assert!(store.update(None));

    let applied: Vec<i64> = log.lock().iter().map(|(v, _)| *v).collect();
    assert_eq!(applied, vec![4, 5, 6]);
    assert!(log
        .lock()
        .iter()
        .all(|(_, kind)| *kind == MigrationKind::Upgrade { from: 3 }));
}

#[test]
fn shipped_ladder_persists_through_json_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");

    {
        let mut store = SettingsStore::new(JsonFileMedium::open(&path));
        assert!(store.update(None));
        store.set_reminder_lead_minutes(20);
    }

    let mut store = SettingsStore::new(JsonFileMedium::open(&path));
    assert_eq!(store.current_version(), LATEST_SETTINGS_VERSION);
    assert!(!store.update(None));
    assert_eq!(store.reminder_lead_minutes(), 20);
}
