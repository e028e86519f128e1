// Versioned application settings
// Persisted in <data_dir>/settings.json through a KeyValueMedium

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::medium::{JsonFileMedium, KeyValueMedium};
use crate::notify::{SettingsNotifier, SettingsSubscription};
use crate::scenario::Scenario;
use crate::storage::StorageConfig;

/// Settings schema version this build migrates to.
/// Increment together with a new step in `default_migrations`.
pub const LATEST_SETTINGS_VERSION: i64 = 1;

/// Lead time applied by the populated scenario seed.
const DEMO_REMINDER_LEAD_MINUTES: i64 = 60;

/// Every named setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SettingKey {
    /// Last applied migration step. Not user-editable.
    SchemaVersion,
    OnboardingComplete,
    AppointmentRemindersEnabled,
    DailyCheckInEnabled,
    ReminderLeadMinutes,
}

impl SettingKey {
    pub const ALL: [SettingKey; 5] = [
        SettingKey::SchemaVersion,
        SettingKey::OnboardingComplete,
        SettingKey::AppointmentRemindersEnabled,
        SettingKey::DailyCheckInEnabled,
        SettingKey::ReminderLeadMinutes,
    ];

    /// Key under which the value is persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::SchemaVersion => "settings.schemaVersion",
            SettingKey::OnboardingComplete => "onboarding.complete",
            SettingKey::AppointmentRemindersEnabled => "reminders.appointments",
            SettingKey::DailyCheckInEnabled => "reminders.dailyCheckIn",
            SettingKey::ReminderLeadMinutes => "reminders.leadMinutes",
        }
    }

    pub fn from_name(name: &str) -> Option<SettingKey> {
        Self::ALL.iter().copied().find(|key| key.as_str() == name)
    }

    pub fn is_bool(&self) -> bool {
        matches!(
            self,
            SettingKey::OnboardingComplete
                | SettingKey::AppointmentRemindersEnabled
                | SettingKey::DailyCheckInEnabled
        )
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsError {
    UnknownKey(String),
    InvalidValue { key: SettingKey, value: String },
    ReadOnly(SettingKey),
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownKey(name) => write!(f, "unknown setting '{name}'"),
            Self::InvalidValue { key, value } => {
                let expected = if key.is_bool() { "true or false" } else { "a non-negative integer" };
                write!(f, "invalid value '{value}' for {key} (expected {expected})")
            }
            Self::ReadOnly(key) => write!(f, "{key} is managed by migrations and cannot be set"),
        }
    }
}

impl std::error::Error for SettingsError {}

// ============================================================================
// Migration ladder
// ============================================================================

/// Whether a migration run started from an empty medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    FreshInstall,
    Upgrade { from: i64 },
}

type StepFn = Box<dyn Fn(&mut dyn KeyValueMedium, MigrationKind) + Send + Sync>;

/// One rung of the settings migration ladder.
pub struct MigrationStep {
    pub version: i64,
    pub description: &'static str,
    apply: StepFn,
}

impl MigrationStep {
    pub fn new<F>(version: i64, description: &'static str, apply: F) -> Self
    where
        F: Fn(&mut dyn KeyValueMedium, MigrationKind) + Send + Sync + 'static,
    {
        Self { version, description, apply: Box::new(apply) }
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationStep")
            .field("version", &self.version)
            .field("description", &self.description)
            .finish()
    }
}

/// The ladder shipped with this build.
pub fn default_migrations() -> Vec<MigrationStep> {
    vec![MigrationStep::new(1, "reminder preferences", reminder_defaults)]
}

/// Step 1: reminder preferences start off.
/// Upgrades keep anything the user already chose.
fn reminder_defaults(medium: &mut dyn KeyValueMedium, kind: MigrationKind) {
    let fill = |medium: &dyn KeyValueMedium, key: SettingKey| {
        kind == MigrationKind::FreshInstall || !medium.contains(key.as_str())
    };

    if fill(&*medium, SettingKey::AppointmentRemindersEnabled) {
        medium.set_bool(SettingKey::AppointmentRemindersEnabled.as_str(), false);
    }
    if fill(&*medium, SettingKey::DailyCheckInEnabled) {
        medium.set_bool(SettingKey::DailyCheckInEnabled.as_str(), false);
    }
    if fill(&*medium, SettingKey::ReminderLeadMinutes) {
        medium.set_int(SettingKey::ReminderLeadMinutes.as_str(), 0);
    }
}

// ============================================================================
// Store
// ============================================================================

/// Point-in-time copy of every named setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSnapshot {
    pub schema_version: i64,
    pub onboarding_complete: bool,
    pub appointment_reminders_enabled: bool,
    pub daily_check_in_enabled: bool,
    pub reminder_lead_minutes: u32,
}

/// Versioned key/value settings with stepwise migration.
///
/// Owned explicitly and passed to whoever needs it; there is no global
/// instance. Setters persist immediately and notify subscribers.
pub struct SettingsStore<M: KeyValueMedium = JsonFileMedium> {
    medium: M,
    migrations: Vec<MigrationStep>,
    latest: i64,
    notifier: SettingsNotifier,
}

impl SettingsStore<JsonFileMedium> {
    /// Open the settings file named by the storage configuration.
    pub fn open(config: &StorageConfig) -> Self {
        Self::new(JsonFileMedium::open(config.settings_path()))
    }
}

impl<M: KeyValueMedium> SettingsStore<M> {
    pub fn new(medium: M) -> Self {
        Self::with_migrations(medium, default_migrations())
    }

    /// Build a store with an explicit ladder. Steps are ordered by version;
    /// the highest version becomes the latest.
    pub fn with_migrations(medium: M, mut migrations: Vec<MigrationStep>) -> Self {
        migrations.sort_by_key(|step| step.version);
        debug_assert!(
            migrations.iter().enumerate().all(|(i, step)| step.version == i as i64 + 1),
            "migration steps must be numbered 1..=n without gaps"
        );
        let latest = migrations.last().map(|step| step.version).unwrap_or(0);
        Self { medium, migrations, latest, notifier: SettingsNotifier::new() }
    }

    pub fn latest_version(&self) -> i64 {
        self.latest
    }

    pub fn current_version(&self) -> i64 {
        self.medium.get_int(SettingKey::SchemaVersion.as_str())
    }

    /// Bring the settings up to date.
    ///
    /// With a scenario, everything is erased and re-seeded and `false` is
    /// returned. Otherwise every step after the persisted version runs once,
    /// in order, and `true` is returned if any step ran.
    pub fn update(&mut self, reset: Option<Scenario>) -> bool {
        if let Some(scenario) = reset {
            self.reset_and_seed(scenario);
            return false;
        }

        let persisted = self.current_version();
        if persisted >= self.latest {
            if persisted > self.latest {
                log::warn!(
                    "Settings version {} is newer than this build ({}); leaving untouched",
                    persisted,
                    self.latest
                );
            }
            return false;
        }

        let kind = if persisted == 0 {
            MigrationKind::FreshInstall
        } else {
            MigrationKind::Upgrade { from: persisted }
        };

        for step in self.migrations.iter().filter(|step| step.version > persisted) {
            log::info!("Applying settings migration {} ({})", step.version, step.description);
            (step.apply)(&mut self.medium, kind);
            // Stamp each rung so an interrupted ladder resumes where it stopped
            self.medium.set_int(SettingKey::SchemaVersion.as_str(), step.version);
        }

        log::info!("Settings migrated from version {} to {}", persisted, self.latest);
        true
    }

    fn reset_and_seed(&mut self, scenario: Scenario) {
        log::info!("Resetting settings for scenario '{}'", scenario);
        self.medium.remove_all();

        for step in &self.migrations {
            (step.apply)(&mut self.medium, MigrationKind::FreshInstall);
        }
        self.medium.set_int(SettingKey::SchemaVersion.as_str(), self.latest);

        if scenario.has_demo_content() {
            self.medium.set_bool(SettingKey::OnboardingComplete.as_str(), true);
            self.medium.set_bool(SettingKey::AppointmentRemindersEnabled.as_str(), true);
            self.medium.set_bool(SettingKey::DailyCheckInEnabled.as_str(), true);
            self.medium
                .set_int(SettingKey::ReminderLeadMinutes.as_str(), DEMO_REMINDER_LEAD_MINUTES);
        }
    }

    // ------------------------------------------------------------------------
    // Typed accessors
    // ------------------------------------------------------------------------

    pub fn onboarding_complete(&self) -> bool {
        self.medium.get_bool(SettingKey::OnboardingComplete.as_str())
    }

    pub fn set_onboarding_complete(&mut self, value: bool) {
        self.store_bool(SettingKey::OnboardingComplete, value);
    }

    pub fn appointment_reminders_enabled(&self) -> bool {
        self.medium.get_bool(SettingKey::AppointmentRemindersEnabled.as_str())
    }

    pub fn set_appointment_reminders_enabled(&mut self, value: bool) {
        self.store_bool(SettingKey::AppointmentRemindersEnabled, value);
    }

    pub fn daily_check_in_enabled(&self) -> bool {
        self.medium.get_bool(SettingKey::DailyCheckInEnabled.as_str())
    }

    pub fn set_daily_check_in_enabled(&mut self, value: bool) {
        self.store_bool(SettingKey::DailyCheckInEnabled, value);
    }

    /// Minutes before an appointment that a reminder fires.
    pub fn reminder_lead_minutes(&self) -> u32 {
        let raw = self.medium.get_int(SettingKey::ReminderLeadMinutes.as_str());
        u32::try_from(raw).unwrap_or(0)
    }

    pub fn set_reminder_lead_minutes(&mut self, minutes: u32) {
        self.medium.set_int(SettingKey::ReminderLeadMinutes.as_str(), i64::from(minutes));
        self.notifier.broadcast(SettingKey::ReminderLeadMinutes);
    }

    fn store_bool(&mut self, key: SettingKey, value: bool) {
        self.medium.set_bool(key.as_str(), value);
        self.notifier.broadcast(key);
    }

    /// Parse and apply a textual value (CLI entry point).
    pub fn set_from_str(&mut self, key: SettingKey, value: &str) -> Result<(), SettingsError> {
        let invalid = || SettingsError::InvalidValue { key, value: value.to_string() };

        match key {
            SettingKey::SchemaVersion => Err(SettingsError::ReadOnly(key)),
            SettingKey::ReminderLeadMinutes => {
                let minutes = value.trim().parse::<u32>().map_err(|_| invalid())?;
                self.set_reminder_lead_minutes(minutes);
                Ok(())
            }
            _ => {
                let flag = match value.trim().to_ascii_lowercase().as_str() {
                    "true" | "on" | "1" | "yes" => true,
                    "false" | "off" | "0" | "no" => false,
                    _ => return Err(invalid()),
                };
                self.store_bool(key, flag);
                Ok(())
            }
        }
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        SettingsSnapshot {
            schema_version: self.current_version(),
            onboarding_complete: self.onboarding_complete(),
            appointment_reminders_enabled: self.appointment_reminders_enabled(),
            daily_check_in_enabled: self.daily_check_in_enabled(),
            reminder_lead_minutes: self.reminder_lead_minutes(),
        }
    }

    pub fn notifier(&self) -> &SettingsNotifier {
        &self.notifier
    }

    pub fn subscribe(&self) -> SettingsSubscription {
        self.notifier.subscribe()
    }

    pub fn medium(&self) -> &M {
        &self.medium
    }

    pub fn into_medium(self) -> M {
        self.medium
    }
}
