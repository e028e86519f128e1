// Configuration loading and the versioned settings store

pub mod medium;
pub mod notify;
pub mod scenario;
pub mod settings;
pub mod storage;

pub use medium::{JsonFileMedium, KeyValueMedium, MemoryMedium};
pub use notify::{SettingChanged, SettingsNotifier, SettingsSubscription};
pub use scenario::{ParseScenarioError, Scenario};
pub use settings::{
    MigrationKind, MigrationStep, SettingKey, SettingsError, SettingsSnapshot, SettingsStore,
    LATEST_SETTINGS_VERSION,
};
pub use storage::{StorageConfig, DATA_DIR_ENV};
