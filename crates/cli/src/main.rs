// vitalog CLI - headless driver for the local store and settings

mod exit_codes;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use vitalog_config::{Scenario, SettingKey, SettingsStore, StorageConfig};
use vitalog_store::{
    BackupArchive, ImportError, InitError, Persistence, ReadError, Record, RecordKey, TouchState, WriteError,
};

use exit_codes::{
    import_exit_code, init_exit_code, write_exit_code, EXIT_ERROR, EXIT_EXPORT_FAILED, EXIT_SUCCESS, EXIT_USAGE,
};

#[derive(Parser)]
#[command(name = "vitalog")]
#[command(about = "Local health record store (open, migrate, write, back up, restore)")]
#[command(long_version = long_version())]
#[command(version)]
struct Cli {
    /// Directory holding the store and settings (overrides VITALOG_DATA_DIR and vitalog.toml)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Reset directive: wipe and reseed (empty | populated)
    #[arg(long, global = true)]
    scenario: Option<Scenario>,

    /// Debug logging (RUST_LOG still wins when set)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the store, creating or migrating it as needed, and print the touch signals
    #[command(after_help = "\
Examples:
  vitalog touch
  vitalog touch --scenario populated")]
    Touch,

    /// Delete the store file and its sidecars
    Reset,

    /// Insert or replace a record
    #[command(after_help = "\
Examples:
  vitalog put appointments a1 '{\"title\": \"Dentist\"}'")]
    Put {
        collection: String,
        id: String,
        /// Record body as JSON
        body: String,
    },

    /// Delete a record
    Delete { collection: String, id: String },

    /// List the records of a collection
    List {
        collection: String,

        /// Output as JSON for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Export the store as a backup archive
    Export {
        /// Output file (default: vitalog-backup-<date>.<ext> in the current directory)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// Replace the store with a backup archive
    #[command(after_help = "\
Files with the backup extension are tagged as backups automatically;
anything else must be tagged explicitly with --content-type.")]
    Import {
        file: PathBuf,

        /// Declared content tag of the archive
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Print the content fingerprint of the store
    Fingerprint {
        /// Output as JSON for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Versioned settings
    #[command(subcommand)]
    Settings(SettingsCommands),
}

#[derive(Subcommand)]
enum SettingsCommands {
    /// Print every named setting
    Show {
        /// Output as JSON for machine parsing
        #[arg(long)]
        json: bool,
    },
    /// Bring the settings up to the latest version (honours --scenario)
    Migrate,
    /// Change one setting
    Set { key: String, value: String },
}

fn long_version() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (", env!("VITALOG_GIT_HASH"), ")",
        "\ntarget:  ", env!("VITALOG_TARGET"),
    )
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = StorageConfig::load();
    let config = match cli.data_dir {
        Some(dir) => config.with_data_dir(dir),
        None => config,
    };
    log::debug!("Data directory: {}", config.resolved_data_dir().display());

    let result = match cli.command {
        Commands::Touch => cmd_touch(config, cli.scenario),
        Commands::Reset => cmd_reset(config),
        Commands::Put { collection, id, body } => cmd_put(config, collection, id, body),
        Commands::Delete { collection, id } => cmd_delete(config, collection, id),
        Commands::List { collection, json } => cmd_list(config, collection, json),
        Commands::Export { output } => cmd_export(config, output),
        Commands::Import { file, content_type } => cmd_import(config, file, content_type),
        Commands::Fingerprint { json } => cmd_fingerprint(config, json),
        Commands::Settings(command) => match command {
            SettingsCommands::Show { json } => cmd_settings_show(config, json),
            SettingsCommands::Migrate => cmd_settings_migrate(config, cli.scenario),
            SettingsCommands::Set { key, value } => cmd_settings_set(config, key, value),
        },
    };

    match result {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(CliError { code, message, hint }) => {
            if !message.is_empty() {
                eprintln!("error: {}", message);
            }
            if let Some(hint) = hint {
                eprintln!("hint:  {}", hint);
            }
            ExitCode::from(code)
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .format_timestamp(None)
        .init();
}

#[derive(Debug)]
pub struct CliError {
    pub code: u8,
    pub message: String,
    pub hint: Option<String>,
}

impl CliError {
    pub fn usage(msg: impl Into<String>) -> Self {
        Self { code: EXIT_USAGE, message: msg.into(), hint: None }
    }

    pub fn general(msg: impl Into<String>) -> Self {
        Self { code: EXIT_ERROR, message: msg.into(), hint: None }
    }

    pub fn init(err: InitError) -> Self {
        let hint = match &err {
            InitError::NotADatabase => Some("the store file is damaged; `vitalog reset` discards it".to_string()),
            InitError::NewerSchema { .. } => Some("upgrade vitalog to open this store".to_string()),
            _ => None,
        };
        Self { code: init_exit_code(&err), message: err.to_string(), hint }
    }

    pub fn write(err: WriteError) -> Self {
        Self { code: write_exit_code(&err), message: err.to_string(), hint: None }
    }

    pub fn read(err: ReadError) -> Self {
        Self::general(err.to_string())
    }

    pub fn import(err: ImportError) -> Self {
        let hint = match &err {
            ImportError::Validation(_) => Some("the existing store was not modified".to_string()),
            ImportError::Io(_) => Some("the existing store is unchanged; retry once other readers close".to_string()),
        };
        Self { code: import_exit_code(&err), message: err.to_string(), hint }
    }

    /// Add a hint to an existing error.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

/// Open and touch the store, silently.
fn open_store(config: StorageConfig) -> Result<Persistence, CliError> {
    let persistence = Persistence::new(config);
    persistence.lifecycle().touch(None, |_| {}).map_err(CliError::init)?;
    Ok(persistence)
}

fn signal_name(signal: TouchState) -> &'static str {
    match signal {
        TouchState::BeginMigration => "beginMigration",
        TouchState::Finished => "finished",
        TouchState::InitError => "initError",
    }
}

fn cmd_touch(config: StorageConfig, scenario: Option<Scenario>) -> Result<(), CliError> {
    let persistence = Persistence::new(config);
    let mut stdout = std::io::stdout();
    persistence
        .lifecycle()
        .touch(scenario, |signal| {
            let _ = writeln!(stdout, "{}", signal_name(signal));
        })
        .map_err(CliError::init)?;
    Ok(())
}

fn cmd_reset(config: StorageConfig) -> Result<(), CliError> {
    let persistence = Persistence::new(config);
    persistence.lifecycle().reset().map_err(CliError::init)?;
    println!("removed {}", persistence.config().store_path().display());
    Ok(())
}

fn cmd_put(config: StorageConfig, collection: String, id: String, body: String) -> Result<(), CliError> {
    let body: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| CliError::usage(format!("record body is not valid JSON: {}", e)))?;
    let record = Record::new(collection, id, body);

    let persistence = open_store(config)?;
    persistence
        .writer()
        .try_write(|txn| txn.upsert(&record))
        .map_err(CliError::write)?;
    println!("{}", record.key());
    Ok(())
}

fn cmd_delete(config: StorageConfig, collection: String, id: String) -> Result<(), CliError> {
    let key = RecordKey::new(collection, id);
    let persistence = open_store(config)?;
    let existed = persistence
        .writer()
        .try_write(|txn| txn.delete(&key))
        .map_err(CliError::write)?;
    if !existed {
        return Err(CliError::general(format!("record {} does not exist", key)));
    }
    println!("deleted {}", key);
    Ok(())
}

fn cmd_list(config: StorageConfig, collection: String, json: bool) -> Result<(), CliError> {
    let persistence = open_store(config)?;
    let handle = persistence.read_handle().map_err(CliError::read)?;
    let records = handle.list(&collection).map_err(CliError::read)?;

    if json {
        let out = serde_json::to_string_pretty(&records).map_err(|e| CliError::general(e.to_string()))?;
        println!("{}", out);
    } else {
        for record in &records {
            println!("{}\t{}", record.id, record.body);
        }
    }
    Ok(())
}

fn cmd_export(config: StorageConfig, output: Option<PathBuf>) -> Result<(), CliError> {
    let persistence = open_store(config)?;
    let archive = persistence.backup().export_now().ok_or_else(|| CliError {
        code: EXIT_EXPORT_FAILED,
        message: "export failed".to_string(),
        hint: Some("run with --verbose for details".to_string()),
    })?;

    let path = output.unwrap_or_else(|| {
        PathBuf::from(archive.suggested_file_name(&persistence.config().backup_extension))
    });
    archive.write_to(&path).map_err(|e| CliError {
        code: EXIT_EXPORT_FAILED,
        message: format!("cannot write {}: {}", path.display(), e),
        hint: None,
    })?;
    println!("{}", path.display());
    Ok(())
}

fn cmd_import(config: StorageConfig, file: PathBuf, content_type: Option<String>) -> Result<(), CliError> {
    let archive = BackupArchive::from_file(&file, &config.backup_extension)
        .map_err(|e| CliError::usage(format!("cannot read {}: {}", file.display(), e)))?;
    let archive = match content_type {
        Some(tag) => BackupArchive::new(tag, archive.into_bytes()),
        None => archive,
    };

    // Touch first: a damaged store can still be replaced
    let persistence = Persistence::new(config);
    if let Err(e) = persistence.lifecycle().touch(None, |_| {}) {
        log::warn!("Existing store could not be opened ({}); replacing it", e);
    }

    persistence.backup().try_import(&archive).map_err(|e| {
        let err = CliError::import(e);
        if archive.content_type() != vitalog_store::BACKUP_CONTENT_TYPE {
            let ext = persistence.config().backup_extension.clone();
            return err.with_hint(format!("backups use the .{} extension", ext));
        }
        err
    })?;
    persistence.lifecycle().touch(None, |_| {}).map_err(CliError::init)?;
    println!("imported {}", file.display());
    Ok(())
}

fn cmd_fingerprint(config: StorageConfig, json: bool) -> Result<(), CliError> {
    let persistence = open_store(config)?;
    let snapshot = persistence
        .read_handle()
        .and_then(|handle| handle.snapshot())
        .map_err(CliError::read)?;

    if json {
        let out = serde_json::json!({
            "fingerprint": snapshot.fingerprint(),
            "records": snapshot.len(),
            "schemaVersion": snapshot.schema_version,
        });
        println!("{}", out);
    } else {
        println!("{}  ({} records, schema v{})", snapshot.fingerprint(), snapshot.len(), snapshot.schema_version);
    }
    Ok(())
}

fn cmd_settings_show(config: StorageConfig, json: bool) -> Result<(), CliError> {
    let settings = SettingsStore::open(&config);
    let snapshot = settings.snapshot();

    if json {
        let out = serde_json::to_string_pretty(&snapshot).map_err(|e| CliError::general(e.to_string()))?;
        println!("{}", out);
    } else {
        println!("{} = {}", SettingKey::SchemaVersion, snapshot.schema_version);
        println!("{} = {}", SettingKey::OnboardingComplete, snapshot.onboarding_complete);
        println!("{} = {}", SettingKey::AppointmentRemindersEnabled, snapshot.appointment_reminders_enabled);
        println!("{} = {}", SettingKey::DailyCheckInEnabled, snapshot.daily_check_in_enabled);
        println!("{} = {}", SettingKey::ReminderLeadMinutes, snapshot.reminder_lead_minutes);
    }
    Ok(())
}

fn cmd_settings_migrate(config: StorageConfig, scenario: Option<Scenario>) -> Result<(), CliError> {
    let mut settings = SettingsStore::open(&config);
    let from = settings.current_version();
    if settings.update(scenario) {
        println!("migrated settings v{} -> v{}", from, settings.current_version());
    } else if let Some(scenario) = scenario {
        println!("reset settings for scenario '{}'", scenario);
    } else if from > settings.latest_version() {
        println!(
            "settings at v{} are newer than this build (v{}); left untouched",
            from,
            settings.latest_version()
        );
    } else {
        println!("settings already at v{}", settings.current_version());
    }
    Ok(())
}

fn cmd_settings_set(config: StorageConfig, key: String, value: String) -> Result<(), CliError> {
    let setting = SettingKey::from_name(&key).ok_or_else(|| {
        let names: Vec<&str> = SettingKey::ALL.iter().map(|k| k.as_str()).collect();
        CliError::usage(format!("unknown setting '{}'", key)).with_hint(format!("settings: {}", names.join(", ")))
    })?;

    let mut settings = SettingsStore::open(&config);
    settings.update(None);
    settings
        .set_from_str(setting, &value)
        .map_err(|e| CliError::usage(e.to_string()))?;
    println!("{} = {}", setting, value.trim());
    Ok(())
}
