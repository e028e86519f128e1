use std::sync::Arc;

use vitalog_config::StorageConfig;

use crate::backup::BackupService;
use crate::error::ReadError;
use crate::events::ChangeSubscription;
use crate::lifecycle::StoreLifecycle;
use crate::read::{LiveQuery, ReadHandle};
use crate::schema::{default_migrations, StoreMigration};
use crate::shared::StoreShared;
use crate::writer::TransactionalWriter;

/// One store, with its lifecycle, writer and backup service sharing a
/// single writer connection.
pub struct Persistence {
    config: StorageConfig,
    shared: Arc<StoreShared>,
    lifecycle: StoreLifecycle,
    writer: TransactionalWriter,
    backup: BackupService,
}

impl Persistence {
    pub fn new(config: StorageConfig) -> Self {
        Self::with_migrations(config, default_migrations())
    }

    /// Use an explicit migration ladder instead of the built-in one.
    pub fn with_migrations(config: StorageConfig, migrations: Vec<StoreMigration>) -> Self {
        let shared = Arc::new(StoreShared::new(&config, migrations));
        Self {
            lifecycle: StoreLifecycle::new(Arc::clone(&shared)),
            writer: TransactionalWriter::new(Arc::clone(&shared)),
            backup: BackupService::new(Arc::clone(&shared)),
            shared,
            config,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &StoreLifecycle {
        &self.lifecycle
    }

    pub fn writer(&self) -> &TransactionalWriter {
        &self.writer
    }

    pub fn backup(&self) -> &BackupService {
        &self.backup
    }

    /// A new read handle on the open store.
    pub fn read_handle(&self) -> Result<ReadHandle, ReadError> {
        ReadHandle::open(Arc::clone(&self.shared))
    }

    pub fn live_query(&self, collection: &str) -> Result<LiveQuery, ReadError> {
        LiveQuery::open(Arc::clone(&self.shared), collection)
    }

    /// Receive a `StoreChange` for every committed write from now on.
    pub fn subscribe(&self) -> ChangeSubscription {
        self.shared.changes.register()
    }

    pub fn unsubscribe(&self, subscription: &ChangeSubscription) {
        self.shared.changes.unregister(subscription.id());
    }
}
