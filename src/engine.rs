/// The backup engine: shared handle over the entity store, the blob
/// stores, the vault cipher and the notification channel.
///
/// Operation logic lives in `pipeline`, `restore` and `dr` as further
/// `impl Engine` blocks; this module owns construction and the shared
/// plumbing they all use.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::EngineConfig;
use crate::crypto::vault::VaultCipher;
use crate::error::Result;
use crate::notify::{Notifier, NoopNotifier, TelegramNotifier};
use crate::state::models::DrEventType;
use crate::state::{repository, Database};
use crate::storage::local::LocalFsStore;
use crate::storage::remote::S3RemoteStore;
use crate::storage::BlobStore;

/// Per-(user, filename) async locks serializing version allocation and
/// pruning. Two concurrent backups of the same logical file queue behind
/// one lock; backups of different files proceed in parallel.
#[derive(Default)]
pub(crate) struct FileLocks {
    inner: Mutex<HashMap<(i64, String), Arc<tokio::sync::Mutex<()>>>>,
}

impl FileLocks {
    pub(crate) fn for_file(&self, user_id: i64, filename: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        // Entries nobody holds a handle to are evicted on the way in, so
        // the map stays bounded by in-flight backups rather than growing
        // with every file ever seen.
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry((user_id, filename.to_string()))
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

pub struct Engine {
    db: Database,
    primary: Arc<dyn BlobStore>,
    secondaries: Vec<Arc<dyn BlobStore>>,
    cipher: VaultCipher,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
    pub(crate) file_locks: FileLocks,
}

impl Engine {
    /// Assemble an engine from configuration: connect and migrate the
    /// entity store, load or generate the vault key, and wire up the
    /// primary store plus any configured secondary replicas.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let db = Database::connect(&config.database_url).await?;
        let cipher = VaultCipher::load_or_generate(&config.key_path)?;

        let primary: Arc<dyn BlobStore> =
            Arc::new(LocalFsStore::new("primary", config.primary_root.clone()));

        // Replication order is fixed: local secondary first, remote after.
        let mut secondaries: Vec<Arc<dyn BlobStore>> = Vec::new();
        if let Some(root) = &config.secondary_root {
            secondaries.push(Arc::new(LocalFsStore::new("secondary", root.clone())));
        }
        if let Some(remote) = &config.remote_replica {
            secondaries.push(Arc::new(S3RemoteStore::new(remote)));
        }

        let notifier: Arc<dyn Notifier> = match &config.telegram_bot_token {
            Some(token) => Arc::new(TelegramNotifier::new(token.clone())),
            None => Arc::new(NoopNotifier),
        };

        tracing::info!(
            secondaries = secondaries.len(),
            primary_root = %config.primary_root.display(),
            "Backup engine ready"
        );

        Ok(Self {
            db,
            primary,
            secondaries,
            cipher,
            notifier,
            config,
            file_locks: FileLocks::default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        db: Database,
        primary: Arc<dyn BlobStore>,
        secondaries: Vec<Arc<dyn BlobStore>>,
        cipher: VaultCipher,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            db,
            primary,
            secondaries,
            cipher,
            notifier,
            config,
            file_locks: FileLocks::default(),
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        self.db.pool()
    }

    pub fn primary(&self) -> &dyn BlobStore {
        self.primary.as_ref()
    }

    pub fn secondaries(&self) -> &[Arc<dyn BlobStore>] {
        &self.secondaries
    }

    pub fn cipher(&self) -> &VaultCipher {
        &self.cipher
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Record a DR event in the audit ledger and log it.
    pub(crate) async fn record_event(
        &self,
        user_id: Option<i64>,
        event_type: DrEventType,
        details: &str,
    ) -> Result<i64> {
        let event = repository::record_dr_event(self.pool(), user_id, event_type, Some(details)).await?;
        tracing::warn!(event = %event_type, user_id, details, "DR event recorded");
        Ok(event.id)
    }

    /// Best-effort notification to a user's configured channel. Returns
    /// whether delivery was attempted and accepted; failures only log.
    pub(crate) async fn notify_user(&self, user_id: i64, text: &str) -> bool {
        let addr = match repository::get_user(self.pool(), user_id).await {
            Ok(Some(user)) => user.notify_addr,
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(user_id, error = %e, "Notification lookup failed");
                None
            }
        };
        match addr {
            Some(addr) => self.notifier.notify(&addr, text).await,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_locks_are_per_file() {
        let locks = FileLocks::default();
        let a = locks.for_file(1, "a.txt");
        let b = locks.for_file(1, "b.txt");
        let a_again = locks.for_file(1, "a.txt");

        assert!(Arc::ptr_eq(&a, &a_again));
        assert!(!Arc::ptr_eq(&a, &b));

        // Holding one file's lock does not block another file.
        let _guard = a.lock().await;
        assert!(b.try_lock().is_ok());
        assert!(a_again.try_lock().is_err());
    }

    #[tokio::test]
    async fn test_released_locks_are_evicted() {
        let locks = FileLocks::default();

        let a = locks.for_file(1, "a.txt");
        let _guard = a.lock().await;
        drop(locks.for_file(1, "b.txt"));
        assert_eq!(locks.len(), 2);

        // The next lookup sweeps the released entry; the held one stays
        // and keeps its identity.
        let c = locks.for_file(1, "c.txt");
        assert_eq!(locks.len(), 2);
        assert!(Arc::ptr_eq(&a, &locks.for_file(1, "a.txt")));
        drop(c);
    }
}
