/// Shared test fixtures: in-memory entity store, temp-dir blob stores,
/// ephemeral cipher, and a recording notification channel.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::EngineConfig;
use crate::crypto::vault::VaultCipher;
use crate::engine::Engine;
use crate::error::{Result, VaultError};
use crate::notify::Notifier;
use crate::state::models::User;
use crate::state::{repository, Database};
use crate::storage::local::LocalFsStore;
use crate::storage::BlobStore;

pub(crate) async fn test_db() -> Database {
    Database::in_memory().await
}

pub(crate) async fn make_user(pool: &sqlx::SqlitePool, email: &str) -> User {
    repository::create_user(pool, email, Some("chat-42")).await.unwrap()
}

/// Notification channel that records every message instead of sending.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingNotifier {
    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, address: &str, text: &str) -> bool {
        self.sent
            .lock()
            .unwrap()
            .push((address.to_string(), text.to_string()));
        true
    }
}

/// Blob store whose writes can be switched to fail, for exercising
/// upload-failure and primary-down paths.
pub(crate) struct FlakyStore {
    inner: LocalFsStore,
    fail_puts: AtomicBool,
    fail_gets: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn new(name: &str, root: &std::path::Path) -> Self {
        Self {
            inner: LocalFsStore::new(name, root),
            fail_puts: AtomicBool::new(false),
            fail_gets: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_gets(&self, fail: bool) {
        self.fail_gets.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for FlakyStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn put(&self, locator: &str, data: &[u8]) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(VaultError::Upload(format!(
                "{}: injected put failure for {locator}",
                self.inner.name()
            )));
        }
        self.inner.put(locator, data).await
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(VaultError::StorageUnavailable(format!(
                "{}: injected get failure for {locator}",
                self.inner.name()
            )));
        }
        self.inner.get(locator).await
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(VaultError::StorageUnavailable(format!(
                "{}: injected stat failure for {locator}",
                self.inner.name()
            )));
        }
        self.inner.exists(locator).await
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        self.inner.delete(locator).await
    }
}

/// A fully wired engine over temp-dir stores. Keeps handles to the
/// individual stores and the recording notifier so tests can assert on
/// replica contents and sent messages.
pub(crate) struct TestHarness {
    pub(crate) engine: Engine,
    pub(crate) primary: Arc<FlakyStore>,
    pub(crate) secondary: Arc<FlakyStore>,
    pub(crate) notifier: Arc<RecordingNotifier>,
    pub(crate) dir: tempfile::TempDir,
}

pub(crate) async fn test_harness() -> TestHarness {
    test_harness_with(EngineConfig::default()).await
}

pub(crate) async fn test_harness_with(config: EngineConfig) -> TestHarness {
    let dir = tempfile::tempdir().unwrap();
    let db = test_db().await;
    let primary = Arc::new(FlakyStore::new("primary", &dir.path().join("primary")));
    let secondary = Arc::new(FlakyStore::new("secondary", &dir.path().join("secondary")));
    let notifier = Arc::new(RecordingNotifier::default());

    let engine = Engine::from_parts(
        db,
        primary.clone(),
        vec![secondary.clone()],
        VaultCipher::ephemeral(),
        notifier.clone(),
        config,
    );

    TestHarness {
        engine,
        primary,
        secondary,
        notifier,
        dir,
    }
}

/// Write a plaintext file under the harness temp dir and return its path.
pub(crate) fn write_source_file(
    harness: &TestHarness,
    name: &str,
    contents: &[u8],
) -> std::path::PathBuf {
    let path = harness.dir.path().join("source").join(name);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, contents).unwrap();
    path
}
