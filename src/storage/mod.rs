/// Pluggable blob store abstraction.
///
/// Blob stores persist already-encrypted payloads under opaque locators;
/// they never see plaintext and never make decisions. The deployment runs
/// one primary store plus zero or more secondary replicas:
/// - Primary: local filesystem tree (durability gate for every backup)
/// - Secondary: a second filesystem root and/or an S3-compatible remote
pub mod local;
pub mod remote;

use async_trait::async_trait;

use crate::error::Result;

/// Locator for one stored version: scoped per user, carrying the version
/// so distinct versions never collide in any replica.
pub fn blob_locator(user_id: i64, filename: &str, version: i64) -> String {
    format!("user_{user_id}/{filename}.v{version}.enc")
}

/// Trait for blob store backends. All payloads are ciphertext.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Human-readable name for logs and DR reports.
    fn name(&self) -> &str;

    /// Store `data` under `locator`, overwriting any previous object.
    async fn put(&self, locator: &str, data: &[u8]) -> Result<()>;

    /// Fetch the object at `locator`.
    async fn get(&self, locator: &str) -> Result<Vec<u8>>;

    /// Check whether an object exists.
    async fn exists(&self, locator: &str) -> Result<bool>;

    /// Delete the object. Returns `false` if it was already absent;
    /// deleting a missing object is not an error.
    async fn delete(&self, locator: &str) -> Result<bool>;
}
