/// S3-compatible remote replica store.
///
/// Used as a secondary replica behind any S3-compatible gateway. Payloads
/// are encrypted before they reach this layer, so the remote never sees
/// plaintext.
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{BehaviorVersion, Builder as S3ConfigBuilder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;

use super::BlobStore;
use crate::config::RemoteReplicaConfig;
use crate::error::{Result, VaultError};

pub struct S3RemoteStore {
    client: S3Client,
    bucket: String,
}

impl S3RemoteStore {
    pub fn new(config: &RemoteReplicaConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "drvault-remote",
        );

        let s3_config = S3ConfigBuilder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: S3Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        }
    }
}

#[async_trait]
impl BlobStore for S3RemoteStore {
    fn name(&self) -> &str {
        "remote-s3"
    }

    async fn put(&self, locator: &str, data: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(locator)
            .body(ByteStream::from(data.to_vec()))
            .content_length(data.len() as i64)
            .send()
            .await
            .map_err(|e| VaultError::Upload(format!("remote-s3: put {locator}: {e}")))?;
        Ok(())
    }

    async fn get(&self, locator: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(locator)
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_no_such_key() {
                    VaultError::NotFound(format!("blob {locator} in remote-s3"))
                } else {
                    VaultError::Download(format!("remote-s3: get {locator}: {service_err}"))
                }
            })?;

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|e| VaultError::Download(format!("remote-s3: read body {locator}: {e}")))?
            .into_bytes();

        Ok(bytes.to_vec())
    }

    async fn exists(&self, locator: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(locator)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(VaultError::StorageUnavailable(format!(
                        "remote-s3: head {locator}: {service_err}"
                    )))
                }
            }
        }
    }

    async fn delete(&self, locator: &str) -> Result<bool> {
        let existed = self.exists(locator).await?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(locator)
            .send()
            .await
            .map_err(|e| VaultError::Upload(format!("remote-s3: delete {locator}: {e}")))?;
        Ok(existed)
    }
}
