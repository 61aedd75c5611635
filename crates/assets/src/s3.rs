//! S3/MinIO asset store.
//!
//! Three URL modes, in resolution order: a configured public base URL,
//! pre-signed GETs (when a TTL is set), or none (callers fall back to
//! inline bytes).

use std::time::Duration;

use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use sha2::{Digest, Sha256};

use cf_domain::error::{Error, Result};

use crate::{AssetData, AssetStore, SavedAsset};

pub struct S3AssetStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    key_prefix: String,
    public_base_url: Option<String>,
    presign_ttl: Option<Duration>,
    id: String,
}

impl S3AssetStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            key_prefix: "assets/".into(),
            public_base_url: None,
            presign_ttl: None,
            id: "s3".into(),
        }
    }

    /// Build a client from ambient AWS configuration (env, profile,
    /// IMDS) and wrap it.
    pub async fn from_env(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(aws_sdk_s3::Client::new(&config), bucket)
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Serve assets from a public/CDN base URL instead of signing.
    pub fn with_public_base_url(mut self, base: impl Into<String>) -> Self {
        self.public_base_url = Some(base.into());
        self
    }

    /// Enable pre-signed GET URLs with the given validity.
    pub fn with_presign_ttl(mut self, ttl: Duration) -> Self {
        self.presign_ttl = Some(ttl);
        self
    }

    fn key_for(&self, asset_id: &str) -> String {
        format!("{}{}", self.key_prefix, asset_id)
    }
}

#[async_trait::async_trait]
impl AssetStore for S3AssetStore {
    async fn save(&self, bytes: &[u8], mime: &str) -> Result<SavedAsset> {
        let asset_id = hex::encode(Sha256::digest(bytes));
        let size = bytes.len() as u64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key_for(&asset_id))
            .content_type(mime)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .map_err(|e| Error::Asset(format!("s3 put failed: {e}")))?;
        Ok(SavedAsset { asset_id, size })
    }

    async fn get(&self, asset_id: &str) -> Result<AssetData> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key_for(asset_id))
            .send()
            .await
            .map_err(|e| Error::Asset(format!("s3 get {asset_id} failed: {e}")))?;
        let mime = output
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| Error::Asset(format!("s3 body read failed: {e}")))?
            .into_bytes()
            .to_vec();
        Ok(AssetData { bytes, mime })
    }

    async fn public_url(&self, asset_id: &str) -> Result<Option<String>> {
        if let Some(base) = &self.public_base_url {
            return Ok(Some(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                self.key_for(asset_id)
            )));
        }
        if let Some(ttl) = self.presign_ttl {
            let config = PresigningConfig::expires_in(ttl)
                .map_err(|e| Error::Asset(format!("invalid presign ttl: {e}")))?;
            let presigned = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(self.key_for(asset_id))
                .presigned(config)
                .await
                .map_err(|e| Error::Asset(format!("presign failed: {e}")))?;
            return Ok(Some(presigned.uri().to_string()));
        }
        Ok(None)
    }

    fn store_id(&self) -> &str {
        &self.id
    }
}
