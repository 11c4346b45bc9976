//! S3-compatible [`ObjectStore`] implementation.
//!
//! Works against AWS S3 proper or any compatible endpoint (MinIO, Ceph RGW)
//! via an explicit endpoint URL, static credentials read from environment
//! variables named in the configuration, and optional path-style addressing.
//! Pre-signed URLs can be produced against a second endpoint when the
//! signing hostname clients reach differs from the one the server uses.

use std::time::Duration;

use anyhow::{Context, Result};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::config::S3Config;
use crate::store::{ObjectMeta, ObjectStore, SignedTransfer, StoreError};

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

pub struct S3Store {
    client: Client,
    /// Client used only for URL signing; identical to `client` unless a
    /// separate signing endpoint is configured.
    sign_client: Client,
    bucket: String,
}

impl S3Store {
    /// Build an [`S3Store`] from the application S3 configuration, reading
    /// credentials from the configured environment variables.
    pub async fn build(config: &S3Config) -> Result<Self> {
        let access_key = std::env::var(&config.access_key_env)
            .with_context(|| format!("missing credential env var: {}", config.access_key_env))?;
        let secret_key = std::env::var(&config.secret_key_env)
            .with_context(|| format!("missing credential env var: {}", config.secret_key_env))?;

        let aws_config = aws_config::from_env()
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let credentials = aws_sdk_s3::config::Credentials::new(
            access_key,
            secret_key,
            None,
            None,
            "gitdock-config",
        );

        let make_client = |endpoint: &str| {
            let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
                .endpoint_url(endpoint)
                .force_path_style(config.use_path_style)
                .credentials_provider(credentials.clone())
                .build();
            Client::from_conf(s3_config)
        };

        let client = make_client(&config.endpoint);
        let sign_client = match &config.sign_endpoint {
            Some(endpoint) if endpoint != &config.endpoint => make_client(endpoint),
            _ => client.clone(),
        };

        tracing::info!(
            endpoint = %config.endpoint,
            bucket = %config.bucket,
            path_style = config.use_path_style,
            "S3 store initialised"
        );

        Ok(Self {
            client,
            sign_client,
            bucket: config.bucket.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// ObjectStore impl
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self), fields(%key))]
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map_or(false, |e| e.is_no_such_key())
                {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Backend(format!("GetObject {key}: {err}"))
                }
            })?;

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|err| StoreError::Backend(format!("read GetObject body {key}: {err}")))?
            .into_bytes();

        debug!(bytes = bytes.len(), "object fetched");
        Ok(bytes)
    }

    #[instrument(skip(self), fields(%key, offset, len))]
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes, StoreError> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let range = format!("bytes={}-{}", offset, offset + len - 1);

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(range)
            .send()
            .await
            .map_err(|err| {
                if err
                    .as_service_error()
                    .map_or(false, |e| e.is_no_such_key())
                {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Backend(format!("ranged GetObject {key}: {err}"))
                }
            })?;

        let bytes = resp
            .body
            .collect()
            .await
            .map_err(|err| StoreError::Backend(format!("read ranged body {key}: {err}")))?
            .into_bytes();

        Ok(bytes)
    }

    #[instrument(skip(self, data), fields(%key, bytes = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|err| StoreError::Backend(format!("PutObject {key}: {err}")))?;

        debug!("object stored");
        Ok(())
    }

    #[instrument(skip(self), fields(%key))]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| StoreError::Backend(format!("DeleteObject {key}: {err}")))?;

        debug!("object deleted");
        Ok(())
    }

    /// List all keys under `prefix`, paginating through every result page.
    #[instrument(skip(self), fields(%prefix))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);

            if let Some(ref token) = continuation_token {
                req = req.continuation_token(token);
            }

            let resp = req
                .send()
                .await
                .map_err(|err| StoreError::Backend(format!("ListObjectsV2 {prefix}: {err}")))?;

            for obj in resp.contents() {
                if let Some(k) = obj.key() {
                    keys.push(k.to_string());
                }
            }

            match resp.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }

        // S3 pages arrive sorted, but re-sort so the listing contract does
        // not depend on backend behaviour.
        keys.sort();

        debug!(count = keys.len(), "listed keys");
        Ok(keys)
    }

    #[instrument(skip(self), fields(%key))]
    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        let resp = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().map_or(false, |e| e.is_not_found()) {
                    StoreError::NotFound(key.to_string())
                } else {
                    StoreError::Backend(format!("HeadObject {key}: {err}"))
                }
            })?;

        let size = resp.content_length().unwrap_or(0).max(0) as u64;
        Ok(ObjectMeta { size })
    }

    #[instrument(skip(self), fields(%key))]
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<SignedTransfer, StoreError> {
        let presigning = PresigningConfig::builder()
            .expires_in(ttl)
            .build()
            .map_err(|err| StoreError::Backend(format!("build PresigningConfig: {err}")))?;

        let req = self
            .sign_client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| StoreError::Backend(format!("presign GET {key}: {err}")))?;

        Ok(signed_transfer(req, ttl))
    }

    #[instrument(skip(self), fields(%key))]
    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<SignedTransfer, StoreError> {
        let presigning = PresigningConfig::builder()
            .expires_in(ttl)
            .build()
            .map_err(|err| StoreError::Backend(format!("build PresigningConfig: {err}")))?;

        let req = self
            .sign_client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|err| StoreError::Backend(format!("presign PUT {key}: {err}")))?;

        Ok(signed_transfer(req, ttl))
    }
}

fn signed_transfer(req: aws_sdk_s3::presigning::PresignedRequest, ttl: Duration) -> SignedTransfer {
    let headers = req
        .headers()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

    SignedTransfer {
        url: req.uri().to_string(),
        headers,
        expires_in: ttl.as_secs(),
    }
}
