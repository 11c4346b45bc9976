//! Batch request processing.
//!
//! One [`LfsHandler`] is shared by all sessions; it is stateless beyond its
//! store handle. Requests fail per object wherever possible -- a missing or
//! mismatched object produces an `error` entry for that oid while the rest
//! of the batch still gets actions. Only a malformed request (unknown
//! operation, no acceptable transfer) fails as a whole.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::store::{ObjectStore, SignedTransfer};

/// The only transfer adapter this server speaks.
pub const BASIC_TRANSFER: &str = "basic";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Download,
    Upload,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    /// `download` or `upload`; anything else is a malformed request.
    pub operation: String,
    #[serde(default)]
    pub transfers: Option<Vec<String>>,
    pub objects: Vec<ObjectSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectSpec {
    pub oid: String,
    pub size: i64,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub transfer: &'static str,
    pub objects: Vec<ResponseObject>,
}

#[derive(Debug, Serialize)]
pub struct ResponseObject {
    pub oid: String,
    pub size: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actions: Option<Actions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ObjectError>,
}

#[derive(Debug, Default, Serialize)]
pub struct Actions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download: Option<Action>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<Action>,
}

#[derive(Debug, Serialize)]
pub struct Action {
    pub href: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, String>,
    pub expires_in: u64,
}

impl From<SignedTransfer> for Action {
    fn from(signed: SignedTransfer) -> Self {
        Action {
            href: signed.url,
            header: signed.headers.into_iter().collect(),
            expires_in: signed.expires_in,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ObjectError {
    pub code: u16,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Whole-batch errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("none of the requested transfer adapters is supported")]
    UnsupportedTransfer,
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

pub struct LfsHandler {
    store: Arc<dyn ObjectStore>,
    /// Key prefix for LFS objects (`/`-terminated).
    prefix: String,
    presign_ttl: Duration,
    check_existing_on_upload: bool,
}

impl LfsHandler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: String,
        presign_ttl: Duration,
        check_existing_on_upload: bool,
    ) -> Self {
        debug_assert!(prefix.ends_with('/'));
        Self {
            store,
            prefix,
            presign_ttl,
            check_existing_on_upload,
        }
    }

    /// Content-addressed key layout: `<prefix>ab/cd/abcd...`.
    fn object_key(&self, oid: &str) -> String {
        format!("{}{}/{}/{}", self.prefix, &oid[..2], &oid[2..4], oid)
    }

    /// Process one batch request into per-object actions.
    #[instrument(skip(self, request), fields(operation = %request.operation, objects = request.objects.len()))]
    pub async fn process(&self, request: BatchRequest) -> Result<BatchResponse, BatchError> {
        let operation = match request.operation.as_str() {
            "download" => Operation::Download,
            "upload" => Operation::Upload,
            other => return Err(BatchError::UnsupportedOperation(other.to_string())),
        };

        // An absent transfer list means `basic`, the protocol default.
        if let Some(transfers) = &request.transfers {
            if !transfers.iter().any(|t| t == BASIC_TRANSFER) {
                return Err(BatchError::UnsupportedTransfer);
            }
        }

        let mut objects = Vec::with_capacity(request.objects.len());
        for spec in request.objects {
            let object = match operation {
                Operation::Download => self.download_object(spec).await,
                Operation::Upload => self.upload_object(spec).await,
            };
            objects.push(object);
        }

        debug!(
            errors = objects.iter().filter(|o| o.error.is_some()).count(),
            "batch processed"
        );

        Ok(BatchResponse {
            transfer: BASIC_TRANSFER,
            objects,
        })
    }

    async fn download_object(&self, spec: ObjectSpec) -> ResponseObject {
        if let Some(error) = validate_spec(&spec) {
            return object_error(spec, error);
        }

        let key = self.object_key(&spec.oid);
        match self.store.exists(&key).await {
            Ok(Some(meta)) if meta.size == spec.size as u64 => {
                match self.store.presign_get(&key, self.presign_ttl).await {
                    Ok(signed) => ResponseObject {
                        oid: spec.oid,
                        size: spec.size,
                        actions: Some(Actions {
                            download: Some(signed.into()),
                            upload: None,
                        }),
                        error: None,
                    },
                    Err(err) => object_error(
                        spec,
                        ObjectError {
                            code: 500,
                            message: format!("failed to sign download: {err}"),
                        },
                    ),
                }
            }
            Ok(Some(meta)) => object_error(
                spec,
                ObjectError {
                    code: 422,
                    message: format!("size mismatch: stored object is {} bytes", meta.size),
                },
            ),
            Ok(None) => object_error(
                spec,
                ObjectError {
                    code: 404,
                    message: "object does not exist".to_string(),
                },
            ),
            Err(err) => object_error(
                spec,
                ObjectError {
                    code: 500,
                    message: format!("store lookup failed: {err}"),
                },
            ),
        }
    }

    async fn upload_object(&self, spec: ObjectSpec) -> ResponseObject {
        if let Some(error) = validate_spec(&spec) {
            return object_error(spec, error);
        }

        let key = self.object_key(&spec.oid);

        if self.check_existing_on_upload {
            match self.store.exists(&key).await {
                Ok(Some(meta)) if meta.size == spec.size as u64 => {
                    // Already present: no actions means the client skips the
                    // transfer entirely.
                    debug!(oid = %spec.oid, "object already stored; skipping upload");
                    return ResponseObject {
                        oid: spec.oid,
                        size: spec.size,
                        actions: None,
                        error: None,
                    };
                }
                Ok(_) => {}
                Err(err) => {
                    // Uploads must not require a working existence probe;
                    // hand out the action and let the transfer itself fail.
                    warn!(oid = %spec.oid, error = %err, "existence probe failed");
                }
            }
        }

        match self.store.presign_put(&key, self.presign_ttl).await {
            Ok(signed) => ResponseObject {
                oid: spec.oid,
                size: spec.size,
                actions: Some(Actions {
                    download: None,
                    upload: Some(signed.into()),
                }),
                error: None,
            },
            Err(err) => object_error(
                spec,
                ObjectError {
                    code: 500,
                    message: format!("failed to sign upload: {err}"),
                },
            ),
        }
    }
}

/// Per-object request validation: oid must be 64 lowercase hex characters
/// (SHA-256) and the size non-negative.
fn validate_spec(spec: &ObjectSpec) -> Option<ObjectError> {
    let oid_ok = spec.oid.len() == 64
        && spec
            .oid
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));

    if !oid_ok {
        return Some(ObjectError {
            code: 422,
            message: "invalid object id".to_string(),
        });
    }
    if spec.size < 0 {
        return Some(ObjectError {
            code: 422,
            message: "invalid object size".to_string(),
        });
    }
    None
}

fn object_error(spec: ObjectSpec, error: ObjectError) -> ResponseObject {
    ResponseObject {
        oid: spec.oid,
        size: spec.size,
        actions: None,
        error: Some(error),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use bytes::Bytes;

    fn oid_of(byte: u8) -> String {
        let hex = format!("{byte:02x}");
        hex.repeat(32)
    }

    async fn handler_with(objects: &[(String, &[u8])]) -> (Arc<MemoryStore>, LfsHandler) {
        let store = Arc::new(MemoryStore::new());
        let handler = LfsHandler::new(
            store.clone(),
            "lfs/".to_string(),
            Duration::from_secs(900),
            true,
        );
        for (oid, content) in objects {
            let key = handler.object_key(oid);
            store.put(&key, Bytes::copy_from_slice(content)).await.unwrap();
        }
        (store, handler)
    }

    fn request(operation: &str, objects: Vec<ObjectSpec>) -> BatchRequest {
        BatchRequest {
            operation: operation.to_string(),
            transfers: None,
            objects,
        }
    }

    #[tokio::test]
    async fn download_mixes_success_and_per_object_errors() {
        let present = oid_of(0xaa);
        let missing = oid_of(0xbb);
        let (_store, handler) = handler_with(&[(present.clone(), b"0123456789")]).await;

        let response = handler
            .process(request(
                "download",
                vec![
                    ObjectSpec { oid: present.clone(), size: 10 },
                    ObjectSpec { oid: missing.clone(), size: 5 },
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.objects.len(), 2);

        let ok = &response.objects[0];
        assert_eq!(ok.oid, present);
        assert!(ok.error.is_none());
        let download = ok.actions.as_ref().unwrap().download.as_ref().unwrap();
        assert!(download.href.contains(&present));
        assert_eq!(download.expires_in, 900);

        let failed = &response.objects[1];
        assert_eq!(failed.oid, missing);
        assert!(failed.actions.is_none());
        assert_eq!(failed.error.as_ref().unwrap().code, 404);
    }

    #[tokio::test]
    async fn download_size_mismatch_is_per_object_422() {
        let oid = oid_of(0xcc);
        let (_store, handler) = handler_with(&[(oid.clone(), b"short")]).await;

        let response = handler
            .process(request("download", vec![ObjectSpec { oid, size: 999 }]))
            .await
            .unwrap();

        assert_eq!(response.objects[0].error.as_ref().unwrap().code, 422);
    }

    #[tokio::test]
    async fn upload_new_object_gets_put_action() {
        let oid = oid_of(0xdd);
        let (_store, handler) = handler_with(&[]).await;

        let response = handler
            .process(request("upload", vec![ObjectSpec { oid: oid.clone(), size: 42 }]))
            .await
            .unwrap();

        let object = &response.objects[0];
        let upload = object.actions.as_ref().unwrap().upload.as_ref().unwrap();
        assert!(upload.href.contains(&format!("lfs/dd/dd/{oid}")));
        assert!(object.error.is_none());
    }

    #[tokio::test]
    async fn upload_of_existing_object_is_deduplicated() {
        let oid = oid_of(0xee);
        let (_store, handler) = handler_with(&[(oid.clone(), b"stored-bytes")]).await;

        let response = handler
            .process(request("upload", vec![ObjectSpec { oid, size: 12 }]))
            .await
            .unwrap();

        let object = &response.objects[0];
        assert!(object.actions.is_none(), "client must skip the transfer");
        assert!(object.error.is_none());
    }

    #[tokio::test]
    async fn invalid_oid_is_per_object_422() {
        let (_store, handler) = handler_with(&[]).await;

        let response = handler
            .process(request(
                "upload",
                vec![ObjectSpec { oid: "DEADBEEF".to_string(), size: 1 }],
            ))
            .await
            .unwrap();

        assert_eq!(response.objects[0].error.as_ref().unwrap().code, 422);
    }

    #[tokio::test]
    async fn unknown_operation_fails_the_whole_batch() {
        let (_store, handler) = handler_with(&[]).await;

        match handler.process(request("verify", Vec::new())).await {
            Err(BatchError::UnsupportedOperation(op)) => assert_eq!(op, "verify"),
            other => panic!("expected UnsupportedOperation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transfer_negotiation_requires_basic() {
        let (_store, handler) = handler_with(&[]).await;

        let mut req = request("download", Vec::new());
        req.transfers = Some(vec!["ssh".to_string()]);
        assert!(matches!(
            handler.process(req).await,
            Err(BatchError::UnsupportedTransfer)
        ));

        let mut req = request("download", Vec::new());
        req.transfers = Some(vec!["lfs-standalone-file".to_string(), "basic".to_string()]);
        assert!(handler.process(req).await.is_ok());
    }
}
