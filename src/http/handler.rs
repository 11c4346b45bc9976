//! Main axum router and HTTP request handlers.
//!
//! Routes:
//! - `GET  /{owner}/{repo}/info/refs`              - Smart HTTP discovery
//! - `POST /{owner}/{repo}/git-upload-pack`        - Fetch/clone pack exchange
//! - `POST /{owner}/{repo}/git-receive-pack`       - Push pack exchange
//! - `POST /{owner}/{repo}/info/lfs/objects/batch` - LFS batch negotiation
//! - `GET  /healthz`                               - Health check
//! - `GET  /metrics`                               - Prometheus metrics

use std::io;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{error, instrument, warn};

use crate::auth::AccessKind;
use crate::git::{ExecError, GitService, ResolveError};
use crate::http::pktline;
use crate::lfs::batch::{BatchError, BatchRequest};
use crate::metrics::{Endpoint, EndpointLabels, LfsOutcome, LfsOutcomeLabels};
use crate::AppState;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all HTTP routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Git smart HTTP protocol endpoints
        .route("/{owner}/{repo}/info/refs", get(handle_info_refs))
        .route("/{owner}/{repo}/git-upload-pack", post(handle_upload_pack))
        .route(
            "/{owner}/{repo}/git-receive-pack",
            post(handle_receive_pack),
        )
        // LFS batch negotiation
        .route(
            "/{owner}/{repo}/info/lfs/objects/batch",
            post(handle_lfs_batch),
        )
        // Health, metrics
        .route("/healthz", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query parameter types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// `GET /{owner}/{repo}/info/refs?service=git-upload-pack`
///
/// Validates the requested service, authorizes the caller, resolves the
/// repository, and returns the pkt-line service announcement followed by
/// the ref advertisement from the external executable. Responses are never
/// cacheable.
#[instrument(skip(state, headers), fields(%owner, %repo))]
async fn handle_info_refs(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let labels = EndpointLabels {
        endpoint: Endpoint::InfoRefs,
    };
    state
        .metrics
        .metrics
        .requests_total
        .get_or_create(&labels)
        .inc();
    let started = Instant::now();

    let service = match query.service.as_deref() {
        None | Some("") => {
            return Err(AppError::BadRequest(
                "dumb HTTP protocol is not supported; specify a service".into(),
            ))
        }
        Some(name) => GitService::from_name(name)
            .ok_or_else(|| AppError::BadRequest(format!("unsupported service: {name}")))?,
    };

    if service == GitService::ReceivePack && !state.config.git.enable_receive_pack {
        return Err(AppError::Forbidden("push is disabled on this server".into()));
    }

    check_access(&state, &owner, &repo, access_kind(service)).await?;

    // Fetch-side discovery is a pure read. Push-side discovery is the first
    // half of the push, so auto-create applies to it.
    let repo_path = match service {
        GitService::UploadPack => state.resolver.resolve_read(&owner, &repo)?,
        GitService::ReceivePack => state.resolver.resolve_write(&owner, &repo).await?,
    };

    let git_protocol = git_protocol_header(&headers);

    state
        .metrics
        .metrics
        .git_spawns_total
        .get_or_create(&labels)
        .inc();
    let advertisement = state
        .executor
        .advertise_refs(service, &repo_path, git_protocol.as_deref())
        .await
        .map_err(|err| map_exec_error(&state, err))?;

    let mut body = pktline::service_announcement(service.name());
    body.extend_from_slice(&advertisement);

    state
        .metrics
        .metrics
        .request_duration_seconds
        .get_or_create(&labels)
        .observe(started.elapsed().as_secs_f64());

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, service.advertisement_content_type()),
            (header::CACHE_CONTROL, "no-cache, max-age=0, must-revalidate"),
            (header::EXPIRES, "Fri, 01 Jan 1980 00:00:00 GMT"),
            (header::PRAGMA, "no-cache"),
        ],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Pack exchange
// ---------------------------------------------------------------------------

/// `POST /{owner}/{repo}/git-upload-pack`
#[instrument(skip(state, headers, body), fields(%owner, %repo))]
async fn handle_upload_pack(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    handle_pack(state, GitService::UploadPack, owner, repo, headers, body).await
}

/// `POST /{owner}/{repo}/git-receive-pack`
#[instrument(skip(state, headers, body), fields(%owner, %repo))]
async fn handle_receive_pack(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    handle_pack(state, GitService::ReceivePack, owner, repo, headers, body).await
}

/// Shared pack-exchange path: couple the request body to the child's stdin
/// and the child's stdout to the response body, both streamed. The request
/// body is already transparently decompressed by the middleware chain when
/// the client sent a compressed transfer encoding.
async fn handle_pack(
    state: Arc<AppState>,
    service: GitService,
    owner: String,
    repo: String,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let labels = EndpointLabels {
        endpoint: match service {
            GitService::UploadPack => Endpoint::UploadPack,
            GitService::ReceivePack => Endpoint::ReceivePack,
        },
    };
    state
        .metrics
        .metrics
        .requests_total
        .get_or_create(&labels)
        .inc();
    let started = Instant::now();

    if service == GitService::ReceivePack && !state.config.git.enable_receive_pack {
        return Err(AppError::Forbidden("push is disabled on this server".into()));
    }

    check_access(&state, &owner, &repo, access_kind(service)).await?;

    let repo_path = match service {
        GitService::UploadPack => state.resolver.resolve_read(&owner, &repo)?,
        GitService::ReceivePack => state.resolver.resolve_write(&owner, &repo).await?,
    };

    let git_protocol = git_protocol_header(&headers);
    let body_reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));

    state
        .metrics
        .metrics
        .git_spawns_total
        .get_or_create(&labels)
        .inc();
    let exchange = state
        .executor
        .run_exchange(service, &repo_path, git_protocol.as_deref(), body_reader)
        .await
        .map_err(|err| map_exec_error(&state, err))?;

    state
        .metrics
        .metrics
        .request_duration_seconds
        .get_or_create(&labels)
        .observe(started.elapsed().as_secs_f64());

    // From here on, errors can only surface as truncation: the status line
    // is committed once the first chunk is out.
    let head = exchange.head;
    let head_stream = futures::stream::once(async move { Ok::<_, io::Error>(head) });
    let body = Body::from_stream(head_stream.chain(ReaderStream::new(exchange.rest)));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, service.result_content_type()),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// LFS batch
// ---------------------------------------------------------------------------

/// `POST /{owner}/{repo}/info/lfs/objects/batch`
#[instrument(skip(state, request), fields(%owner, %repo))]
async fn handle_lfs_batch(
    State(state): State<Arc<AppState>>,
    Path((owner, repo)): Path<(String, String)>,
    Json(request): Json<BatchRequest>,
) -> Result<Response, AppError> {
    let labels = EndpointLabels {
        endpoint: Endpoint::LfsBatch,
    };
    state
        .metrics
        .metrics
        .requests_total
        .get_or_create(&labels)
        .inc();
    let started = Instant::now();

    let Some(lfs) = &state.lfs else {
        return Err(AppError::NotFound(
            "large file storage is not enabled on this server".into(),
        ));
    };

    // Path validation only; LFS objects are content-addressed and shared
    // across repositories, so the repo need not exist yet.
    state.resolver.validate(&owner, &repo)?;

    let kind = if request.operation == "upload" {
        AccessKind::Write
    } else {
        AccessKind::Read
    };
    check_access(&state, &owner, &repo, kind).await?;

    let response = lfs.process(request).await.map_err(|err| match err {
        BatchError::UnsupportedOperation(_) => AppError::BadRequest(err.to_string()),
        BatchError::UnsupportedTransfer => AppError::Unprocessable(err.to_string()),
    })?;

    for object in &response.objects {
        let outcome = if object.error.is_some() {
            LfsOutcome::Error
        } else {
            match &object.actions {
                Some(actions) if actions.download.is_some() => LfsOutcome::Download,
                Some(_) => LfsOutcome::Upload,
                None => LfsOutcome::Skipped,
            }
        };
        state
            .metrics
            .metrics
            .lfs_objects_total
            .get_or_create(&LfsOutcomeLabels { outcome })
            .inc();
    }

    state
        .metrics
        .metrics
        .request_duration_seconds
        .get_or_create(&labels)
        .observe(started.elapsed().as_secs_f64());

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/vnd.git-lfs+json")],
        Json(response),
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: HealthStatus,
    checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum HealthStatus {
    Ok,
    Unhealthy,
}

#[derive(Debug, Serialize)]
struct HealthChecks {
    repositories: CheckResult,
    store: CheckResult,
    mount: CheckResult,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

/// `GET /healthz`. Returns 200 when the repository root and (if configured)
/// the object store are usable, 503 otherwise.
async fn handle_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let repos_dir = state.config.repositories_dir();
    let repositories = match tokio::fs::metadata(&repos_dir).await {
        Ok(meta) if meta.is_dir() => CheckResult {
            ok: true,
            detail: None,
        },
        Ok(_) => CheckResult {
            ok: false,
            detail: Some(format!("{} is not a directory", repos_dir.display())),
        },
        Err(err) => CheckResult {
            ok: false,
            detail: Some(format!("{}: {err}", repos_dir.display())),
        },
    };

    let store = match &state.store {
        None => CheckResult {
            ok: true,
            detail: Some("local storage only".into()),
        },
        // Any well-formed answer (present or not) proves reachability.
        Some(store) => match store.exists("gitdock-healthz-probe").await {
            Ok(_) => CheckResult {
                ok: true,
                detail: None,
            },
            Err(err) => CheckResult {
                ok: false,
                detail: Some(format!("store probe failed: {err}")),
            },
        },
    };

    let mount_expected = state
        .config
        .storage
        .s3
        .as_ref()
        .map(|s3| s3.mount_repositories)
        .unwrap_or(false);
    let mount = if !mount_expected {
        CheckResult {
            ok: true,
            detail: Some("not configured".into()),
        }
    } else if state.mounts.is_mounted().await {
        CheckResult {
            ok: true,
            detail: None,
        }
    } else {
        CheckResult {
            ok: false,
            detail: Some("repositories mount is down".into()),
        }
    };

    let status = if repositories.ok && store.ok && mount.ok {
        HealthStatus::Ok
    } else {
        HealthStatus::Unhealthy
    };

    let http_status = match status {
        HealthStatus::Ok => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (
        http_status,
        Json(HealthResponse {
            status,
            checks: HealthChecks {
                repositories,
                store,
                mount,
            },
        }),
    )
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// `GET /metrics`
///
/// Returns Prometheus metrics in OpenMetrics text encoding.
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let mut buf = String::new();
    prometheus_client::encoding::text::encode(&mut buf, &state.metrics.registry)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn access_kind(service: GitService) -> AccessKind {
    match service {
        GitService::UploadPack => AccessKind::Read,
        GitService::ReceivePack => AccessKind::Write,
    }
}

async fn check_access(
    state: &AppState,
    owner: &str,
    repo: &str,
    kind: AccessKind,
) -> Result<(), AppError> {
    state
        .policy
        .check(owner, repo, kind)
        .await
        .map_err(|denial| {
            warn!(%owner, %repo, ?kind, reason = %denial.reason, "access denied");
            AppError::Forbidden(denial.reason)
        })
}

/// The client's `Git-Protocol` header, forwarded to the child process so
/// protocol v2 negotiation works end to end.
fn git_protocol_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("git-protocol")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn map_exec_error(state: &AppState, err: ExecError) -> AppError {
    match &err {
        ExecError::TimedOut { .. } => {
            state.metrics.metrics.git_timeouts_total.inc();
        }
        _ => {
            state.metrics.metrics.git_failures_total.inc();
        }
    }
    AppError::Internal(anyhow::anyhow!(err))
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Application-level error type that maps cleanly to HTTP responses.
///
/// Every variant is produced before any response byte is written; failures
/// after streaming starts terminate the connection instead (truncation).
#[derive(Debug)]
pub enum AppError {
    /// Malformed request: unknown service, invalid path. No side effects.
    BadRequest(String),
    /// The capability check denied the caller.
    Forbidden(String),
    NotFound(String),
    /// Structurally valid but unservable request (e.g. no common transfer).
    Unprocessable(String),
    /// An unexpected internal error.
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            AppError::Unprocessable(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg).into_response()
            }
            AppError::Internal(err) => {
                error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Internal server error: {err:#}"),
                )
                    .into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::InvalidPath(path) => {
                AppError::BadRequest(format!("invalid repository path: {path}"))
            }
            ResolveError::NotFound => AppError::NotFound("repository not found".into()),
            ResolveError::Internal(err) => AppError::Internal(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
