//! External git process lifecycle.
//!
//! One [`ProcessExecutor`] is built at startup and shared by every session.
//! Each operation spawns its own `git upload-pack` / `git receive-pack`
//! child with the repository as working directory, a scrubbed environment,
//! and piped stdio. Discovery runs buffered (advertisements are small);
//! pack exchanges stream both directions so multi-gigabyte packs never sit
//! in server memory. A supervisor task enforces the execution timeout:
//! SIGTERM, a grace window, then SIGKILL.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, instrument, warn};

use crate::config::GitConfig;
use crate::git::service::GitService;

/// First-read buffer for the exchange path. One read this size is enough to
/// tell "child produced output" from "child died before responding".
const HEAD_READ_BYTES: usize = 16 * 1024;

/// Ceiling on captured child stderr; anything beyond is drained and dropped.
const MAX_STDERR_BYTES: u64 = 64 * 1024;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn git {service}: {source}")]
    Spawn {
        service: &'static str,
        source: io::Error,
    },
    /// The child exited non-zero before producing any output.
    #[error("git {service} failed (status {status}): {stderr}")]
    Failed {
        service: &'static str,
        status: ExitStatus,
        stderr: String,
    },
    #[error("git {service} exceeded the execution timeout")]
    TimedOut { service: &'static str },
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ---------------------------------------------------------------------------
// Exit reporting
// ---------------------------------------------------------------------------

/// Structured result of a supervised child process.
#[derive(Debug)]
pub enum ExitReport {
    Completed { status: ExitStatus, stderr: String },
    TimedOut { stderr: String },
    WaitFailed(io::Error),
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct ProcessExecutor {
    binary: String,
    timeout: Duration,
    kill_grace: Duration,
}

impl ProcessExecutor {
    pub fn new(git: &GitConfig) -> Self {
        Self {
            binary: git.binary.clone(),
            timeout: Duration::from_secs(git.timeout_secs),
            kill_grace: Duration::from_secs(git.kill_grace_secs),
        }
    }

    /// Build the service command with an explicit, minimal environment.
    /// Nothing ambient beyond `PATH` reaches the child.
    fn command(
        &self,
        service: GitService,
        repo_path: &Path,
        git_protocol: Option<&str>,
        advertise: bool,
    ) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(service.subcommand()).arg("--stateless-rpc");
        if advertise {
            cmd.arg("--advertise-refs");
        }
        cmd.arg(".");
        cmd.current_dir(repo_path);

        cmd.env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(proto) = git_protocol {
            cmd.env("GIT_PROTOCOL", proto);
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run the service in advertise-only mode and return the complete ref
    /// advertisement.
    #[instrument(skip(self, git_protocol), fields(service = service.name(), repo = %repo_path.display()))]
    pub async fn advertise_refs(
        &self,
        service: GitService,
        repo_path: &Path,
        git_protocol: Option<&str>,
    ) -> Result<Vec<u8>, ExecError> {
        let mut cmd = self.command(service, repo_path, git_protocol, true);
        cmd.stdin(Stdio::null());

        // kill_on_drop tears the child down if the deadline drops the future.
        let output = time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ExecError::TimedOut {
                service: service.name(),
            })?
            .map_err(|err| ExecError::Spawn {
                service: service.name(),
                source: err,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ExecError::Failed {
                service: service.name(),
                status: output.status,
                stderr,
            });
        }

        debug!(bytes = output.stdout.len(), "ref advertisement produced");
        Ok(output.stdout)
    }

    /// Run a pack exchange: `body` is streamed into the child's stdin while
    /// its stdout is handed back for streaming to the client.
    ///
    /// The first stdout chunk is read before returning so a child that dies
    /// without responding surfaces as a clean [`ExecError`] instead of an
    /// empty 200. Once bytes flow, failures can only surface as truncation.
    #[instrument(skip(self, git_protocol, body), fields(service = service.name(), repo = %repo_path.display()))]
    pub async fn run_exchange<R>(
        &self,
        service: GitService,
        repo_path: &Path,
        git_protocol: Option<&str>,
        body: R,
    ) -> Result<PackExchange, ExecError>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut cmd = self.command(service, repo_path, git_protocol, false);
        cmd.stdin(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| ExecError::Spawn {
            service: service.name(),
            source: err,
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::other("child stdin not captured"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child stdout not captured"))?;

        // Client -> child copy. Dropping stdin at the end signals EOF.
        let stdin_task = tokio::spawn(async move {
            let mut body = body;
            if let Err(err) = tokio::io::copy(&mut body, &mut stdin).await {
                debug!(error = %err, "request body copy into child ended early");
            }
        });

        let supervisor = tokio::spawn(supervise(
            child,
            service,
            self.timeout,
            self.kill_grace,
        ));

        // Wait for the first response bytes (or EOF) before committing to a
        // streamed 200.
        let mut head = BytesMut::with_capacity(HEAD_READ_BYTES);
        let n = stdout.read_buf(&mut head).await?;

        if n == 0 {
            stdin_task.abort();
            let report = supervisor
                .await
                .map_err(|err| io::Error::other(err))?;
            return match report {
                ExitReport::Completed { status, .. } if status.success() => Ok(PackExchange {
                    head: Bytes::new(),
                    rest: ExchangeBody {
                        stdout,
                        stdin_task: None,
                        supervisor: None,
                    },
                }),
                ExitReport::Completed { status, stderr } => Err(ExecError::Failed {
                    service: service.name(),
                    status,
                    stderr,
                }),
                ExitReport::TimedOut { .. } => Err(ExecError::TimedOut {
                    service: service.name(),
                }),
                ExitReport::WaitFailed(err) => Err(ExecError::Io(err)),
            };
        }

        Ok(PackExchange {
            head: head.freeze(),
            rest: ExchangeBody {
                stdout,
                stdin_task: Some(stdin_task),
                supervisor: Some(supervisor),
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Exchange output
// ---------------------------------------------------------------------------

/// A started pack exchange: the first stdout bytes plus the remaining
/// stream.
pub struct PackExchange {
    pub head: Bytes,
    pub rest: ExchangeBody,
}

/// The child's remaining stdout. Dropping it cancels the session: the stdin
/// copy stops and the supervisor (which owns the kill-on-drop child handle)
/// is aborted, so a disconnected client takes the process down with it.
pub struct ExchangeBody {
    stdout: ChildStdout,
    stdin_task: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<ExitReport>>,
}

impl AsyncRead for ExchangeBody {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl Drop for ExchangeBody {
    fn drop(&mut self) {
        if let Some(task) = self.stdin_task.take() {
            task.abort();
        }
        if let Some(task) = self.supervisor.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Supervision
// ---------------------------------------------------------------------------

/// Wait for the child under the execution timeout, collecting stderr on the
/// side. On expiry: SIGTERM, grace window, then SIGKILL.
async fn supervise(
    mut child: Child,
    service: GitService,
    timeout: Duration,
    kill_grace: Duration,
) -> ExitReport {
    let stderr = child.stderr.take();
    let stderr_fut = async {
        let mut buf = Vec::new();
        if let Some(mut stderr) = stderr {
            let _ = (&mut stderr)
                .take(MAX_STDERR_BYTES)
                .read_to_end(&mut buf)
                .await;
            // Keep draining so a chatty child cannot block on a full pipe.
            let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
        }
        String::from_utf8_lossy(&buf).trim().to_string()
    };

    let wait_fut = async {
        match time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => Ok(Some(status)),
            Ok(Err(err)) => Err(err),
            Err(_) => {
                warn!(service = service.name(), "execution timeout; terminating child");
                terminate(&mut child);
                match time::timeout(kill_grace, child.wait()).await {
                    Ok(Ok(_)) => Ok(None),
                    _ => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        Ok(None)
                    }
                }
            }
        }
    };

    let (wait_result, stderr) = tokio::join!(wait_fut, stderr_fut);

    match wait_result {
        Ok(Some(status)) => {
            if status.success() {
                debug!(service = service.name(), "child exited cleanly");
            } else {
                warn!(
                    service = service.name(),
                    %status,
                    stderr = %stderr,
                    "child exited with non-zero status"
                );
            }
            ExitReport::Completed { status, stderr }
        }
        Ok(None) => {
            warn!(service = service.name(), stderr = %stderr, "child timed out");
            ExitReport::TimedOut { stderr }
        }
        Err(err) => ExitReport::WaitFailed(err),
    }
}

/// Graceful termination request.
#[cfg(unix)]
fn terminate(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

// ---------------------------------------------------------------------------
// Bare repo init
// ---------------------------------------------------------------------------

/// Initialise a new bare repository at `path` with `git init --bare`.
///
/// Creates missing parent directories first. If the directory already holds
/// a valid bare repo (has a `HEAD` file), this is a no-op.
#[instrument(skip(binary), fields(path = %path.display()))]
pub async fn init_bare_repo(binary: &str, path: &Path) -> Result<()> {
    if path.join("HEAD").is_file() {
        debug!("bare repo already exists; skipping init");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create parent directory: {}", parent.display()))?;
    }

    let output = Command::new(binary)
        .arg("init")
        .arg("--bare")
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("failed to spawn git init --bare")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "git init --bare failed (status {}): {}",
            output.status,
            stderr.trim(),
        );
    }

    debug!("bare repo initialised");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    /// Write an executable stand-in for the git binary. The scripts ignore
    /// the `upload-pack --stateless-rpc .` arguments they are spawned with.
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn executor(binary: &Path, timeout_ms: u64, kill_grace_ms: u64) -> ProcessExecutor {
        ProcessExecutor {
            binary: binary.to_string_lossy().into_owned(),
            timeout: Duration::from_millis(timeout_ms),
            kill_grace: Duration::from_millis(kill_grace_ms),
        }
    }

    #[tokio::test]
    async fn advertise_returns_stdout() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fake-git", "printf 'advertised-refs'");

        let exec = executor(&script, 5_000, 1_000);
        let out = exec
            .advertise_refs(GitService::UploadPack, tmp.path(), None)
            .await
            .unwrap();
        assert_eq!(out, b"advertised-refs");
    }

    #[tokio::test]
    async fn advertise_failure_carries_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fake-git", "echo boom >&2\nexit 3");

        let exec = executor(&script, 5_000, 1_000);
        match exec
            .advertise_refs(GitService::UploadPack, tmp.path(), None)
            .await
        {
            Err(ExecError::Failed { stderr, .. }) => assert_eq!(stderr, "boom"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exchange_streams_body_through_child() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fake-git", "cat");

        let exec = executor(&script, 5_000, 1_000);
        let body = std::io::Cursor::new(b"0009want\n0000".to_vec());
        let exchange = exec
            .run_exchange(GitService::UploadPack, tmp.path(), None, body)
            .await
            .unwrap();

        let mut out = exchange.head.to_vec();
        let mut rest = exchange.rest;
        rest.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"0009want\n0000");
    }

    #[tokio::test]
    async fn exchange_failure_before_output_is_clean_error() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fake-git", "echo nope >&2\nexit 128");

        let exec = executor(&script, 5_000, 1_000);
        let body = std::io::Cursor::new(Vec::new());
        match exec
            .run_exchange(GitService::ReceivePack, tmp.path(), None, body)
            .await
        {
            Err(ExecError::Failed { stderr, status, .. }) => {
                assert_eq!(stderr, "nope");
                assert_eq!(status.code(), Some(128));
            }
            Err(other) => panic!("expected Failed, got {other:?}"),
            Ok(_) => panic!("expected Failed, got a streaming exchange"),
        }
    }

    #[tokio::test]
    async fn timed_out_child_is_terminated_within_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fake-git", "exec sleep 30");

        let exec = executor(&script, 200, 200);
        let body = std::io::Cursor::new(Vec::new());
        let started = std::time::Instant::now();
        match exec
            .run_exchange(GitService::UploadPack, tmp.path(), None, body)
            .await
        {
            Err(ExecError::TimedOut { .. }) => {}
            Err(other) => panic!("expected TimedOut, got {other:?}"),
            Ok(_) => panic!("expected TimedOut, got a streaming exchange"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn concurrent_exchanges_do_not_cross_talk() {
        use std::sync::Arc;

        let tmp = tempfile::tempdir().unwrap();
        let script = write_script(tmp.path(), "fake-git", "cat");
        let exec = Arc::new(executor(&script, 5_000, 1_000));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let exec = Arc::clone(&exec);
            let dir = tmp.path().to_path_buf();
            tasks.push(tokio::spawn(async move {
                let payload = format!("0032want session-{i} distinct payload\n0000").into_bytes();
                let body = std::io::Cursor::new(payload.clone());
                let exchange = exec
                    .run_exchange(GitService::UploadPack, &dir, None, body)
                    .await
                    .unwrap();

                let mut out = exchange.head.to_vec();
                let mut rest = exchange.rest;
                rest.read_to_end(&mut out).await.unwrap();
                // Each session sees exactly its own bytes back.
                assert_eq!(out, payload);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn init_bare_repo_noop_when_head_exists() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = tmp.path().join("existing.git");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("HEAD"), "ref: refs/heads/main\n").unwrap();

        // Binary would fail if invoked; the early return must win.
        init_bare_repo("/nonexistent/git-binary", &repo).await.unwrap();
    }
}
