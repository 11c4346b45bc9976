//! Git protocol serving: service dispatch, repository resolution, and
//! external process execution.
//!
//! All pack operations shell out to the `git` binary using
//! `tokio::process::Command`; this crate never reimplements commit-graph,
//! diff, or merge logic. The resolver keeps every request inside the
//! configured repository root, and the executor owns child-process
//! lifecycle including timeouts and teardown.

pub mod executor;
pub mod resolver;
pub mod service;

pub use executor::{ExecError, PackExchange, ProcessExecutor};
pub use resolver::{RepoResolver, ResolveError};
pub use service::GitService;
