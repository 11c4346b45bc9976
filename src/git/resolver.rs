//! Repository path resolution.
//!
//! Maps the `{owner}/{repo}` part of a request URL to a canonical location
//! under `<root>/repositories`, rejecting every form of traversal before
//! the filesystem is touched. Write operations may lazily initialise a
//! bare repository when `git.auto_create` is enabled; read operations are
//! side-effect-free by contract.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::GitConfig;
use crate::git::executor::init_bare_repo;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The request path is malformed (traversal, bad characters). Rejected
    /// before any filesystem access.
    #[error("invalid repository path: {0}")]
    InvalidPath(String),
    /// No repository at this location and the operation may not create one.
    #[error("repository not found")]
    NotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct RepoResolver {
    repos_dir: PathBuf,
    git_binary: String,
    auto_create: bool,
}

impl RepoResolver {
    pub fn new(repos_dir: PathBuf, git: &GitConfig) -> Self {
        Self {
            repos_dir,
            git_binary: git.binary.clone(),
            auto_create: git.auto_create,
        }
    }

    /// Resolve an existing repository for a read operation (discovery,
    /// upload-pack). Never creates anything.
    #[instrument(skip(self), fields(%owner, %repo))]
    pub fn resolve_read(&self, owner: &str, repo: &str) -> Result<PathBuf, ResolveError> {
        let candidate = self.candidate_path(owner, repo)?;

        if !candidate.join("HEAD").is_file() {
            return Err(ResolveError::NotFound);
        }

        self.canonical_within_root(&candidate)
    }

    /// Resolve a repository for a push, initialising a bare repository at
    /// the location first when it is missing and auto-create is enabled.
    #[instrument(skip(self), fields(%owner, %repo))]
    pub async fn resolve_write(&self, owner: &str, repo: &str) -> Result<PathBuf, ResolveError> {
        let candidate = self.candidate_path(owner, repo)?;

        if !candidate.join("HEAD").is_file() {
            if !self.auto_create {
                return Err(ResolveError::NotFound);
            }
            debug!(path = %candidate.display(), "initialising repository on first push");
            init_bare_repo(&self.git_binary, &candidate).await?;
        }

        self.canonical_within_root(&candidate)
    }

    /// Lexical validation only, for endpoints that address the repository
    /// namespace without touching the repository itself (LFS batch).
    pub fn validate(&self, owner: &str, repo: &str) -> Result<(), ResolveError> {
        self.candidate_path(owner, repo).map(|_| ())
    }

    /// Validate the path segments and join them under the repository root.
    /// Purely lexical; performs no I/O.
    fn candidate_path(&self, owner: &str, repo: &str) -> Result<PathBuf, ResolveError> {
        validate_segment(owner)?;

        // Accept both `name` and `name.git` in URLs; store as `name.git`.
        let repo = repo.strip_suffix(".git").unwrap_or(repo);
        validate_segment(repo)?;

        Ok(self.repos_dir.join(owner).join(format!("{repo}.git")))
    }

    /// Canonicalize and confirm the location did not escape the root via
    /// symlinks. The candidate exists by the time this is called.
    fn canonical_within_root(&self, candidate: &Path) -> Result<PathBuf, ResolveError> {
        let root = self
            .repos_dir
            .canonicalize()
            .map_err(|_| ResolveError::NotFound)?;
        let resolved = candidate
            .canonicalize()
            .map_err(|_| ResolveError::NotFound)?;

        if !resolved.starts_with(&root) {
            return Err(ResolveError::InvalidPath(format!(
                "{} escapes the repository root",
                candidate.display()
            )));
        }

        Ok(resolved)
    }
}

/// Reject anything that is not a plain single path component.
fn validate_segment(segment: &str) -> Result<(), ResolveError> {
    let bad = segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains('/')
        || segment.contains('\\')
        || segment.contains('\0');

    if bad {
        return Err(ResolveError::InvalidPath(segment.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GitConfig;

    fn resolver(root: &Path) -> RepoResolver {
        RepoResolver::new(root.to_path_buf(), &GitConfig::default())
    }

    fn make_bare_repo(root: &Path, owner: &str, repo: &str) -> PathBuf {
        let path = root.join(owner).join(format!("{repo}.git"));
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("HEAD"), "ref: refs/heads/main\n").unwrap();
        path
    }

    #[test]
    fn resolves_existing_repo() {
        let tmp = tempfile::tempdir().unwrap();
        make_bare_repo(tmp.path(), "acme", "widget");

        let resolved = resolver(tmp.path()).resolve_read("acme", "widget").unwrap();
        assert!(resolved.ends_with("acme/widget.git"));
    }

    #[test]
    fn git_suffix_in_url_is_accepted() {
        let tmp = tempfile::tempdir().unwrap();
        make_bare_repo(tmp.path(), "acme", "widget");

        let resolved = resolver(tmp.path())
            .resolve_read("acme", "widget.git")
            .unwrap();
        assert!(resolved.ends_with("acme/widget.git"));
    }

    #[test]
    fn traversal_segments_rejected_without_fs_access() {
        // The root does not even exist; a lexical rejection must come first.
        let r = resolver(Path::new("/nonexistent/gitdock-test-root"));

        for (owner, repo) in [
            ("..", "widget"),
            ("acme", ".."),
            (".", "widget"),
            ("", "widget"),
            ("acme", ""),
            ("a/b", "widget"),
            ("acme", "wid\\get"),
        ] {
            match r.resolve_read(owner, repo) {
                Err(ResolveError::InvalidPath(_)) => {}
                other => panic!("expected InvalidPath for {owner:?}/{repo:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn missing_repo_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        match resolver(tmp.path()).resolve_read("acme", "ghost") {
            Err(ResolveError::NotFound) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escape_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();

        // A "repository" that is really a symlink out of the root.
        let target = outside.path().join("victim.git");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("HEAD"), "ref: refs/heads/main\n").unwrap();

        std::fs::create_dir_all(tmp.path().join("acme")).unwrap();
        std::os::unix::fs::symlink(&target, tmp.path().join("acme/widget.git")).unwrap();

        match resolver(tmp.path()).resolve_read("acme", "widget") {
            Err(ResolveError::InvalidPath(_)) => {}
            other => panic!("expected InvalidPath, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_without_auto_create_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let git = GitConfig {
            auto_create: false,
            ..GitConfig::default()
        };
        let r = RepoResolver::new(tmp.path().to_path_buf(), &git);

        match r.resolve_write("acme", "fresh").await {
            Err(ResolveError::NotFound) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_with_auto_create_initialises_repo() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();

        // Stand-in for the git binary: `git init --bare <path>`.
        let fake_git = tmp.path().join("fake-git");
        std::fs::write(&fake_git, "#!/bin/sh\nmkdir -p \"$3\" && touch \"$3/HEAD\"\n").unwrap();
        std::fs::set_permissions(&fake_git, std::fs::Permissions::from_mode(0o755)).unwrap();

        let root = tmp.path().join("repos");
        std::fs::create_dir_all(&root).unwrap();

        let git = GitConfig {
            binary: fake_git.to_string_lossy().into_owned(),
            ..GitConfig::default()
        };
        let r = RepoResolver::new(root.clone(), &git);

        let resolved = r.resolve_write("acme", "fresh").await.unwrap();
        assert!(resolved.join("HEAD").is_file());
        assert!(resolved.starts_with(root.canonicalize().unwrap()));
    }
}
