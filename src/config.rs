use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub lfs: LfsConfig,
    #[serde(default)]
    pub vfs: VfsConfig,
}

impl Config {
    /// Directory that holds the served repositories.
    ///
    /// Repositories always live under `<root>/repositories`, whether that
    /// subtree is plain local disk or an object-store mount.
    pub fn repositories_dir(&self) -> PathBuf {
        self.storage.root.join("repositories")
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address for the HTTP listener (e.g. `0.0.0.0:9527`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9527".to_string()
}

// ---------------------------------------------------------------------------
// Storage (local root + optional S3)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root data directory. Repositories are served from
    /// `<root>/repositories`.
    pub root: PathBuf,
    /// Object-store backend. When absent, repositories live on local disk
    /// and the LFS batch endpoint is disabled.
    #[serde(default)]
    pub s3: Option<S3Config>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Endpoint URL the server talks to (e.g. `http://minio.local:9000`).
    pub endpoint: String,
    /// Endpoint used when generating pre-signed URLs, when it differs from
    /// `endpoint` (e.g. a public hostname reachable by clients).
    #[serde(default)]
    pub sign_endpoint: Option<String>,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Name of the environment variable that holds the access key ID.
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,
    /// Name of the environment variable that holds the secret access key.
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
    /// Use path-style bucket addressing (`endpoint/bucket/key`).
    #[serde(default)]
    pub use_path_style: bool,
    /// Mount the bucket's repository prefix over `<root>/repositories` so
    /// the git binary operates on store-backed files.
    #[serde(default)]
    pub mount_repositories: bool,
    /// Key prefix for repository trees in the bucket.
    #[serde(default = "default_repositories_prefix")]
    pub repositories_prefix: String,
    /// Key prefix for LFS objects in the bucket.
    #[serde(default = "default_lfs_prefix")]
    pub lfs_prefix: String,
    /// TTL (seconds) for pre-signed transfer URLs. Must comfortably exceed
    /// the time a client needs to move one object.
    #[serde(default = "default_presigned_url_ttl")]
    pub presigned_url_ttl: u64,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_access_key_env() -> String {
    "GITDOCK_S3_ACCESS_KEY".to_string()
}

fn default_secret_key_env() -> String {
    "GITDOCK_S3_SECRET_KEY".to_string()
}

fn default_repositories_prefix() -> String {
    "repositories/".to_string()
}

fn default_lfs_prefix() -> String {
    "lfs/".to_string()
}

fn default_presigned_url_ttl() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Git execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GitConfig {
    /// Path to the git binary.
    #[serde(default = "default_git_binary")]
    pub binary: String,
    /// Hard ceiling (seconds) on a single upload-pack / receive-pack run.
    #[serde(default = "default_git_timeout")]
    pub timeout_secs: u64,
    /// Grace window (seconds) between SIGTERM and SIGKILL on timeout.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,
    /// Initialise a bare repository on first push to an unknown path.
    #[serde(default = "bool_true")]
    pub auto_create: bool,
    /// Serve receive-pack (push). When false every push attempt is rejected.
    #[serde(default = "bool_true")]
    pub enable_receive_pack: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            binary: default_git_binary(),
            timeout_secs: default_git_timeout(),
            kill_grace_secs: default_kill_grace(),
            auto_create: true,
            enable_receive_pack: true,
        }
    }
}

fn default_git_binary() -> String {
    "git".to_string()
}

fn default_git_timeout() -> u64 {
    3600
}

fn default_kill_grace() -> u64 {
    10
}

fn bool_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// LFS
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LfsConfig {
    /// Probe the store before handing out upload actions so clients can
    /// skip re-transmitting objects that already exist.
    #[serde(default = "bool_true")]
    pub check_existing_on_upload: bool,
}

impl Default for LfsConfig {
    fn default() -> Self {
        Self {
            check_existing_on_upload: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Virtual mount cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct VfsConfig {
    /// Ceiling for cached clean file content in the mount layer, in bytes.
    /// Eviction is size-triggered; dirty entries are flushed, never dropped.
    #[serde(default = "default_max_cache_bytes")]
    pub max_cache_bytes: u64,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: default_max_cache_bytes(),
        }
    }
}

fn default_max_cache_bytes() -> u64 {
    256 * 1024 * 1024
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.storage.root.is_absolute(),
        "storage.root must be an absolute path"
    );
    anyhow::ensure!(config.git.timeout_secs > 0, "git.timeout_secs must be > 0");

    if let Some(s3) = &config.storage.s3 {
        anyhow::ensure!(!s3.endpoint.is_empty(), "storage.s3.endpoint must be set");
        anyhow::ensure!(!s3.bucket.is_empty(), "storage.s3.bucket must be set");
        anyhow::ensure!(
            s3.presigned_url_ttl >= 60,
            "storage.s3.presigned_url_ttl must be at least 60 seconds"
        );
        anyhow::ensure!(
            s3.repositories_prefix.ends_with('/') && s3.lfs_prefix.ends_with('/'),
            "storage.s3 key prefixes must end with '/'"
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)?;
        validate_config(&config)?;
        Ok(config)
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse("storage:\n  root: /var/lib/gitdock\n").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9527");
        assert_eq!(config.git.binary, "git");
        assert!(config.git.auto_create);
        assert!(config.lfs.check_existing_on_upload);
        assert!(config.storage.s3.is_none());
        assert_eq!(
            config.repositories_dir(),
            PathBuf::from("/var/lib/gitdock/repositories")
        );
    }

    #[test]
    fn relative_root_rejected() {
        assert!(parse("storage:\n  root: ./data\n").is_err());
    }

    #[test]
    fn s3_section_parses_with_defaults() {
        let yaml = "\
storage:
  root: /srv/gitdock
  s3:
    endpoint: http://minio.local:9000
    bucket: repos
    mount_repositories: true
";
        let config = parse(yaml).unwrap();
        let s3 = config.storage.s3.unwrap();
        assert_eq!(s3.region, "us-east-1");
        assert_eq!(s3.repositories_prefix, "repositories/");
        assert_eq!(s3.lfs_prefix, "lfs/");
        assert_eq!(s3.presigned_url_ttl, 3600);
        assert!(s3.mount_repositories);
        assert!(s3.sign_endpoint.is_none());
    }

    #[test]
    fn short_presign_ttl_rejected() {
        let yaml = "\
storage:
  root: /srv/gitdock
  s3:
    endpoint: http://minio.local:9000
    bucket: repos
    presigned_url_ttl: 5
";
        assert!(parse(yaml).is_err());
    }
}
