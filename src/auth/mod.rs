//! Authorization boundary.
//!
//! Whether a caller may read or write a repository path is an external
//! collaborator's decision; the protocol core only defines the capability
//! check and consults it before spawning a git process or answering an LFS
//! batch. The default policy permits everything, which matches a trusted
//! internal deployment; real installations plug in their own
//! [`AccessPolicy`] implementation.

// ---------------------------------------------------------------------------
// Capability check
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// A denied capability check, with the reason handed back to the client.
#[derive(Debug, Clone)]
pub struct Denial {
    pub reason: String,
}

#[async_trait::async_trait]
pub trait AccessPolicy: Send + Sync {
    /// Decide whether the caller may perform `kind` against `owner/repo`.
    async fn check(&self, owner: &str, repo: &str, kind: AccessKind) -> Result<(), Denial>;
}

// ---------------------------------------------------------------------------
// Default policy
// ---------------------------------------------------------------------------

/// Permits every request.
pub struct AllowAll;

#[async_trait::async_trait]
impl AccessPolicy for AllowAll {
    async fn check(&self, _owner: &str, _repo: &str, _kind: AccessKind) -> Result<(), Denial> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allow_all_permits_reads_and_writes() {
        let policy = AllowAll;
        assert!(policy.check("acme", "widget", AccessKind::Read).await.is_ok());
        assert!(policy.check("acme", "widget", AccessKind::Write).await.is_ok());
    }
}
