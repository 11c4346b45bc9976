//! The closed set of smart-protocol operations.
//!
//! The wire protocol defines exactly two services; everything else in a
//! request's `service` parameter or POST path is rejected before any
//! process is spawned.

/// A smart HTTP protocol service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitService {
    /// Fetch/clone: the client downloads pack data.
    UploadPack,
    /// Push: the client uploads pack data and ref updates.
    ReceivePack,
}

impl GitService {
    /// Parse the wire-level service name (`git-upload-pack` /
    /// `git-receive-pack`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(GitService::UploadPack),
            "git-receive-pack" => Some(GitService::ReceivePack),
            _ => None,
        }
    }

    /// Wire-level service name, as it appears in URLs and announcements.
    pub fn name(&self) -> &'static str {
        match self {
            GitService::UploadPack => "git-upload-pack",
            GitService::ReceivePack => "git-receive-pack",
        }
    }

    /// Subcommand passed to the git binary.
    pub fn subcommand(&self) -> &'static str {
        match self {
            GitService::UploadPack => "upload-pack",
            GitService::ReceivePack => "receive-pack",
        }
    }

    /// `Content-Type` of the `info/refs` discovery response.
    pub fn advertisement_content_type(&self) -> &'static str {
        match self {
            GitService::UploadPack => "application/x-git-upload-pack-advertisement",
            GitService::ReceivePack => "application/x-git-receive-pack-advertisement",
        }
    }

    /// `Content-Type` of the pack exchange response.
    pub fn result_content_type(&self) -> &'static str {
        match self {
            GitService::UploadPack => "application/x-git-upload-pack-result",
            GitService::ReceivePack => "application/x-git-receive-pack-result",
        }
    }

    /// Whether this service is permitted to initialise a missing repository.
    /// Only pushes may create; reads must never have side effects.
    pub fn may_create(&self) -> bool {
        matches!(self, GitService::ReceivePack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_services() {
        assert_eq!(
            GitService::from_name("git-upload-pack"),
            Some(GitService::UploadPack)
        );
        assert_eq!(
            GitService::from_name("git-receive-pack"),
            Some(GitService::ReceivePack)
        );
    }

    #[test]
    fn rejects_unknown_services() {
        assert_eq!(GitService::from_name("git-upload-archive"), None);
        assert_eq!(GitService::from_name(""), None);
        assert_eq!(GitService::from_name("upload-pack"), None);
    }

    #[test]
    fn only_receive_pack_creates() {
        assert!(!GitService::UploadPack.may_create());
        assert!(GitService::ReceivePack.may_create());
    }
}
