//! Local working copy of the content repository.
//!
//! The sync manager only sees the [`MirrorAccessor`] trait; [`GitMirror`] is
//! the production implementation.

mod git;
mod lock;

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use git::{
    GitCli, GitMirror, RemoteSpec, open_repository, read_head_commit, repository_exists,
};
pub use lock::MirrorLock;

use crate::types::Timestamp;

/// Metadata about the commit the mirror is checked out at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadCommit {
    pub hash: String,
    /// First line of the commit message.
    pub message: String,
    /// `Name <email>`
    pub author: String,
    pub timestamp: Timestamp,
}

impl HeadCommit {
    pub fn short_hash(&self) -> &str {
        if self.hash.len() > 12 {
            &self.hash[..12]
        } else {
            &self.hash
        }
    }
}

/// Errors returned by mirror operations.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// A git CLI command exited unsuccessfully. `stderr` is already redacted.
    #[error("git {op} failed: {stderr}")]
    Command { op: &'static str, stderr: String },
    /// A git CLI command ran past its deadline and was killed.
    #[error("git {op} killed after {after:?}")]
    CommandTimedOut { op: &'static str, after: Duration },
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Path does not contain a git repository.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Another sync (possibly an abandoned one) still holds the mirror.
    #[error("mirror lock not acquired within {0:?}")]
    LockTimeout(Duration),
}

/// stderr fragments that mean retrying will not help. Checked first.
const PERMANENT_PATTERNS: &[&str] = &[
    "authentication failed",
    "could not read username",
    "could not read password",
    "permission denied",
    "repository not found",
    "does not appear to be a git repository",
    "not a git repository",
    "couldn't find remote ref",
    "not found in upstream",
    "bad object",
    "corrupt",
    "invalid refspec",
];

/// stderr fragments that indicate a network hiccup.
const TRANSIENT_PATTERNS: &[&str] = &[
    "could not resolve host",
    "unable to look up",
    "temporary failure in name resolution",
    "connection reset",
    "connection refused",
    "connection timed out",
    "operation timed out",
    "timed out",
    "network is unreachable",
    "early eof",
    "the remote end hung up unexpectedly",
    "rpc failed",
    "gnutls",
    "ssl",
    "http/2 stream",
    "502",
    "503",
    "504",
];

fn classify_stderr(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return false;
    }
    TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p))
}

impl MirrorError {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// Network and i/o failures are transient; authentication, missing or
    /// corrupt repositories and invalid inputs are not.
    pub fn is_transient(&self) -> bool {
        match self {
            MirrorError::Command { stderr, .. } => classify_stderr(stderr),
            MirrorError::Git(e) => {
                e.code() != git2::ErrorCode::Auth
                    && matches!(
                        e.class(),
                        git2::ErrorClass::Net | git2::ErrorClass::Http | git2::ErrorClass::Ssl
                    )
            }
            MirrorError::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::PermissionDenied
                    | io::ErrorKind::InvalidInput
            ),
            MirrorError::CommandTimedOut { .. } | MirrorError::LockTimeout(_) => true,
            MirrorError::NotFound(_) | MirrorError::InvalidInput(_) => false,
        }
    }
}

/// Clone/pull/inspect operations against a local working copy.
///
/// Implementations must tolerate being abandoned mid-operation by a timed
/// out caller: a later call on the same path has to converge on the remote
/// state regardless of what the abandoned call left behind.
pub trait MirrorAccessor: Send + Sync {
    /// Clone into `path` if absent, otherwise bring it up to date.
    fn ensure_local_mirror(&self, path: &Path) -> Result<(), MirrorError>;

    /// Read the commit the working copy is checked out at.
    fn head_commit(&self, path: &Path) -> Result<HeadCommit, MirrorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_are_transient() {
        for stderr in [
            "fatal: unable to access 'https://github.com/a/b.git/': Could not resolve host: github.com",
            "error: RPC failed; curl 56 Recv failure: Connection reset by peer",
            "fatal: the remote end hung up unexpectedly",
            "fatal: unable to access 'https://github.com/a/b.git/': The requested URL returned error: 503",
        ] {
            let err = MirrorError::Command {
                op: "fetch",
                stderr: stderr.to_string(),
            };
            assert!(err.is_transient(), "expected transient: {}", stderr);
        }
    }

    #[test]
    fn auth_and_missing_repo_are_permanent() {
        for stderr in [
            "remote: Invalid username or password.\nfatal: Authentication failed for 'https://github.com/a/b.git/'",
            "fatal: could not read Username for 'https://github.com': terminal prompts disabled",
            "remote: Repository not found.\nfatal: repository 'https://github.com/a/b.git/' not found",
            "fatal: not a git repository (or any of the parent directories): .git",
            "fatal: couldn't find remote ref refs/heads/nope",
        ] {
            let err = MirrorError::Command {
                op: "clone",
                stderr: stderr.to_string(),
            };
            assert!(!err.is_transient(), "expected permanent: {}", stderr);
        }
    }

    #[test]
    fn unknown_command_failures_are_permanent() {
        let err = MirrorError::Command {
            op: "reset",
            stderr: "fatal: something unexpected".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn io_classification() {
        assert!(MirrorError::Io(io::Error::from(io::ErrorKind::TimedOut)).is_transient());
        assert!(MirrorError::Io(io::Error::from(io::ErrorKind::Interrupted)).is_transient());
        assert!(!MirrorError::Io(io::Error::from(io::ErrorKind::NotFound)).is_transient());
        assert!(!MirrorError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_transient());
    }

    #[test]
    fn git2_classification() {
        let net = git2::Error::new(
            git2::ErrorCode::GenericError,
            git2::ErrorClass::Net,
            "failed to connect",
        );
        assert!(MirrorError::Git(net).is_transient());

        let auth = git2::Error::new(git2::ErrorCode::Auth, git2::ErrorClass::Http, "401");
        assert!(!MirrorError::Git(auth).is_transient());

        let odb = git2::Error::new(
            git2::ErrorCode::NotFound,
            git2::ErrorClass::Odb,
            "object not found",
        );
        assert!(!MirrorError::Git(odb).is_transient());
    }

    #[test]
    fn lock_contention_is_transient() {
        assert!(MirrorError::LockTimeout(Duration::from_secs(1)).is_transient());
        assert!(
            MirrorError::CommandTimedOut {
                op: "fetch",
                after: Duration::from_secs(30),
            }
            .is_transient()
        );
        assert!(!MirrorError::NotFound("/tmp/x".into()).is_transient());
        assert!(!MirrorError::InvalidInput("branch".into()).is_transient());
    }

    #[test]
    fn short_hash_truncates() {
        let head = HeadCommit {
            hash: "0123456789abcdef0123456789abcdef01234567".to_string(),
            message: "update".to_string(),
            author: "a <a@b>".to_string(),
            timestamp: 0,
        };
        assert_eq!(head.short_hash(), "0123456789ab");
    }
}
