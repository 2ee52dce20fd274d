//! Git operations using a hybrid CLI + libgit2 approach.
//!
//! **CLI (with hardening) for operations that talk to the remote or rewrite
//! the working copy:** shallow clone, shallow fetch, hard reset, clean.
//!
//! **libgit2 for read operations:** opening the repository and reading the
//! HEAD commit.

use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use git2::Repository;

use super::lock::MirrorLock;
use super::{HeadCommit, MirrorAccessor, MirrorError};

/// Validate that a git ref (branch name) does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes, control characters or whitespace
fn validate_git_ref(value: &str, name: &str) -> Result<(), MirrorError> {
    if value.is_empty() {
        return Err(MirrorError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(MirrorError::InvalidInput(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    if value.starts_with('-') {
        return Err(MirrorError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b < 0x20 || b == b' ' || b == 0x7f) {
        return Err(MirrorError::InvalidInput(format!(
            "{} cannot contain whitespace or control characters",
            name
        )));
    }
    Ok(())
}

/// Validate a remote URL before handing it to git.
fn validate_remote_url(url: &str) -> Result<(), MirrorError> {
    if url.is_empty() {
        return Err(MirrorError::InvalidInput("remote url cannot be empty".into()));
    }
    if url.starts_with('-') {
        return Err(MirrorError::InvalidInput(
            "remote url cannot start with '-'".into(),
        ));
    }
    // ext:: and fd:: transports run arbitrary commands
    if url.starts_with("ext::") || url.starts_with("fd::") {
        return Err(MirrorError::InvalidInput(format!(
            "unsupported remote transport: {}",
            url
        )));
    }
    Ok(())
}

/// Strip `user:password@` from any URL embedded in `text`.
fn redact_url_credentials(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(idx) = rest.find("://") {
        let (head, tail) = rest.split_at(idx + 3);
        out.push_str(head);

        let authority_end = tail
            .find(|c: char| c == '/' || c.is_whitespace() || c == '\'' || c == '"')
            .unwrap_or(tail.len());
        match tail[..authority_end].rfind('@') {
            Some(at) => {
                out.push_str("***@");
                rest = &tail[at + 1..];
            }
            None => rest = tail,
        }
    }

    out.push_str(rest);
    out
}

/// Remote repository coordinates.
#[derive(Debug, Clone)]
pub struct RemoteSpec {
    pub url: String,
    pub branch: String,
    /// Token for HTTPS remotes, sent as `x-access-token`.
    pub token: Option<String>,
}

impl RemoteSpec {
    pub fn new(url: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    /// URL used for network operations. Carries credentials, so it is only
    /// ever passed on the command line and never written to the repo config.
    fn authenticated_url(&self) -> String {
        match (&self.token, self.url.strip_prefix("https://")) {
            (Some(token), Some(rest)) => format!("https://x-access-token:{}@{}", token, rest),
            _ => self.url.clone(),
        }
    }

    /// Remote URL safe for logs and status output.
    pub fn display_url(&self) -> String {
        self.redact(&self.url)
    }

    fn redact(&self, text: &str) -> String {
        let text = redact_url_credentials(text);
        match &self.token {
            Some(token) => text.replace(token.as_str(), "***"),
            None => text,
        }
    }
}

/// Git CLI wrapper with security hardening.
///
/// Every command runs in its own process group. With a timeout set, a
/// command still running at the deadline is killed together with its
/// remote helpers, so an abandoned sync never holds the mirror lock for
/// longer than that.
pub struct GitCli {
    git_path: PathBuf,
    timeout: Option<Duration>,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

/// Transfers slower than this many bytes per second...
const LOW_SPEED_LIMIT: &str = "http.lowSpeedLimit=1000";
/// ...for this many seconds are aborted by git itself.
const LOW_SPEED_TIME: &str = "http.lowSpeedTime=30";

const MAX_POLL_INTERVAL: Duration = Duration::from_millis(200);

impl GitCli {
    /// Create a new GitCli instance using the system git.
    pub fn new() -> Self {
        Self {
            git_path: PathBuf::from("git"),
            timeout: None,
        }
    }

    /// Use a specific git binary.
    pub fn with_git_path(mut self, git_path: impl Into<PathBuf>) -> Self {
        self.git_path = git_path.into();
        self
    }

    /// Kill any single command that runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_LFS_SKIP_SMUDGE=1` - skip LFS file downloads
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    /// - `credential.helper=` - never consult stored credentials
    /// - `http.lowSpeedLimit`/`http.lowSpeedTime` - abort stalled transfers
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["-c", "core.hooksPath=", "-c", "credential.helper="]);
        cmd.args(["-c", LOW_SPEED_LIMIT, "-c", LOW_SPEED_TIME]);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn run(
        &self,
        op: &'static str,
        mut cmd: Command,
        remote: &RemoteSpec,
    ) -> Result<(), MirrorError> {
        cmd.stdout(Stdio::null()).stderr(Stdio::piped()).process_group(0);
        let mut child = cmd.spawn()?;

        // Drained on its own thread so a chatty child never blocks on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let status = match self.wait(&mut child)? {
            Some(status) => status,
            None => {
                let after = self.timeout.unwrap_or_default();
                log::warn!("git {} still running after {:?}, killed it", op, after);
                return Err(MirrorError::CommandTimedOut { op, after });
            }
        };

        if !status.success() {
            let stderr = stderr_reader
                .and_then(|reader| reader.join().ok())
                .unwrap_or_default();
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(MirrorError::Command {
                op,
                stderr: remote.redact(stderr.trim()),
            });
        }
        Ok(())
    }

    /// Wait for `child`, killing its process group at the deadline.
    /// Returns `None` if it had to be killed.
    fn wait(&self, child: &mut Child) -> io::Result<Option<ExitStatus>> {
        let Some(timeout) = self.timeout else {
            return child.wait().map(Some);
        };

        let deadline = Instant::now() + timeout;
        let mut poll = Duration::from_millis(10);
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                kill_process_group(child);
                child.wait()?;
                return Ok(None);
            }
            thread::sleep(poll.min(deadline - now));
            poll = (poll * 2).min(MAX_POLL_INTERVAL);
        }
    }

    /// Check whether the git binary can be executed.
    pub fn is_available(&self) -> bool {
        Command::new(&self.git_path)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Clone a single branch with only the latest commit into `dest`.
    ///
    /// The remote stored in the clone's config is the plain URL, without
    /// credentials.
    pub fn clone_shallow(&self, remote: &RemoteSpec, dest: &Path) -> Result<(), MirrorError> {
        validate_remote_url(&remote.url)?;
        validate_git_ref(&remote.branch, "branch")?;

        let dest_existed = dest.exists();

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut cmd = self.command();
        cmd.args(["clone", "--depth=1", "--single-branch", "--no-tags", "--branch"])
            .arg(&remote.branch)
            .arg(remote.authenticated_url())
            .arg(dest);

        if let Err(err) = self.run("clone", cmd, remote) {
            if !dest_existed {
                let _ = std::fs::remove_dir_all(dest);
            }
            return Err(err);
        }

        if remote.token.is_some() {
            let mut cmd = self.command();
            cmd.arg("-C")
                .arg(dest)
                .args(["remote", "set-url", "origin"])
                .arg(&remote.url);
            self.run("remote set-url", cmd, remote)?;
        }

        Ok(())
    }

    /// Fetch the latest commit of the branch into `refs/remotes/origin/<branch>`.
    pub fn fetch_shallow(
        &self,
        remote: &RemoteSpec,
        mirror_path: &Path,
    ) -> Result<(), MirrorError> {
        validate_remote_url(&remote.url)?;
        validate_git_ref(&remote.branch, "branch")?;

        let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", remote.branch);

        let mut cmd = self.command();
        cmd.arg("-C")
            .arg(mirror_path)
            .args(["fetch", "--depth=1", "--no-tags"])
            .arg(remote.authenticated_url())
            .arg(&refspec);
        self.run("fetch", cmd, remote)
    }

    /// Force the working copy to match `origin/<branch>`, discarding any
    /// local modifications or untracked files.
    pub fn reset_to_remote(
        &self,
        remote: &RemoteSpec,
        mirror_path: &Path,
    ) -> Result<(), MirrorError> {
        validate_git_ref(&remote.branch, "branch")?;

        let target = format!("refs/remotes/origin/{}", remote.branch);

        let mut cmd = self.command();
        cmd.arg("-C")
            .arg(mirror_path)
            .args(["reset", "--hard", "--quiet"])
            .arg(&target);
        self.run("reset", cmd, remote)?;

        let mut cmd = self.command();
        cmd.arg("-C")
            .arg(mirror_path)
            .args(["clean", "-ffd", "--quiet"]);
        self.run("clean", cmd, remote)
    }
}

fn kill_process_group(child: &mut Child) {
    // The child leads its own group (`process_group(0)`), so this also
    // reaches `git-remote-https` and friends.
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.kill();
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, MirrorError> {
    let repo = Repository::open(path).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            MirrorError::NotFound(path.display().to_string())
        } else {
            MirrorError::Git(e)
        }
    })?;
    Ok(repo)
}

/// Check if a path contains a valid git repository.
pub fn repository_exists(path: &Path) -> bool {
    Repository::open(path).is_ok()
}

/// Read HEAD's commit metadata from a repository.
pub fn read_head_commit(repo: &Repository) -> Result<HeadCommit, MirrorError> {
    let head = repo.head()?;
    let commit = head.peel_to_commit()?;
    let author = commit.author();

    Ok(HeadCommit {
        hash: commit.id().to_string(),
        message: commit.summary().unwrap_or_default().to_string(),
        author: format!(
            "{} <{}>",
            author.name().unwrap_or("unknown"),
            author.email().unwrap_or("")
        ),
        timestamp: (commit.time().seconds().max(0) as u64) * 1000,
    })
}

/// Default time to wait for a mirror held by another (possibly abandoned)
/// sync attempt.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// [`MirrorAccessor`] backed by the git CLI and libgit2.
pub struct GitMirror {
    remote: RemoteSpec,
    git: GitCli,
    lock_timeout: Duration,
}

impl GitMirror {
    pub fn new(remote: RemoteSpec) -> Self {
        Self {
            remote,
            git: GitCli::new(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Bound each git command. Pass the sync timeout so a timed out sync
    /// releases the mirror shortly after the caller gives up on it.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.git = self.git.with_timeout(timeout);
        self
    }

    pub fn with_git(mut self, git: GitCli) -> Self {
        self.git = git;
        self
    }

    pub fn remote(&self) -> &RemoteSpec {
        &self.remote
    }

    fn lock(&self, path: &Path) -> Result<MirrorLock, MirrorError> {
        let lock_path = MirrorLock::path_for(path);
        match MirrorLock::acquire_with_timeout(&lock_path, self.lock_timeout) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                Err(MirrorError::LockTimeout(self.lock_timeout))
            }
            Err(e) => Err(MirrorError::Io(e)),
        }
    }

    fn initial_clone(&self, path: &Path) -> Result<(), MirrorError> {
        log::info!(
            "Cloning {} ({}) into {}",
            self.remote.redact(&self.remote.url),
            self.remote.branch,
            path.display()
        );
        self.git.clone_shallow(&self.remote, path)
    }

    fn pull(&self, path: &Path) -> Result<(), MirrorError> {
        log::debug!("Fetching {} into {}", self.remote.branch, path.display());
        self.git.fetch_shallow(&self.remote, path)?;
        self.git.reset_to_remote(&self.remote, path)
    }
}

fn discard_broken_mirror(path: &Path) -> Result<(), MirrorError> {
    log::warn!(
        "{} exists but is not a git repository, removing it before cloning",
        path.display()
    );
    if path.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

impl MirrorAccessor for GitMirror {
    fn ensure_local_mirror(&self, path: &Path) -> Result<(), MirrorError> {
        let _lock = self.lock(path)?;

        if repository_exists(path) {
            return self.pull(path);
        }

        // Leftovers from an interrupted clone.
        if path.exists() {
            discard_broken_mirror(path)?;
        }

        self.initial_clone(path)
    }

    fn head_commit(&self, path: &Path) -> Result<HeadCommit, MirrorError> {
        let repo = open_repository(path)?;
        read_head_commit(&repo)
    }
}
