//! Single-flight repository synchronization.
//!
//! [`SyncManager`] owns the process-wide [`SyncState`]. At most one sync runs
//! at a time; callers that arrive while one is running get an
//! [`SyncOutcome::AlreadyInProgress`] result immediately instead of waiting.
//! Every completed attempt, successful or not, bumps the generation counter
//! that the content cache compares its entries against.

mod managed;
mod retry;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};

pub use managed::ManagedSync;
pub use retry::RetryPolicy;

use crate::mirror::{HeadCommit, MirrorAccessor, MirrorError};
use crate::types::{SyncReason, Timestamp, now_millis};

/// Default bound on a single `ensure_local_mirror` call.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

const ALREADY_IN_PROGRESS_MESSAGE: &str = "sync already in progress; no-op";
const TIMED_OUT_MESSAGE: &str = "sync timed out";

/// How a sync request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Mirror updated and head commit read.
    Synced,
    /// Mirror updated but the head commit could not be read.
    Partial,
    /// Mirror update failed (after retries, if the error was transient).
    Failed,
    /// Another sync was running; nothing was done.
    AlreadyInProgress,
}

impl SyncOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Partial => "partial",
            Self::Failed => "failed",
            Self::AlreadyInProgress => "already_in_progress",
        }
    }
}

impl FromStr for SyncOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "synced" => Ok(Self::Synced),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            "already_in_progress" => Ok(Self::AlreadyInProgress),
            other => Err(format!("unknown sync outcome: {}", other)),
        }
    }
}

/// Structured result of one `request_sync` call. Never mutated after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub outcome: SyncOutcome,
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub duration_ms: u64,
    /// Completion time.
    pub timestamp: Timestamp,
    pub reason: SyncReason,
    /// Accessor attempts made. Zero for `AlreadyInProgress`.
    pub attempts: u32,
    /// Generation after this request. Unchanged for `AlreadyInProgress`.
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<HeadCommit>,
}

impl SyncResult {
    fn already_in_progress(reason: SyncReason, generation: u64) -> Self {
        Self {
            outcome: SyncOutcome::AlreadyInProgress,
            success: false,
            message: ALREADY_IN_PROGRESS_MESSAGE.to_string(),
            details: None,
            duration_ms: 0,
            timestamp: now_millis(),
            reason,
            attempts: 0,
            generation,
            commit: None,
        }
    }

    /// HTTP status a forced-sync endpoint should answer with.
    pub fn http_status(&self) -> u16 {
        match self.outcome {
            SyncOutcome::Synced => 200,
            SyncOutcome::Partial => 207,
            SyncOutcome::Failed => 500,
            SyncOutcome::AlreadyInProgress => 409,
        }
    }
}

/// Point-in-time copy of the sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub in_progress: bool,
    pub last_sync_at: Option<Timestamp>,
    pub last_result: Option<SyncResult>,
    pub generation: u64,
}

/// Anything that can hand out the current sync generation.
pub trait GenerationSource: Send + Sync {
    fn current_generation(&self) -> u64;
}

/// Entry point used by the scheduler and the daemon to start a sync.
pub trait SyncTrigger: Send + Sync {
    fn request_sync(&self, reason: SyncReason) -> SyncResult;
}

#[derive(Debug, Default)]
struct LastSync {
    at: Option<Timestamp>,
    result: Option<SyncResult>,
}

/// Clears `in_progress` when dropped, including during unwinding.
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Why a single attempt did not produce a mirror update.
enum AttemptError {
    Mirror(MirrorError),
    TimedOut,
    Panicked,
}

impl AttemptError {
    fn is_transient(&self) -> bool {
        match self {
            AttemptError::Mirror(e) => e.is_transient(),
            AttemptError::TimedOut => true,
            AttemptError::Panicked => false,
        }
    }
}

/// Result of the attempt loop, before it is stamped with a generation.
struct Completed {
    outcome: SyncOutcome,
    message: String,
    details: Option<String>,
    attempts: u32,
    commit: Option<HeadCommit>,
}

/// Coordinates mirror updates. Share it behind an `Arc`.
pub struct SyncManager {
    accessor: Arc<dyn MirrorAccessor>,
    mirror_path: PathBuf,
    timeout: Duration,
    retry: RetryPolicy,
    in_progress: AtomicBool,
    generation: AtomicU64,
    last: Mutex<LastSync>,
}

impl SyncManager {
    pub fn new(accessor: Arc<dyn MirrorAccessor>, mirror_path: impl Into<PathBuf>) -> Self {
        Self {
            accessor,
            mirror_path: mirror_path.into(),
            timeout: DEFAULT_SYNC_TIMEOUT,
            retry: RetryPolicy::default(),
            in_progress: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            last: Mutex::new(LastSync::default()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn mirror_path(&self) -> &Path {
        &self.mirror_path
    }

    /// Run a sync unless one is already running.
    ///
    /// Never panics and never returns an error: every failure is described
    /// by the returned [`SyncResult`].
    pub fn request_sync(&self, reason: SyncReason) -> SyncResult {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!("{} sync requested while another is running", reason);
            return SyncResult::already_in_progress(reason, self.current_generation());
        }
        let _guard = InProgressGuard(&self.in_progress);

        log::info!("Starting {} sync of {}", reason, self.mirror_path.display());
        let started = Instant::now();
        let completed = self.run_attempts();
        let duration_ms = started.elapsed().as_millis() as u64;

        let result = {
            let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            let timestamp = now_millis();
            let result = SyncResult {
                success: completed.outcome == SyncOutcome::Synced,
                outcome: completed.outcome,
                message: completed.message,
                details: completed.details,
                duration_ms,
                timestamp,
                reason,
                attempts: completed.attempts,
                generation,
                commit: completed.commit,
            };
            last.at = Some(timestamp);
            last.result = Some(result.clone());
            result
        };

        match result.outcome {
            SyncOutcome::Synced => log::info!(
                "Sync finished in {}ms (generation {}): {}",
                result.duration_ms,
                result.generation,
                result.message
            ),
            _ => log::warn!(
                "Sync {} after {} attempt(s) (generation {}): {}{}",
                result.outcome.as_str(),
                result.attempts,
                result.generation,
                result.message,
                result
                    .details
                    .as_deref()
                    .map(|d| format!(": {}", d))
                    .unwrap_or_default()
            ),
        }

        result
    }

    /// Snapshot of the current state. Does not wait for a running sync.
    pub fn status(&self) -> SyncState {
        let last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        SyncState {
            in_progress: self.in_progress.load(Ordering::Acquire),
            last_sync_at: last.at,
            last_result: last.result.clone(),
            generation: self.generation.load(Ordering::Acquire),
        }
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn run_attempts(&self) -> Completed {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.attempt_once() {
                Ok(()) => return self.read_head(attempt),
                Err(err) => err,
            };

            if err.is_transient() && self.retry.should_retry(attempt) {
                let delay = self.retry.delay_after(attempt);
                log::warn!(
                    "Sync attempt {}/{} failed ({}), retrying in {:?}",
                    attempt,
                    self.retry.attempts(),
                    describe(&err, self.timeout),
                    delay
                );
                thread::sleep(delay);
                continue;
            }

            let (message, details) = match err {
                AttemptError::TimedOut => (
                    TIMED_OUT_MESSAGE.to_string(),
                    Some(format!("attempt {} exceeded {:?}", attempt, self.timeout)),
                ),
                AttemptError::Mirror(e) => ("sync failed".to_string(), Some(e.to_string())),
                AttemptError::Panicked => (
                    "sync failed".to_string(),
                    Some("mirror accessor panicked".to_string()),
                ),
            };
            return Completed {
                outcome: SyncOutcome::Failed,
                message,
                details,
                attempts: attempt,
                commit: None,
            };
        }
    }

    /// Run `ensure_local_mirror` on its own thread, bounded by the timeout.
    /// A timed out thread is abandoned; the accessor serializes itself
    /// against the next attempt.
    fn attempt_once(&self) -> Result<(), AttemptError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let accessor = Arc::clone(&self.accessor);
        let path = self.mirror_path.clone();

        thread::Builder::new()
            .name("contentsync-sync-attempt".to_string())
            .spawn(move || {
                let result = accessor.ensure_local_mirror(&path);
                let _ = tx.send(result);
            })
            .map_err(|e| AttemptError::Mirror(MirrorError::Io(e)))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result.map_err(AttemptError::Mirror),
            Err(RecvTimeoutError::Timeout) => Err(AttemptError::TimedOut),
            Err(RecvTimeoutError::Disconnected) => Err(AttemptError::Panicked),
        }
    }

    fn read_head(&self, attempts: u32) -> Completed {
        match self.accessor.head_commit(&self.mirror_path) {
            Ok(commit) => Completed {
                outcome: SyncOutcome::Synced,
                message: format!("synced to {} ({})", commit.short_hash(), commit.message),
                details: None,
                attempts,
                commit: Some(commit),
            },
            Err(e) => Completed {
                outcome: SyncOutcome::Partial,
                message: "mirror updated but head commit could not be read".to_string(),
                details: Some(e.to_string()),
                attempts,
                commit: None,
            },
        }
    }
}

fn describe(err: &AttemptError, timeout: Duration) -> String {
    match err {
        AttemptError::Mirror(e) => e.to_string(),
        AttemptError::TimedOut => format!("timed out after {:?}", timeout),
        AttemptError::Panicked => "accessor panicked".to_string(),
    }
}

impl GenerationSource for SyncManager {
    fn current_generation(&self) -> u64 {
        SyncManager::current_generation(self)
    }
}

impl SyncTrigger for SyncManager {
    fn request_sync(&self, reason: SyncReason) -> SyncResult {
        SyncManager::request_sync(self, reason)
    }
}
