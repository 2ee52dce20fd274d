//! Invalidation entry point for changes that bypass the git sync path.
//!
//! [`InvalidationGateway::notify_content_changed`] invalidates the content
//! cache synchronously and queues a page-cache revalidation for a background
//! worker. Revalidation failures are retried a few times and then logged;
//! they never reach the caller.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::content::ContentCache;
use crate::sync::RetryPolicy;
use crate::types::Locale;

/// Header carrying the shared secret on revalidation requests.
pub const SECRET_HEADER: &str = "x-revalidate-secret";

/// Pending revalidations kept before new ones are dropped.
const DEFAULT_QUEUE_CAPACITY: usize = 64;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// What changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationScope {
    Global,
    Locale(Locale),
}

impl InvalidationScope {
    pub fn locale(&self) -> Option<&Locale> {
        match self {
            InvalidationScope::Global => None,
            InvalidationScope::Locale(locale) => Some(locale),
        }
    }

    /// Page paths the downstream cache should revalidate.
    pub fn paths(&self) -> Vec<String> {
        match self {
            InvalidationScope::Global => vec!["/".to_string()],
            InvalidationScope::Locale(locale) => vec![format!("/{}", locale)],
        }
    }
}

impl From<Option<Locale>> for InvalidationScope {
    fn from(locale: Option<Locale>) -> Self {
        locale.map_or(InvalidationScope::Global, InvalidationScope::Locale)
    }
}

#[derive(Debug, Error)]
pub enum RevalidateError {
    #[error("revalidation endpoint returned HTTP {0}")]
    Status(u16),
    #[error("revalidation request failed: {0}")]
    Transport(String),
}

/// Downstream page cache. Calls must be idempotent.
pub trait PageRevalidator: Send + Sync {
    fn revalidate(&self, paths: &[String]) -> Result<(), RevalidateError>;
}

/// Revalidator for deployments without a page cache.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRevalidator;

impl PageRevalidator for NoopRevalidator {
    fn revalidate(&self, paths: &[String]) -> Result<(), RevalidateError> {
        log::debug!("No page cache configured, skipping revalidation of {:?}", paths);
        Ok(())
    }
}

/// POSTs `{"paths": [...]}` to a revalidation webhook.
pub struct HttpRevalidator {
    url: String,
    secret: Option<String>,
    agent: ureq::Agent,
}

impl HttpRevalidator {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            url: url.into(),
            secret: secret.filter(|s| !s.is_empty()),
            agent: ureq::builder().timeout(HTTP_TIMEOUT).build(),
        }
    }
}

impl PageRevalidator for HttpRevalidator {
    fn revalidate(&self, paths: &[String]) -> Result<(), RevalidateError> {
        let mut request = self
            .agent
            .post(&self.url)
            .set("User-Agent", concat!("contentsync/", env!("CARGO_PKG_VERSION")));
        if let Some(secret) = &self.secret {
            request = request.set(SECRET_HEADER, secret);
        }

        match request.send_json(serde_json::json!({ "paths": paths })) {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => Err(RevalidateError::Status(code)),
            Err(ureq::Error::Transport(e)) => Err(RevalidateError::Transport(e.to_string())),
        }
    }
}

/// Counters for the revalidation queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevalidationStats {
    pub queued: u64,
    pub dropped: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    dropped: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

enum WorkerMessage {
    Revalidate(Vec<String>),
    Shutdown,
}

pub struct InvalidationGateway {
    cache: Arc<ContentCache>,
    tx: Sender<WorkerMessage>,
    counters: Arc<Counters>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl InvalidationGateway {
    /// Start the gateway with a 3-attempt revalidation retry.
    pub fn new(
        cache: Arc<ContentCache>,
        revalidator: Arc<dyn PageRevalidator>,
    ) -> io::Result<Self> {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        };
        Self::with_options(cache, revalidator, retry, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_options(
        cache: Arc<ContentCache>,
        revalidator: Arc<dyn PageRevalidator>,
        retry: RetryPolicy,
        queue_capacity: usize,
    ) -> io::Result<Self> {
        let (tx, rx) = bounded(queue_capacity.max(1));
        let counters = Arc::new(Counters::default());

        let worker_counters = Arc::clone(&counters);
        let worker = thread::Builder::new()
            .name("contentsync-revalidate".to_string())
            .spawn(move || run_worker(rx, revalidator, retry, worker_counters))?;

        Ok(Self {
            cache,
            tx,
            counters,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Invalidate cached content for `scope` now and revalidate downstream
    /// pages in the background. Never blocks on the downstream cache.
    pub fn notify_content_changed(&self, scope: InvalidationScope) {
        self.cache.invalidate(scope.locale());

        let paths = scope.paths();
        match self.tx.try_send(WorkerMessage::Revalidate(paths)) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(WorkerMessage::Revalidate(paths))) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Revalidation queue full, dropping {:?}", paths);
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Revalidation worker is not running, dropping request");
            }
        }
    }

    pub fn stats(&self) -> RevalidationStats {
        RevalidationStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Let the worker drain queued requests, then stop it.
    pub fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = self.tx.send(WorkerMessage::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for InvalidationGateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(
    rx: Receiver<WorkerMessage>,
    revalidator: Arc<dyn PageRevalidator>,
    retry: RetryPolicy,
    counters: Arc<Counters>,
) {
    log::info!("Revalidation worker started");

    for message in rx.iter() {
        match message {
            WorkerMessage::Revalidate(paths) => {
                let counter = if revalidate_with_retry(revalidator.as_ref(), &paths, &retry) {
                    &counters.succeeded
                } else {
                    &counters.failed
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            WorkerMessage::Shutdown => break,
        }
    }

    log::info!("Revalidation worker shutting down");
}

fn revalidate_with_retry(
    revalidator: &dyn PageRevalidator,
    paths: &[String],
    retry: &RetryPolicy,
) -> bool {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match revalidator.revalidate(paths) {
            Ok(()) => {
                log::debug!("Revalidated {:?}", paths);
                return true;
            }
            Err(e) if retry.should_retry(attempt) => {
                let delay = retry.delay_after(attempt);
                log::warn!(
                    "Revalidation of {:?} failed ({}), retrying in {:?}",
                    paths,
                    e,
                    delay
                );
                thread::sleep(delay);
            }
            Err(e) => {
                log::error!(
                    "Giving up on revalidation of {:?} after {} attempts: {}",
                    paths,
                    attempt,
                    e
                );
                return false;
            }
        }
    }
}
