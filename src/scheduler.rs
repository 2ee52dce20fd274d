//! Periodic and on-demand sync triggering.
//!
//! A [`Scheduler`] owns exactly one job, `repository-sync`, driven by one
//! timer thread. Registration is idempotent so that code paths which may run
//! more than once (daemon restarts of a component, re-entrant init) never
//! stack timers.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use serde::{Deserialize, Serialize};

use crate::sync::{SyncResult, SyncTrigger};
use crate::types::{SyncReason, Timestamp, now_millis};

/// Identifier of the only job the scheduler runs.
pub const SYNC_JOB_ID: &str = "repository-sync";

/// Description of a registered job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub id: String,
    pub interval_ms: u64,
    pub last_run_at: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct JobStats {
    last_run_at: Mutex<Option<Timestamp>>,
    runs: AtomicU64,
}

struct Timer {
    shutdown_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

enum Registration {
    Uninitialized,
    /// Terminal. The timer is taken out on shutdown.
    Registered(Option<Timer>),
}

/// Fixed-interval trigger for the sync manager.
pub struct Scheduler {
    trigger: Arc<dyn SyncTrigger>,
    interval: Duration,
    run_on_start: bool,
    stats: Arc<JobStats>,
    registration: Mutex<Registration>,
}

impl Scheduler {
    pub fn new(trigger: Arc<dyn SyncTrigger>, interval: Duration) -> Self {
        Self {
            trigger,
            interval,
            run_on_start: true,
            stats: Arc::new(JobStats::default()),
            registration: Mutex::new(Registration::Uninitialized),
        }
    }

    /// Whether the timer fires once right after registration (default true).
    pub fn with_run_on_start(mut self, run_on_start: bool) -> Self {
        self.run_on_start = run_on_start;
        self
    }

    /// Register the sync job and start its timer, once.
    ///
    /// Returns `Ok(true)` for the call that registered and `Ok(false)` for
    /// every later call, including calls after [`shutdown`](Self::shutdown).
    pub fn ensure_registered(&self) -> io::Result<bool> {
        let mut registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Registration::Registered(_) = *registration {
            log::debug!("Job {} already registered", SYNC_JOB_ID);
            return Ok(false);
        }

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(1);
        let trigger = Arc::clone(&self.trigger);
        let stats = Arc::clone(&self.stats);
        let interval = self.interval;
        let run_on_start = self.run_on_start;

        let thread = thread::Builder::new()
            .name("contentsync-scheduler".to_string())
            .spawn(move || run_timer(trigger, stats, interval, run_on_start, shutdown_rx))?;

        log::info!(
            "Registered job {} every {:?}{}",
            SYNC_JOB_ID,
            self.interval,
            if self.run_on_start { " (running now)" } else { "" }
        );
        *registration = Registration::Registered(Some(Timer {
            shutdown_tx,
            thread: Some(thread),
        }));
        Ok(true)
    }

    pub fn is_registered(&self) -> bool {
        matches!(
            *self
                .registration
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            Registration::Registered(_)
        )
    }

    /// Registered jobs: empty before registration, otherwise exactly one.
    pub fn jobs(&self) -> Vec<JobDescriptor> {
        if !self.is_registered() {
            return Vec::new();
        }
        vec![JobDescriptor {
            id: SYNC_JOB_ID.to_string(),
            interval_ms: self.interval.as_millis() as u64,
            last_run_at: *self
                .stats
                .last_run_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }]
    }

    /// Number of times the timer has fired the job.
    pub fn run_count(&self) -> u64 {
        self.stats.runs.load(Ordering::SeqCst)
    }

    /// Request a forced sync right away, outside the timer cadence.
    pub fn trigger_now(&self) -> SyncResult {
        self.trigger.request_sync(SyncReason::Forced)
    }

    /// Stop the timer and wait for it to exit. A job already running is
    /// allowed to finish.
    pub fn shutdown(&self) {
        let timer = match &mut *self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            Registration::Registered(timer) => timer.take(),
            Registration::Uninitialized => None,
        };

        if let Some(mut timer) = timer {
            let _ = timer.shutdown_tx.send(());
            if let Some(thread) = timer.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer(
    trigger: Arc<dyn SyncTrigger>,
    stats: Arc<JobStats>,
    interval: Duration,
    run_on_start: bool,
    shutdown_rx: Receiver<()>,
) {
    log::info!("Scheduler thread started");

    if run_on_start {
        run_job(trigger.as_ref(), &stats);
    }

    let ticker = crossbeam_channel::tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => run_job(trigger.as_ref(), &stats),
            recv(shutdown_rx) -> _ => {
                log::info!("Scheduler shutting down");
                return;
            }
        }
    }
}

/// Fire the job once. A panic inside the job is logged and swallowed so the
/// timer keeps its cadence.
fn run_job(trigger: &dyn SyncTrigger, stats: &JobStats) {
    *stats
        .last_run_at
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(now_millis());
    stats.runs.fetch_add(1, Ordering::SeqCst);

    match panic::catch_unwind(AssertUnwindSafe(|| {
        trigger.request_sync(SyncReason::Scheduled)
    })) {
        Ok(result) => log::debug!(
            "Job {} finished: {} (generation {})",
            SYNC_JOB_ID,
            result.outcome.as_str(),
            result.generation
        ),
        Err(payload) => log::error!(
            "Job {} panicked: {}",
            SYNC_JOB_ID,
            panic_message(payload.as_ref())
        ),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

static BACKGROUND_JOBS: OnceLock<Arc<Scheduler>> = OnceLock::new();

/// Process-wide scheduler initialization.
///
/// The first call builds the scheduler and registers its job; later calls
/// return the same instance and ignore their arguments.
pub fn init_background_jobs(
    trigger: Arc<dyn SyncTrigger>,
    interval: Duration,
    run_on_start: bool,
) -> io::Result<Arc<Scheduler>> {
    let scheduler = BACKGROUND_JOBS.get_or_init(|| {
        Arc::new(Scheduler::new(trigger, interval).with_run_on_start(run_on_start))
    });
    scheduler.ensure_registered()?;
    Ok(Arc::clone(scheduler))
}
