//! Daemon: wires the mirror, sync manager, scheduler, content cache and
//! invalidation gateway together and serves them over the control socket.

mod socket;

pub use socket::{Context, SocketServerHandle};

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Instant;

use thiserror::Error;

use crate::cli::Client;
use crate::config::Config;
use crate::content::{ContentCache, FsContentParser};
use crate::history::{DEFAULT_RETENTION, HistoryError, SyncHistory};
use crate::invalidation::{HttpRevalidator, InvalidationGateway, NoopRevalidator, PageRevalidator};
use crate::mirror::{GitMirror, RemoteSpec};
use crate::protocol::socket_path;
use crate::scheduler::init_background_jobs;
use crate::sync::{ManagedSync, SyncManager};

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon is already running (socket {0})")]
    AlreadyRunning(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

/// True if something answers on the control socket.
pub fn is_daemon_running() -> bool {
    is_listening(&socket_path())
}

fn is_listening(path: &Path) -> bool {
    Client::connect_to(path)
        .and_then(|mut client| client.version())
        .is_ok()
}

fn revalidator(config: &Config) -> Arc<dyn PageRevalidator> {
    match &config.revalidate_url {
        Some(url) => {
            log::info!("Downstream revalidation via {}", url);
            Arc::new(HttpRevalidator::new(url, config.revalidate_secret.clone()))
        }
        None => {
            log::info!("No revalidation URL configured, downstream revalidation disabled");
            Arc::new(NoopRevalidator)
        }
    }
}

/// Run the daemon in the foreground until `stop` or Ctrl-C.
pub fn start(config: Config) -> Result<(), DaemonError> {
    let socket = socket_path();
    if is_listening(&socket) {
        return Err(DaemonError::AlreadyRunning(socket.display().to_string()));
    }

    let history = match &config.history_db {
        Some(path) => {
            let history = SyncHistory::open(path)?;
            history.init()?;
            let pruned = history.prune(DEFAULT_RETENTION)?;
            if pruned > 0 {
                log::debug!("Pruned {} old sync records", pruned);
            }
            if let Some(last) = history.last_success()? {
                log::info!(
                    "Last successful sync: generation {} at {}",
                    last.generation,
                    last.timestamp
                );
            }
            log::info!("Recording sync history in {}", path.display());
            Some(Arc::new(history))
        }
        None => None,
    };

    let remote = RemoteSpec::new(&config.repo_url, &config.branch).with_token(config.token.clone());
    let repo_url = remote.display_url();
    log::info!(
        "Mirroring {} ({}) into {}",
        repo_url,
        config.branch,
        config.mirror_dir.display()
    );

    let mirror = GitMirror::new(remote).with_command_timeout(config.sync_timeout());
    let manager = SyncManager::new(Arc::new(mirror), &config.mirror_dir)
        .with_timeout(config.sync_timeout())
        .with_retry_policy(config.retry_policy());
    let sync = Arc::new(ManagedSync::new(Arc::new(manager), history));

    let cache = Arc::new(ContentCache::new(
        &config.mirror_dir,
        Arc::new(FsContentParser::new()),
        sync.clone(),
    ));
    let gateway = Arc::new(InvalidationGateway::new(cache.clone(), revalidator(&config))?);

    let scheduler = init_background_jobs(
        sync.clone(),
        config.sync_interval(),
        config.sync_on_start,
    )?;

    // Build the configured locales in the background; a cold mirror just
    // fails the first builds and the next `get` retries.
    let warm_cache = cache.clone();
    let locales = config.warm_locales();
    thread::Builder::new()
        .name("contentsync-warm".to_string())
        .spawn(move || {
            let built = warm_cache.warm(&locales);
            log::info!("Warmed {}/{} locales", built, locales.len());
        })?;

    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    let signal_tx = stop_tx.clone();
    ctrlc::set_handler(move || {
        let _ = signal_tx.try_send(());
    })?;

    let ctx = Context {
        sync,
        scheduler: scheduler.clone(),
        cache,
        gateway: gateway.clone(),
        default_locale: config.default_locale.clone(),
        locales: config.warm_locales(),
        repo_url,
        branch: config.branch.clone(),
        mirror_dir: config.mirror_dir.display().to_string(),
        start_time: Instant::now(),
        stop_tx,
    };
    let mut server = SocketServerHandle::spawn_at(&socket, ctx, Arc::new(AtomicBool::new(false)))?;

    log::info!("Daemon started (pid {})", std::process::id());
    let _ = stop_rx.recv();
    log::info!("Shutting down");

    server.shutdown();
    scheduler.shutdown();
    gateway.shutdown();

    log::info!("Daemon stopped");
    Ok(())
}
