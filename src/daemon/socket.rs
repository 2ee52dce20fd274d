//! Unix socket server for handling JSON-RPC requests from the CLI.

use std::io::BufReader;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::Sender;

use crate::content::ContentCache;
use crate::invalidation::{InvalidationGateway, InvalidationScope};
use crate::protocol::{
    ContentResult, HistoryResult, InvalidateResult, Request, Response, RpcError, RpcReply,
    StatusResult, VersionResult, read_request, write_message,
};
use crate::scheduler::Scheduler;
use crate::sync::ManagedSync;
use crate::types::Locale;

/// Upper bound on `history` results per request.
const MAX_HISTORY_LIMIT: usize = 500;

/// Context shared by request handlers.
pub struct Context {
    pub sync: Arc<ManagedSync>,
    pub scheduler: Arc<Scheduler>,
    pub cache: Arc<ContentCache>,
    pub gateway: Arc<InvalidationGateway>,
    pub default_locale: Locale,
    /// Locales clients may ask for. Anything else is rejected before it
    /// reaches the cache.
    pub locales: Vec<Locale>,
    /// Remote URL with credentials redacted.
    pub repo_url: String,
    pub branch: String,
    pub mirror_dir: String,
    pub start_time: Instant,
    /// Signals the daemon main loop to exit.
    pub stop_tx: Sender<()>,
}

impl Context {
    fn check_locale(&self, locale: &Locale) -> Result<(), RpcError> {
        if self.locales.contains(locale) {
            Ok(())
        } else {
            Err(RpcError::invalid_params(format!(
                "locale {} is not configured",
                locale
            )))
        }
    }
}

/// Handle a single JSON-RPC request.
fn handle_request(ctx: &Context, request: Request) -> Result<Response, RpcError> {
    match request {
        Request::Status => Ok(Response::Status(Box::new(StatusResult {
            running: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            uptime_secs: ctx.start_time.elapsed().as_secs(),
            repo_url: ctx.repo_url.clone(),
            branch: ctx.branch.clone(),
            mirror_dir: ctx.mirror_dir.clone(),
            sync: ctx.sync.status(),
            jobs: ctx.scheduler.jobs(),
            cache: ctx.cache.entries(),
            revalidation: ctx.gateway.stats(),
            history_enabled: ctx.sync.history().is_some(),
        }))),

        // Blocks this client's thread until the sync finishes. A sync that
        // is already running answers immediately with `already_in_progress`.
        Request::Sync => Ok(Response::Sync(ctx.scheduler.trigger_now())),

        Request::Invalidate { locale } => {
            if let Some(locale) = &locale {
                ctx.check_locale(locale)?;
            }
            let scope = InvalidationScope::from(locale);
            let paths = scope.paths();
            ctx.gateway.notify_content_changed(scope.clone());
            Ok(Response::Invalidate(InvalidateResult { scope, paths }))
        }

        Request::Content { locale } => {
            let locale = locale.unwrap_or_else(|| ctx.default_locale.clone());
            ctx.check_locale(&locale)?;
            let snapshot = ctx
                .cache
                .get(&locale)
                .map_err(|e| RpcError::internal(e.to_string()))?;

            Ok(Response::Content(ContentResult {
                entry: ctx.cache.peek(&locale),
                items: snapshot.items().iter().map(|i| i.slug.clone()).collect(),
                pages: snapshot.pages().iter().map(|p| p.slug.clone()).collect(),
            }))
        }

        Request::History { limit } => {
            let history = ctx
                .sync
                .history()
                .ok_or_else(|| RpcError::not_found("sync history is disabled"))?;
            if limit == 0 {
                return Err(RpcError::invalid_params("limit must be at least 1"));
            }
            let records = history
                .recent(limit.min(MAX_HISTORY_LIMIT))
                .map_err(|e| RpcError::internal(e.to_string()))?;
            Ok(Response::History(HistoryResult { records }))
        }

        Request::Version => Ok(Response::Version(VersionResult {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
        })),

        Request::Stop => {
            let _ = ctx.stop_tx.try_send(());
            Ok(Response::Ok(()))
        }
    }
}

/// Handle a connected client, reading requests and writing responses.
fn handle_client(ctx: &Context, stream: UnixStream) {
    let mut reader = BufReader::new(&stream);
    let mut writer = &stream;

    loop {
        let reply = match read_request(&mut reader) {
            Ok(Some(Ok(req))) => {
                log::debug!("RPC request {}: {:?}", req.id, req.request);
                match handle_request(ctx, req.request) {
                    Ok(result) => RpcReply::success(result, req.id),
                    Err(error) => RpcReply::failure(error, req.id),
                }
            }
            Ok(Some(Err(rejected))) => {
                log::debug!("Rejected request: {}", rejected.error.message);
                rejected.into_reply()
            }
            Ok(None) => break, // Client disconnected
            Err(e) => {
                log::warn!("Failed to read request: {}", e);
                break;
            }
        };

        if let Err(e) = write_message(&mut writer, &reply) {
            log::warn!("Failed to write response: {}", e);
            break;
        }
    }
}

/// Handle for managing the socket server thread.
pub struct SocketServerHandle {
    path: PathBuf,
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl SocketServerHandle {
    /// Bind `path` and spawn the accept loop.
    pub fn spawn_at(
        path: &Path,
        ctx: Context,
        shutdown: Arc<AtomicBool>,
    ) -> std::io::Result<Self> {
        // Remove stale socket file
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        log::info!("Socket server listening on {}", path.display());

        let ctx = Arc::new(ctx);
        let socket_file = path.to_path_buf();
        let shutdown_clone = shutdown.clone();
        let thread = thread::Builder::new()
            .name("contentsync-socket".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    if shutdown_clone.load(Ordering::SeqCst) {
                        break;
                    }

                    match stream {
                        Ok(stream) => {
                            let ctx = Arc::clone(&ctx);
                            thread::spawn(move || handle_client(&ctx, stream));
                        }
                        Err(e) => {
                            if shutdown_clone.load(Ordering::SeqCst) {
                                break;
                            }
                            log::warn!("Failed to accept connection: {}", e);
                        }
                    }
                }

                let _ = std::fs::remove_file(&socket_file);
                log::info!("Socket server stopped");
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            thread: Some(thread),
            shutdown,
        })
    }

    /// Signal shutdown and wait for thread to exit.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        // Connect to the socket to unblock accept()
        let _ = UnixStream::connect(&self.path);

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SocketServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use crossbeam_channel::Receiver;
    use tempfile::TempDir;

    use crate::cli::{Client, ClientError};
    use crate::content::tests::item;
    use crate::content::{ContentParser, ContentSnapshot, ParseError};
    use crate::history::SyncHistory;
    use crate::invalidation::NoopRevalidator;
    use crate::protocol::{INVALID_PARAMS, METHOD_NOT_FOUND, RpcRequest, read_reply};
    use crate::sync::tests::FakeAccessor;
    use crate::sync::{SyncManager, SyncOutcome};

    struct FakeParser {
        calls: AtomicUsize,
    }

    impl ContentParser for FakeParser {
        fn parse_locale(
            &self,
            _root: &Path,
            locale: &Locale,
        ) -> Result<ContentSnapshot, ParseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ContentSnapshot::new(
                locale.clone(),
                vec![item("zoxide"), item("bat")],
                vec![],
                vec![],
                vec![],
                vec![],
            ))
        }
    }

    // Field order matters: the server must shut down before the tempdir
    // holding its socket is removed.
    struct Harness {
        server: SocketServerHandle,
        socket: PathBuf,
        stop_rx: Receiver<()>,
        parser: Arc<FakeParser>,
        _dir: TempDir,
    }

    fn start(with_history: bool) -> Harness {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("contentsync.sock");

        let history = with_history.then(|| {
            let history = SyncHistory::open_in_memory().unwrap();
            history.init().unwrap();
            Arc::new(history)
        });
        let manager = SyncManager::new(Arc::new(FakeAccessor::ok()), dir.path().join("mirror"));
        let sync = Arc::new(ManagedSync::new(Arc::new(manager), history));
        let scheduler = Arc::new(Scheduler::new(sync.clone(), Duration::from_secs(3600)));

        let parser = Arc::new(FakeParser {
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(ContentCache::new(
            dir.path().join("mirror"),
            parser.clone(),
            sync.clone(),
        ));
        let gateway = Arc::new(
            InvalidationGateway::new(cache.clone(), Arc::new(NoopRevalidator)).unwrap(),
        );

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let ctx = Context {
            sync,
            scheduler,
            cache,
            gateway,
            default_locale: Locale::default(),
            locales: vec![Locale::default(), "fr".parse().unwrap()],
            repo_url: "https://example.com/content.git".to_string(),
            branch: "main".to_string(),
            mirror_dir: dir.path().join("mirror").display().to_string(),
            start_time: Instant::now(),
            stop_tx,
        };
        let server =
            SocketServerHandle::spawn_at(&socket, ctx, Arc::new(AtomicBool::new(false))).unwrap();

        Harness {
            server,
            socket,
            stop_rx,
            parser,
            _dir: dir,
        }
    }

    #[test]
    fn sync_then_content_roundtrip() {
        let harness = start(true);
        let mut client = Client::connect_to(&harness.socket).unwrap();

        let status = client.status().unwrap();
        assert!(status.running);
        assert_eq!(status.sync.generation, 0);
        assert!(status.history_enabled);

        let result = client.sync().unwrap();
        assert_eq!(result.outcome, SyncOutcome::Synced);
        assert_eq!(result.generation, 1);

        let content = client.content(None).unwrap();
        assert_eq!(content.items, vec!["bat", "zoxide"]);
        let entry = content.entry.unwrap();
        assert_eq!(entry.generation, 1);
        assert!(entry.valid);

        // Served from cache.
        client.content(None).unwrap();
        assert_eq!(harness.parser.calls.load(Ordering::SeqCst), 1);

        let history = client.history(10).unwrap();
        assert_eq!(history.records.len(), 1);
        assert_eq!(history.records[0].generation, 1);
    }

    #[test]
    fn invalidate_reports_scope_paths() {
        let harness = start(false);
        let mut client = Client::connect_to(&harness.socket).unwrap();

        client.content(Some("fr".parse().unwrap())).unwrap();
        let result = client.invalidate(Some("fr".parse().unwrap())).unwrap();
        assert_eq!(result.paths, vec!["/fr"]);

        let content = client.content(Some("fr".parse().unwrap())).unwrap();
        assert!(content.entry.unwrap().valid);
        assert_eq!(harness.parser.calls.load(Ordering::SeqCst), 2);

        let global = client.invalidate(None).unwrap();
        assert_eq!(global.scope, InvalidationScope::Global);
        assert_eq!(global.paths, vec!["/"]);
    }

    #[test]
    fn history_disabled_is_an_rpc_error() {
        let harness = start(false);
        let mut client = Client::connect_to(&harness.socket).unwrap();

        match client.history(5) {
            Err(ClientError::Rpc(err)) => assert_eq!(err.code, -1),
            other => panic!("expected rpc error, got {:?}", other.map(|r| r.records.len())),
        }
        // Connection stays usable after an error response.
        assert_eq!(client.version().unwrap().pid, std::process::id());
    }

    #[test]
    fn stop_signals_daemon_loop() {
        let harness = start(false);
        let mut client = Client::connect_to(&harness.socket).unwrap();
        client.stop().unwrap();
        assert!(harness.stop_rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn shutdown_removes_socket_file() {
        let mut harness = start(false);
        assert!(harness.socket.exists());
        harness.server.shutdown();
        assert!(!harness.socket.exists());
        assert!(matches!(
            Client::connect_to(&harness.socket),
            Err(ClientError::NotRunning)
        ));
    }

    #[test]
    fn unconfigured_locale_is_rejected_before_the_cache() {
        let harness = start(false);
        let mut client = Client::connect_to(&harness.socket).unwrap();

        for locale in ["de", "xx-YY"] {
            match client.content(Some(locale.parse().unwrap())) {
                Err(ClientError::Rpc(err)) => assert_eq!(err.code, INVALID_PARAMS),
                other => panic!("expected rpc error, got {:?}", other.map(|r| r.items)),
            }
            assert!(matches!(
                client.invalidate(Some(locale.parse().unwrap())),
                Err(ClientError::Rpc(_))
            ));
        }

        assert_eq!(harness.parser.calls.load(Ordering::SeqCst), 0);
        assert!(client.status().unwrap().cache.is_empty());
    }

    #[test]
    fn malformed_line_gets_an_error_reply() {
        let harness = start(false);
        let stream = UnixStream::connect(&harness.socket).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut writer = &stream;

        writer.write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"reboot\",\"id\":3}\n").unwrap();
        let reply = read_reply(&mut reader).unwrap();
        assert_eq!(reply.id, 3);
        assert_eq!(reply.into_result().unwrap_err().code, METHOD_NOT_FOUND);

        // Same connection still serves requests.
        write_message(&mut writer, &RpcRequest::new(Request::Version, 4)).unwrap();
        let reply = read_reply(&mut reader).unwrap();
        assert!(matches!(reply.into_result(), Ok(Response::Version(_))));
    }
}
