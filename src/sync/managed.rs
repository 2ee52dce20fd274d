//! Sync manager that integrates with the SQLite history log.

use std::sync::Arc;

use crate::history::{DEFAULT_RETENTION, SyncHistory};
use crate::types::SyncReason;

use super::{GenerationSource, SyncManager, SyncResult, SyncState, SyncTrigger};

/// Wraps a [`SyncManager`] and records every completed attempt in the
/// history database, keeping only the newest `retention` rows. Recording
/// failures are logged and otherwise ignored.
pub struct ManagedSync {
    sync: Arc<SyncManager>,
    history: Option<Arc<SyncHistory>>,
    retention: usize,
}

impl ManagedSync {
    pub fn new(sync: Arc<SyncManager>, history: Option<Arc<SyncHistory>>) -> Self {
        Self {
            sync,
            history,
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    pub fn manager(&self) -> &Arc<SyncManager> {
        &self.sync
    }

    pub fn history(&self) -> Option<&Arc<SyncHistory>> {
        self.history.as_ref()
    }

    pub fn request_sync(&self, reason: SyncReason) -> SyncResult {
        let result = self.sync.request_sync(reason);
        if let Some(history) = &self.history {
            match history.record(&result) {
                Ok(Some(_)) => {
                    if let Err(e) = history.prune(self.retention) {
                        log::warn!("Failed to prune sync history: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("Failed to record sync in history: {}", e),
            }
        }
        result
    }

    pub fn status(&self) -> SyncState {
        self.sync.status()
    }
}

impl SyncTrigger for ManagedSync {
    fn request_sync(&self, reason: SyncReason) -> SyncResult {
        ManagedSync::request_sync(self, reason)
    }
}

impl GenerationSource for ManagedSync {
    fn current_generation(&self) -> u64 {
        self.sync.current_generation()
    }
}
