//! Read-through, generation-checked content cache.
//!
//! Entries are keyed by locale. An entry is served while its generation
//! matches the sync manager's and no invalidation covering its locale has
//! happened since its build started. Otherwise the next read rebuilds it.
//! Concurrent rebuilds of one locale are coalesced into a single parse;
//! different locales build independently.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{ContentParser, ContentSnapshot, ContentSummary, ParseError};
use crate::sync::GenerationSource;
use crate::types::{Locale, Timestamp, now_millis};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// The build leader panicked before producing a result.
    #[error("content build for {0} panicked")]
    BuildPanicked(Locale),
}

/// A parsed snapshot tagged with the generation it was built against.
/// Replaced on rebuild, never mutated.
#[derive(Debug)]
pub struct CacheEntry {
    pub snapshot: Arc<ContentSnapshot>,
    pub generation: u64,
    pub loaded_at: Timestamp,
    global_epoch: u64,
    locale_epoch: u64,
}

/// Inspection view of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryInfo {
    pub locale: Locale,
    pub generation: u64,
    pub loaded_at: Timestamp,
    /// Whether the next `get` would be served from this entry.
    pub valid: bool,
    pub summary: ContentSummary,
}

type BuildResult = Result<Arc<ContentSnapshot>, CacheError>;

/// One in-flight build that callers for the same locale wait on.
#[derive(Default)]
struct Flight {
    result: Mutex<Option<BuildResult>>,
    done: Condvar,
}

impl Flight {
    fn complete(&self, result: BuildResult) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
        self.done.notify_all();
    }

    fn wait(&self) -> BuildResult {
        let mut slot = self.result.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            slot = self.done.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Completes and unregisters a flight when the leader leaves `get`, with an
/// error if it is unwinding.
struct FlightGuard<'a> {
    flights: &'a DashMap<Locale, Arc<Flight>>,
    locale: &'a Locale,
    flight: Arc<Flight>,
    finished: bool,
}

impl FlightGuard<'_> {
    fn finish(mut self, result: BuildResult) {
        self.flights.remove(self.locale);
        self.flight.complete(result);
        self.finished = true;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.flights.remove(self.locale);
            self.flight
                .complete(Err(CacheError::BuildPanicked(self.locale.clone())));
        }
    }
}

/// Per-locale content cache over one working copy.
pub struct ContentCache {
    root: PathBuf,
    parser: Arc<dyn ContentParser>,
    generations: Arc<dyn GenerationSource>,
    entries: DashMap<Locale, Arc<CacheEntry>>,
    flights: DashMap<Locale, Arc<Flight>>,
    global_epoch: AtomicU64,
    locale_epochs: DashMap<Locale, u64>,
}

impl ContentCache {
    pub fn new(
        root: impl Into<PathBuf>,
        parser: Arc<dyn ContentParser>,
        generations: Arc<dyn GenerationSource>,
    ) -> Self {
        Self {
            root: root.into(),
            parser,
            generations,
            entries: DashMap::new(),
            flights: DashMap::new(),
            global_epoch: AtomicU64::new(0),
            locale_epochs: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Snapshot for `locale`, building it if missing, stale or invalidated.
    ///
    /// If a rebuild fails to parse and an older snapshot exists it is
    /// returned instead; the failure itself is never cached.
    pub fn get(&self, locale: &Locale) -> Result<Arc<ContentSnapshot>, CacheError> {
        if let Some(snapshot) = self.fresh(locale) {
            return Ok(snapshot);
        }

        let flight = match self.flights.entry(locale.clone()) {
            Entry::Occupied(existing) => {
                let flight = Arc::clone(existing.get());
                drop(existing);
                log::debug!("Waiting for in-flight build of {}", locale);
                return flight.wait();
            }
            Entry::Vacant(slot) => {
                let flight = Arc::new(Flight::default());
                slot.insert(Arc::clone(&flight));
                flight
            }
        };

        let guard = FlightGuard {
            flights: &self.flights,
            locale,
            flight,
            finished: false,
        };

        // A previous leader may have stored a valid entry between our first
        // check and registering this flight.
        let result = match self.fresh(locale) {
            Some(snapshot) => Ok(snapshot),
            None => self.build(locale),
        };
        guard.finish(result.clone());
        result
    }

    /// Mark one locale, or every locale, as needing a rebuild.
    ///
    /// The snapshot is not dropped: the next [`get`](Self::get) rebuilds it,
    /// and if that rebuild fails to parse, the invalidated snapshot is still
    /// served (and the error logged). Only a locale that never built
    /// successfully surfaces the parse error.
    ///
    /// Every distinct locale passed here keeps an epoch slot for the life of
    /// the cache, so callers should only pass configured locales.
    pub fn invalidate(&self, locale: Option<&Locale>) {
        match locale {
            Some(locale) => {
                *self.locale_epochs.entry(locale.clone()).or_insert(0) += 1;
                log::debug!("Invalidated content cache for {}", locale);
            }
            None => {
                self.global_epoch.fetch_add(1, Ordering::AcqRel);
                log::debug!("Invalidated content cache for all locales");
            }
        }
    }

    /// Describe the entry for `locale` without building it.
    pub fn peek(&self, locale: &Locale) -> Option<EntryInfo> {
        let entry = self.entry(locale)?;
        Some(self.info(locale.clone(), &entry))
    }

    /// Describe every cached entry, ordered by locale.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let mut infos: Vec<EntryInfo> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect::<Vec<_>>()
            .into_iter()
            .map(|(locale, entry)| self.info(locale, &entry))
            .collect();
        infos.sort_by(|a, b| a.locale.cmp(&b.locale));
        infos
    }

    /// Build `locales` eagerly. Returns how many are now available.
    pub fn warm(&self, locales: &[Locale]) -> usize {
        locales
            .iter()
            .filter(|locale| match self.get(locale) {
                Ok(_) => true,
                Err(e) => {
                    log::warn!("Could not warm content cache for {}: {}", locale, e);
                    false
                }
            })
            .count()
    }

    fn entry(&self, locale: &Locale) -> Option<Arc<CacheEntry>> {
        self.entries.get(locale).map(|e| Arc::clone(e.value()))
    }

    fn fresh(&self, locale: &Locale) -> Option<Arc<ContentSnapshot>> {
        let entry = self.entry(locale)?;
        self.is_valid(locale, &entry)
            .then(|| Arc::clone(&entry.snapshot))
    }

    fn is_valid(&self, locale: &Locale, entry: &CacheEntry) -> bool {
        entry.generation == self.generations.current_generation()
            && entry.global_epoch == self.global_epoch.load(Ordering::Acquire)
            && entry.locale_epoch == self.locale_epoch(locale)
    }

    fn locale_epoch(&self, locale: &Locale) -> u64 {
        self.locale_epochs.get(locale).map(|e| *e).unwrap_or(0)
    }

    fn info(&self, locale: Locale, entry: &CacheEntry) -> EntryInfo {
        EntryInfo {
            valid: self.is_valid(&locale, entry),
            locale,
            generation: entry.generation,
            loaded_at: entry.loaded_at,
            summary: entry.snapshot.summary(),
        }
    }

    fn build(&self, locale: &Locale) -> BuildResult {
        // Captured before parsing: the entry is never tagged ahead of the
        // data it was built from, and a racing invalidation is not lost.
        let generation = self.generations.current_generation();
        let global_epoch = self.global_epoch.load(Ordering::Acquire);
        let locale_epoch = self.locale_epoch(locale);

        match self.parser.parse_locale(&self.root, locale) {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.entries.insert(
                    locale.clone(),
                    Arc::new(CacheEntry {
                        snapshot: Arc::clone(&snapshot),
                        generation,
                        loaded_at: now_millis(),
                        global_epoch,
                        locale_epoch,
                    }),
                );
                log::info!(
                    "Built content for {} at generation {} ({} items)",
                    locale,
                    generation,
                    snapshot.items().len()
                );
                Ok(snapshot)
            }
            Err(e) => match self.entry(locale) {
                Some(previous) => {
                    log::warn!(
                        "Content rebuild for {} failed, serving generation {}: {}",
                        locale,
                        previous.generation,
                        e
                    );
                    Ok(Arc::clone(&previous.snapshot))
                }
                None => {
                    log::warn!("Content build for {} failed: {}", locale, e);
                    Err(e.into())
                }
            },
        }
    }
}
