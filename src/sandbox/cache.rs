//! Bounded, reference-counted cache of compiled filters.
//!
//! Every wrapped command holds a [`FilterLease`] on the filter it references
//! until its task is cleaned up. Leases are acquired under the cache lock and
//! released with a lock-free decrement; eviction (capacity pressure or an
//! explicit sweep) also runs under the cache lock and only ever removes
//! entries whose count is zero, least recently used first.
//!
//! Artifacts are persisted as `<dir>/<fingerprint>.json`. A valid artifact
//! already on disk (from an earlier run or another process) is reused
//! instead of recompiling.

use lru::LruCache;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use super::error::Result;
use super::filter::{CompiledFilter, FilterSpec, Fingerprint, artifact_path};
use crate::concurrency::StateLock;

pub const DEFAULT_FILTER_CACHE_CAPACITY: usize = 32;

/// On-disk artifacts no process has touched for this long are swept.
const ORPHAN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug)]
struct CacheEntry {
    filter: Arc<CompiledFilter>,
    refs: Arc<AtomicUsize>,
}

/// Keeps a cached filter (and its artifact file) alive.
#[derive(Debug)]
pub struct FilterLease {
    filter: Arc<CompiledFilter>,
    refs: Arc<AtomicUsize>,
    path: PathBuf,
}

impl FilterLease {
    pub fn filter(&self) -> &Arc<CompiledFilter> {
        &self.filter
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.filter.fingerprint
    }

    pub fn artifact_path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FilterLease {
    fn drop(&mut self) {
        self.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug)]
pub struct FilterCache {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
    capacity: usize,
    dir: PathBuf,
    lock: StateLock,
}

impl FilterCache {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let dir = dir.into();
        let lock = StateLock::in_dir(&dir)?;
        Ok(Self {
            entries: Mutex::new(LruCache::unbounded()),
            capacity: capacity.max(1),
            dir,
            lock,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<Fingerprint, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the filter for `spec`, compiling it on a miss, and take a
    /// reference on it.
    pub fn acquire(&self, spec: &FilterSpec) -> Result<FilterLease> {
        let fingerprint = spec.fingerprint();

        if let Some(lease) = self.lease_cached(&fingerprint) {
            return Ok(lease);
        }

        // Compile (or load) outside the lock; a concurrent miss for the same
        // fingerprint produces an identical artifact, and the first insert wins.
        let filter = Arc::new(self.load_or_compile(spec, &fingerprint)?);

        let mut entries = self.entries();
        let entry = entries.get_or_insert(fingerprint.clone(), || CacheEntry {
            filter,
            refs: Arc::new(AtomicUsize::new(0)),
        });
        entry.refs.fetch_add(1, Ordering::AcqRel);
        let lease = FilterLease {
            filter: entry.filter.clone(),
            refs: entry.refs.clone(),
            path: artifact_path(&self.dir, &fingerprint),
        };
        self.evict_over_capacity(&mut entries);
        Ok(lease)
    }

    /// Compile and persist `spec` without holding a reference, so the first
    /// command using it skips compilation.
    pub fn prepare(&self, spec: &FilterSpec) -> Result<Fingerprint> {
        let lease = self.acquire(spec)?;
        Ok(lease.fingerprint().clone())
    }

    fn lease_cached(&self, fingerprint: &Fingerprint) -> Option<FilterLease> {
        let mut entries = self.entries();
        let entry = entries.get(fingerprint)?;
        entry.refs.fetch_add(1, Ordering::AcqRel);
        Some(FilterLease {
            filter: entry.filter.clone(),
            refs: entry.refs.clone(),
            path: artifact_path(&self.dir, fingerprint),
        })
    }

    fn load_or_compile(&self, spec: &FilterSpec, fingerprint: &Fingerprint) -> Result<CompiledFilter> {
        let path = artifact_path(&self.dir, fingerprint);

        if path.exists() {
            match CompiledFilter::load(&path) {
                Ok(filter) if filter.verify().is_ok() && &filter.spec == spec => {
                    debug!(fingerprint = fingerprint.short(), "reusing filter artifact");
                    return Ok(filter);
                }
                Ok(_) => debug!(fingerprint = fingerprint.short(), "stale filter artifact"),
                Err(e) => debug!(fingerprint = fingerprint.short(), "unreadable filter artifact: {}", e),
            }
        }

        let filter = CompiledFilter::compile(spec)?;
        let _guard = self.lock.acquire()?;
        filter.store(&path)?;
        debug!(fingerprint = fingerprint.short(), "compiled filter");
        Ok(filter)
    }

    /// Drop least recently used zero-reference entries until within capacity.
    fn evict_over_capacity(&self, entries: &mut LruCache<Fingerprint, CacheEntry>) {
        if entries.len() <= self.capacity {
            return;
        }
        let excess = entries.len() - self.capacity;
        let victims: Vec<Fingerprint> = entries
            .iter()
            .rev()
            .filter(|(_, entry)| entry.refs.load(Ordering::Acquire) == 0)
            .map(|(fp, _)| fp.clone())
            .take(excess)
            .collect();

        if victims.len() < excess {
            debug!(
                len = entries.len(),
                capacity = self.capacity,
                "filter cache over capacity; remaining entries are in use"
            );
        }
        self.remove_entries(entries, &victims);
    }

    fn remove_entries(&self, entries: &mut LruCache<Fingerprint, CacheEntry>, victims: &[Fingerprint]) {
        if victims.is_empty() {
            return;
        }
        let _guard = match self.lock.acquire() {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!("Failed to lock filter directory: {}", e);
                None
            }
        };
        for fingerprint in victims {
            entries.pop(fingerprint);
            let path = artifact_path(&self.dir, fingerprint);
            if let Err(e) = fs::remove_file(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                warn!("Failed to remove filter artifact {}: {}", path.display(), e);
            }
        }
    }

    /// Evict every zero-reference entry except `keep`, plus artifacts on
    /// disk that no cache has touched for a day. Returns the number of
    /// in-memory entries removed.
    pub fn sweep(&self, keep: Option<&Fingerprint>) -> usize {
        let mut entries = self.entries();
        let victims: Vec<Fingerprint> = entries
            .iter()
            .filter(|(fp, entry)| Some(*fp) != keep && entry.refs.load(Ordering::Acquire) == 0)
            .map(|(fp, _)| fp.clone())
            .collect();
        self.remove_entries(&mut entries, &victims);

        let live: Vec<PathBuf> = entries
            .iter()
            .map(|(fp, _)| artifact_path(&self.dir, fp))
            .collect();
        drop(entries);
        self.sweep_orphans(&live);

        victims.len()
    }

    fn sweep_orphans(&self, live: &[PathBuf]) {
        let Ok(read_dir) = fs::read_dir(&self.dir) else {
            return;
        };
        let Ok(_guard) = self.lock.acquire() else {
            return;
        };
        let now = SystemTime::now();
        for entry in read_dir.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") || live.contains(&path) {
                continue;
            }
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > ORPHAN_TTL);
            if stale && fs::remove_file(&path).is_ok() {
                debug!("removed orphaned filter artifact {}", path.display());
            }
        }
    }

    /// Current reference count, if cached.
    pub fn refs(&self, fingerprint: &Fingerprint) -> Option<usize> {
        self.entries()
            .peek(fingerprint)
            .map(|entry| entry.refs.load(Ordering::Acquire))
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.entries().contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Forget in-memory entries. Outstanding leases stay valid; artifacts on
    /// disk are kept for reuse.
    pub fn clear(&self) {
        self.entries().clear();
    }
}
