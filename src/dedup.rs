//! "Seen before in this session" tracking for entity fingerprints.
//!
//! The [`Deduplicator`] is the only component that keeps state across poll
//! cycles. It owns a pluggable [`SeenStore`]: the in-memory map by default, or
//! the on-disk journal in [`crate::storage`] when fingerprints should survive
//! a restart.

use crate::hasher::Fingerprint;
use std::collections::HashMap;
use std::io;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SeenStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid journal format")]
    InvalidFormat,
    #[error("Version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u32, got: u32 },
}

/// Backing store for observed fingerprints.
///
/// Timestamps are POSIX seconds. A store is owned by exactly one
/// [`Deduplicator`]; implementations need no internal locking.
pub trait SeenStore: Send {
    /// Record an observation of `fingerprint` at `now`.
    ///
    /// Returns `true` when the fingerprint was not present. Observing a
    /// present fingerprint refreshes its last-seen time.
    fn observe(&mut self, fingerprint: Fingerprint, now: u64) -> Result<bool, SeenStoreError>;

    /// Drop a fingerprint so its next observation counts as new.
    fn forget(&mut self, fingerprint: &Fingerprint) -> Result<bool, SeenStoreError>;

    /// Drop every fingerprint last seen before `cutoff`.
    fn evict_older_than(&mut self, cutoff: u64) -> Result<usize, SeenStoreError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist pending changes. Called once at the end of every cycle.
    fn flush(&mut self) -> Result<(), SeenStoreError> {
        Ok(())
    }
}

/// Process-lifetime fingerprint set.
#[derive(Debug, Default)]
pub struct MemorySeenStore {
    seen: HashMap<Fingerprint, u64>,
}

impl MemorySeenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SeenStore for MemorySeenStore {
    fn observe(&mut self, fingerprint: Fingerprint, now: u64) -> Result<bool, SeenStoreError> {
        Ok(self.seen.insert(fingerprint, now).is_none())
    }

    fn forget(&mut self, fingerprint: &Fingerprint) -> Result<bool, SeenStoreError> {
        Ok(self.seen.remove(fingerprint).is_some())
    }

    fn evict_older_than(&mut self, cutoff: u64) -> Result<usize, SeenStoreError> {
        let before = self.seen.len();
        self.seen.retain(|_, last_seen| *last_seen >= cutoff);
        Ok(before - self.seen.len())
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Decides, per fingerprint, whether an entity is new.
///
/// Without a TTL the set only grows. With a TTL, fingerprints that have not
/// been observed for the whole TTL are evicted at the start of a cycle; an
/// entity the feed keeps republishing is refreshed on every observation and
/// is therefore never evicted while it is still being published.
pub struct Deduplicator {
    store: Box<dyn SeenStore>,
    ttl: Option<Duration>,
}

impl Deduplicator {
    pub fn new(store: Box<dyn SeenStore>) -> Self {
        Self { store, ttl: None }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemorySeenStore::new()))
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn ttl(&self) -> Option<Duration> {
        self.ttl
    }

    /// Number of fingerprints currently tracked.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Evict expired fingerprints. Returns how many were dropped.
    pub fn begin_cycle(&mut self, now: u64) -> usize {
        let Some(ttl) = self.ttl else {
            return 0;
        };

        let cutoff = now.saturating_sub(ttl.as_secs());
        match self.store.evict_older_than(cutoff) {
            Ok(evicted) => {
                if evicted > 0 {
                    tracing::debug!("Evicted {} fingerprints older than {:?}", evicted, ttl);
                }
                evicted
            }
            Err(e) => {
                tracing::warn!("Seen-set eviction failed: {}", e);
                0
            }
        }
    }

    /// Returns `true` the first time `fingerprint` is observed, and records it.
    ///
    /// A store failure counts the entity as new: the store then rejects a
    /// true duplicate on write because document ids are fingerprints.
    pub fn is_new(&mut self, fingerprint: Fingerprint, now: u64) -> bool {
        match self.store.observe(fingerprint, now) {
            Ok(new) => new,
            Err(e) => {
                tracing::warn!("Seen-set write failed for {}: {}", fingerprint, e);
                true
            }
        }
    }

    /// Forget a fingerprint so a later cycle may emit it again.
    pub fn forget(&mut self, fingerprint: &Fingerprint) {
        if let Err(e) = self.store.forget(fingerprint) {
            tracing::warn!("Seen-set forget failed for {}: {}", fingerprint, e);
        }
    }

    pub fn end_cycle(&mut self) {
        if let Err(e) = self.store.flush() {
            tracing::error!("Seen-set flush failed: {}", e);
        }
    }
}

impl std::fmt::Debug for Deduplicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deduplicator")
            .field("len", &self.store.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}
