//! Poll loop driving fetch, decode, dedupe, transform and index.
//!
//! One cycle runs to completion before the next starts, so the
//! [`Deduplicator`] is only ever touched from a single task.

use crate::client::{FeedSource, FetchError};
use crate::dedup::Deduplicator;
use crate::hasher::{self, Fingerprint, Fingerprinted};
use crate::indexer::{BatchResult, Indexer};
use crate::protocol::{self, DecodeError};
use crate::transform::{self, OutputDocument};
use crate::types::VehiclePositionEntity;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("Cycle interrupted by shutdown")]
    Cancelled,
}

/// Where the poll loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Fetching,
    Decoding,
    Filtering,
    Transforming,
    Indexing,
    Sleeping,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What happens to a fingerprint whose document could not be written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The fingerprint stays seen; the document is lost.
    #[default]
    AtMostOnce,
    /// The fingerprint is forgotten so the next cycle re-emits the entity.
    AtLeastOnce,
}

/// Statistics for the scheduler.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub cycles: AtomicU64,
    pub fetch_errors: AtomicU64,
    pub decode_errors: AtomicU64,
    pub bytes_received: AtomicU64,
    pub entities_received: AtomicU64,
    pub entities_skipped: AtomicU64,
    pub duplicates: AtomicU64,
    pub documents_emitted: AtomicU64,
    pub documents_indexed: AtomicU64,
    pub documents_rejected: AtomicU64,
    pub documents_failed: AtomicU64,
    pub last_cycle_ms: AtomicU64,
}

impl SchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            entities_received: self.entities_received.load(Ordering::Relaxed),
            entities_skipped: self.entities_skipped.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            documents_emitted: self.documents_emitted.load(Ordering::Relaxed),
            documents_indexed: self.documents_indexed.load(Ordering::Relaxed),
            documents_rejected: self.documents_rejected.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_ms.load(Ordering::Relaxed),
        }
    }

    fn record(&self, report: &CycleReport) {
        self.bytes_received
            .fetch_add(report.bytes as u64, Ordering::Relaxed);
        self.entities_received
            .fetch_add(report.entities as u64, Ordering::Relaxed);
        self.entities_skipped
            .fetch_add(report.skipped as u64, Ordering::Relaxed);
        self.duplicates
            .fetch_add(report.duplicates as u64, Ordering::Relaxed);
        self.documents_emitted
            .fetch_add(report.emitted as u64, Ordering::Relaxed);
        self.documents_indexed
            .fetch_add(report.batch.indexed() as u64, Ordering::Relaxed);
        self.documents_rejected
            .fetch_add(report.batch.rejected() as u64, Ordering::Relaxed);
        self.documents_failed
            .fetch_add(report.batch.failed() as u64, Ordering::Relaxed);
        self.last_cycle_ms
            .store(report.elapsed.as_millis() as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub fetch_errors: u64,
    pub decode_errors: u64,
    pub bytes_received: u64,
    pub entities_received: u64,
    pub entities_skipped: u64,
    pub duplicates: u64,
    pub documents_emitted: u64,
    pub documents_indexed: u64,
    pub documents_rejected: u64,
    pub documents_failed: u64,
    pub last_cycle_ms: u64,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub bytes: usize,
    /// Entities decoded from the feed.
    pub entities: usize,
    pub skipped: usize,
    pub duplicates: usize,
    /// Documents handed to the indexer.
    pub emitted: usize,
    pub evicted: usize,
    pub batch: BatchResult,
    pub elapsed: Duration,
}

/// Configuration for the scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Sleep between cycles
    pub interval: Duration,
    /// Upper bound for the sleep after failing cycles; `None` keeps it fixed
    pub max_interval: Option<Duration>,
    pub delivery_mode: DeliveryMode,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_interval: None,
            delivery_mode: DeliveryMode::AtMostOnce,
        }
    }
}

impl SchedulerConfig {
    /// Sleep after a cycle, given the previous sleep and how the cycle went.
    fn next_wait(&self, previous: Duration, healthy: bool, retry_after: Option<Duration>) -> Duration {
        let wait = match (healthy, self.max_interval) {
            (false, Some(max)) => previous.saturating_mul(2).clamp(self.interval, max.max(self.interval)),
            _ => self.interval,
        };
        match retry_after {
            Some(at_least) => wait.max(at_least),
            None => wait,
        }
    }
}

/// The poll loop.
pub struct Scheduler<S, I> {
    source: S,
    indexer: I,
    dedup: Deduplicator,
    config: SchedulerConfig,
    stats: Arc<SchedulerStats>,
    state: Arc<RwLock<SchedulerState>>,
}

impl<S: FeedSource, I: Indexer> Scheduler<S, I> {
    pub fn new(source: S, indexer: I, dedup: Deduplicator, config: SchedulerConfig) -> Self {
        Self {
            source,
            indexer,
            dedup,
            config,
            stats: Arc::new(SchedulerStats::new()),
            state: Arc::new(RwLock::new(SchedulerState::Idle)),
        }
    }

    /// Get a reference to the scheduler stats.
    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.read()
    }

    /// Shared view of the state for observers on other tasks.
    pub fn state_handle(&self) -> Arc<RwLock<SchedulerState>> {
        Arc::clone(&self.state)
    }

    pub fn dedup(&self) -> &Deduplicator {
        &self.dedup
    }

    fn set_state(&self, next: SchedulerState) {
        let previous = std::mem::replace(&mut *self.state.write(), next);
        if previous != next {
            tracing::debug!("Scheduler {} -> {}", previous, next);
        }
    }

    /// Move to `next`, unless shutdown was requested.
    fn enter(&self, next: SchedulerState, cancel: &CancellationToken) -> Result<(), CycleError> {
        if cancel.is_cancelled() {
            return Err(CycleError::Cancelled);
        }
        self.set_state(next);
        Ok(())
    }

    /// Run a single cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, CycleError> {
        self.cycle(&CancellationToken::new()).await
    }

    /// Poll until `cancel` fires.
    ///
    /// A failed cycle is logged and followed by the usual sleep; nothing a
    /// cycle does can end the loop.
    pub async fn run(&mut self, cancel: CancellationToken) {
        let mut wait = self.config.interval;

        tracing::info!(
            "Scheduler started (interval {:?}, delivery {:?})",
            self.config.interval,
            self.config.delivery_mode
        );

        while !cancel.is_cancelled() {
            let (healthy, retry_after) = match self.cycle(&cancel).await {
                Ok(report) => {
                    tracing::info!(
                        "Cycle: {} entities, {} skipped, {} duplicates, {} emitted ({}) in {:?}",
                        report.entities,
                        report.skipped,
                        report.duplicates,
                        report.emitted,
                        report.batch,
                        report.elapsed
                    );
                    (!report.batch.is_total_failure(), None)
                }
                Err(CycleError::Cancelled) => break,
                Err(CycleError::Fetch(FetchError::RateLimited { retry_after })) => {
                    tracing::warn!("Feed rate limited, retry after {:?}", retry_after);
                    (false, retry_after)
                }
                Err(e) => {
                    tracing::error!("Cycle failed: {}", e);
                    (false, None)
                }
            };

            wait = self.config.next_wait(wait, healthy, retry_after);
            if !healthy && wait > self.config.interval {
                tracing::warn!("Backing off, next cycle in {:?}", wait);
            }

            if self.enter(SchedulerState::Sleeping, &cancel).is_err() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }

        self.dedup.end_cycle();
        self.set_state(SchedulerState::Stopped);
        tracing::info!("Scheduler stopped");
    }

    async fn cycle(&mut self, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
        let start = Instant::now();
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);

        self.enter(SchedulerState::Fetching, cancel)?;
        let data = self.source.fetch().await.map_err(|e| {
            self.stats.fetch_errors.fetch_add(1, Ordering::Relaxed);
            e
        })?;

        self.enter(SchedulerState::Decoding, cancel)?;
        let feed = protocol::decode(&data).map_err(|e| {
            self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            e
        })?;

        let mut report = CycleReport {
            bytes: data.len(),
            entities: feed.entities.len(),
            skipped: feed.skipped.len(),
            ..Default::default()
        };

        self.enter(SchedulerState::Filtering, cancel)?;
        let now = Utc::now();
        let now_secs = u64::try_from(now.timestamp()).unwrap_or(0);
        report.evicted = self.dedup.begin_cycle(now_secs);
        let novel = self.filter(feed.entities, now_secs, &mut report);

        // Past this point the seen set already holds this cycle's fingerprints
        let observed: Vec<Fingerprint> = novel.iter().map(|(_, fp)| fp.fingerprint).collect();
        self.enter_or_abandon(SchedulerState::Transforming, cancel, &observed)?;
        let documents: Vec<OutputDocument> = novel
            .into_iter()
            .map(|(entity, fp)| transform::transform(entity, fp, now))
            .collect();
        report.emitted = documents.len();

        self.enter_or_abandon(SchedulerState::Indexing, cancel, &observed)?;
        if !documents.is_empty() {
            report.batch = self.indexer.index_batch(&documents).await;
        }

        if self.config.delivery_mode == DeliveryMode::AtLeastOnce {
            let fingerprints: HashMap<String, Fingerprint> =
                observed.iter().map(|fp| (fp.to_hex(), *fp)).collect();
            for id in report.batch.failed_ids() {
                if let Some(fp) = fingerprints.get(id) {
                    self.dedup.forget(fp);
                }
            }
        }
        self.dedup.end_cycle();

        report.elapsed = start.elapsed();
        self.stats.record(&report);
        Ok(report)
    }

    fn filter(
        &mut self,
        entities: Vec<VehiclePositionEntity>,
        now: u64,
        report: &mut CycleReport,
    ) -> Vec<(VehiclePositionEntity, Fingerprinted)> {
        let mut novel = Vec::with_capacity(entities.len());

        for entity in entities {
            let fingerprinted = match hasher::fingerprint(&entity) {
                Ok(fp) => fp,
                Err(e) => {
                    tracing::warn!("Skipping entity {}: cannot fingerprint: {}", entity.id, e);
                    report.skipped += 1;
                    continue;
                }
            };

            if self.dedup.is_new(fingerprinted.fingerprint, now) {
                novel.push((entity, fingerprinted));
            } else {
                report.duplicates += 1;
            }
        }

        novel
    }

    /// Like [`enter`](Self::enter), but forgets `observed` when shutdown
    /// interrupts the cycle.
    fn enter_or_abandon(
        &mut self,
        next: SchedulerState,
        cancel: &CancellationToken,
        observed: &[Fingerprint],
    ) -> Result<(), CycleError> {
        let result = self.enter(next, cancel);
        if result.is_err() {
            for fp in observed {
                self.dedup.forget(fp);
            }
            tracing::debug!(
                "Abandoned cycle before {}, forgot {} fingerprints",
                next,
                observed.len()
            );
        }
        result
    }
}
