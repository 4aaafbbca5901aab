//! On-disk journal of seen fingerprints.
//!
//! Lets a restarted collector keep skipping entities it already emitted.
//!
//! # File Format
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │ Header (64 bytes)                    │
//! │  - Magic: "TGZ-SEEN"                │
//! │  - Version: u32                      │
//! │  - Record size: u32                  │
//! │  - Reserved                          │
//! ├─────────────────────────────────────┤
//! │ Records (40 bytes each, append-only) │
//! │  - SHA-256 digest: [u8; 32]          │
//! │  - Last seen (unix seconds): u64     │
//! └─────────────────────────────────────┘
//! ```
//!
//! Every observation is appended, new or refreshed; on load the last record
//! for a digest wins. Evictions and forgets live in memory until the next
//! compaction, which rewrites the file through a temporary file and an atomic
//! rename. A flush compacts when there are unpersisted removals or when
//! superseded records outnumber live ones.

use crate::dedup::{SeenStore, SeenStoreError};
use crate::hasher::Fingerprint;
use bytemuck::{Pod, Zeroable};
use memmap2::MmapOptions;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const JOURNAL_MAGIC: &[u8; 8] = b"TGZ-SEEN";
const CURRENT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 64;
/// Journals below this many records are never compacted just for size.
const MIN_COMPACT_RECORDS: usize = 512;

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct JournalHeader {
    magic: [u8; 8],
    version: u32,
    record_size: u32,
    _reserved: [u8; 48],
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct SeenRecord {
    digest: [u8; 32],
    last_seen: u64,
}

impl SeenRecord {
    const SIZE: usize = std::mem::size_of::<Self>();
}

impl JournalHeader {
    fn current() -> Self {
        Self {
            magic: *JOURNAL_MAGIC,
            version: CURRENT_VERSION,
            record_size: SeenRecord::SIZE as u32,
            _reserved: [0; 48],
        }
    }
}

/// Restart-safe [`SeenStore`] backed by an append-only journal.
pub struct JournalSeenStore {
    path: PathBuf,
    seen: HashMap<Fingerprint, u64>,
    writer: BufWriter<File>,
    /// Records in the file, superseded ones included.
    records: usize,
    /// Removals not yet reflected in the file.
    dirty: bool,
}

impl JournalSeenStore {
    /// Open or create the journal at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SeenStoreError> {
        let path = path.as_ref().to_path_buf();
        let (seen, records) = Self::load(&path)?;

        let file = OpenOptions::new().append(true).open(&path)?;

        tracing::info!(
            "Opened seen journal {} with {} fingerprints",
            path.display(),
            seen.len()
        );

        Ok(Self {
            path,
            seen,
            writer: BufWriter::new(file),
            records,
            dirty: false,
        })
    }

    fn load(path: &Path) -> Result<(HashMap<Fingerprint, u64>, usize), SeenStoreError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let file_len = file.metadata()?.len() as usize;
        if file_len == 0 {
            let mut file = file;
            file.write_all(bytemuck::bytes_of(&JournalHeader::current()))?;
            file.sync_all()?;
            return Ok((HashMap::new(), 0));
        }

        if file_len < HEADER_SIZE {
            return Err(SeenStoreError::InvalidFormat);
        }

        let mmap = unsafe { MmapOptions::new().map(&file)? };

        let header: JournalHeader = bytemuck::pod_read_unaligned(&mmap[..HEADER_SIZE]);
        if header.magic != *JOURNAL_MAGIC {
            return Err(SeenStoreError::InvalidFormat);
        }
        if header.version != CURRENT_VERSION {
            return Err(SeenStoreError::VersionMismatch {
                expected: CURRENT_VERSION,
                got: header.version,
            });
        }
        if header.record_size as usize != SeenRecord::SIZE {
            return Err(SeenStoreError::InvalidFormat);
        }

        let body = &mmap[HEADER_SIZE..];
        let records = body.len() / SeenRecord::SIZE;
        let mut seen = HashMap::with_capacity(records);
        for chunk in body.chunks_exact(SeenRecord::SIZE) {
            let record: SeenRecord = bytemuck::pod_read_unaligned(chunk);
            seen.insert(Fingerprint::from_bytes(record.digest), record.last_seen);
        }

        // A crash mid-append leaves a partial record behind
        let torn = body.len() % SeenRecord::SIZE;
        if torn != 0 {
            drop(mmap);
            let valid_len = (file_len - torn) as u64;
            tracing::warn!(
                "Truncating {} torn bytes from seen journal {}",
                torn,
                path.display()
            );
            file.set_len(valid_len)?;
        }

        Ok((seen, records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the journal with exactly the in-memory entries.
    pub fn compact(&mut self) -> Result<(), SeenStoreError> {
        self.writer.flush()?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            tmp.write_all(bytemuck::bytes_of(&JournalHeader::current()))?;
            for (fingerprint, last_seen) in &self.seen {
                let record = SeenRecord {
                    digest: *fingerprint.as_bytes(),
                    last_seen: *last_seen,
                };
                tmp.write_all(bytemuck::bytes_of(&record))?;
            }
            let file = tmp.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.records = self.seen.len();
        self.dirty = false;

        tracing::debug!(
            "Compacted seen journal to {} fingerprints",
            self.seen.len()
        );
        Ok(())
    }

    fn append(&mut self, fingerprint: &Fingerprint, last_seen: u64) -> Result<(), SeenStoreError> {
        let record = SeenRecord {
            digest: *fingerprint.as_bytes(),
            last_seen,
        };
        self.writer.write_all(bytemuck::bytes_of(&record))?;
        self.records += 1;
        Ok(())
    }

    fn needs_compaction(&self) -> bool {
        self.dirty || self.records > 2 * self.seen.len().max(MIN_COMPACT_RECORDS)
    }
}

impl SeenStore for JournalSeenStore {
    fn observe(&mut self, fingerprint: Fingerprint, now: u64) -> Result<bool, SeenStoreError> {
        let new = self.seen.insert(fingerprint, now).is_none();
        self.append(&fingerprint, now)?;
        Ok(new)
    }

    fn forget(&mut self, fingerprint: &Fingerprint) -> Result<bool, SeenStoreError> {
        let removed = self.seen.remove(fingerprint).is_some();
        self.dirty |= removed;
        Ok(removed)
    }

    fn evict_older_than(&mut self, cutoff: u64) -> Result<usize, SeenStoreError> {
        let before = self.seen.len();
        self.seen.retain(|_, last_seen| *last_seen >= cutoff);
        let evicted = before - self.seen.len();
        if evicted > 0 {
            self.compact()?;
        }
        Ok(evicted)
    }

    fn len(&self) -> usize {
        self.seen.len()
    }

    fn flush(&mut self) -> Result<(), SeenStoreError> {
        if self.needs_compaction() {
            return self.compact();
        }
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }
}

impl Drop for JournalSeenStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!("Final seen journal sync failed: {}", e);
        }
    }
}
