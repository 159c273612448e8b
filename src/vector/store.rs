// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Canonical embedding storage
//!
//! The store is the source of truth; ANN indexes are derived from it and
//! can always be rebuilt from a scan. Records are keyed by `(id, modality)`
//! so one document may carry an embedding per modality under the same id.
//!
//! Two backends:
//! - [`MemoryVectorStore`]: process-local map, used in tests and when no
//!   data directory is configured
//! - [`FileVectorStore`]: append-only JSON-lines log replayed on open

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::errors::{RetrievalError, RetrievalResult};
use crate::vector::types::{EmbeddingRecord, IndexKey, Modality, VectorId};

const LOG_FILE: &str = "records.log";

type RecordMap = BTreeMap<(VectorId, Modality), EmbeddingRecord>;

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the record for `(record.id, record.modality)`.
    /// Returns the record it replaced.
    async fn put(&self, record: EmbeddingRecord) -> RetrievalResult<Option<EmbeddingRecord>>;

    /// Delete every record for `id`, or only the one in `modality`.
    /// Returns what was removed; empty when nothing matched.
    async fn delete(
        &self,
        id: &str,
        modality: Option<Modality>,
    ) -> RetrievalResult<Vec<EmbeddingRecord>>;

    async fn get(&self, id: &str, modality: Modality) -> RetrievalResult<Option<EmbeddingRecord>>;

    /// All records belonging to one index
    async fn scan(&self, key: &IndexKey) -> RetrievalResult<Vec<EmbeddingRecord>>;

    /// Every index key that has at least one record
    async fn keys(&self) -> RetrievalResult<Vec<IndexKey>>;

    async fn len(&self) -> RetrievalResult<usize>;
}

fn remove_matching(
    records: &mut RecordMap,
    id: &str,
    modality: Option<Modality>,
) -> Vec<EmbeddingRecord> {
    let targets: Vec<Modality> = match modality {
        Some(m) => vec![m],
        None => Modality::ALL.to_vec(),
    };
    targets
        .into_iter()
        .filter_map(|m| records.remove(&(id.to_string(), m)))
        .collect()
}

fn scan_matching(records: &RecordMap, key: &IndexKey) -> Vec<EmbeddingRecord> {
    records
        .values()
        .filter(|r| r.modality == key.modality && r.collection == key.collection)
        .cloned()
        .collect()
}

fn distinct_keys(records: &RecordMap) -> Vec<IndexKey> {
    let mut keys: Vec<IndexKey> = records.values().map(|r| r.index_key()).collect();
    keys.sort();
    keys.dedup();
    keys
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryVectorStore {
    records: Arc<RwLock<RecordMap>>,
    unavailable: AtomicBool,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreUnavailable` (test hook)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> RetrievalResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RetrievalError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn put(&self, record: EmbeddingRecord) -> RetrievalResult<Option<EmbeddingRecord>> {
        self.check_available()?;
        let mut records = self.records.write().await;
        Ok(records.insert((record.id.clone(), record.modality), record))
    }

    async fn delete(
        &self,
        id: &str,
        modality: Option<Modality>,
    ) -> RetrievalResult<Vec<EmbeddingRecord>> {
        self.check_available()?;
        let mut records = self.records.write().await;
        Ok(remove_matching(&mut records, id, modality))
    }

    async fn get(&self, id: &str, modality: Modality) -> RetrievalResult<Option<EmbeddingRecord>> {
        self.check_available()?;
        let records = self.records.read().await;
        Ok(records.get(&(id.to_string(), modality)).cloned())
    }

    async fn scan(&self, key: &IndexKey) -> RetrievalResult<Vec<EmbeddingRecord>> {
        self.check_available()?;
        Ok(scan_matching(&*self.records.read().await, key))
    }

    async fn keys(&self) -> RetrievalResult<Vec<IndexKey>> {
        self.check_available()?;
        Ok(distinct_keys(&*self.records.read().await))
    }

    async fn len(&self) -> RetrievalResult<usize> {
        self.check_available()?;
        Ok(self.records.read().await.len())
    }
}

/// One line of the record log
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogEntry {
    Put { record: EmbeddingRecord },
    Delete { id: VectorId, modality: Modality },
}

/// Durable store backed by an append-only JSON-lines log.
///
/// Every mutation is appended and synced before it is applied in memory.
/// Unparseable lines (e.g. a torn final write) are skipped on replay.
#[derive(Debug)]
pub struct FileVectorStore {
    dir: PathBuf,
    records: RwLock<RecordMap>,
    log: Mutex<File>,
}

impl FileVectorStore {
    /// Open (or create) the store under `dir`, replaying any existing log
    pub async fn open(dir: impl AsRef<Path>) -> RetrievalResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(unavailable)?;
        let path = dir.join(LOG_FILE);

        let mut records = RecordMap::new();
        let mut skipped = 0usize;
        if fs::try_exists(&path).await.map_err(unavailable)? {
            let file = File::open(&path).await.map_err(unavailable)?;
            let mut lines = BufReader::new(file).lines();
            while let Some(line) = lines.next_line().await.map_err(unavailable)? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogEntry>(&line) {
                    Ok(LogEntry::Put { record }) => {
                        records.insert((record.id.clone(), record.modality), record);
                    }
                    Ok(LogEntry::Delete { id, modality }) => {
                        records.remove(&(id, modality));
                    }
                    Err(e) => {
                        skipped += 1;
                        debug!("Skipping unreadable log line: {}", e);
                    }
                }
            }
        }
        if skipped > 0 {
            warn!(
                "⚠️  Skipped {} unreadable entries while replaying {}",
                skipped,
                path.display()
            );
        }
        info!(
            "📂 Opened vector store at {} ({} records)",
            dir.display(),
            records.len()
        );

        let log = Self::open_log(&path).await?;
        Ok(Self {
            dir,
            records: RwLock::new(records),
            log: Mutex::new(log),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn open_log(path: &Path) -> RetrievalResult<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(unavailable)
    }

    async fn append(log: &mut File, entries: &[LogEntry]) -> RetrievalResult<()> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        log.write_all(&buf).await.map_err(unavailable)?;
        log.sync_data().await.map_err(unavailable)?;
        Ok(())
    }

    /// Rewrite the log so it holds exactly one `put` per live record
    pub async fn compact(&self) -> RetrievalResult<()> {
        let mut log = self.log.lock().await;
        let records = self.records.read().await;

        let path = self.dir.join(LOG_FILE);
        let tmp = self.dir.join(format!("{}.tmp", LOG_FILE));
        {
            let mut file = File::create(&tmp).await.map_err(unavailable)?;
            let entries: Vec<LogEntry> = records
                .values()
                .map(|record| LogEntry::Put {
                    record: record.clone(),
                })
                .collect();
            Self::append(&mut file, &entries).await?;
        }
        fs::rename(&tmp, &path).await.map_err(unavailable)?;
        *log = Self::open_log(&path).await?;

        info!("🗜️  Compacted record log ({} records)", records.len());
        Ok(())
    }
}

#[async_trait]
impl VectorStore for FileVectorStore {
    async fn put(&self, record: EmbeddingRecord) -> RetrievalResult<Option<EmbeddingRecord>> {
        let mut log = self.log.lock().await;
        Self::append(
            &mut log,
            &[LogEntry::Put {
                record: record.clone(),
            }],
        )
        .await?;
        let mut records = self.records.write().await;
        Ok(records.insert((record.id.clone(), record.modality), record))
    }

    async fn delete(
        &self,
        id: &str,
        modality: Option<Modality>,
    ) -> RetrievalResult<Vec<EmbeddingRecord>> {
        let mut log = self.log.lock().await;
        let targets: Vec<LogEntry> = {
            let records = self.records.read().await;
            Modality::ALL
                .into_iter()
                .filter(|m| modality.map_or(true, |wanted| wanted == *m))
                .filter(|m| records.contains_key(&(id.to_string(), *m)))
                .map(|m| LogEntry::Delete {
                    id: id.to_string(),
                    modality: m,
                })
                .collect()
        };
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        Self::append(&mut log, &targets).await?;
        let mut records = self.records.write().await;
        Ok(remove_matching(&mut records, id, modality))
    }

    async fn get(&self, id: &str, modality: Modality) -> RetrievalResult<Option<EmbeddingRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&(id.to_string(), modality)).cloned())
    }

    async fn scan(&self, key: &IndexKey) -> RetrievalResult<Vec<EmbeddingRecord>> {
        Ok(scan_matching(&*self.records.read().await, key))
    }

    async fn keys(&self) -> RetrievalResult<Vec<IndexKey>> {
        Ok(distinct_keys(&*self.records.read().await))
    }

    async fn len(&self) -> RetrievalResult<usize> {
        Ok(self.records.read().await.len())
    }
}

fn unavailable(err: std::io::Error) -> RetrievalError {
    RetrievalError::StoreUnavailable(err.to_string())
}
