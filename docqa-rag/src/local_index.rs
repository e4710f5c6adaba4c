//! Single-collection vector index kept in memory, optionally persisted to disk.
//!
//! This module provides [`LocalVectorIndex`], a dependency-free
//! [`VectorIndex`]. The collection lives behind a `tokio::sync::RwLock`; when
//! a persistence directory is configured it is also written to
//! `<dir>/<collection>.json` after every mutation, via a temporary file and a
//! rename so the snapshot on disk is always complete. The collection's
//! generation is mirrored in the small `<dir>/<collection>.meta.json`.
//!
//! Scans, insertion and snapshot (de)serialization run on the [`WorkerPool`]'s
//! blocking threads while the caller holds an owned lock guard.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::IndexConfig;
use crate::document::{Chunk, CollectionStats, IndexEntry, RawSearchResults};
use crate::error::{RagError, Result};
use crate::index::{DistanceMetric, MetadataFilter, VectorIndex};
use crate::pool::WorkerPool;

const BACKEND: &str = "Local";

type Slot = Option<Collection>;

/// One generation of the collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Collection {
    name: String,
    /// Incremented every time the collection is dropped and recreated.
    generation: u64,
    /// Next entry number; ids are never reused within a generation.
    next_id: u64,
    entries: Vec<IndexEntry>,
}

impl Collection {
    fn empty(name: &str, generation: u64) -> Self {
        Self { name: name.to_string(), generation, next_id: 0, entries: Vec::new() }
    }

    fn allocate_id(&mut self) -> String {
        let id = format!("doc_{}", self.next_id);
        self.next_id += 1;
        id
    }

    fn dimensions(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.len())
    }
}

/// Generation record stored next to the snapshot.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotMeta {
    generation: u64,
}

/// A local [`VectorIndex`] over one named collection.
///
/// The collection handle is created (or loaded from disk) on first access
/// and cached. A `replace_all` upsert invalidates the cached handle, deletes
/// the snapshot and starts a new generation, all under the write lock, so
/// concurrent searches see either the complete old generation or the
/// complete new one.
///
/// # Example
///
/// ```rust,ignore
/// use docqa_rag::{IndexConfig, LocalVectorIndex, WorkerPool};
///
/// let index = LocalVectorIndex::new(IndexConfig {
///     persist_dir: Some("index_db".into()),
///     ..Default::default()
/// })
/// .with_pool(WorkerPool::new(2));
/// ```
#[derive(Debug)]
pub struct LocalVectorIndex {
    config: IndexConfig,
    handle: Arc<RwLock<Slot>>,
    pool: WorkerPool,
}

impl LocalVectorIndex {
    /// Create an index with its own two-slot pool. Nothing is read from disk
    /// until first use.
    pub fn new(config: IndexConfig) -> Self {
        Self { config, handle: Arc::new(RwLock::new(None)), pool: WorkerPool::default() }
    }

    /// A purely in-memory index with default settings and the given collection name.
    pub fn in_memory(collection_name: impl Into<String>) -> Self {
        Self::new(IndexConfig {
            persist_dir: None,
            collection_name: collection_name.into(),
            ..Default::default()
        })
    }

    /// Run scans and snapshot work on `pool` instead of a private one.
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    /// Generation number of the cached collection, loading it if needed.
    pub async fn generation(&self) -> Result<u64> {
        let guard = self.loaded_read().await?;
        Ok(loaded(&guard)?.generation)
    }

    fn snapshot_path(&self) -> Option<PathBuf> {
        self.config
            .persist_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", self.config.collection_name)))
    }

    fn meta_path(&self) -> Option<PathBuf> {
        self.config
            .persist_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.meta.json", self.config.collection_name)))
    }

    /// Load the collection from its snapshot, or create an empty one.
    async fn open(&self) -> Result<Collection> {
        let name = &self.config.collection_name;
        let Some(path) = self.snapshot_path() else {
            debug!(collection = %name, "created in-memory collection");
            return Ok(Collection::empty(name, 1));
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(collection = %name, "created empty collection");
                return Ok(Collection::empty(name, 1));
            }
            Err(e) => {
                return Err(RagError::index(BACKEND, format!("failed to read snapshot: {e}")));
            }
        };

        let path_str = path.display().to_string();
        let collection = self
            .pool
            .run(move || {
                serde_json::from_slice::<Collection>(&bytes).map_err(|e| {
                    error!(path = %path_str, error = %e, "corrupt collection snapshot");
                    RagError::index(BACKEND, format!("corrupt snapshot '{path_str}': {e}"))
                })
            })
            .await?;
        info!(
            collection = %name,
            generation = collection.generation,
            count = collection.entries.len(),
            "loaded collection"
        );
        Ok(collection)
    }

    /// Generation of the persisted collection without loading its entries.
    ///
    /// `0` when nothing was ever persisted, so the first generation is `1`.
    async fn persisted_generation(&self) -> u64 {
        let Some(path) = self.meta_path() else {
            return 0;
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<SnapshotMeta>(&bytes) {
                Ok(meta) => meta.generation,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable generation record");
                    0
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable generation record");
                0
            }
        }
    }

    /// Write an encoded snapshot and its generation record.
    async fn write_snapshot(&self, snapshot: Vec<u8>, generation: u64) -> Result<()> {
        let (Some(path), Some(meta_path)) = (self.snapshot_path(), self.meta_path()) else {
            return Ok(());
        };
        let write = async {
            if let Some(dir) = path.parent() {
                tokio::fs::create_dir_all(dir).await?;
            }
            replace_file(&path, &snapshot).await?;
            let meta = serde_json::to_vec(&SnapshotMeta { generation })?;
            replace_file(&meta_path, &meta).await?;
            Ok::<_, RagError>(())
        };
        write.await.map_err(|e| {
            error!(path = %path.display(), error = %e, "failed to persist collection");
            RagError::index(BACKEND, format!("failed to persist collection: {e}"))
        })
    }

    async fn remove_snapshot(&self) -> Result<()> {
        let Some(path) = self.snapshot_path() else {
            return Ok(());
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RagError::index(BACKEND, format!("failed to drop collection: {e}"))),
        }
    }

    async fn loaded_read(&self) -> Result<OwnedRwLockReadGuard<Slot>> {
        let guard = self.handle.clone().read_owned().await;
        if guard.is_some() {
            return Ok(guard);
        }
        drop(guard);
        Ok(self.loaded_write().await?.downgrade())
    }

    async fn loaded_write(&self) -> Result<OwnedRwLockWriteGuard<Slot>> {
        let mut guard = self.handle.clone().write_owned().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        Ok(guard)
    }
}

async fn replace_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

/// Encode the collection for its snapshot, if one is configured.
fn encode(collection: &Collection, persist: bool) -> Result<Option<Vec<u8>>> {
    if !persist {
        return Ok(None);
    }
    serde_json::to_vec(collection)
        .map(Some)
        .map_err(|e| RagError::index(BACKEND, format!("failed to serialize collection: {e}")))
}

fn loaded(slot: &Slot) -> Result<&Collection> {
    slot.as_ref().ok_or_else(|| RagError::index(BACKEND, "collection handle vanished"))
}

fn check_lengths(texts: usize, vectors: usize, chunks: usize) -> Result<()> {
    if texts != vectors || texts != chunks {
        return Err(RagError::index(
            BACKEND,
            format!("mismatched input lengths: {texts} texts, {vectors} vectors, {chunks} chunks"),
        ));
    }
    Ok(())
}

fn check_dimensions(vectors: &[Vec<f32>], expected: Option<usize>) -> Result<()> {
    let Some(expected) = expected.or_else(|| vectors.first().map(Vec::len)) else {
        return Ok(());
    };
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(RagError::index(
            BACKEND,
            format!("vector has {} dimensions, collection uses {expected}", bad.len()),
        ));
    }
    Ok(())
}

fn insert_batches(
    collection: &mut Collection,
    texts: Vec<String>,
    vectors: Vec<Vec<f32>>,
    chunks: Vec<Chunk>,
    batch_size: usize,
) {
    let mut rows = texts.into_iter().zip(vectors).zip(chunks);
    let mut batch_index = 0usize;
    loop {
        let batch: Vec<IndexEntry> = rows
            .by_ref()
            .take(batch_size)
            .map(|((content, embedding), chunk)| IndexEntry {
                id: collection.allocate_id(),
                embedding,
                content,
                metadata: chunk.metadata,
            })
            .collect();
        if batch.is_empty() {
            break;
        }
        debug!(batch_index, batch_len = batch.len(), "inserting batch");
        collection.entries.extend(batch);
        batch_index += 1;
    }
}

/// Brute-force nearest-neighbour scan, one row per query.
fn scan(
    collection: &Collection,
    query_vectors: &[Vec<f32>],
    top_k: usize,
    filter: Option<&MetadataFilter>,
    metric: DistanceMetric,
) -> RawSearchResults {
    let mut raw = RawSearchResults::default();
    for query in query_vectors {
        let mut scored: Vec<(f32, usize)> = collection
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| filter.is_none_or(|f| f.matches(&entry.metadata)))
            .map(|(i, entry)| (metric.distance(query, &entry.embedding), i))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        scored.truncate(top_k);

        let (mut ids, mut documents, mut metadatas, mut distances) =
            (Vec::new(), Vec::new(), Vec::new(), Vec::new());
        for (distance, i) in scored {
            let entry = &collection.entries[i];
            ids.push(entry.id.clone());
            documents.push(entry.content.clone());
            metadatas.push(entry.metadata.clone());
            distances.push(distance);
        }
        raw.ids.push(ids);
        raw.documents.push(documents);
        raw.metadatas.push(metadatas);
        raw.distances.push(distances);
    }
    raw
}

#[async_trait]
impl VectorIndex for LocalVectorIndex {
    fn name(&self) -> &str {
        &self.config.collection_name
    }

    async fn upsert(
        &self,
        texts: Vec<String>,
        vectors: Vec<Vec<f32>>,
        chunks: Vec<Chunk>,
        replace_all: bool,
    ) -> Result<usize> {
        check_lengths(texts.len(), vectors.len(), chunks.len())?;

        let guard = if replace_all {
            check_dimensions(&vectors, None)?;
            let mut guard = self.handle.clone().write_owned().await;
            let previous = match guard.take() {
                Some(old) => old.generation,
                None => self.persisted_generation().await,
            };
            let generation = previous + 1;
            self.remove_snapshot().await?;
            info!(
                collection = %self.config.collection_name,
                generation,
                "collection dropped and recreated"
            );
            *guard = Some(Collection::empty(&self.config.collection_name, generation));
            guard
        } else {
            self.loaded_write().await?
        };

        let batch_size = self.config.insert_batch_size.max(1);
        let persist = self.snapshot_path().is_some();
        let (guard, snapshot) = self
            .pool
            .run(move || {
                let mut guard = guard;
                let collection = guard
                    .as_mut()
                    .ok_or_else(|| RagError::index(BACKEND, "collection handle vanished"))?;
                if !replace_all {
                    check_dimensions(&vectors, collection.dimensions())?;
                }
                insert_batches(collection, texts, vectors, chunks, batch_size);
                let snapshot = encode(collection, persist)?;
                Ok((guard, snapshot))
            })
            .await?;

        let collection = loaded(&guard)?;
        if let Some(snapshot) = snapshot {
            self.write_snapshot(snapshot, collection.generation).await?;
        }
        Ok(collection.entries.len())
    }

    async fn search(
        &self,
        query_vectors: &[Vec<f32>],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<RawSearchResults> {
        let guard = self.loaded_read().await?;
        check_dimensions(query_vectors, loaded(&guard)?.dimensions())?;

        let queries = query_vectors.to_vec();
        let filter = filter.cloned();
        let metric = self.config.metric;
        self.pool
            .run(move || Ok(scan(loaded(&guard)?, &queries, top_k, filter.as_ref(), metric)))
            .await
    }

    async fn delete(&self, filter: &MetadataFilter) -> Result<Option<usize>> {
        let guard = self.loaded_write().await?;
        let persist = self.snapshot_path().is_some();
        let matcher = filter.clone();
        let (guard, removed, snapshot) = self
            .pool
            .run(move || {
                let mut guard = guard;
                let collection = guard
                    .as_mut()
                    .ok_or_else(|| RagError::index(BACKEND, "collection handle vanished"))?;
                let before = collection.entries.len();
                collection.entries.retain(|entry| !matcher.matches(&entry.metadata));
                let removed = before - collection.entries.len();
                let snapshot = if removed > 0 { encode(collection, persist)? } else { None };
                Ok((guard, removed, snapshot))
            })
            .await?;

        if let Some(snapshot) = snapshot {
            self.write_snapshot(snapshot, loaded(&guard)?.generation).await?;
        }
        drop(guard);
        debug!(removed, document = filter.document_id(), "deleted entries");

        if removed == 0 && filter.document_id().is_some() {
            return Ok(None);
        }
        Ok(Some(removed))
    }

    async fn stats(&self) -> Result<CollectionStats> {
        let guard = self.loaded_read().await?;
        let collection = loaded(&guard)?;
        Ok(CollectionStats { name: collection.name.clone(), count: collection.entries.len() })
    }

    async fn metadatas(&self) -> Result<Vec<HashMap<String, String>>> {
        let guard = self.loaded_read().await?;
        self.pool
            .run(move || {
                Ok(loaded(&guard)?.entries.iter().map(|e| e.metadata.clone()).collect())
            })
            .await
    }
}
