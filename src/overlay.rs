use std::{
  collections::BTreeSet,
  ops::Range,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
  backend::{BlockBatch, DiskKey, OverlayBackend},
  device::{check_alignment, check_block_size},
  error::{BlockError, Result},
  snapshot::{OverlayExport, OverlaySnapshot},
  util::{contiguous_runs, now_millis},
};

/// Number of buffered blocks that triggers a flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 16;

/// Writes that have not reached the backend yet.
///
/// `in_flight` is the batch a flush is currently committing. Both maps are
/// consulted by reads so that a block is never invisible while it moves from
/// memory to durable storage.
#[derive(Default)]
struct Staging {
  buffer: BlockBatch,
  in_flight: Option<Arc<BlockBatch>>,
}

impl Staging {
  /// Staged blocks in `[start, end)`. The buffer shadows the in-flight batch.
  fn collect_range(&self, start: u64, end: u64) -> BlockBatch {
    let mut out = BlockBatch::new();
    if start >= end {
      return out;
    }
    for (index, data) in self.buffer.range(start..end) {
      out.insert(*index, data.clone());
    }
    if let Some(in_flight) = &self.in_flight {
      for (index, data) in in_flight.range(start..end) {
        out.entry(*index).or_insert_with(|| data.clone());
      }
    }
    out
  }

  fn indices(&self) -> impl Iterator<Item = u64> + '_ {
    self
      .buffer
      .keys()
      .chain(self.in_flight.iter().flat_map(|x| x.keys()))
      .copied()
  }
}

/// Durable, sparse store of the modified blocks of one `(owner_id, disk_id)`.
///
/// Writes are buffered in memory and committed to the backend in batches of
/// `flush_threshold` blocks, or on `flush()`. A successful flush is the
/// durability boundary. Only one store instance may write a given disk at a
/// time; concurrent writers on the same disk are not coordinated.
pub struct OverlayStore {
  backend: Arc<dyn OverlayBackend>,
  key: DiskKey,
  label: String,
  block_size: usize,
  flush_threshold: usize,
  open: AtomicBool,
  staging: Mutex<Staging>,
  flush_lock: tokio::sync::Mutex<()>,
}

impl OverlayStore {
  /// Creates an uninitialized store. Call `init()` before use.
  pub fn new(
    backend: Arc<dyn OverlayBackend>,
    owner_id: impl Into<String>,
    disk_id: impl Into<String>,
    block_size: usize,
  ) -> Self {
    assert!(block_size > 0, "block size must be non-zero");
    let key = DiskKey::new(owner_id, disk_id);
    Self {
      backend,
      label: key.to_string(),
      key,
      block_size,
      flush_threshold: DEFAULT_FLUSH_THRESHOLD,
      open: AtomicBool::new(false),
      staging: Mutex::new(Staging::default()),
      flush_lock: tokio::sync::Mutex::new(()),
    }
  }

  pub fn with_flush_threshold(mut self, blocks: usize) -> Self {
    assert!(blocks > 0, "flush threshold must be non-zero");
    self.flush_threshold = blocks;
    self
  }

  pub async fn open(
    backend: Arc<dyn OverlayBackend>,
    owner_id: impl Into<String>,
    disk_id: impl Into<String>,
    block_size: usize,
  ) -> Result<Self> {
    let me = Self::new(backend, owner_id, disk_id, block_size);
    me.init().await?;
    Ok(me)
  }

  /// Registers the disk with the backend. Fails if the disk was created with
  /// a different block size.
  pub async fn init(&self) -> Result<()> {
    let stored = self
      .backend
      .register_disk(&self.key, self.block_size)
      .await?;
    check_block_size(&self.label, stored, self.block_size)?;
    self.open.store(true, Ordering::SeqCst);
    log::info!(
      "Opened overlay {} (block size {}).",
      self.label,
      self.block_size
    );
    Ok(())
  }

  pub fn owner_id(&self) -> &str {
    &self.key.owner_id
  }

  pub fn disk_id(&self) -> &str {
    &self.key.disk_id
  }

  pub fn key(&self) -> &DiskKey {
    &self.key
  }

  pub fn block_size(&self) -> usize {
    self.block_size
  }

  pub fn flush_threshold(&self) -> usize {
    self.flush_threshold
  }

  pub fn is_open(&self) -> bool {
    self.open.load(Ordering::SeqCst)
  }

  /// Whether some writes have not been flushed yet.
  pub fn is_dirty(&self) -> bool {
    let staging = self.staging.lock();
    !staging.buffer.is_empty() || staging.in_flight.is_some()
  }

  pub(crate) fn ensure_open(&self) -> Result<()> {
    if !self.is_open() {
      return Err(BlockError::NotInitialized {
        device: self.label.clone(),
      });
    }
    Ok(())
  }

  /// Stages one block.
  ///
  /// Staging may trigger a flush. If that flush fails the error is returned,
  /// but the block stays staged and readable. Rewriting the same data is
  /// harmless, so callers may simply retry.
  pub async fn write_block(&self, index: u64, data: Vec<u8>) -> Result<()> {
    self.ensure_open()?;
    if data.len() != self.block_size {
      return Err(BlockError::Alignment {
        device: self.label.clone(),
        index,
        len: data.len(),
        block_size: self.block_size,
      });
    }
    let pending = {
      let mut staging = self.staging.lock();
      staging.buffer.insert(index, data);
      staging.buffer.len()
    };
    self.maybe_flush(pending).await
  }

  /// Stages consecutive blocks starting at `index`.
  ///
  /// Large writes are staged `flush_threshold` blocks at a time, flushing in
  /// between, so the buffer never holds much more than one batch. If a flush
  /// fails the error is returned: blocks staged so far stay staged and
  /// readable, later ones are not written. Retrying the whole write is safe.
  pub async fn write_blocks(&self, index: u64, data: &[u8]) -> Result<()> {
    self.ensure_open()?;
    check_alignment(&self.label, index, data.len(), self.block_size)?;
    let chunk_len = self.flush_threshold * self.block_size;
    for (i, chunk) in data.chunks(chunk_len).enumerate() {
      let first = index + (i * self.flush_threshold) as u64;
      let pending = {
        let mut staging = self.staging.lock();
        for (j, block) in chunk.chunks_exact(self.block_size).enumerate() {
          staging.buffer.insert(first + j as u64, block.to_vec());
        }
        staging.buffer.len()
      };
      self.maybe_flush(pending).await?;
    }
    Ok(())
  }

  async fn maybe_flush(&self, pending: usize) -> Result<()> {
    if pending >= self.flush_threshold {
      self.flush().await?;
    }
    Ok(())
  }

  pub async fn read_block(&self, index: u64) -> Result<Option<Vec<u8>>> {
    Ok(self.read_range(index, 1).await?.remove(&index))
  }

  /// Returns the overlaid blocks among `[start, start + count)`, with one
  /// backend query for whatever the write buffer does not hold.
  pub async fn read_range(&self, start: u64, count: u64) -> Result<BlockBatch> {
    self.ensure_open()?;
    let end = start.saturating_add(count);

    // Staged data is captured before the backend is queried. A flush racing
    // with this read moves blocks the other way, so nothing is missed.
    let mut hits = self.staging.lock().collect_range(start, end);
    if hits.len() as u64 == end - start {
      return Ok(hits);
    }

    for (index, data) in self.backend.read_range(&self.key, start, end).await? {
      hits.entry(index).or_insert(data);
    }
    Ok(hits)
  }

  /// Commits the write buffer to the backend, at most `flush_threshold`
  /// blocks per backend transaction.
  ///
  /// On failure the failed batch and everything after it stay buffered
  /// (behind any newer writes to the same blocks) and the next flush retries
  /// them.
  pub async fn flush(&self) -> Result<()> {
    self.ensure_open()?;
    let _guard = self.flush_lock.lock().await;
    while let Some(batch) = self.start_batch() {
      self.commit_batch(batch).await?;
    }
    Ok(())
  }

  /// Moves up to `flush_threshold` of the lowest buffered blocks in flight.
  fn start_batch(&self) -> Option<Arc<BlockBatch>> {
    let mut staging = self.staging.lock();
    if staging.buffer.is_empty() {
      return None;
    }
    let split = staging.buffer.keys().nth(self.flush_threshold).copied();
    let batch = match split {
      Some(split) => {
        let rest = staging.buffer.split_off(&split);
        std::mem::replace(&mut staging.buffer, rest)
      }
      None => std::mem::take(&mut staging.buffer),
    };
    let batch = Arc::new(batch);
    staging.in_flight = Some(batch.clone());
    Some(batch)
  }

  async fn commit_batch(&self, batch: Arc<BlockBatch>) -> Result<()> {
    let result = self
      .backend
      .write_batch(&self.key, batch.clone(), now_millis())
      .await;

    let mut staging = self.staging.lock();
    staging.in_flight = None;
    match result {
      Ok(()) => {
        log::debug!("Flushed {} blocks of overlay {}.", batch.len(), self.label);
        Ok(())
      }
      Err(e) => {
        for (index, data) in batch.iter() {
          staging
            .buffer
            .entry(*index)
            .or_insert_with(|| data.clone());
        }
        log::warn!(
          "Flush of {} blocks of overlay {} failed, keeping them buffered: {}",
          batch.len(),
          self.label,
          e
        );
        Err(e)
      }
    }
  }

  pub async fn sync(&self) -> Result<()> {
    self.flush().await
  }

  /// Flushes and closes the store. A failed flush leaves the store open so
  /// that the caller can retry.
  pub async fn close(&self) -> Result<()> {
    if !self.is_open() {
      return Ok(());
    }
    self.flush().await?;
    self.open.store(false, Ordering::SeqCst);
    log::info!("Closed overlay {}.", self.label);
    Ok(())
  }

  /// Every modified block index, buffered or durable, in ascending order.
  pub async fn modified_blocks(&self) -> Result<Vec<u64>> {
    self.ensure_open()?;
    let staged: Vec<u64> = self.staging.lock().indices().collect();
    let mut all: BTreeSet<u64> = self
      .backend
      .list_indices(&self.key)
      .await?
      .into_iter()
      .collect();
    all.extend(staged);
    Ok(all.into_iter().collect())
  }

  /// Maximal contiguous ranges of modified blocks.
  pub async fn modified_ranges(&self) -> Result<Vec<Range<u64>>> {
    Ok(contiguous_runs(self.modified_blocks().await?, u64::MAX))
  }

  pub async fn block_count(&self) -> Result<u64> {
    Ok(self.modified_blocks().await?.len() as u64)
  }

  pub async fn total_bytes(&self) -> Result<u64> {
    Ok(self.block_count().await? * self.block_size as u64)
  }

  fn make_snapshot(&self, block_count: u64, description: Option<String>) -> OverlaySnapshot {
    OverlaySnapshot {
      id: Uuid::new_v4().to_string(),
      owner_id: self.key.owner_id.clone(),
      disk_id: self.key.disk_id.clone(),
      created_at: now_millis(),
      block_count,
      total_bytes: block_count * self.block_size as u64,
      description,
    }
  }

  /// Flushes, then records a summary of the overlay.
  pub async fn create_snapshot(&self, description: Option<String>) -> Result<OverlaySnapshot> {
    self.flush().await?;
    let count = self.backend.list_indices(&self.key).await?.len() as u64;
    let snapshot = self.make_snapshot(count, description);
    self.backend.put_snapshot(&snapshot).await?;
    log::info!(
      "Recorded snapshot {} of overlay {} ({} blocks).",
      snapshot.id,
      self.label,
      count
    );
    Ok(snapshot)
  }

  pub async fn list_snapshots(&self) -> Result<Vec<OverlaySnapshot>> {
    self.ensure_open()?;
    self.backend.list_snapshots(&self.key).await
  }

  /// Flushes, then copies every modified block out of the store. The
  /// accompanying snapshot is recorded for provenance.
  pub async fn export(&self, description: Option<String>) -> Result<OverlayExport> {
    self.flush().await?;
    let blocks = self.backend.read_all(&self.key).await?;
    let snapshot = self.make_snapshot(blocks.len() as u64, description);
    self.backend.put_snapshot(&snapshot).await?;
    log::info!(
      "Exported {} blocks of overlay {} as snapshot {}.",
      blocks.len(),
      self.label,
      snapshot.id
    );
    Ok(OverlayExport {
      snapshot,
      block_size: self.block_size,
      blocks,
    })
  }

  /// Replaces the whole overlay with `export`. Unflushed writes are
  /// discarded.
  pub async fn import(&self, export: OverlayExport) -> Result<()> {
    self.ensure_open()?;
    check_block_size(&self.label, self.block_size, export.block_size)?;
    let mut blocks = BlockBatch::new();
    for (index, data) in export.blocks {
      if data.len() != self.block_size {
        return Err(BlockError::Alignment {
          device: self.label.clone(),
          index,
          len: data.len(),
          block_size: self.block_size,
        });
      }
      blocks.insert(index, data);
    }
    let count = blocks.len();

    let _guard = self.flush_lock.lock().await;
    self
      .backend
      .replace_all(&self.key, blocks, now_millis())
      .await?;
    self.staging.lock().buffer.clear();
    log::info!(
      "Imported {} blocks into overlay {} from snapshot {} ({}/{}).",
      count,
      self.label,
      export.snapshot.id,
      export.snapshot.owner_id,
      export.snapshot.disk_id
    );
    Ok(())
  }

  /// Drops every modified block, buffered or durable. Returns the number of
  /// durable blocks deleted.
  pub async fn clear(&self) -> Result<u64> {
    self.ensure_open()?;
    let _guard = self.flush_lock.lock().await;
    let removed = self.backend.clear(&self.key).await?;
    self.staging.lock().buffer.clear();
    log::info!("Cleared overlay {} ({} blocks).", self.label, removed);
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backend::{testing::FlakyBackend, MemoryBackend};

  const BS: usize = 512;

  fn block(fill: u8) -> Vec<u8> {
    vec![fill; BS]
  }

  async fn open_store(backend: &MemoryBackend) -> OverlayStore {
    OverlayStore::open(Arc::new(backend.clone()), "alice", "root", BS)
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn operations_require_init() {
    let store = OverlayStore::new(Arc::new(MemoryBackend::new()), "alice", "root", BS);
    assert!(matches!(
      store.write_block(0, block(1)).await,
      Err(BlockError::NotInitialized { .. })
    ));
    assert!(matches!(
      store.read_range(0, 1).await,
      Err(BlockError::NotInitialized { .. })
    ));
    store.init().await.unwrap();
    store.write_block(0, block(1)).await.unwrap();
  }

  #[tokio::test]
  async fn buffered_writes_are_readable_before_flush() {
    let backend = MemoryBackend::new();
    let store = open_store(&backend).await;
    store.write_block(3, block(0x33)).await.unwrap();
    assert!(store.is_dirty());
    assert_eq!(store.read_block(3).await.unwrap(), Some(block(0x33)));
    assert_eq!(store.read_block(4).await.unwrap(), None);

    // Nothing reached the backend yet.
    let key = DiskKey::new("alice", "root");
    assert!(backend.list_indices(&key).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn flush_threshold_commits_automatically() {
    let backend = MemoryBackend::new();
    let store = OverlayStore::new(Arc::new(backend.clone()), "alice", "root", BS)
      .with_flush_threshold(4);
    store.init().await.unwrap();

    let data: Vec<u8> = (0..3u8).flat_map(|i| block(i)).collect();
    store.write_blocks(0, &data).await.unwrap();
    assert!(store.is_dirty());
    store.write_block(10, block(0xAA)).await.unwrap();
    assert!(!store.is_dirty());

    let key = DiskKey::new("alice", "root");
    assert_eq!(backend.list_indices(&key).await.unwrap(), vec![0, 1, 2, 10]);
  }

  #[tokio::test]
  async fn flushed_blocks_survive_reopen() {
    let backend = MemoryBackend::new();
    {
      let store = open_store(&backend).await;
      store.write_block(1, block(0xFF)).await.unwrap();
      store.flush().await.unwrap();
      // Unflushed: lost with the instance.
      store.write_block(2, block(0xEE)).await.unwrap();
    }
    let store = open_store(&backend).await;
    assert_eq!(store.read_block(1).await.unwrap(), Some(block(0xFF)));
    assert_eq!(store.read_block(2).await.unwrap(), None);
  }

  #[tokio::test]
  async fn buffer_overrides_durable_data() {
    let backend = MemoryBackend::new();
    let store = open_store(&backend).await;
    store.write_block(5, block(1)).await.unwrap();
    store.flush().await.unwrap();
    store.write_block(5, block(2)).await.unwrap();
    assert_eq!(store.read_block(5).await.unwrap(), Some(block(2)));
    store.sync().await.unwrap();
    assert_eq!(store.read_block(5).await.unwrap(), Some(block(2)));
  }

  #[tokio::test]
  async fn failed_flush_keeps_buffer_for_retry() {
    let backend = Arc::new(FlakyBackend::new());
    backend.fail_writes.store(true, Ordering::SeqCst);
    let store = OverlayStore::open(backend.clone(), "alice", "root", BS)
      .await
      .unwrap();
    store.write_block(7, block(0x77)).await.unwrap();

    assert!(matches!(store.flush().await, Err(BlockError::Io { .. })));
    assert!(store.is_dirty());
    assert_eq!(store.read_block(7).await.unwrap(), Some(block(0x77)));

    // Close must not report success while data is only in memory.
    assert!(store.close().await.is_err());
    assert!(store.is_open());

    backend.fail_writes.store(false, Ordering::SeqCst);
    store.close().await.unwrap();
    assert!(!store.is_open());

    let reopened = OverlayStore::open(backend.clone(), "alice", "root", BS)
      .await
      .unwrap();
    assert_eq!(reopened.read_block(7).await.unwrap(), Some(block(0x77)));
  }

  #[tokio::test]
  async fn flush_commits_at_most_threshold_blocks_per_batch() {
    let backend = Arc::new(FlakyBackend::new());
    let store = OverlayStore::new(backend.clone(), "alice", "root", BS).with_flush_threshold(4);
    store.init().await.unwrap();

    let data: Vec<u8> = (0..11u8).flat_map(block).collect();
    store.write_blocks(0, &data).await.unwrap();
    for index in 20..26u64 {
      store.write_block(index, block(index as u8)).await.unwrap();
    }
    store.flush().await.unwrap();

    let sizes = backend.batch_sizes.lock().clone();
    assert!(sizes.iter().all(|&n| n <= 4), "batch sizes {:?}", sizes);
    assert_eq!(sizes.iter().sum::<usize>(), 17);
    assert!(!store.is_dirty());
    assert_eq!(backend.inner.list_indices(store.key()).await.unwrap().len(), 17);
    assert_eq!(store.read_block(10).await.unwrap(), Some(block(10)));
  }

  #[tokio::test]
  async fn failed_threshold_flush_keeps_staged_blocks_readable() {
    let backend = Arc::new(FlakyBackend::new());
    let store = OverlayStore::new(backend.clone(), "alice", "root", BS).with_flush_threshold(2);
    store.init().await.unwrap();
    backend.fail_writes.store(true, Ordering::SeqCst);

    let data: Vec<u8> = (0..4u8).flat_map(block).collect();
    assert!(store.write_blocks(0, &data).await.is_err());
    assert_eq!(store.read_block(0).await.unwrap(), Some(block(0)));
    assert_eq!(store.read_block(1).await.unwrap(), Some(block(1)));
    assert_eq!(store.read_block(2).await.unwrap(), None);

    // Retrying the same write completes it.
    backend.fail_writes.store(false, Ordering::SeqCst);
    store.write_blocks(0, &data).await.unwrap();
    store.flush().await.unwrap();
    assert_eq!(store.modified_blocks().await.unwrap(), vec![0, 1, 2, 3]);
  }

  #[tokio::test]
  async fn retried_batch_does_not_clobber_newer_writes() {
    let backend = Arc::new(FlakyBackend::new());
    backend.fail_writes.store(true, Ordering::SeqCst);
    let store = OverlayStore::open(backend.clone(), "alice", "root", BS)
      .await
      .unwrap();
    store.write_block(1, block(0x01)).await.unwrap();
    assert!(store.flush().await.is_err());
    store.write_block(1, block(0x02)).await.unwrap();

    backend.fail_writes.store(false, Ordering::SeqCst);
    store.flush().await.unwrap();
    assert_eq!(store.read_block(1).await.unwrap(), Some(block(0x02)));
  }

  #[tokio::test]
  async fn rejects_misaligned_writes() {
    let store = open_store(&MemoryBackend::new()).await;
    assert!(matches!(
      store.write_blocks(0, &[0u8; BS + 1]).await,
      Err(BlockError::Alignment { .. })
    ));
    assert!(matches!(
      store.write_block(0, vec![0u8; 10]).await,
      Err(BlockError::Alignment { .. })
    ));
    assert!(!store.is_dirty());
  }

  #[tokio::test]
  async fn block_size_is_fixed_per_disk() {
    let backend = MemoryBackend::new();
    open_store(&backend).await;
    let err = OverlayStore::open(Arc::new(backend.clone()), "alice", "root", BS * 2)
      .await
      .err()
      .unwrap();
    assert!(matches!(err, BlockError::BlockSizeMismatch { .. }));
  }

  #[tokio::test]
  async fn modified_ranges_cover_buffer_and_durable_blocks() {
    let store = open_store(&MemoryBackend::new()).await;
    for index in [0, 1, 2, 8] {
      store.write_block(index, block(index as u8)).await.unwrap();
    }
    store.flush().await.unwrap();
    store.write_block(3, block(3)).await.unwrap();
    store.write_block(10, block(10)).await.unwrap();

    assert_eq!(store.modified_blocks().await.unwrap(), vec![0, 1, 2, 3, 8, 10]);
    assert_eq!(store.modified_ranges().await.unwrap(), vec![0..4, 8..9, 10..11]);
    assert_eq!(store.block_count().await.unwrap(), 6);
    assert_eq!(store.total_bytes().await.unwrap(), 6 * BS as u64);
  }

  #[tokio::test]
  async fn export_import_replaces_contents() {
    let source = open_store(&MemoryBackend::new()).await;
    source.write_block(1, block(0x11)).await.unwrap();
    source.write_block(4, block(0x44)).await.unwrap();
    let export = source
      .export(Some("golden".into()))
      .await
      .unwrap();
    assert!(!source.is_dirty());
    assert_eq!(export.snapshot.block_count, 2);
    assert_eq!(export.snapshot.total_bytes, 2 * BS as u64);
    assert_eq!(export.blocks[0], (1, block(0x11)));
    assert_eq!(source.list_snapshots().await.unwrap().len(), 1);

    let target = OverlayStore::open(Arc::new(MemoryBackend::new()), "bob", "copy", BS)
      .await
      .unwrap();
    target.write_block(2, block(0x22)).await.unwrap();
    target.flush().await.unwrap();
    target.write_block(9, block(0x99)).await.unwrap();

    target.import(export).await.unwrap();
    assert_eq!(target.modified_blocks().await.unwrap(), vec![1, 4]);
    assert_eq!(target.read_block(4).await.unwrap(), Some(block(0x44)));
    assert_eq!(target.read_block(2).await.unwrap(), None);
    assert!(!target.is_dirty());
  }

  #[tokio::test]
  async fn import_validates_block_sizes() {
    let store = open_store(&MemoryBackend::new()).await;
    let mut export = store.export(None).await.unwrap();
    export.blocks.push((0, vec![0u8; BS / 2]));
    assert!(matches!(
      store.import(export.clone()).await,
      Err(BlockError::Alignment { .. })
    ));

    export.blocks.clear();
    export.block_size = BS * 2;
    assert!(matches!(
      store.import(export).await,
      Err(BlockError::BlockSizeMismatch { .. })
    ));
  }

  #[tokio::test]
  async fn clear_drops_everything() {
    let store = open_store(&MemoryBackend::new()).await;
    store.write_block(1, block(1)).await.unwrap();
    store.flush().await.unwrap();
    store.write_block(2, block(2)).await.unwrap();

    assert_eq!(store.clear().await.unwrap(), 1);
    assert!(store.modified_blocks().await.unwrap().is_empty());
    assert!(!store.is_dirty());
  }

  #[tokio::test]
  async fn closed_store_rejects_operations() {
    let store = open_store(&MemoryBackend::new()).await;
    store.write_block(1, block(1)).await.unwrap();
    store.close().await.unwrap();
    store.close().await.unwrap();
    assert!(matches!(
      store.read_block(1).await,
      Err(BlockError::NotInitialized { .. })
    ));
  }

  #[tokio::test]
  async fn snapshots_are_recorded_in_order() {
    let store = open_store(&MemoryBackend::new()).await;
    store.write_block(0, block(0)).await.unwrap();
    let first = store.create_snapshot(Some("one".into())).await.unwrap();
    store.write_block(1, block(1)).await.unwrap();
    let second = store.create_snapshot(None).await.unwrap();

    assert_eq!(first.block_count, 1);
    assert_eq!(second.block_count, 2);
    let listed = store.list_snapshots().await.unwrap();
    assert_eq!(listed, vec![first, second]);
  }
}
