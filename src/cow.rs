use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
  backend::OverlayBackend,
  device::{check_alignment, check_block_size, check_range, BlockDevice, DEFAULT_BLOCK_SIZE},
  error::{BlockError, Result},
  overlay::OverlayStore,
  snapshot::{OverlayExport, OverlaySnapshot},
  util::contiguous_runs,
};

/// Upper bound on the number of blocks fetched from the base in one call.
pub const DEFAULT_MAX_COALESCED_BLOCKS: u64 = 256;

#[derive(Debug, Clone)]
pub struct CowOptions {
  pub id: String,
  /// Defaults to `DEFAULT_BLOCK_SIZE`.
  pub block_size: Option<usize>,
  pub max_coalesced_blocks: u64,
}

impl CowOptions {
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      block_size: None,
      max_coalesced_blocks: DEFAULT_MAX_COALESCED_BLOCKS,
    }
  }

  pub fn block_size(&self) -> usize {
    self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE)
  }
}

/// A writable device layered over a read-only base.
///
/// Writes go to the overlay store and never reach the base. Reads take each
/// block from the overlay if it has one and from the base otherwise. The base
/// may be shared by several devices; the overlay belongs to this one.
///
/// Errors from reads and writes name this device and the requested block
/// range, with the failing layer kept in the message.
pub struct CowBlockDevice {
  id: String,
  block_size: usize,
  size: u64,
  max_coalesced_blocks: u64,
  /// Taken on close.
  base: Mutex<Option<Arc<dyn BlockDevice>>>,
  overlay: OverlayStore,
}

impl CowBlockDevice {
  /// `overlay` must already be initialized.
  pub fn new(opts: CowOptions, base: Arc<dyn BlockDevice>, overlay: OverlayStore) -> Result<Self> {
    assert!(
      opts.max_coalesced_blocks > 0,
      "max_coalesced_blocks must be non-zero"
    );
    let block_size = opts.block_size();
    check_block_size(base.id(), block_size, base.block_size())?;
    check_block_size(&opts.id, block_size, overlay.block_size())?;
    overlay.ensure_open()?;
    Ok(Self {
      id: opts.id,
      block_size,
      size: base.size(),
      max_coalesced_blocks: opts.max_coalesced_blocks,
      base: Mutex::new(Some(base)),
      overlay,
    })
  }

  /// Opens the overlay of `(owner_id, disk_id)` in `backend` and layers it over
  /// `base`.
  pub async fn open(
    opts: CowOptions,
    base: Arc<dyn BlockDevice>,
    backend: Arc<dyn OverlayBackend>,
    owner_id: impl Into<String>,
    disk_id: impl Into<String>,
  ) -> Result<Self> {
    check_block_size(base.id(), opts.block_size(), base.block_size())?;
    let overlay = OverlayStore::open(backend, owner_id, disk_id, opts.block_size()).await?;
    Self::new(opts, base, overlay)
  }

  pub fn overlay(&self) -> &OverlayStore {
    &self.overlay
  }

  /// The base device, or `None` once this device is closed.
  pub fn base(&self) -> Option<Arc<dyn BlockDevice>> {
    self.base.lock().clone()
  }

  fn live_base(&self) -> Result<Arc<dyn BlockDevice>> {
    self.base().ok_or_else(|| BlockError::NotInitialized {
      device: self.id.clone(),
    })
  }

  async fn read_merged(&self, index: u64, count: u64) -> Result<Vec<u8>> {
    let bs = self.block_size;
    let mut out = vec![0u8; count as usize * bs];
    let overlaid = self.overlay.read_range(index, count).await?;

    let missing = (index..index + count).filter(|x| !overlaid.contains_key(x));
    let runs = contiguous_runs(missing, self.max_coalesced_blocks);
    if !runs.is_empty() {
      let base = self.live_base()?;
      for run in runs {
        let len = run.end - run.start;
        let data = base.read_blocks(run.start, len).await?;
        if data.len() != len as usize * bs {
          return Err(BlockError::io(
            base.id(),
            format!(
              "returned {} bytes for blocks [{}, {}+{})",
              data.len(),
              run.start,
              run.start,
              len
            ),
          ));
        }
        let offset = (run.start - index) as usize * bs;
        out[offset..offset + data.len()].copy_from_slice(&data);
        log::debug!(
          "Device {}: read blocks [{}, {}+{}) from base.",
          self.id,
          run.start,
          run.start,
          len
        );
      }
    }

    for (block, data) in &overlaid {
      let offset = (block - index) as usize * bs;
      out[offset..offset + bs].copy_from_slice(data);
    }
    Ok(out)
  }

  pub fn is_dirty(&self) -> bool {
    self.overlay.is_dirty()
  }

  pub async fn export(&self, description: Option<String>) -> Result<OverlayExport> {
    self.overlay.export(description).await
  }

  pub async fn import(&self, export: OverlayExport) -> Result<()> {
    self.overlay.import(export).await
  }

  pub async fn create_snapshot(&self, description: Option<String>) -> Result<OverlaySnapshot> {
    self.overlay.create_snapshot(description).await
  }
}

#[async_trait]
impl BlockDevice for CowBlockDevice {
  fn id(&self) -> &str {
    &self.id
  }

  fn size(&self) -> u64 {
    self.size
  }

  fn block_size(&self) -> usize {
    self.block_size
  }

  fn readonly(&self) -> bool {
    false
  }

  async fn read_blocks(&self, index: u64, count: u64) -> Result<Vec<u8>> {
    check_range(&self.id, index, count, self.block_count())?;
    self
      .read_merged(index, count)
      .await
      .map_err(|e| e.within(&self.id, index, count))
  }

  async fn write_blocks(&self, index: u64, data: &[u8]) -> Result<()> {
    let count = check_alignment(&self.id, index, data.len(), self.block_size)?;
    check_range(&self.id, index, count, self.block_count())?;
    self
      .overlay
      .write_blocks(index, data)
      .await
      .map_err(|e| e.within(&self.id, index, count))
  }

  async fn sync(&self) -> Result<()> {
    self.overlay.sync().await
  }

  /// Flushes and closes the overlay, then releases this device's reference
  /// to the base. The base itself is closed only when no other holder is left,
  /// so the last device sharing it to close is the one that closes it.
  async fn close(&self) -> Result<()> {
    self.overlay.close().await?;
    let base = self.base.lock().take();
    if let Some(base) = base {
      if Arc::strong_count(&base) == 1 {
        base.close().await?;
      }
    }
    log::info!("Closed device {}.", self.id);
    Ok(())
  }
}
