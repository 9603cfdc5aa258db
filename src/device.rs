use async_trait::async_trait;

use crate::error::{BlockError, Result};

/// Standard block size (64 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 65536;

/// A block-addressed device.
///
/// Reads always return exactly `count * block_size()` bytes. When `size()` is
/// not a multiple of `block_size()`, the last block is partial and reads of it
/// are zero-padded.
#[async_trait]
pub trait BlockDevice: Send + Sync {
  fn id(&self) -> &str;

  /// Total size in bytes.
  fn size(&self) -> u64;

  fn block_size(&self) -> usize;

  fn readonly(&self) -> bool;

  /// Number of addressable blocks, counting a trailing partial block.
  fn block_count(&self) -> u64 {
    block_count(self.size(), self.block_size())
  }

  async fn read_blocks(&self, index: u64, count: u64) -> Result<Vec<u8>>;

  /// `data.len()` must be a multiple of `block_size()`.
  async fn write_blocks(&self, index: u64, data: &[u8]) -> Result<()>;

  /// Flush buffered writes. Idempotent.
  async fn sync(&self) -> Result<()>;

  /// Sync, then release underlying resources.
  async fn close(&self) -> Result<()>;
}

pub fn block_count(size: u64, block_size: usize) -> u64 {
  let block_size = block_size as u64;
  (size + block_size - 1) / block_size
}

pub fn check_range(device: &str, index: u64, count: u64, block_count: u64) -> Result<()> {
  match index.checked_add(count) {
    Some(end) if end <= block_count => Ok(()),
    _ => Err(BlockError::OutOfRange {
      device: device.to_string(),
      index,
      count,
      block_count,
    }),
  }
}

/// Returns the number of whole blocks in `len` bytes.
pub fn check_alignment(device: &str, index: u64, len: usize, block_size: usize) -> Result<u64> {
  if len % block_size != 0 {
    return Err(BlockError::Alignment {
      device: device.to_string(),
      index,
      len,
      block_size,
    });
  }
  Ok((len / block_size) as u64)
}

pub fn check_block_size(device: &str, expected: usize, actual: usize) -> Result<()> {
  if expected != actual {
    return Err(BlockError::BlockSizeMismatch {
      device: device.to_string(),
      expected,
      actual,
    });
  }
  Ok(())
}

/// Copies `src[offset..]` into `out`, zero-filling whatever lies past the end
/// of `src`.
pub(crate) fn copy_padded(src: &[u8], offset: u64, out: &mut [u8]) {
  let start = (offset as usize).min(src.len());
  let end = (start + out.len()).min(src.len());
  let n = end - start;
  out[..n].copy_from_slice(&src[start..end]);
  for b in &mut out[n..] {
    *b = 0;
  }
}
