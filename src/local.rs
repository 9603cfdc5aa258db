use std::{fs::File, path::Path};

use async_trait::async_trait;
use fs2::FileExt;
use memmap2::Mmap;

use crate::{
  device::{check_range, copy_padded, BlockDevice},
  error::{BlockError, Result},
};

enum Source {
  Memory(Vec<u8>),
  Mapped {
    // Holds the shared lock for as long as the mapping lives.
    _file: File,
    map: Mmap,
  },
}

impl Source {
  fn bytes(&self) -> &[u8] {
    match self {
      Source::Memory(x) => x,
      Source::Mapped { map, .. } => map,
    }
  }
}

/// Read-only base device over a fixed-size local byte source.
pub struct LocalSourceDevice {
  id: String,
  block_size: usize,
  source: Source,
}

impl LocalSourceDevice {
  pub fn from_bytes(id: impl Into<String>, data: Vec<u8>, block_size: usize) -> Self {
    assert!(block_size > 0, "block size must be non-zero");
    Self {
      id: id.into(),
      block_size,
      source: Source::Memory(data),
    }
  }

  /// Maps an image file read-only. A shared lock is held on the file so that
  /// an exclusive writer elsewhere cannot change the base underneath us.
  pub fn open_file(id: impl Into<String>, path: &Path, block_size: usize) -> Result<Self> {
    assert!(block_size > 0, "block size must be non-zero");
    let id = id.into();
    let file = File::open(path)
      .map_err(|e| BlockError::io(&id, format!("cannot open {}: {}", path.display(), e)))?;
    file
      .try_lock_shared()
      .map_err(|e| BlockError::io(&id, format!("cannot lock {}: {}", path.display(), e)))?;
    let len = file
      .metadata()
      .map_err(|e| BlockError::io(&id, e))?
      .len();

    // Zero-length files cannot be mapped.
    let source = if len == 0 {
      Source::Memory(Vec::new())
    } else {
      let map = unsafe { Mmap::map(&file) }.map_err(|e| BlockError::io(&id, e))?;
      Source::Mapped { _file: file, map }
    };

    log::info!(
      "Opened base image {} ({} bytes) as device {}.",
      path.display(),
      len,
      id
    );
    Ok(Self {
      id,
      block_size,
      source,
    })
  }
}

#[async_trait]
impl BlockDevice for LocalSourceDevice {
  fn id(&self) -> &str {
    &self.id
  }

  fn size(&self) -> u64 {
    self.source.bytes().len() as u64
  }

  fn block_size(&self) -> usize {
    self.block_size
  }

  fn readonly(&self) -> bool {
    true
  }

  async fn read_blocks(&self, index: u64, count: u64) -> Result<Vec<u8>> {
    check_range(&self.id, index, count, self.block_count())?;
    let mut out = vec![0u8; count as usize * self.block_size];
    copy_padded(
      self.source.bytes(),
      index * self.block_size as u64,
      &mut out,
    );
    Ok(out)
  }

  async fn write_blocks(&self, index: u64, _data: &[u8]) -> Result<()> {
    Err(BlockError::ReadOnly {
      device: self.id.clone(),
      index,
    })
  }

  async fn sync(&self) -> Result<()> {
    Ok(())
  }

  async fn close(&self) -> Result<()> {
    Ok(())
  }
}
