use thiserror::Error;

pub type Result<T> = std::result::Result<T, BlockError>;

/// Errors surfaced by block devices and the overlay store.
///
/// `device` is the device id for devices and `owner/disk` for overlay stores,
/// so that a failure can be traced back to the disk and session it affects.
#[derive(Debug, Error)]
pub enum BlockError {
  #[error("{device}: blocks [{index}, {index}+{count}) out of range, device has {block_count} blocks")]
  OutOfRange {
    device: String,
    index: u64,
    count: u64,
    block_count: u64,
  },

  #[error("{device}: write at block {index} has length {len}, not a multiple of block size {block_size}")]
  Alignment {
    device: String,
    index: u64,
    len: usize,
    block_size: usize,
  },

  #[error("{device}: block size mismatch: expected {expected}, got {actual}")]
  BlockSizeMismatch {
    device: String,
    expected: usize,
    actual: usize,
  },

  #[error("{device}: device is read-only, rejected write at block {index}")]
  ReadOnly { device: String, index: u64 },

  #[error("{device}: io error: {message}")]
  Io { device: String, message: String },

  #[error("{device}: overlay store is not open")]
  NotInitialized { device: String },
}

impl BlockError {
  pub fn io(device: impl Into<String>, err: impl std::fmt::Display) -> Self {
    Self::Io {
      device: device.into(),
      message: err.to_string(),
    }
  }

  /// Re-attributes a failure of a lower layer to blocks `[index, index+count)`
  /// of `device`. The original device stays in the message.
  pub fn within(self, device: &str, index: u64, count: u64) -> Self {
    match self {
      Self::Io {
        device: inner,
        message,
      } => Self::Io {
        device: device.to_string(),
        message: format!("blocks [{}, {}+{}): {}: {}", index, index, count, inner, message),
      },
      Self::NotInitialized { .. } => Self::NotInitialized {
        device: device.to_string(),
      },
      other => other,
    }
  }

  pub fn device(&self) -> &str {
    match self {
      Self::OutOfRange { device, .. }
      | Self::Alignment { device, .. }
      | Self::BlockSizeMismatch { device, .. }
      | Self::ReadOnly { device, .. }
      | Self::Io { device, .. }
      | Self::NotInitialized { device } => device,
    }
  }
}
