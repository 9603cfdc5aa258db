use std::{
  path::{Path, PathBuf},
  sync::Arc,
};

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;

use crate::{
  backend::{OverlayBackend, SqliteBackend},
  cow::{CowBlockDevice, CowOptions, DEFAULT_MAX_COALESCED_BLOCKS},
  device::{BlockDevice, DEFAULT_BLOCK_SIZE},
  local::LocalSourceDevice,
  overlay::{OverlayStore, DEFAULT_FLUSH_THRESHOLD},
  remote::RemoteSourceDevice,
};

#[derive(Deserialize, Debug, Clone)]
pub struct DiskConfig {
  /// Device id, used in logs and errors.
  pub id: String,

  /// Bytes per block. Defaults to 64 KiB.
  pub block_size: Option<usize>,

  /// Longest run of blocks fetched from the base in one read. Defaults to 256.
  pub max_coalesced_blocks: Option<u64>,

  pub base: BaseConfig,
  pub overlay: OverlayConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BaseConfig {
  /// Local image file.
  File(PathBuf),

  /// HTTP(S) URL of an image served with range support.
  Url(String),
}

#[derive(Deserialize, Debug, Clone)]
pub struct OverlayConfig {
  /// Path to the overlay database. Created if missing.
  pub db: PathBuf,

  pub owner_id: String,
  pub disk_id: String,

  /// Buffered blocks before an automatic flush. Defaults to 16.
  pub flush_threshold: Option<usize>,
}

#[derive(Error, Debug)]
enum ConfigError {
  #[error("`{0}` must be greater than zero")]
  Zero(&'static str),

  #[error("`{0}` must not be empty")]
  Empty(&'static str),
}

impl DiskConfig {
  pub fn load_from_file(path: &Path) -> Result<Self> {
    let text = std::fs::read_to_string(path)
      .with_context(|| format!("cannot open disk config at {}", path.display()))?;
    Self::from_yaml(&text).with_context(|| format!("invalid disk config at {}", path.display()))
  }

  pub fn from_yaml(text: &str) -> Result<Self> {
    let config: Self = serde_yaml::from_str(text)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.id.is_empty() {
      return Err(ConfigError::Empty("id").into());
    }
    if self.overlay.owner_id.is_empty() {
      return Err(ConfigError::Empty("overlay.owner_id").into());
    }
    if self.overlay.disk_id.is_empty() {
      return Err(ConfigError::Empty("overlay.disk_id").into());
    }
    if self.block_size == Some(0) {
      return Err(ConfigError::Zero("block_size").into());
    }
    if self.max_coalesced_blocks == Some(0) {
      return Err(ConfigError::Zero("max_coalesced_blocks").into());
    }
    if self.overlay.flush_threshold == Some(0) {
      return Err(ConfigError::Zero("overlay.flush_threshold").into());
    }
    Ok(())
  }

  pub fn block_size(&self) -> usize {
    self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE)
  }

  pub fn cow_options(&self) -> CowOptions {
    CowOptions {
      id: self.id.clone(),
      block_size: Some(self.block_size()),
      max_coalesced_blocks: self
        .max_coalesced_blocks
        .unwrap_or(DEFAULT_MAX_COALESCED_BLOCKS),
    }
  }

  pub async fn open_base(&self) -> Result<Arc<dyn BlockDevice>> {
    let id = format!("{}-base", self.id);
    let base: Arc<dyn BlockDevice> = match &self.base {
      BaseConfig::File(path) => Arc::new(LocalSourceDevice::open_file(id, path, self.block_size())?),
      BaseConfig::Url(url) => {
        Arc::new(RemoteSourceDevice::open_url(id, url, self.block_size()).await?)
      }
    };
    Ok(base)
  }

  pub fn open_backend(&self) -> Result<Arc<dyn OverlayBackend>> {
    Ok(Arc::new(SqliteBackend::open_file(&self.overlay.db)?))
  }

  /// Opens and initializes the overlay store alone, without touching the base.
  pub async fn open_overlay(&self) -> Result<OverlayStore> {
    let store = OverlayStore::new(
      self.open_backend()?,
      &self.overlay.owner_id,
      &self.overlay.disk_id,
      self.block_size(),
    )
    .with_flush_threshold(
      self
        .overlay
        .flush_threshold
        .unwrap_or(DEFAULT_FLUSH_THRESHOLD),
    );
    store.init().await?;
    Ok(store)
  }

  pub async fn open(&self) -> Result<CowBlockDevice> {
    let base = self.open_base().await?;
    let overlay = self.open_overlay().await?;
    Ok(CowBlockDevice::new(self.cow_options(), base, overlay)?)
  }
}
