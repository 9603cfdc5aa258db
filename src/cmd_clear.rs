use std::path::PathBuf;

use anyhow::Result;
use cowblk::DiskConfig;
use structopt::StructOpt;
use thiserror::Error;

/// Delete every modified block of an overlay, reverting the disk to its base.
#[derive(Debug, StructOpt)]
pub struct ClearCmd {
  /// Path to the disk config.
  config: PathBuf,

  /// Data loss confirmation.
  #[structopt(long)]
  confirm: bool,
}

impl ClearCmd {
  pub async fn run(&self) -> Result<()> {
    #[derive(Error, Debug)]
    #[error("clear discards all changes to the disk - please confirm by adding the flag `--confirm`.")]
    struct NotConfirmed;

    if !self.confirm {
      return Err(NotConfirmed.into());
    }
    let config = DiskConfig::load_from_file(&self.config)?;
    let overlay = config.open_overlay().await?;
    overlay.clear().await?;
    overlay.close().await?;
    Ok(())
  }
}
