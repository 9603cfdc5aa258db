use std::{fs::File, io::Write, path::PathBuf};

use anyhow::Result;
use cowblk::{BlockDevice, DiskConfig};
use structopt::StructOpt;

/// Dump merged blocks of a disk to a file.
#[derive(Debug, StructOpt)]
pub struct ReadCmd {
  /// Path to the disk config.
  config: PathBuf,

  /// First block index.
  #[structopt(long)]
  block: u64,

  /// Number of blocks.
  #[structopt(long, default_value = "1")]
  count: u64,

  /// Output file.
  #[structopt(long, short = "o")]
  output: PathBuf,
}

impl ReadCmd {
  pub async fn run(&self) -> Result<()> {
    let config = DiskConfig::load_from_file(&self.config)?;
    let dev = config.open().await?;
    let mut out = File::create(&self.output)?;

    // Bounded chunks keep memory flat for large dumps.
    let step = config.cow_options().max_coalesced_blocks;
    let end = self.block.saturating_add(self.count);
    let mut index = self.block;
    while index < end {
      let n = step.min(end - index);
      out.write_all(&dev.read_blocks(index, n).await?)?;
      index += n;
    }
    out.sync_all()?;
    dev.close().await?;

    log::info!(
      "Wrote blocks [{}, {}) of {} to {}.",
      self.block,
      end,
      dev.id(),
      self.output.display()
    );
    Ok(())
  }
}
