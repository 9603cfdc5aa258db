use std::path::PathBuf;

use anyhow::Result;
use cowblk::{BlockDevice, DiskConfig};
use itertools::Itertools;
use prettytable::{cell, row, Table};
use size_format::SizeFormatterBinary;
use structopt::StructOpt;

/// Show the size and overlay state of a disk.
#[derive(Debug, StructOpt)]
pub struct InfoCmd {
  /// Path to the disk config.
  config: PathBuf,
}

impl InfoCmd {
  pub async fn run(&self) -> Result<()> {
    let config = DiskConfig::load_from_file(&self.config)?;
    let dev = config.open().await?;
    let overlay = dev.overlay();
    let modified = overlay.block_count().await?;
    let ranges = overlay.modified_ranges().await?;

    let mut table = Table::new();
    table.add_row(row!["ID", dev.id()]);
    table.add_row(row![
      "SIZE",
      format!("{} ({} bytes)", SizeFormatterBinary::new(dev.size()), dev.size())
    ]);
    table.add_row(row!["BLOCK SIZE", dev.block_size()]);
    table.add_row(row!["BLOCKS", dev.block_count()]);
    table.add_row(row![
      "OWNER/DISK",
      format!("{}/{}", overlay.owner_id(), overlay.disk_id())
    ]);
    table.add_row(row![
      "MODIFIED",
      format!(
        "{} blocks ({})",
        modified,
        SizeFormatterBinary::new(overlay.total_bytes().await?)
      )
    ]);
    table.add_row(row![
      "RANGES",
      ranges
        .iter()
        .map(|x| format!("[{}, {})", x.start, x.end))
        .join(", ")
    ]);
    table.print_tty(false);

    dev.close().await?;
    Ok(())
  }
}
