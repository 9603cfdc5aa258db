use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDateTime;
use cowblk::{DiskConfig, OverlaySnapshot};
use prettytable::{cell, row, Table};
use size_format::SizeFormatterBinary;
use structopt::StructOpt;

/// List recorded snapshots of an overlay.
#[derive(Debug, StructOpt)]
pub struct SnapshotsCmd {
  /// Path to the disk config.
  config: PathBuf,
}

/// Flush the overlay and record a snapshot of it.
#[derive(Debug, StructOpt)]
pub struct SnapshotCmd {
  /// Path to the disk config.
  config: PathBuf,

  /// Free-form note stored with the snapshot.
  #[structopt(long)]
  description: Option<String>,
}

pub(crate) fn format_created_at(millis: i64) -> String {
  NaiveDateTime::from_timestamp_opt(millis.div_euclid(1000), 0)
    .map(|x| x.to_string())
    .unwrap_or_else(|| millis.to_string())
}

fn print_snapshots(snapshots: &[OverlaySnapshot]) {
  let mut table = Table::new();
  table.set_titles(row!["ID", "CREATED", "BLOCKS", "SIZE", "DESCRIPTION"]);
  for s in snapshots {
    table.add_row(row![
      s.id,
      format_created_at(s.created_at),
      s.block_count,
      SizeFormatterBinary::new(s.total_bytes),
      s.description.as_deref().unwrap_or("")
    ]);
  }
  table.print_tty(false);
}

impl SnapshotsCmd {
  pub async fn run(&self) -> Result<()> {
    let config = DiskConfig::load_from_file(&self.config)?;
    let overlay = config.open_overlay().await?;
    print_snapshots(&overlay.list_snapshots().await?);
    overlay.close().await?;
    Ok(())
  }
}

impl SnapshotCmd {
  pub async fn run(&self) -> Result<()> {
    let config = DiskConfig::load_from_file(&self.config)?;
    let overlay = config.open_overlay().await?;
    let snapshot = overlay.create_snapshot(self.description.clone()).await?;
    overlay.close().await?;
    print_snapshots(&[snapshot]);
    Ok(())
  }
}
