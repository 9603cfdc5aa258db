use std::{
  fs::File,
  io::{BufReader, BufWriter, Write},
  path::PathBuf,
};

use anyhow::Result;
use cowblk::{snapshot, DiskConfig};
use size_format::SizeFormatterBinary;
use structopt::StructOpt;

/// Write every modified block of an overlay to a portable file.
#[derive(Debug, StructOpt)]
pub struct ExportCmd {
  /// Path to the disk config.
  config: PathBuf,

  /// Output file.
  #[structopt(long, short = "o")]
  output: PathBuf,

  /// Free-form note stored with the export snapshot.
  #[structopt(long)]
  description: Option<String>,
}

/// Replace the contents of an overlay with an exported file.
#[derive(Debug, StructOpt)]
pub struct ImportCmd {
  /// Path to the disk config.
  config: PathBuf,

  /// Input file produced by `export`.
  #[structopt(long, short = "i")]
  input: PathBuf,
}

impl ExportCmd {
  pub async fn run(&self) -> Result<()> {
    let config = DiskConfig::load_from_file(&self.config)?;
    let overlay = config.open_overlay().await?;
    let export = overlay.export(self.description.clone()).await?;
    overlay.close().await?;

    let mut w = BufWriter::new(File::create(&self.output)?);
    snapshot::write_export(&mut w, &export)?;
    w.flush()?;
    w.get_ref().sync_all()?;

    log::info!(
      "Wrote {} blocks ({}) of snapshot {} to {}.",
      export.blocks.len(),
      SizeFormatterBinary::new(export.snapshot.total_bytes),
      export.snapshot.id,
      self.output.display()
    );
    Ok(())
  }
}

impl ImportCmd {
  pub async fn run(&self) -> Result<()> {
    let config = DiskConfig::load_from_file(&self.config)?;
    let export = snapshot::read_export(&mut BufReader::new(File::open(&self.input)?))?;
    let overlay = config.open_overlay().await?;
    overlay.import(export).await?;
    overlay.close().await?;
    Ok(())
  }
}
