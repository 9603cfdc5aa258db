mod cmd_clear;
mod cmd_info;
mod cmd_read;
mod cmd_snapshot;
mod cmd_transfer;

use anyhow::Result;
use cmd_clear::ClearCmd;
use cmd_info::InfoCmd;
use cmd_read::ReadCmd;
use cmd_snapshot::{SnapshotCmd, SnapshotsCmd};
use cmd_transfer::{ExportCmd, ImportCmd};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
struct Opt {
  #[structopt(subcommand)]
  subcommand: Subcmd,
}

#[derive(Debug, StructOpt)]
enum Subcmd {
  Info(InfoCmd),
  Snapshots(SnapshotsCmd),
  Snapshot(SnapshotCmd),
  Export(ExportCmd),
  Import(ImportCmd),
  Clear(ClearCmd),
  Read(ReadCmd),
}

#[tokio::main]
async fn main() -> Result<()> {
  if std::env::var("RUST_LOG").is_err() {
    std::env::set_var("RUST_LOG", "info");
  }
  pretty_env_logger::init_timed();
  let opt = Opt::from_args();
  match &opt.subcommand {
    Subcmd::Info(cmd) => {
      cmd.run().await?;
    }
    Subcmd::Snapshots(cmd) => {
      cmd.run().await?;
    }
    Subcmd::Snapshot(cmd) => {
      cmd.run().await?;
    }
    Subcmd::Export(cmd) => {
      cmd.run().await?;
    }
    Subcmd::Import(cmd) => {
      cmd.run().await?;
    }
    Subcmd::Clear(cmd) => {
      cmd.run().await?;
    }
    Subcmd::Read(cmd) => {
      cmd.run().await?;
    }
  }
  Ok(())
}
