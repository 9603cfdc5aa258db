//! Copy-on-write block devices over read-only base images.
//!
//! A [`CowBlockDevice`] layers a durable, sparse [`OverlayStore`] over a
//! read-only base ([`LocalSourceDevice`] or [`RemoteSourceDevice`]). Writes land
//! in the overlay; the base is never modified.

pub mod backend;
pub mod config;
pub mod cow;
pub mod device;
pub mod error;
pub mod local;
pub mod overlay;
pub mod remote;
pub mod snapshot;
mod util;

pub use backend::{DiskKey, MemoryBackend, OverlayBackend, SqliteBackend};
pub use config::DiskConfig;
pub use cow::{CowBlockDevice, CowOptions};
pub use device::{BlockDevice, DEFAULT_BLOCK_SIZE};
pub use error::{BlockError, Result};
pub use local::LocalSourceDevice;
pub use overlay::OverlayStore;
pub use remote::{HttpRangeFetcher, RangeFetcher, RangeResponse, RemoteSourceDevice};
pub use snapshot::{OverlayExport, OverlaySnapshot};
