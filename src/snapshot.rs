//! Overlay snapshots and the portable export format.
//!
//! An export file is laid out as:
//!
//! ```text
//! magic          "COWBLK_OVERLAY_V1\0"
//! header_len     u32 LE
//! header         JSON { snapshot, block_size }
//! entries        repeated until EOF:
//!   checksum     [u8; 32]  blake3(index LE || data)
//!   index        u64 LE
//!   len          u64 LE
//!   data         [u8; len]
//! ```

use std::io::{ErrorKind, Read, Write};

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const EXPORT_MAGIC: &[u8] = b"COWBLK_OVERLAY_V1\0";

/// Largest block size accepted from an export header.
pub const MAX_EXPORT_BLOCK_SIZE: usize = 64 << 20;

/// Largest JSON header accepted from an export file.
const MAX_HEADER_LEN: u32 = 1 << 20;

/// Point-in-time summary of an overlay. Does not own block data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlaySnapshot {
  pub id: String,
  pub owner_id: String,
  pub disk_id: String,
  /// Milliseconds since the Unix epoch.
  pub created_at: i64,
  pub block_count: u64,
  pub total_bytes: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
}

/// The modified-block set of an overlay, detached from any store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayExport {
  pub snapshot: OverlaySnapshot,
  pub block_size: usize,
  /// Sorted by block index.
  pub blocks: Vec<(u64, Vec<u8>)>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportHeader {
  snapshot: OverlaySnapshot,
  block_size: usize,
}

fn checksum_block(index: u64, data: &[u8]) -> [u8; 32] {
  let mut hasher = blake3::Hasher::new();
  hasher.update(&index.to_le_bytes());
  hasher.update(data);
  hasher.finalize().into()
}

pub fn write_export(w: &mut impl Write, export: &OverlayExport) -> Result<()> {
  let header = serde_json::to_vec(&ExportHeader {
    snapshot: export.snapshot.clone(),
    block_size: export.block_size,
  })?;

  w.write_all(EXPORT_MAGIC)?;
  w.write_u32::<LittleEndian>(header.len() as u32)?;
  w.write_all(&header)?;
  for (index, data) in &export.blocks {
    w.write_all(&checksum_block(*index, data))?;
    w.write_u64::<LittleEndian>(*index)?;
    w.write_u64::<LittleEndian>(data.len() as u64)?;
    w.write_all(data)?;
  }
  Ok(())
}

pub fn read_export(r: &mut impl Read) -> Result<OverlayExport> {
  #[derive(Error, Debug)]
  #[error("bad magic in overlay export")]
  struct BadMagic;

  #[derive(Error, Debug)]
  #[error("export header is {0} bytes, limit is {1}")]
  struct HeaderTooLarge(u32, u32);

  #[derive(Error, Debug)]
  #[error("export block size {0} is outside 1..={1}")]
  struct BadBlockSize(usize, usize);

  #[derive(Error, Debug)]
  #[error("entry {0} (block {1}) has length {2}, expected block size {3}")]
  struct BadLength(usize, u64, u64, usize);

  #[derive(Error, Debug)]
  #[error("entry {0} (block {1}) failed checksum verification: expected {2}, got {3}")]
  struct BadChecksum(usize, u64, String, String);

  let mut magic = [0u8; EXPORT_MAGIC.len()];
  r.read_exact(&mut magic)?;
  if magic != EXPORT_MAGIC {
    return Err(BadMagic.into());
  }

  let header_len = r.read_u32::<LittleEndian>()?;
  if header_len > MAX_HEADER_LEN {
    return Err(HeaderTooLarge(header_len, MAX_HEADER_LEN).into());
  }
  let mut header = vec![0u8; header_len as usize];
  r.read_exact(&mut header)?;
  let header: ExportHeader = serde_json::from_slice(&header)?;
  if header.block_size == 0 || header.block_size > MAX_EXPORT_BLOCK_SIZE {
    return Err(BadBlockSize(header.block_size, MAX_EXPORT_BLOCK_SIZE).into());
  }

  let mut blocks = vec![];
  loop {
    let mut checksum = [0u8; 32];
    // A clean EOF can only happen on an entry boundary.
    match read_full_or_eof(r, &mut checksum)? {
      true => {}
      false => break,
    }
    let entry = blocks.len();
    let index = r.read_u64::<LittleEndian>()?;
    let len = r.read_u64::<LittleEndian>()?;
    if len != header.block_size as u64 {
      return Err(BadLength(entry, index, len, header.block_size).into());
    }
    let mut data = vec![0u8; len as usize];
    r.read_exact(&mut data)?;

    let actual = checksum_block(index, &data);
    if actual != checksum {
      return Err(BadChecksum(entry, index, hex::encode(checksum), hex::encode(actual)).into());
    }
    blocks.push((index, data));
  }

  Ok(OverlayExport {
    snapshot: header.snapshot,
    block_size: header.block_size,
    blocks,
  })
}

/// Fills `buf`, returning false if the reader was already at EOF. EOF in the
/// middle of `buf` is an error.
fn read_full_or_eof(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<bool> {
  let mut filled = 0;
  while filled < buf.len() {
    match r.read(&mut buf[filled..]) {
      Ok(0) if filled == 0 => return Ok(false),
      Ok(0) => {
        return Err(std::io::Error::new(
          ErrorKind::UnexpectedEof,
          "truncated overlay export entry",
        ))
      }
      Ok(n) => filled += n,
      Err(e) if e.kind() == ErrorKind::Interrupted => {}
      Err(e) => return Err(e),
    }
  }
  Ok(true)
}
