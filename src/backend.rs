use std::{
  collections::{BTreeMap, HashMap},
  fmt,
  path::Path,
  sync::Arc,
  time::Duration,
};

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use thiserror::Error;

use crate::{
  error::{BlockError, Result},
  snapshot::OverlaySnapshot,
};

macro_rules! migration {
  ($id:ident, $($version:expr,)*) => {
    static $id: &'static [(&'static str, &'static str)] = &[
      $(($version, include_str!(concat!("./migration/", $version, ".sql"))),)*
    ];
  };
}

migration!(VERSIONS, "000001", "000002",);

/// Block data keyed by block index.
pub type BlockBatch = BTreeMap<u64, Vec<u8>>;

/// Scope of one overlay inside a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskKey {
  pub owner_id: String,
  pub disk_id: String,
}

impl DiskKey {
  pub fn new(owner_id: impl Into<String>, disk_id: impl Into<String>) -> Self {
    Self {
      owner_id: owner_id.into(),
      disk_id: disk_id.into(),
    }
  }
}

impl fmt::Display for DiskKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.owner_id, self.disk_id)
  }
}

/// Durable storage behind an `OverlayStore`.
///
/// Every method is scoped to one `DiskKey`; overlays of different disks never
/// see each other's blocks. `write_batch` and `replace_all` are atomic.
#[async_trait]
pub trait OverlayBackend: Send + Sync {
  /// Records the disk if it is new and returns its persisted block size.
  async fn register_disk(&self, key: &DiskKey, block_size: usize) -> Result<usize>;

  /// Stored blocks with index in `[start, end)`, in index order.
  async fn read_range(&self, key: &DiskKey, start: u64, end: u64) -> Result<Vec<(u64, Vec<u8>)>>;

  async fn write_batch(&self, key: &DiskKey, batch: Arc<BlockBatch>, timestamp: i64)
    -> Result<()>;

  async fn list_indices(&self, key: &DiskKey) -> Result<Vec<u64>>;

  async fn read_all(&self, key: &DiskKey) -> Result<Vec<(u64, Vec<u8>)>>;

  /// Deletes every block of the disk and stores `blocks` in its place.
  async fn replace_all(&self, key: &DiskKey, blocks: BlockBatch, timestamp: i64) -> Result<()>;

  /// Returns the number of deleted blocks.
  async fn clear(&self, key: &DiskKey) -> Result<u64>;

  async fn put_snapshot(&self, snapshot: &OverlaySnapshot) -> Result<()>;

  /// Recorded snapshots, oldest first.
  async fn list_snapshots(&self, key: &DiskKey) -> Result<Vec<OverlaySnapshot>>;
}

/// SQLite-backed overlay storage. One database file can hold the overlays of
/// many disks.
#[derive(Clone)]
pub struct SqliteBackend {
  db: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
  pub fn open_file(path: &Path) -> Result<Self> {
    let name = path.display().to_string();
    let mut db = Connection::open_with_flags(
      path,
      OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
    )
    .map_err(|e| BlockError::io(&name, e))?;

    // A committed flush must survive power loss.
    db.execute_batch(
      r#"
      pragma journal_mode = wal;
      pragma synchronous = full;
    "#,
    )
    .map_err(|e| BlockError::io(&name, e))?;
    db.busy_handler(Some(|i| {
      log::debug!("Waiting for lock on overlay database (attempt {})", i);
      std::thread::sleep(Duration::from_millis(100));
      true
    }))
    .map_err(|e| BlockError::io(&name, e))?;

    run_migration(&mut db).map_err(|e| BlockError::io(&name, format!("migration failed: {:#}", e)))?;

    log::info!("Opened overlay database at {}.", name);
    Ok(Self {
      db: Arc::new(Mutex::new(db)),
    })
  }

  async fn run<T, F>(&self, key: &DiskKey, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
  {
    let db = self.db.clone();
    match tokio::task::spawn_blocking(move || f(&mut *db.lock())).await {
      Ok(Ok(x)) => Ok(x),
      Ok(Err(e)) => Err(BlockError::io(key.to_string(), e)),
      Err(e) => Err(BlockError::io(key.to_string(), format!("task join error: {}", e))),
    }
  }
}

#[async_trait]
impl OverlayBackend for SqliteBackend {
  async fn register_disk(&self, key: &DiskKey, block_size: usize) -> Result<usize> {
    let k = key.clone();
    let now = crate::util::now_millis();
    let stored: u64 = self
      .run(key, move |db| {
        db.prepare_cached(
          "insert or ignore into disk_v1 (owner_id, disk_id, block_size, created_at) values(?, ?, ?, ?)",
        )?
        .execute(params![k.owner_id, k.disk_id, block_size as u64, now])?;
        let mut stmt =
          db.prepare_cached("select block_size from disk_v1 where owner_id = ? and disk_id = ?")?;
        let stored: u64 = stmt.query_row(params![k.owner_id, k.disk_id], |r| r.get(0))?;
        Ok(stored)
      })
      .await?;
    Ok(stored as usize)
  }

  async fn read_range(&self, key: &DiskKey, start: u64, end: u64) -> Result<Vec<(u64, Vec<u8>)>> {
    let k = key.clone();
    // SQLite integers are signed.
    let end = end.min(i64::MAX as u64);
    self
      .run(key, move |db| {
        let mut stmt = db.prepare_cached(
          r#"
          select block_index, data from overlay_block_v1
          where owner_id = ? and disk_id = ? and block_index >= ? and block_index < ?
          order by block_index asc
        "#,
        )?;
        let rows = stmt.query_map(params![k.owner_id, k.disk_id, start, end], |r| {
          Ok((r.get(0)?, r.get(1)?))
        })?;
        let result: rusqlite::Result<Vec<_>> = rows.collect();
        result
      })
      .await
  }

  async fn write_batch(
    &self,
    key: &DiskKey,
    batch: Arc<BlockBatch>,
    timestamp: i64,
  ) -> Result<()> {
    let k = key.clone();
    self
      .run(key, move |db| {
        let txn = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        {
          let mut stmt = txn.prepare_cached(
            "replace into overlay_block_v1 (owner_id, disk_id, block_index, data, updated_at) values(?, ?, ?, ?, ?)",
          )?;
          for (index, data) in batch.iter() {
            stmt.execute(params![k.owner_id, k.disk_id, index, data, timestamp])?;
          }
        }
        txn.commit()
      })
      .await
  }

  async fn list_indices(&self, key: &DiskKey) -> Result<Vec<u64>> {
    let k = key.clone();
    self
      .run(key, move |db| {
        let mut stmt = db.prepare_cached(
          "select block_index from overlay_block_v1 where owner_id = ? and disk_id = ? order by block_index asc",
        )?;
        let rows = stmt.query_map(params![k.owner_id, k.disk_id], |r| r.get(0))?;
        let result: rusqlite::Result<Vec<_>> = rows.collect();
        result
      })
      .await
  }

  async fn read_all(&self, key: &DiskKey) -> Result<Vec<(u64, Vec<u8>)>> {
    self.read_range(key, 0, u64::MAX).await
  }

  async fn replace_all(&self, key: &DiskKey, blocks: BlockBatch, timestamp: i64) -> Result<()> {
    let k = key.clone();
    self
      .run(key, move |db| {
        let txn = db.transaction_with_behavior(TransactionBehavior::Immediate)?;
        txn.execute(
          "delete from overlay_block_v1 where owner_id = ? and disk_id = ?",
          params![k.owner_id, k.disk_id],
        )?;
        {
          let mut stmt = txn.prepare_cached(
            "insert into overlay_block_v1 (owner_id, disk_id, block_index, data, updated_at) values(?, ?, ?, ?, ?)",
          )?;
          for (index, data) in &blocks {
            stmt.execute(params![k.owner_id, k.disk_id, index, data, timestamp])?;
          }
        }
        txn.commit()
      })
      .await
  }

  async fn clear(&self, key: &DiskKey) -> Result<u64> {
    let k = key.clone();
    let n = self
      .run(key, move |db| {
        let n = db.execute(
          "delete from overlay_block_v1 where owner_id = ? and disk_id = ?",
          params![k.owner_id, k.disk_id],
        )?;
        Ok(n)
      })
      .await?;
    Ok(n as u64)
  }

  async fn put_snapshot(&self, snapshot: &OverlaySnapshot) -> Result<()> {
    let key = DiskKey::new(&snapshot.owner_id, &snapshot.disk_id);
    let s = snapshot.clone();
    self
      .run(&key, move |db| {
        db.prepare_cached(
          r#"
          insert into snapshot_v1 (id, owner_id, disk_id, created_at, block_count, total_bytes, description)
          values(?, ?, ?, ?, ?, ?, ?)
        "#,
        )?
        .execute(params![
          s.id,
          s.owner_id,
          s.disk_id,
          s.created_at,
          s.block_count,
          s.total_bytes,
          s.description
        ])?;
        Ok(())
      })
      .await
  }

  async fn list_snapshots(&self, key: &DiskKey) -> Result<Vec<OverlaySnapshot>> {
    let k = key.clone();
    self
      .run(key, move |db| {
        let mut stmt = db.prepare_cached(
          r#"
          select id, created_at, block_count, total_bytes, description from snapshot_v1
          where owner_id = ? and disk_id = ?
          order by created_at asc, rowid asc
        "#,
        )?;
        let rows = stmt.query_map(params![k.owner_id, k.disk_id], |r| {
          Ok(OverlaySnapshot {
            id: r.get(0)?,
            owner_id: k.owner_id.clone(),
            disk_id: k.disk_id.clone(),
            created_at: r.get(1)?,
            block_count: r.get(2)?,
            total_bytes: r.get(3)?,
            description: r.get(4)?,
          })
        })?;
        let result: rusqlite::Result<Vec<_>> = rows.collect();
        result
      })
      .await
  }
}

fn run_migration(db: &mut Connection) -> AnyResult<()> {
  #[derive(Error, Debug)]
  #[error("database schema version is newer than the supported version")]
  struct SchemaTooNew;

  let txn = db.transaction_with_behavior(TransactionBehavior::Immediate)?;

  let table_exists: u32 = txn.query_row(
    "select count(*) from sqlite_master where type='table' and name='cowblk_config'",
    params![],
    |r| r.get(0),
  )?;
  let current_version: Option<String> = if table_exists == 1 {
    txn
      .query_row(
        "select v from cowblk_config where k = 'schema_version'",
        params![],
        |r| r.get(0),
      )
      .optional()?
  } else {
    None
  };
  let current_version: u64 = current_version.map(|x| x.parse()).transpose()?.unwrap_or(0);
  let latest_version: u64 = match VERSIONS.last() {
    Some((v, _)) => v.parse()?,
    None => 0,
  };
  if current_version > latest_version {
    return Err(SchemaTooNew.into());
  }
  for &(version, sql) in VERSIONS {
    let version: u64 = version.parse()?;
    if version > current_version {
      txn.execute_batch(sql)?;
      log::info!("Applied overlay schema migration {}.", version);
    }
  }
  txn.execute(
    "replace into cowblk_config (k, v) values('schema_version', ?)",
    params![format!("{}", latest_version)],
  )?;
  txn.commit()?;
  Ok(())
}

/// Process-local overlay storage. Clones share the same contents, so a store
/// reopened over a clone observes everything flushed before.
#[derive(Clone, Default)]
pub struct MemoryBackend {
  inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
  disks: HashMap<DiskKey, usize>,
  blocks: HashMap<DiskKey, BTreeMap<u64, (Vec<u8>, i64)>>,
  snapshots: Vec<OverlaySnapshot>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl OverlayBackend for MemoryBackend {
  async fn register_disk(&self, key: &DiskKey, block_size: usize) -> Result<usize> {
    let mut inner = self.inner.lock();
    Ok(*inner.disks.entry(key.clone()).or_insert(block_size))
  }

  async fn read_range(&self, key: &DiskKey, start: u64, end: u64) -> Result<Vec<(u64, Vec<u8>)>> {
    let inner = self.inner.lock();
    Ok(match inner.blocks.get(key) {
      Some(blocks) if start < end => blocks
        .range(start..end)
        .map(|(index, (data, _))| (*index, data.clone()))
        .collect(),
      _ => vec![],
    })
  }

  async fn write_batch(
    &self,
    key: &DiskKey,
    batch: Arc<BlockBatch>,
    timestamp: i64,
  ) -> Result<()> {
    let mut inner = self.inner.lock();
    let blocks = inner.blocks.entry(key.clone()).or_default();
    for (index, data) in batch.iter() {
      blocks.insert(*index, (data.clone(), timestamp));
    }
    Ok(())
  }

  async fn list_indices(&self, key: &DiskKey) -> Result<Vec<u64>> {
    let inner = self.inner.lock();
    Ok(
      inner
        .blocks
        .get(key)
        .map(|x| x.keys().copied().collect())
        .unwrap_or_default(),
    )
  }

  async fn read_all(&self, key: &DiskKey) -> Result<Vec<(u64, Vec<u8>)>> {
    self.read_range(key, 0, u64::MAX).await
  }

  async fn replace_all(&self, key: &DiskKey, blocks: BlockBatch, timestamp: i64) -> Result<()> {
    let mut inner = self.inner.lock();
    inner.blocks.insert(
      key.clone(),
      blocks
        .into_iter()
        .map(|(index, data)| (index, (data, timestamp)))
        .collect(),
    );
    Ok(())
  }

  async fn clear(&self, key: &DiskKey) -> Result<u64> {
    let mut inner = self.inner.lock();
    Ok(inner.blocks.remove(key).map(|x| x.len() as u64).unwrap_or(0))
  }

  async fn put_snapshot(&self, snapshot: &OverlaySnapshot) -> Result<()> {
    self.inner.lock().snapshots.push(snapshot.clone());
    Ok(())
  }

  async fn list_snapshots(&self, key: &DiskKey) -> Result<Vec<OverlaySnapshot>> {
    let inner = self.inner.lock();
    Ok(
      inner
        .snapshots
        .iter()
        .filter(|s| s.owner_id == key.owner_id && s.disk_id == key.disk_id)
        .cloned()
        .collect(),
    )
  }
}


#[cfg(test)]
mod tests {
  use super::*;

  fn batch(entries: &[(u64, u8)]) -> Arc<BlockBatch> {
    Arc::new(
      entries
        .iter()
        .map(|&(index, fill)| (index, vec![fill; 16]))
        .collect(),
    )
  }

  async fn exercise(backend: &dyn OverlayBackend) {
    let a = DiskKey::new("alice", "root");
    let b = DiskKey::new("bob", "root");

    assert_eq!(backend.register_disk(&a, 16).await.unwrap(), 16);
    // First registration wins.
    assert_eq!(backend.register_disk(&a, 32).await.unwrap(), 16);
    assert_eq!(backend.register_disk(&b, 16).await.unwrap(), 16);

    backend
      .write_batch(&a, batch(&[(1, 0x11), (2, 0x22), (9, 0x99)]), 1)
      .await
      .unwrap();
    backend.write_batch(&b, batch(&[(2, 0xBB)]), 1).await.unwrap();
    backend.write_batch(&a, batch(&[(2, 0x2F)]), 2).await.unwrap();

    let got = backend.read_range(&a, 0, 5).await.unwrap();
    assert_eq!(got, vec![(1, vec![0x11; 16]), (2, vec![0x2F; 16])]);
    assert_eq!(backend.list_indices(&a).await.unwrap(), vec![1, 2, 9]);
    assert_eq!(backend.list_indices(&b).await.unwrap(), vec![2]);
    assert_eq!(backend.read_all(&a).await.unwrap().len(), 3);

    let replacement: BlockBatch = vec![(4, vec![0x44; 16])].into_iter().collect();
    backend.replace_all(&a, replacement, 3).await.unwrap();
    assert_eq!(backend.list_indices(&a).await.unwrap(), vec![4]);
    assert_eq!(backend.list_indices(&b).await.unwrap(), vec![2]);

    assert_eq!(backend.clear(&a).await.unwrap(), 1);
    assert!(backend.list_indices(&a).await.unwrap().is_empty());
    assert_eq!(backend.clear(&a).await.unwrap(), 0);

    let snap = OverlaySnapshot {
      id: "s1".into(),
      owner_id: "bob".into(),
      disk_id: "root".into(),
      created_at: 10,
      block_count: 1,
      total_bytes: 16,
      description: None,
    };
    backend.put_snapshot(&snap).await.unwrap();
    assert_eq!(backend.list_snapshots(&b).await.unwrap(), vec![snap]);
    assert!(backend.list_snapshots(&a).await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn memory_backend_semantics() {
    exercise(&MemoryBackend::new()).await;
  }

  #[tokio::test]
  async fn sqlite_backend_semantics() {
    let dir = tempfile::tempdir().unwrap();
    let backend = SqliteBackend::open_file(&dir.path().join("overlay.db")).unwrap();
    exercise(&backend).await;
  }

  #[tokio::test]
  async fn sqlite_reopen_keeps_data_and_schema() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("overlay.db");
    let key = DiskKey::new("alice", "root");
    {
      let backend = SqliteBackend::open_file(&path).unwrap();
      backend.register_disk(&key, 16).await.unwrap();
      backend.write_batch(&key, batch(&[(3, 0x33)]), 1).await.unwrap();
    }
    let backend = SqliteBackend::open_file(&path).unwrap();
    assert_eq!(backend.register_disk(&key, 16).await.unwrap(), 16);
    assert_eq!(
      backend.read_range(&key, 0, 10).await.unwrap(),
      vec![(3, vec![0x33; 16])]
    );
  }

  #[test]
  fn disk_key_display() {
    assert_eq!(DiskKey::new("alice", "root").to_string(), "alice/root");
  }
}
