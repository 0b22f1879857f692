use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::core::{Component, KeyPrefix, Level};
use crate::error::StorageError;
use crate::storage::rows::{self, RowMap};
use crate::storage::snapshot::{SnapshotStore, TableImage};
use crate::storage::wal::{WalOp, WalStore};
use crate::storage::{Row, TableBackend};

const SNAPSHOT_FILE: &str = "rows.snap";

struct Durable {
    rows: RowMap,
    wal: WalStore,
    snapshot: SnapshotStore,
}

impl Durable {
    /// 先写 WAL 再改内存：append 失败时内存保持原样
    fn commit(&mut self, op: WalOp) -> Result<usize, StorageError> {
        self.wal.append(std::slice::from_ref(&op))?;
        Ok(apply(&mut self.rows, op))
    }
}

fn apply(rows: &mut RowMap, op: WalOp) -> usize {
    match op {
        WalOp::Upsert(incoming) => rows::apply_upsert(rows, &incoming),
        WalOp::Delete(keys) => rows::apply_delete(rows, &keys),
        WalOp::Truncate => {
            let n = rows.len();
            rows.clear();
            n
        }
    }
}

/// 落盘表：`<data_dir>/<table>/rows.snap` + `rows.wal`
///
/// 每次变更在返回前已 fsync 进 WAL；`checkpoint` 把全量行写成新快照并清理旧 WAL。
pub struct FileTable {
    name: String,
    dir: PathBuf,
    state: RwLock<Option<Durable>>,
    checkpoint_notify: Notify,
}

impl FileTable {
    /// 打开（未安装时 state 为空，等待 install）
    pub fn open(data_dir: &Path, name: &str) -> Result<Self, StorageError> {
        let dir = data_dir.join(name);
        let snapshot = SnapshotStore::new(dir.join(SNAPSHOT_FILE));
        let state = match snapshot.load()? {
            None => None,
            Some(image) => Some(Self::recover(&dir, snapshot, image)?),
        };
        if let Some(d) = &state {
            tracing::info!("Opened table '{}' ({} rows) at {}", name, d.rows.len(), dir.display());
        }
        Ok(Self {
            name: name.to_string(),
            dir,
            state: RwLock::new(state),
            checkpoint_notify: Notify::new(),
        })
    }

    fn recover(dir: &Path, snapshot: SnapshotStore, image: TableImage) -> Result<Durable, StorageError> {
        let wal = WalStore::open_in_dir(dir.to_path_buf())?;
        let mut rows: RowMap = image.rows.into_iter().map(|r| (r.path, r.value)).collect();
        let replay = wal.replay_since_seal(image.seal_id)?;
        let n_ops = replay.ops.len();
        for op in replay.ops {
            apply(&mut rows, op);
        }
        if n_ops > 0 {
            tracing::info!(
                "Replayed {} WAL op(s) from {} sealed segment(s) + current",
                n_ops,
                replay.sealed_used
            );
        }
        Ok(Durable {
            rows,
            wal,
            snapshot,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn not_installed(&self) -> StorageError {
        StorageError::NotInstalled(self.name.clone())
    }

    /// 全量快照 + 切分并清理已包含的 WAL；返回快照行数
    pub fn checkpoint(&self) -> Result<usize, StorageError> {
        // 整个过程持有写锁：快照内容、seal 边界与并发 checkpoint 之间都保持一致
        let g = self.state.write();
        let d = g.as_ref().ok_or_else(|| self.not_installed())?;
        let seal_id = d.wal.seal()?;
        let image = TableImage {
            seal_id,
            rows: rows::select_all(&d.rows),
        };
        d.snapshot.write_atomic(&image)?;
        d.wal.cleanup_sealed_up_to(seal_id)?;
        tracing::info!(
            "Checkpoint of '{}' complete: {} rows (seal {:016x})",
            self.name,
            image.rows.len(),
            seal_id
        );
        Ok(image.rows.len())
    }

    /// 唤醒 checkpoint_loop 立即做一次 checkpoint
    pub fn request_checkpoint(&self) {
        self.checkpoint_notify.notify_one();
    }

    /// 周期性 checkpoint（间隔到期或被 request_checkpoint 唤醒）
    pub async fn checkpoint_loop(self: Arc<Self>, interval_secs: u64) {
        let interval = std::time::Duration::from_secs(interval_secs);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {},
                _ = self.checkpoint_notify.notified() => {},
            }

            let table = self.clone();
            match tokio::task::spawn_blocking(move || table.checkpoint()).await {
                Ok(Ok(_)) => {}
                Ok(Err(StorageError::NotInstalled(_))) => {
                    tracing::debug!("Checkpoint skipped: table '{}' not installed", self.name);
                }
                Ok(Err(e)) => {
                    tracing::error!("Checkpoint of '{}' failed: {}", self.name, e);
                    // 避免失败后自旋
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
                Err(e) => tracing::error!("Checkpoint task panicked: {}", e),
            }
        }
    }
}

impl TableBackend for FileTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn install(&self) -> Result<(), StorageError> {
        let mut g = self.state.write();
        if g.is_some() {
            return Err(StorageError::AlreadyExists(self.name.clone()));
        }
        // 目录里可能残留未完成安装的 WAL：从空目录开始
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        std::fs::create_dir_all(&self.dir)?;
        let snapshot = SnapshotStore::new(self.dir.join(SNAPSHOT_FILE));
        snapshot.write_atomic(&TableImage::default())?;
        let wal = WalStore::open_in_dir(self.dir.clone())?;
        *g = Some(Durable {
            rows: RowMap::new(),
            wal,
            snapshot,
        });
        tracing::info!("Installed table '{}' at {}", self.name, self.dir.display());
        Ok(())
    }

    fn uninstall(&self) -> Result<(), StorageError> {
        let mut g = self.state.write();
        if g.take().is_none() {
            return Err(StorageError::NotFound(self.name.clone()));
        }
        std::fs::remove_dir_all(&self.dir)?;
        tracing::info!("Uninstalled table '{}'", self.name);
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.state.read().is_some()
    }

    fn select(&self, prefix: &KeyPrefix) -> Result<Vec<Row>, StorageError> {
        let g = self.state.read();
        let d = g.as_ref().ok_or_else(|| self.not_installed())?;
        Ok(rows::select(&d.rows, prefix))
    }

    fn select_all(&self) -> Result<Vec<Row>, StorageError> {
        let g = self.state.read();
        let d = g.as_ref().ok_or_else(|| self.not_installed())?;
        Ok(rows::select_all(&d.rows))
    }

    fn upsert(&self, incoming: &[Row]) -> Result<usize, StorageError> {
        let mut g = self.state.write();
        let d = g.as_mut().ok_or_else(|| self.not_installed())?;
        let changed: Vec<Row> = rows::changed(&d.rows, incoming).into_iter().cloned().collect();
        if changed.is_empty() {
            return Ok(0);
        }
        d.commit(WalOp::Upsert(changed))
    }

    fn delete_matching(
        &self,
        level: Level,
        values: &[Component],
        pages: Option<&[i64]>,
    ) -> Result<usize, StorageError> {
        let mut g = self.state.write();
        let d = g.as_mut().ok_or_else(|| self.not_installed())?;
        let keys = rows::matching_keys(&d.rows, level, values, pages);
        if keys.is_empty() {
            return Ok(0);
        }
        d.commit(WalOp::Delete(keys))
    }

    fn pages_matching(&self, level: Level, values: &[Component]) -> Result<Vec<i64>, StorageError> {
        let g = self.state.read();
        let d = g.as_ref().ok_or_else(|| self.not_installed())?;
        Ok(rows::pages_matching(&d.rows, level, values))
    }

    fn truncate(&self) -> Result<(), StorageError> {
        let mut g = self.state.write();
        let d = g.as_mut().ok_or_else(|| self.not_installed())?;
        d.commit(WalOp::Truncate)?;
        Ok(())
    }

    fn row_count(&self) -> Result<usize, StorageError> {
        let g = self.state.read();
        Ok(g.as_ref().ok_or_else(|| self.not_installed())?.rows.len())
    }
}
