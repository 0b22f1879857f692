pub mod file_table;
pub mod memory;
pub mod rows;
pub mod snapshot;
pub mod wal;

use serde::{Deserialize, Serialize};

use crate::core::{Component, KeyPath, KeyPrefix, Level};
use crate::error::StorageError;

pub use file_table::FileTable;
pub use memory::MemoryTable;
pub use snapshot::SnapshotStore;
pub use wal::{WalOp, WalStore};

/// 一行：五列主键 + L0（JSON 文本）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub path: KeyPath,
    pub value: String,
}

impl Row {
    pub fn new(path: KeyPath, value: String) -> Self {
        Self { path, value }
    }
}

/// 持久化后端：按五列主键的行级读写 + 按前缀批量读取。
///
/// 表是唯一的事实来源；所有方法在未安装时返回 `StorageError::NotInstalled`
/// （`install`/`uninstall`/`is_installed` 除外）。
pub trait TableBackend: Send + Sync {
    fn name(&self) -> &str;

    /// 已存在 → `AlreadyExists`
    fn install(&self) -> Result<(), StorageError>;
    /// 不存在 → `NotFound`
    fn uninstall(&self) -> Result<(), StorageError>;
    fn is_installed(&self) -> bool;

    fn select(&self, prefix: &KeyPrefix) -> Result<Vec<Row>, StorageError>;
    fn select_all(&self) -> Result<Vec<Row>, StorageError>;

    /// 插入或覆盖；返回新增或值有变化的行数
    fn upsert(&self, rows: &[Row]) -> Result<usize, StorageError>;

    /// 删除 `level` 上等于任一 `values` 的行；`pages` 为 Some 时只在这些 L5 内删除
    fn delete_matching(
        &self,
        level: Level,
        values: &[Component],
        pages: Option<&[i64]>,
    ) -> Result<usize, StorageError>;

    /// 含有匹配行的 L5 集合（升序）
    fn pages_matching(&self, level: Level, values: &[Component]) -> Result<Vec<i64>, StorageError>;

    fn truncate(&self) -> Result<(), StorageError>;
    fn row_count(&self) -> Result<usize, StorageError>;
}
