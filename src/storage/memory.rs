use parking_lot::RwLock;

use crate::core::{Component, KeyPrefix, Level};
use crate::error::StorageError;
use crate::storage::rows::{self, RowMap};
use crate::storage::{Row, TableBackend};

/// 纯内存表（None = 未安装）
pub struct MemoryTable {
    name: String,
    rows: RwLock<Option<RowMap>>,
}

impl MemoryTable {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rows: RwLock::new(None),
        }
    }

    /// 创建并立即安装
    pub fn installed(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rows: RwLock::new(Some(RowMap::new())),
        }
    }

    fn not_installed(&self) -> StorageError {
        StorageError::NotInstalled(self.name.clone())
    }
}

impl TableBackend for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn install(&self) -> Result<(), StorageError> {
        let mut g = self.rows.write();
        if g.is_some() {
            return Err(StorageError::AlreadyExists(self.name.clone()));
        }
        *g = Some(RowMap::new());
        Ok(())
    }

    fn uninstall(&self) -> Result<(), StorageError> {
        let mut g = self.rows.write();
        if g.take().is_none() {
            return Err(StorageError::NotFound(self.name.clone()));
        }
        Ok(())
    }

    fn is_installed(&self) -> bool {
        self.rows.read().is_some()
    }

    fn select(&self, prefix: &KeyPrefix) -> Result<Vec<Row>, StorageError> {
        let g = self.rows.read();
        let m = g.as_ref().ok_or_else(|| self.not_installed())?;
        Ok(rows::select(m, prefix))
    }

    fn select_all(&self) -> Result<Vec<Row>, StorageError> {
        let g = self.rows.read();
        let m = g.as_ref().ok_or_else(|| self.not_installed())?;
        Ok(rows::select_all(m))
    }

    fn upsert(&self, incoming: &[Row]) -> Result<usize, StorageError> {
        let mut g = self.rows.write();
        let m = g.as_mut().ok_or_else(|| self.not_installed())?;
        let changed = rows::changed(m, incoming);
        Ok(rows::apply_upsert(m, changed))
    }

    fn delete_matching(
        &self,
        level: Level,
        values: &[Component],
        pages: Option<&[i64]>,
    ) -> Result<usize, StorageError> {
        let mut g = self.rows.write();
        let m = g.as_mut().ok_or_else(|| self.not_installed())?;
        let keys = rows::matching_keys(m, level, values, pages);
        Ok(rows::apply_delete(m, &keys))
    }

    fn pages_matching(&self, level: Level, values: &[Component]) -> Result<Vec<i64>, StorageError> {
        let g = self.rows.read();
        let m = g.as_ref().ok_or_else(|| self.not_installed())?;
        Ok(rows::pages_matching(m, level, values))
    }

    fn truncate(&self) -> Result<(), StorageError> {
        let mut g = self.rows.write();
        let m = g.as_mut().ok_or_else(|| self.not_installed())?;
        m.clear();
        Ok(())
    }

    fn row_count(&self) -> Result<usize, StorageError> {
        let g = self.rows.read();
        Ok(g.as_ref().ok_or_else(|| self.not_installed())?.len())
    }
}
