//! 页缓存机制：读穿透、锁内加载、带版本复核的回写。

use crate::cache::{lock, page_cache_key, page_lock_key, PageLockGuard};
use crate::core::{CacheStrategy, KeyPrefix, Tree};
use crate::error::{CacheError, Result, StoreError};
use crate::stats::StoreStats;
use crate::storage::Row;
use crate::store::PagedStore;

pub(crate) fn rows_to_tree(op: &'static str, rows: Vec<Row>) -> Result<Tree> {
    let mut tree = Tree::new();
    for row in rows {
        let value = serde_json::from_str(&row.value)
            .map_err(|e| StoreError::persistence(op, row.path.to_string(), e))?;
        crate::core::tree::insert(&mut tree, &row.path, value);
    }
    Ok(tree)
}

impl PagedStore {
    pub(crate) fn namespace(&self) -> &str {
        &self.descriptor.cache_namespace
    }

    pub(crate) fn version(&self, op: &'static str) -> Result<u64> {
        self.cache
            .namespace_version(self.namespace())
            .map_err(|source| StoreError::Cache { op, source })
    }

    /// 按升序加锁（调用方给出的页键可以无序/重复）
    pub(crate) fn lock_pages<'a>(&'a self, pages: &[String]) -> Result<PageLockGuard<'a>> {
        let keys = pages
            .iter()
            .map(|p| page_lock_key(self.namespace(), p))
            .collect();
        lock::acquire(self.cache.as_ref(), keys, self.policy, &self.stats)
    }

    /// 从表整页读取：paged 读一个 L5，monolithic 读全表
    pub(crate) fn load_from_table(&self, op: &'static str, l5: i64) -> Result<Tree> {
        let rows = match self.descriptor.cache_strategy {
            CacheStrategy::Monolithic => self.table.select_all(),
            CacheStrategy::Paged | CacheStrategy::None => {
                self.table.select(&KeyPrefix::page(l5))
            }
        }
        .map_err(|e| StoreError::from_storage(op, format!("page of L5={l5}"), e))?;
        StoreStats::bump(&self.stats.page_loads);
        rows_to_tree(op, rows)
    }

    /// 读缓存页；缓存故障或内容无法解码时视为未命中（表是事实来源）
    pub(crate) fn cached(&self, version: u64, page: &str) -> Option<Tree> {
        let key = page_cache_key(self.namespace(), version, page);
        let bytes = match self.cache.get(&key) {
            Ok(b) => b?,
            Err(e) => {
                tracing::warn!("Cache read of {} failed, falling back to table: {}", key, e);
                return None;
            }
        };
        match serde_json::from_slice::<Tree>(&bytes) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!("Undecodable cache page {}, invalidating: {}", key, e);
                let _ = self.cache.delete(&key);
                StoreStats::bump(&self.stats.invalidations);
                None
            }
        }
    }

    /// 调用方已持有页锁
    pub(crate) fn load_locked(&self, op: &'static str, version: u64, page: &str, l5: i64) -> Result<Tree> {
        if let Some(t) = self.cached(version, page) {
            return Ok(t);
        }
        self.load_from_table(op, l5)
    }

    /// 读穿透：命中直接返回；未命中时在页锁内复查并从表加载
    pub(crate) fn read_page(&self, page: &str, l5: i64) -> Result<Tree> {
        let version = self.version("get")?;
        if let Some(t) = self.cached(version, page) {
            StoreStats::bump(&self.stats.cache_hits);
            tracing::debug!("Cache hit: page {} of {}", page, self.namespace());
            return Ok(t);
        }
        StoreStats::bump(&self.stats.cache_misses);
        tracing::debug!("Cache miss: page {} of {}", page, self.namespace());

        let _guard = self.lock_pages(&[page.to_string()])?;
        let version = self.version("get")?;
        if let Some(t) = self.cached(version, page) {
            // 等锁期间已被其他调用方填充
            return Ok(t);
        }
        let tree = self.load_from_table("get", l5)?;
        self.write_back(version, page, &tree);
        Ok(tree)
    }

    /// 回写缓存页。版本比较与写入在缓存内一步完成：命名空间期间被 flush 则放弃；
    /// 写入失败则删除该页，让后续读取从表重新加载。
    pub(crate) fn write_back(&self, version: u64, page: &str, tree: &Tree) {
        let key = page_cache_key(self.namespace(), version, page);
        let res = serde_json::to_vec(tree)
            .map_err(CacheError::from)
            .and_then(|bytes| self.cache.set_if_version(self.namespace(), version, &key, bytes));
        match res {
            Ok(true) => StoreStats::bump(&self.stats.page_writebacks),
            Ok(false) => {
                tracing::warn!(
                    "Namespace {} flushed during update (was v{}), skipping write-back of page {}",
                    self.namespace(),
                    version,
                    page
                );
                StoreStats::bump(&self.stats.stale_writebacks_skipped);
            }
            Err(e) => {
                tracing::warn!("Cache write-back of {} failed, invalidating page: {}", key, e);
                let _ = self.cache.delete(&key);
                StoreStats::bump(&self.stats.invalidations);
            }
        }
    }

    /// 删除缓存页（页已空或被剪空）
    pub(crate) fn evict(&self, version: u64, page: &str) {
        let key = page_cache_key(self.namespace(), version, page);
        if let Err(e) = self.cache.delete(&key) {
            tracing::warn!("Failed to evict cache page {}: {}", key, e);
        }
    }
}
