//! 分页五级键值存储：表为事实来源，缓存按页镜像，同页读-改-写经页锁串行化。

mod page;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::{CacheBackend, LockPolicy};
use crate::core::tree;
use crate::core::{
    normalize_segment, CacheStrategy, Component, HierarchicalRecord, KeyPath, KeyPrefix, Level,
    TableDescriptor, Tree, Value,
};
use crate::error::{Result, StoreError};
use crate::stats::{StatsReport, StoreStats};
use crate::storage::{Row, TableBackend};

/// dropGlobal 的匹配值：单个或多个分量
#[derive(Clone, Debug, PartialEq)]
pub enum Match {
    One(Component),
    Many(Vec<Component>),
}

impl Match {
    pub fn values(&self) -> &[Component] {
        match self {
            Match::One(c) => std::slice::from_ref(c),
            Match::Many(v) => v,
        }
    }
}

impl From<Component> for Match {
    fn from(c: Component) -> Self {
        Match::One(c)
    }
}

impl From<i64> for Match {
    fn from(v: i64) -> Self {
        Match::One(Component::Int(v))
    }
}

impl From<&str> for Match {
    fn from(v: &str) -> Self {
        Match::One(Component::from(v))
    }
}

impl From<Vec<Component>> for Match {
    fn from(v: Vec<Component>) -> Self {
        Match::Many(v)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DropCtrl {
    /// true：类型不符的匹配值直接报 Validation；false：这些值不匹配任何行
    pub validate: bool,
}

impl Default for DropCtrl {
    fn default() -> Self {
        Self { validate: true }
    }
}

/// 管理端重置范围；执行顺序总是先 flush 缓存
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResetScope {
    Cache,
    Tables,
    Schema,
}

/// 同一页的一批写入
struct PageWrite {
    l5: i64,
    records: Vec<HierarchicalRecord>,
    rows: Vec<Row>,
}

impl PageWrite {
    fn new(l5: i64) -> Self {
        Self {
            l5,
            records: Vec::new(),
            rows: Vec::new(),
        }
    }
}

pub struct PagedStore {
    descriptor: TableDescriptor,
    table: Arc<dyn TableBackend>,
    cache: Arc<dyn CacheBackend>,
    policy: LockPolicy,
    stats: Arc<StoreStats>,
}

impl PagedStore {
    pub fn new(
        descriptor: TableDescriptor,
        table: Arc<dyn TableBackend>,
        cache: Arc<dyn CacheBackend>,
        policy: LockPolicy,
    ) -> Result<Self> {
        descriptor.validate()?;
        Ok(Self {
            descriptor,
            table,
            cache,
            policy,
            stats: Arc::new(StoreStats::default()),
        })
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn report(&self) -> StatsReport {
        StatsReport {
            table_rows: self.table.row_count().unwrap_or(0),
            ..self.stats.report()
        }
    }

    fn caching(&self) -> bool {
        self.descriptor.cache_strategy != CacheStrategy::None
    }

    // ---- schema lifecycle ----

    pub fn install(&self) -> Result<bool> {
        self.table
            .install()
            .map_err(|e| StoreError::from_storage("install", &self.descriptor.name, e))?;
        tracing::info!("Table '{}' installed", self.descriptor.name);
        Ok(true)
    }

    pub fn uninstall(&self) -> Result<bool> {
        self.table
            .uninstall()
            .map_err(|e| StoreError::from_storage("uninstall", &self.descriptor.name, e))?;
        tracing::info!("Table '{}' uninstalled", self.descriptor.name);
        Ok(true)
    }

    /// 清空表；不动缓存（正常流程需配合 flush_cache）
    pub fn truncate(&self) -> Result<bool> {
        self.table
            .truncate()
            .map_err(|e| StoreError::from_storage("truncate", &self.descriptor.name, e))?;
        tracing::info!("Table '{}' truncated", self.descriptor.name);
        Ok(true)
    }

    /// 使本命名空间全部缓存页失效；不动表，不影响已持有的页锁
    pub fn flush_cache(&self) -> Result<bool> {
        if !self.caching() {
            return Ok(true);
        }
        self.cache
            .flush_namespace(self.namespace())
            .map_err(|source| StoreError::Cache {
                op: "flush",
                source,
            })?;
        tracing::info!("Cache namespace '{}' flushed", self.namespace());
        Ok(true)
    }

    /// 先 flush 缓存，再动表：避免缓存页引用已删除的行。
    /// 动表之后再 flush 一次：期间已加载旧页的写者回写时会发现版本已变。
    pub fn reset(&self, scope: ResetScope) -> Result<()> {
        self.flush_cache()?;
        match scope {
            ResetScope::Cache => return Ok(()),
            ResetScope::Tables => {
                self.truncate()?;
            }
            ResetScope::Schema => {
                match self.uninstall() {
                    Err(e) if e.is_already_satisfied() => {}
                    other => {
                        other?;
                    }
                }
                self.install()?;
            }
        }
        self.flush_cache()?;
        Ok(())
    }

    // ---- writes ----

    pub fn set(&self, path: &KeyPath, value: Value) -> Result<usize> {
        self.set_multi(&[HierarchicalRecord::new(path.clone(), value)])
    }

    /// 按页分组；每页一次表写入 + 一次缓存回写，返回变化行数
    pub fn set_multi(&self, records: &[HierarchicalRecord]) -> Result<usize> {
        let mut groups: BTreeMap<String, PageWrite> = BTreeMap::new();
        let mut all_rows = Vec::with_capacity(records.len());
        for r in records {
            let path = r.path.checked()?;
            let text = serde_json::to_string(&r.value)
                .map_err(|e| StoreError::validation(format!("value at {path} is not serializable: {e}")))?;
            let row = Row::new(path.clone(), text);
            match self.descriptor.page_key(path.l5) {
                Some(page) => {
                    let w = groups.entry(page).or_insert_with(|| PageWrite::new(path.l5));
                    w.rows.push(row);
                    w.records.push(HierarchicalRecord::new(path, r.value.clone()));
                }
                None => all_rows.push(row),
            }
        }

        if !all_rows.is_empty() {
            let changed = self
                .table
                .upsert(&all_rows)
                .map_err(|e| StoreError::from_storage("set", describe(&all_rows), e))?;
            StoreStats::add(&self.stats.rows_written, changed as u64);
            return Ok(changed);
        }

        let mut total = 0;
        for (page, w) in groups {
            total += self.write_page(&page, w)?;
        }
        Ok(total)
    }

    fn write_page(&self, page: &str, w: PageWrite) -> Result<usize> {
        let _guard = self.lock_pages(&[page.to_string()])?;
        let version = self.version("set")?;
        // 锁内重新加载：不基于任何锁外读到的旧副本
        let mut page_tree = self.load_locked("set", version, page, w.l5)?;

        // 先落表；失败时缓存保持原样
        let changed = self
            .table
            .upsert(&w.rows)
            .map_err(|e| StoreError::from_storage("set", describe(&w.rows), e))?;

        for r in w.records {
            tree::insert(&mut page_tree, &r.path, r.value);
        }
        self.write_back(version, page, &page_tree);
        StoreStats::add(&self.stats.rows_written, changed as u64);
        Ok(changed)
    }

    /// 跨全部页删除 `level` 上等于任一匹配值的行，并递归剪掉空分支
    pub fn drop_global(&self, level: Level, m: &Match, ctrl: DropCtrl) -> Result<usize> {
        let values = prepare_match(level, m, ctrl)?;
        if values.is_empty() {
            return Ok(0);
        }
        let context = format!("{level} in {:?}", values);

        let l5s = self
            .table
            .pages_matching(level, &values)
            .map_err(|e| StoreError::from_storage("drop", &context, e))?;
        if l5s.is_empty() {
            return Ok(0);
        }

        if !self.caching() {
            let deleted = self
                .table
                .delete_matching(level, &values, Some(l5s.as_slice()))
                .map_err(|e| StoreError::from_storage("drop", &context, e))?;
            StoreStats::add(&self.stats.rows_deleted, deleted as u64);
            return Ok(deleted);
        }

        let mut pages: Vec<String> = l5s
            .iter()
            .filter_map(|&l5| self.descriptor.page_key(l5))
            .collect();
        pages.sort();
        pages.dedup();

        let _guard = self.lock_pages(&pages)?;
        let version = self.version("drop")?;

        let deleted = self
            .table
            .delete_matching(level, &values, Some(l5s.as_slice()))
            .map_err(|e| StoreError::from_storage("drop", &context, e))?;

        // 只剪已缓存的页；未缓存的页下次读取时从表加载
        for page in &pages {
            let Some(mut cached) = self.cached(version, page) else {
                continue;
            };
            tree::prune_matching(&mut cached, level, &values);
            if cached.is_empty() {
                self.evict(version, page);
            } else {
                self.write_back(version, page, &cached);
            }
        }

        StoreStats::add(&self.stats.rows_deleted, deleted as u64);
        tracing::info!(
            "Dropped {} row(s) where {} across {} page(s)",
            deleted,
            context,
            pages.len()
        );
        Ok(deleted)
    }

    // ---- reads ----

    pub fn get(&self, prefix: &KeyPrefix) -> Result<(Tree, bool)> {
        self.get_multi(std::slice::from_ref(prefix))
    }

    /// 返回收窄后的子树与有效标志：每个请求的 L5 都至少有一行时为 true。
    /// 缺失的 L5 不影响其他 L5 的结果。
    pub fn get_multi(&self, prefixes: &[KeyPrefix]) -> Result<(Tree, bool)> {
        let prefixes = prefixes
            .iter()
            .map(KeyPrefix::checked)
            .collect::<Result<Vec<_>>>()?;

        // 每个页只加载一次
        let mut loaded: BTreeMap<String, Tree> = BTreeMap::new();
        let mut out = Tree::new();
        let mut valid = true;

        for prefix in &prefixes {
            let page_tree = match self.descriptor.page_key(prefix.l5) {
                Some(page) => {
                    if !loaded.contains_key(&page) {
                        let t = self.read_page(&page, prefix.l5)?;
                        loaded.insert(page.clone(), t);
                    }
                    loaded.get(&page).cloned().unwrap_or_default()
                }
                None => self.load_from_table("get", prefix.l5)?,
            };

            if page_tree.get(&prefix.l5).map_or(true, |p| p.is_empty()) {
                valid = false;
            }
            tree::merge(&mut out, &tree::narrow(&page_tree, prefix));
        }
        Ok((out, valid))
    }

    pub fn get_value(&self, path: &KeyPath) -> Result<Option<Value>> {
        let (t, _) = self.get(&KeyPrefix::from(path))?;
        Ok(tree::get(&t, path).cloned())
    }
}

fn describe(rows: &[Row]) -> String {
    match rows {
        [one] => one.path.to_string(),
        [first, ..] => format!("{} rows from {}", rows.len(), first.path),
        [] => "no rows".to_string(),
    }
}

/// 类型检查 + 段键规范化
fn prepare_match(level: Level, m: &Match, ctrl: DropCtrl) -> Result<Vec<Component>> {
    if m.values().is_empty() && ctrl.validate {
        return Err(StoreError::validation(format!("empty match for {level}")));
    }
    let mut out = Vec::with_capacity(m.values().len());
    for c in m.values() {
        if !c.fits(level) {
            if ctrl.validate {
                return Err(StoreError::validation(format!(
                    "{c} cannot match {level} ({} expected)",
                    if level.is_int() { "integer" } else { "string" }
                )));
            }
            continue;
        }
        match c {
            Component::Int(_) => out.push(c.clone()),
            Component::Str(s) => match normalize_segment(level, s) {
                Ok(n) => out.push(Component::Str(n)),
                Err(e) if ctrl.validate => return Err(e),
                Err(_) => {}
            },
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{page_cache_key, page_lock_key, LocalCache, LockToken};
    use crate::error::StorageError;
    use crate::storage::MemoryTable;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;

    fn kp(l5: i64, l4: &str, l3: &str, l2: &str, l1: i64) -> KeyPath {
        KeyPath::new(l5, l4, l3, l2, l1).unwrap()
    }

    fn policy() -> LockPolicy {
        LockPolicy {
            ttl: Duration::from_secs(30),
            timeout: Duration::from_secs(2),
            retry: Duration::from_millis(1),
        }
    }

    fn store_with(
        strategy: CacheStrategy,
        table: Arc<dyn TableBackend>,
    ) -> (PagedStore, Arc<LocalCache>) {
        let cache = Arc::new(LocalCache::new());
        let store = PagedStore::new(
            TableDescriptor::standard("t").with_strategy(strategy),
            table,
            cache.clone(),
            policy(),
        )
        .unwrap();
        (store, cache)
    }

    fn store() -> (PagedStore, Arc<LocalCache>) {
        store_with(CacheStrategy::Paged, Arc::new(MemoryTable::installed("t")))
    }

    /// 19 行，分布在 L5 ∈ {1,2,3}
    fn fixture() -> Vec<HierarchicalRecord> {
        [
            (1, "X", "K", "K", 1),
            (1, "X", "K", "K", 2),
            (1, "X", "Z", "Q", 1),
            (1, "Y", "K", "K", 3),
            (1, "Y", "Z", "K", 1),
            (1, "Y", "Z", "Q", 2),
            (1, "W", "K", "Q", 4),
            (2, "A", "K", "K", 1),
            (2, "A", "K", "K", 2),
            (2, "A", "Z", "Q", 3),
            (2, "B", "Z", "K", 1),
            (2, "B", "K", "Q", 2),
            (2, "B", "K", "M", 5),
            (3, "X", "Z", "K", 1),
            (3, "X", "Z", "K", 4),
            (3, "X", "K", "Q", 1),
            (3, "Y", "K", "K", 2),
            (3, "Y", "Z", "M", 3),
            (3, "Z", "Z", "M", 6),
        ]
        .into_iter()
        .map(|(l5, l4, l3, l2, l1)| {
            HierarchicalRecord::new(kp(l5, l4, l3, l2, l1), json!(format!("{l5}{l4}{l3}{l2}{l1}")))
        })
        .collect()
    }

    fn seeded() -> (PagedStore, Arc<LocalCache>) {
        let (s, c) = store();
        assert_eq!(s.set_multi(&fixture()).unwrap(), 19);
        (s, c)
    }

    fn pages() -> Vec<KeyPrefix> {
        vec![KeyPrefix::page(1), KeyPrefix::page(2), KeyPrefix::page(3)]
    }

    /// 注入写失败的表
    struct FailingTable {
        inner: MemoryTable,
        fail_writes: AtomicBool,
    }

    impl FailingTable {
        fn new() -> Self {
            Self {
                inner: MemoryTable::installed("t"),
                fail_writes: AtomicBool::new(false),
            }
        }

        fn check(&self, op: &'static str) -> std::result::Result<(), StorageError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("{op} rejected"),
                )));
            }
            Ok(())
        }
    }

    impl TableBackend for FailingTable {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn install(&self) -> std::result::Result<(), StorageError> {
            self.inner.install()
        }
        fn uninstall(&self) -> std::result::Result<(), StorageError> {
            self.inner.uninstall()
        }
        fn is_installed(&self) -> bool {
            self.inner.is_installed()
        }
        fn select(&self, prefix: &KeyPrefix) -> std::result::Result<Vec<Row>, StorageError> {
            self.inner.select(prefix)
        }
        fn select_all(&self) -> std::result::Result<Vec<Row>, StorageError> {
            self.inner.select_all()
        }
        fn upsert(&self, rows: &[Row]) -> std::result::Result<usize, StorageError> {
            self.check("upsert")?;
            self.inner.upsert(rows)
        }
        fn delete_matching(
            &self,
            level: Level,
            values: &[Component],
            pages: Option<&[i64]>,
        ) -> std::result::Result<usize, StorageError> {
            self.check("delete")?;
            self.inner.delete_matching(level, values, pages)
        }
        fn pages_matching(
            &self,
            level: Level,
            values: &[Component],
        ) -> std::result::Result<Vec<i64>, StorageError> {
            self.inner.pages_matching(level, values)
        }
        fn truncate(&self) -> std::result::Result<(), StorageError> {
            self.check("truncate")?;
            self.inner.truncate()
        }
        fn row_count(&self) -> std::result::Result<usize, StorageError> {
            self.inner.row_count()
        }
    }

    /// upsert 时模拟另一进程 flush 整个命名空间
    struct FlushingTable {
        inner: MemoryTable,
        cache: Arc<LocalCache>,
    }

    impl TableBackend for FlushingTable {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn install(&self) -> std::result::Result<(), StorageError> {
            self.inner.install()
        }
        fn uninstall(&self) -> std::result::Result<(), StorageError> {
            self.inner.uninstall()
        }
        fn is_installed(&self) -> bool {
            self.inner.is_installed()
        }
        fn select(&self, prefix: &KeyPrefix) -> std::result::Result<Vec<Row>, StorageError> {
            self.inner.select(prefix)
        }
        fn select_all(&self) -> std::result::Result<Vec<Row>, StorageError> {
            self.inner.select_all()
        }
        fn upsert(&self, rows: &[Row]) -> std::result::Result<usize, StorageError> {
            self.cache.flush_namespace("t").unwrap();
            self.inner.upsert(rows)
        }
        fn delete_matching(
            &self,
            level: Level,
            values: &[Component],
            pages: Option<&[i64]>,
        ) -> std::result::Result<usize, StorageError> {
            self.inner.delete_matching(level, values, pages)
        }
        fn pages_matching(
            &self,
            level: Level,
            values: &[Component],
        ) -> std::result::Result<Vec<i64>, StorageError> {
            self.inner.pages_matching(level, values)
        }
        fn truncate(&self) -> std::result::Result<(), StorageError> {
            self.inner.truncate()
        }
        fn row_count(&self) -> std::result::Result<usize, StorageError> {
            self.inner.row_count()
        }
    }

    /// 让 reset 的清表与另一写者的落表交错：
    /// 清表先等写者进入 upsert，再在写者落表前完成
    struct TruncateRaceTable {
        inner: MemoryTable,
        armed: AtomicBool,
        truncating: Barrier,
        in_upsert: Barrier,
        truncated: Barrier,
    }

    impl TableBackend for TruncateRaceTable {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn install(&self) -> std::result::Result<(), StorageError> {
            self.inner.install()
        }
        fn uninstall(&self) -> std::result::Result<(), StorageError> {
            self.inner.uninstall()
        }
        fn is_installed(&self) -> bool {
            self.inner.is_installed()
        }
        fn select(&self, prefix: &KeyPrefix) -> std::result::Result<Vec<Row>, StorageError> {
            self.inner.select(prefix)
        }
        fn select_all(&self) -> std::result::Result<Vec<Row>, StorageError> {
            self.inner.select_all()
        }
        fn upsert(&self, rows: &[Row]) -> std::result::Result<usize, StorageError> {
            if self.armed.load(Ordering::SeqCst) {
                self.in_upsert.wait();
                self.truncated.wait();
            }
            self.inner.upsert(rows)
        }
        fn delete_matching(
            &self,
            level: Level,
            values: &[Component],
            pages: Option<&[i64]>,
        ) -> std::result::Result<usize, StorageError> {
            self.inner.delete_matching(level, values, pages)
        }
        fn pages_matching(
            &self,
            level: Level,
            values: &[Component],
        ) -> std::result::Result<Vec<i64>, StorageError> {
            self.inner.pages_matching(level, values)
        }
        fn truncate(&self) -> std::result::Result<(), StorageError> {
            self.truncating.wait();
            self.in_upsert.wait();
            let res = self.inner.truncate();
            self.truncated.wait();
            res
        }
        fn row_count(&self) -> std::result::Result<usize, StorageError> {
            self.inner.row_count()
        }
    }

    #[test]
    fn set_then_get_round_trips() {
        let (s, _) = store();
        let p = kp(7, "policy", "role", "cap", 3);
        assert_eq!(s.set(&p, json!({"allow": [1, 2]})).unwrap(), 1);
        // 同值再写不算变化
        assert_eq!(s.set(&p, json!({"allow": [1, 2]})).unwrap(), 0);
        assert_eq!(s.set(&p, json!(false)).unwrap(), 1);

        assert_eq!(s.get_value(&p).unwrap(), Some(json!(false)));
        let (t, valid) = s.get(&KeyPrefix::page(7).l4("policy")).unwrap();
        assert!(valid);
        assert_eq!(tree::len(&t), 1);
        assert_eq!(s.get_value(&kp(7, "policy", "role", "cap", 4)).unwrap(), None);
    }

    #[test]
    fn set_multi_matches_individual_sets() {
        let (a, _) = seeded();
        let (b, _) = store();
        for r in fixture().into_iter().rev() {
            b.set(&r.path, r.value).unwrap();
        }
        assert_eq!(a.get_multi(&pages()).unwrap(), b.get_multi(&pages()).unwrap());
        assert_eq!(tree::len(&a.get_multi(&pages()).unwrap().0), 19);
    }

    #[test]
    fn reads_hit_cache_after_first_load() {
        let (s, cache) = seeded();
        s.flush_cache().unwrap();
        let before = s.stats().report();
        s.get(&KeyPrefix::page(1)).unwrap();
        s.get(&KeyPrefix::page(1).l4("X")).unwrap();
        let after = s.stats().report();
        assert_eq!(after.cache_misses - before.cache_misses, 1);
        assert_eq!(after.cache_hits - before.cache_hits, 1);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn validity_tracks_missing_pages() {
        let (s, _) = seeded();
        let (t, valid) = s.get_multi(&pages()).unwrap();
        assert!(valid);
        assert_eq!(t.len(), 3);

        // L4='X' 只存在于 L5=1 和 L5=3，删除后两页仍有数据
        assert_eq!(s.drop_global(Level::L4, &Match::from("X"), DropCtrl::default()).unwrap(), 6);
        let (t, valid) = s.get_multi(&pages()).unwrap();
        assert!(valid);
        assert_eq!(tree::len(&t), 13);

        // 清空 L5=2：有效标志为 false，但 1、3 的结果照常返回
        let ab = Match::Many(vec!["A".into(), "B".into()]);
        assert_eq!(s.drop_global(Level::L4, &ab, DropCtrl::default()).unwrap(), 6);
        let (t, valid) = s.get_multi(&pages()).unwrap();
        assert!(!valid);
        assert!(t.contains_key(&1) && t.contains_key(&3));
        assert!(!t.contains_key(&2));
        assert_eq!(tree::len(&t), 7);

        let (_, valid) = s.get_multi(&[KeyPrefix::page(1), KeyPrefix::page(3)]).unwrap();
        assert!(valid);
    }

    #[test]
    fn drop_global_row_counts() {
        let (s, _) = seeded();
        assert_eq!(s.drop_global(Level::L1, &Match::from(1), DropCtrl::default()).unwrap(), 7);

        let (s, _) = seeded();
        assert_eq!(s.drop_global(Level::L2, &Match::from("K"), DropCtrl::default()).unwrap(), 10);

        let (s, _) = seeded();
        let kz = Match::Many(vec!["K".into(), "Z".into()]);
        assert_eq!(s.drop_global(Level::L3, &kz, DropCtrl::default()).unwrap(), 19);
        let (t, valid) = s.get_multi(&pages()).unwrap();
        assert!(t.is_empty());
        assert!(!valid);
    }

    #[test]
    fn drop_prunes_cached_pages_like_the_table() {
        let (s, cache) = seeded();
        // 先把三页都读进缓存
        s.get_multi(&pages()).unwrap();
        assert_eq!(s.drop_global(Level::L2, &Match::from("K"), DropCtrl::default()).unwrap(), 10);

        let (cached_view, _) = s.get_multi(&pages()).unwrap();
        s.flush_cache().unwrap();
        let (table_view, _) = s.get_multi(&pages()).unwrap();
        assert_eq!(cached_view, table_view);
        assert_eq!(tree::len(&table_view), 9);

        // 不留空的中间层：L5=1/L4=X/L3=K 只有 L2=K 的行，应整枝消失
        assert!(!table_view[&1]["X"].contains_key("K"));
        assert!(cache.entry_count() >= 1);
    }

    #[test]
    fn dropping_a_whole_page_evicts_it() {
        let (s, cache) = seeded();
        s.get(&KeyPrefix::page(2)).unwrap();
        assert_eq!(s.drop_global(Level::L5, &Match::from(2), DropCtrl::default()).unwrap(), 6);
        let v = s.version("test").unwrap();
        assert_eq!(cache.get(&page_cache_key("t", v, "2")).unwrap(), None);
        let (_, valid) = s.get(&KeyPrefix::page(2)).unwrap();
        assert!(!valid);
    }

    #[test]
    fn drop_validation_modes() {
        let (s, _) = seeded();
        let wrong = Match::from("1");
        let err = s.drop_global(Level::L1, &wrong, DropCtrl::default()).unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert!(s
            .drop_global(Level::L3, &Match::Many(vec![]), DropCtrl::default())
            .is_err());

        let lax = DropCtrl { validate: false };
        assert_eq!(s.drop_global(Level::L1, &wrong, lax).unwrap(), 0);
        // 混合：类型正确的值照常生效
        let mixed = Match::Many(vec![Component::from("K"), Component::from(5)]);
        assert_eq!(s.drop_global(Level::L2, &mixed, lax).unwrap(), 10);
    }

    #[test]
    fn invalid_keys_are_rejected() {
        let (s, _) = store();
        let bad = KeyPath {
            l5: 1,
            l4: "*".into(),
            l3: "a".into(),
            l2: "b".into(),
            l1: 1,
        };
        assert!(matches!(s.set(&bad, json!(1)), Err(StoreError::Validation(_))));
        let gap = KeyPrefix {
            l5: 1,
            l4: None,
            l3: Some("a".into()),
            l2: None,
            l1: None,
        };
        assert!(matches!(s.get(&gap), Err(StoreError::Validation(_))));
        assert!(KeyPath::new(1, &"x".repeat(33), "a", "b", 1).is_err());
    }

    #[test]
    fn persistence_failure_leaves_cache_untouched() {
        let table = Arc::new(FailingTable::new());
        let (s, cache) = store_with(CacheStrategy::Paged, table.clone());
        let p = kp(1, "a", "b", "c", 1);
        s.set(&p, json!("old")).unwrap();
        s.get(&KeyPrefix::page(1)).unwrap();
        let key = page_cache_key("t", s.version("test").unwrap(), "1");
        let before = cache.get(&key).unwrap();
        assert!(before.is_some());

        table.fail_writes.store(true, Ordering::SeqCst);
        let err = s.set(&p, json!("new")).unwrap_err();
        assert!(matches!(err, StoreError::Persistence { op: "set", .. }));
        assert!(err.to_string().contains("(1,a,b,c,1)"));
        let err = s.drop_global(Level::L1, &Match::from(1), DropCtrl::default()).unwrap_err();
        assert!(matches!(err, StoreError::Persistence { op: "drop", .. }));

        assert_eq!(cache.get(&key).unwrap(), before);
        assert_eq!(s.get_value(&p).unwrap(), Some(json!("old")));
        // 锁已释放
        assert_eq!(cache.lock_holder(&page_lock_key("t", "1")).unwrap(), None);
    }

    #[test]
    fn flush_during_write_is_detected_not_resurrected() {
        let cache = Arc::new(LocalCache::new());
        let table = Arc::new(FlushingTable {
            inner: MemoryTable::installed("t"),
            cache: cache.clone(),
        });
        let s = PagedStore::new(TableDescriptor::standard("t"), table, cache.clone(), policy()).unwrap();

        let p = kp(1, "a", "b", "c", 1);
        assert_eq!(s.set(&p, json!(1)).unwrap(), 1);
        assert_eq!(s.stats().report().stale_writebacks_skipped, 1);
        // 写入已落表；缓存里没有旧版本的页可被读到
        assert_eq!(s.get_value(&p).unwrap(), Some(json!(1)));
    }

    #[test]
    fn write_after_concurrent_drop_does_not_resurrect_rows() {
        let (s, _) = seeded();
        s.get(&KeyPrefix::page(1)).unwrap();
        s.drop_global(Level::L4, &Match::from("Y"), DropCtrl::default()).unwrap();
        s.set(&kp(1, "N", "K", "K", 1), json!("new")).unwrap();

        let (cached, _) = s.get(&KeyPrefix::page(1)).unwrap();
        assert!(!cached[&1].contains_key("Y"));
        s.flush_cache().unwrap();
        let (fresh, _) = s.get(&KeyPrefix::page(1)).unwrap();
        assert_eq!(cached, fresh);
        assert_eq!(tree::len(&fresh), 5);
    }

    #[test]
    fn same_page_writers_serialize() {
        let (s, cache) = store();
        let s = Arc::new(s);
        s.get(&KeyPrefix::page(1)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let s = s.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        s.set(&kp(1, "a", "b", "c", t * 100 + i), json!(i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // 缓存页没有丢失任何一次写入
        let (t, _) = s.get(&KeyPrefix::page(1)).unwrap();
        assert_eq!(tree::len(&t), 200);
        assert_eq!(cache.lock_count(), 0);
    }

    #[test]
    fn held_lock_times_out_with_conflict() {
        let (s, cache) = store();
        let other = LockToken::mint();
        cache
            .try_lock(&page_lock_key("t", "1"), &other, Duration::from_secs(30))
            .unwrap();
        let err = s.set(&kp(1, "a", "b", "c", 1), json!(1)).unwrap_err();
        assert!(matches!(err, StoreError::LockConflict { .. }));
        assert_eq!(s.report().table_rows, 0);
        // 其他页不受影响
        assert_eq!(s.set(&kp(2, "a", "b", "c", 1), json!(1)).unwrap(), 1);
    }

    #[test]
    fn lock_of_dead_process_is_reclaimed() {
        let (s, cache) = store();
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let ghost = LockToken { pid, nonce: 1 };
        cache
            .try_lock(&page_lock_key("t", "1"), &ghost, Duration::from_secs(600))
            .unwrap();

        assert_eq!(s.set(&kp(1, "a", "b", "c", 1), json!(1)).unwrap(), 1);
        assert_eq!(s.stats().report().locks_reclaimed, 1);
    }

    #[test]
    fn monolithic_strategy_uses_one_page() {
        let (s, cache) =
            store_with(CacheStrategy::Monolithic, Arc::new(MemoryTable::installed("t")));
        s.set_multi(&fixture()).unwrap();
        let (t, valid) = s.get_multi(&pages()).unwrap();
        assert!(valid);
        assert_eq!(tree::len(&t), 19);
        assert_eq!(cache.entry_count(), 1);
        let v = s.version("test").unwrap();
        assert!(cache.get(&page_cache_key("t", v, "all")).unwrap().is_some());

        assert_eq!(s.drop_global(Level::L1, &Match::from(1), DropCtrl::default()).unwrap(), 7);
        let (t, _) = s.get_multi(&pages()).unwrap();
        assert_eq!(tree::len(&t), 12);
        let (t, _) = s.get(&KeyPrefix::page(2).l4("A")).unwrap();
        assert_eq!(tree::len(&t), 2);
    }

    #[test]
    fn uncached_strategy_bypasses_cache() {
        let (s, cache) = store_with(CacheStrategy::None, Arc::new(MemoryTable::installed("t")));
        s.set_multi(&fixture()).unwrap();
        assert_eq!(s.drop_global(Level::L2, &Match::from("K"), DropCtrl::default()).unwrap(), 10);
        let (t, valid) = s.get_multi(&pages()).unwrap();
        assert!(valid);
        assert_eq!(tree::len(&t), 9);
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.lock_count(), 0);
    }

    #[test]
    fn schema_lifecycle_signals_already_satisfied() {
        let (s, _) = store();
        let err = s.install().unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        assert!(err.is_already_satisfied());
        assert!(s.uninstall().unwrap());
        let err = s.uninstall().unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(s.install().unwrap());
    }

    #[test]
    fn reset_flushes_before_touching_tables() {
        let (s, cache) = seeded();
        s.get_multi(&pages()).unwrap();
        assert_eq!(cache.entry_count(), 3);

        s.reset(ResetScope::Tables).unwrap();
        let (t, valid) = s.get_multi(&pages()).unwrap();
        assert!(t.is_empty());
        assert!(!valid);

        s.set_multi(&fixture()).unwrap();
        s.reset(ResetScope::Schema).unwrap();
        assert_eq!(s.report().table_rows, 0);
        assert!(s.get(&KeyPrefix::page(1)).unwrap().0.is_empty());

        s.set(&kp(1, "a", "b", "c", 1), json!(1)).unwrap();
        s.reset(ResetScope::Cache).unwrap();
        assert_eq!(s.get_value(&kp(1, "a", "b", "c", 1)).unwrap(), Some(json!(1)));
    }

    #[test]
    fn truncate_without_flush_leaves_cache_stale() {
        let (s, _) = seeded();
        s.get(&KeyPrefix::page(1)).unwrap();
        s.truncate().unwrap();
        // 未 flush：缓存仍是旧镜像
        assert_eq!(tree::len(&s.get(&KeyPrefix::page(1)).unwrap().0), 7);
        s.flush_cache().unwrap();
        assert!(s.get(&KeyPrefix::page(1)).unwrap().0.is_empty());
    }

    #[test]
    fn reset_during_write_does_not_cache_truncated_rows() {
        let table = Arc::new(TruncateRaceTable {
            inner: MemoryTable::installed("t"),
            armed: AtomicBool::new(false),
            truncating: Barrier::new(2),
            in_upsert: Barrier::new(2),
            truncated: Barrier::new(2),
        });
        let (s, _) = store_with(CacheStrategy::Paged, table.clone());
        let s = Arc::new(s);
        let page1: Vec<_> = fixture().into_iter().filter(|r| r.path.l5 == 1).collect();
        assert_eq!(s.set_multi(&page1).unwrap(), 7);
        table.armed.store(true, Ordering::SeqCst);

        // reset 已完成第一次 flush，正停在清表处
        let resetter = {
            let s = s.clone();
            std::thread::spawn(move || s.reset(ResetScope::Tables))
        };
        table.truncating.wait();

        // 写者在新版本下加载了完整旧页，随后清表先于它落表完成
        let p = kp(1, "a", "b", "c", 99);
        let writer = {
            let s = s.clone();
            let p = p.clone();
            std::thread::spawn(move || s.set(&p, json!(99)))
        };
        resetter.join().unwrap().unwrap();
        assert_eq!(writer.join().unwrap().unwrap(), 1);
        table.armed.store(false, Ordering::SeqCst);

        assert_eq!(s.report().table_rows, 1);
        let (t, valid) = s.get(&KeyPrefix::page(1)).unwrap();
        assert!(valid);
        assert_eq!(tree::len(&t), 1);
        assert_eq!(tree::get(&t, &p), Some(&json!(99)));
    }
}
