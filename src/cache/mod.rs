pub mod local;
pub mod lock;

use std::time::Duration;

use crate::error::CacheError;

pub use local::LocalCache;
pub use lock::{LockAttempt, LockEntry, LockPolicy, LockToken, PageLockGuard, ReclaimReason};

/// 缓存后端抽象（进程内或远端）：不透明字符串键 → 字节值。
///
/// ## 契约
/// - `flush_namespace` 通过递增命名空间版本使旧键整体失效；锁表不受 flush 影响。
/// - `set_if_version` 的版本比较与写入必须原子：flush 之后不会再有旧版本的键写进来。
/// - `try_lock` 必须原子：同一键同一时刻只有一个持有者；过期/持有者已死的锁由实现回收。
pub trait CacheBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;
    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;
    fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// 仅当命名空间当前版本等于 `version` 时写入；返回是否写入
    fn set_if_version(
        &self,
        ns: &str,
        version: u64,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, CacheError>;

    fn namespace_version(&self, ns: &str) -> Result<u64, CacheError>;
    fn flush_namespace(&self, ns: &str) -> Result<(), CacheError>;
    fn flush_all(&self) -> Result<(), CacheError>;

    fn try_lock(&self, key: &str, token: &LockToken, ttl: Duration)
        -> Result<LockAttempt, CacheError>;
    /// 返回 false 表示锁已不属于该 token（被回收或从未持有）
    fn unlock(&self, key: &str, token: &LockToken) -> Result<bool, CacheError>;
    fn lock_holder(&self, key: &str) -> Result<Option<LockToken>, CacheError>;
}

/// 页缓存键：命名空间 + 版本 + 页键
pub fn page_cache_key(ns: &str, version: u64, page: &str) -> String {
    format!("{ns}:{version}:{page}")
}

/// 页锁键：不含版本，flush 不会丢失已持有的锁
pub fn page_lock_key(ns: &str, page: &str) -> String {
    format!("{ns}:lock:{page}")
}
