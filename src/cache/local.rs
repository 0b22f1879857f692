use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;

use crate::cache::lock::{now_ms, reclaim_reason, LockAttempt, LockEntry, LockToken};
use crate::cache::CacheBackend;
use crate::error::CacheError;

/// 进程内缓存（DashMap 实现）
#[derive(Default)]
pub struct LocalCache {
    entries: DashMap<String, Vec<u8>>,
    versions: DashMap<String, u64>,
    locks: DashMap<String, LockEntry>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// 估算缓存堆占用（键 + 值字节数）
    pub fn estimated_bytes(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| (e.key().len() + e.value().len()) as u64)
            .sum()
    }
}

impl CacheBackend for LocalCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.remove(key).is_some())
    }

    fn set_if_version(
        &self,
        ns: &str,
        version: u64,
        key: &str,
        value: Vec<u8>,
    ) -> Result<bool, CacheError> {
        // 持有版本槽的写锁直到写完：flush_namespace 只能排在整次写入之前或之后
        let current = self.versions.entry(ns.to_string()).or_insert(0);
        if *current != version {
            return Ok(false);
        }
        self.entries.insert(key.to_string(), value);
        Ok(true)
    }

    fn namespace_version(&self, ns: &str) -> Result<u64, CacheError> {
        // 首次访问即登记，flush_all 才能覆盖到
        Ok(*self.versions.entry(ns.to_string()).or_insert(0))
    }

    fn flush_namespace(&self, ns: &str) -> Result<(), CacheError> {
        let old = {
            let mut v = self.versions.entry(ns.to_string()).or_insert(0);
            let old = *v;
            *v += 1;
            old
        };
        // 旧版本的键已不可达，顺手回收内存
        let prefix = format!("{ns}:{old}:");
        self.entries.retain(|k, _| !k.starts_with(&prefix));
        Ok(())
    }

    fn flush_all(&self) -> Result<(), CacheError> {
        for mut v in self.versions.iter_mut() {
            *v += 1;
        }
        self.entries.clear();
        Ok(())
    }

    fn try_lock(
        &self,
        key: &str,
        token: &LockToken,
        ttl: Duration,
    ) -> Result<LockAttempt, CacheError> {
        let now = now_ms();
        let fresh = LockEntry {
            holder: token.clone(),
            expires_at_ms: now.saturating_add(ttl.as_millis() as u64),
        };
        match self.locks.entry(key.to_string()) {
            Entry::Vacant(v) => {
                v.insert(fresh);
                Ok(LockAttempt::Acquired)
            }
            Entry::Occupied(mut o) => {
                if o.get().holder == *token {
                    // 同一 token 续期
                    o.insert(fresh);
                    return Ok(LockAttempt::Acquired);
                }
                match reclaim_reason(o.get(), now) {
                    Some(reason) => {
                        let previous = o.insert(fresh).holder;
                        Ok(LockAttempt::Reclaimed { previous, reason })
                    }
                    None => Ok(LockAttempt::Held {
                        holder: o.get().holder.clone(),
                    }),
                }
            }
        }
    }

    fn unlock(&self, key: &str, token: &LockToken) -> Result<bool, CacheError> {
        Ok(self
            .locks
            .remove_if(key, |_, e| e.holder == *token)
            .is_some())
    }

    fn lock_holder(&self, key: &str) -> Result<Option<LockToken>, CacheError> {
        Ok(self.locks.get(key).map(|e| e.holder.clone()))
    }
}
