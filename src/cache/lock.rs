use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::cache::CacheBackend;
use crate::error::{Result, StoreError};
use crate::stats::StoreStats;

static NEXT_NONCE: AtomicU64 = AtomicU64::new(1);

/// 锁持有者标识：进程号 + 每次操作唯一的 nonce
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockToken {
    pub pid: u32,
    pub nonce: u64,
}

impl LockToken {
    /// 每个读-改-写序列铸造一个新 token（同进程不同线程互不重入）
    pub fn mint() -> Self {
        Self {
            pid: std::process::id(),
            nonce: NEXT_NONCE.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {} #{}", self.pid, self.nonce)
    }
}

/// 锁表条目（墙钟毫秒，便于跨进程的远端缓存共享）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub holder: LockToken,
    pub expires_at_ms: u64,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReclaimReason {
    Expired,
    DeadHolder,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    Reclaimed {
        previous: LockToken,
        reason: ReclaimReason,
    },
    Held {
        holder: LockToken,
    },
}

pub fn now_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 进程是否仍存活：kill(pid, 0)，ESRCH 视为已退出
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: 信号 0 只做存在性/权限检查，不投递任何信号
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// 过期或持有者进程已退出的锁可以回收
pub fn reclaim_reason(entry: &LockEntry, now_ms: u64) -> Option<ReclaimReason> {
    if entry.expires_at_ms <= now_ms {
        return Some(ReclaimReason::Expired);
    }
    if !process_alive(entry.holder.pid) {
        return Some(ReclaimReason::DeadHolder);
    }
    None
}

#[derive(Copy, Clone, Debug)]
pub struct LockPolicy {
    pub ttl: Duration,
    pub timeout: Duration,
    pub retry: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            retry: Duration::from_millis(5),
        }
    }
}

/// 持有一组页锁；drop 时按逆序释放（成功与出错路径一致）
pub struct PageLockGuard<'a> {
    cache: &'a dyn CacheBackend,
    keys: Vec<String>,
    token: LockToken,
}

impl<'a> PageLockGuard<'a> {
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

impl Drop for PageLockGuard<'_> {
    fn drop(&mut self) {
        for key in self.keys.iter().rev() {
            match self.cache.unlock(key, &self.token) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!("Lock {} was no longer held by {} at release", key, self.token)
                }
                Err(e) => tracing::warn!("Failed to release lock {}: {}", key, e),
            }
        }
    }
}

/// 按升序获取全部锁（避免多页操作之间死锁）；超时返回 LockConflict
pub fn acquire<'a>(
    cache: &'a dyn CacheBackend,
    mut keys: Vec<String>,
    policy: LockPolicy,
    stats: &StoreStats,
) -> Result<PageLockGuard<'a>> {
    keys.sort();
    keys.dedup();

    let mut guard = PageLockGuard {
        cache,
        keys: Vec::with_capacity(keys.len()),
        token: LockToken::mint(),
    };

    for key in keys {
        let started = Instant::now();
        let mut waited = false;
        loop {
            let attempt = cache
                .try_lock(&key, &guard.token, policy.ttl)
                .map_err(|source| StoreError::Cache {
                    op: "lock",
                    source,
                })?;
            match attempt {
                LockAttempt::Acquired => break,
                LockAttempt::Reclaimed { previous, reason } => {
                    tracing::warn!(
                        "Reclaimed lock {} from {} ({:?})",
                        key,
                        previous,
                        reason
                    );
                    StoreStats::bump(&stats.locks_reclaimed);
                    break;
                }
                LockAttempt::Held { holder } => {
                    if !waited {
                        waited = true;
                        StoreStats::bump(&stats.lock_waits);
                        tracing::debug!("Lock {} held by {}, waiting", key, holder);
                    }
                    if started.elapsed() >= policy.timeout {
                        // guard drop 会释放已拿到的锁
                        return Err(StoreError::LockConflict {
                            page: key,
                            holder: holder.to_string(),
                        });
                    }
                    std::thread::sleep(policy.retry);
                }
            }
        }
        guard.keys.push(key);
    }
    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LocalCache;

    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn quick() -> LockPolicy {
        LockPolicy {
            ttl: Duration::from_secs(30),
            timeout: Duration::from_millis(50),
            retry: Duration::from_millis(2),
        }
    }

    #[test]
    fn tokens_are_unique_per_mint() {
        let a = LockToken::mint();
        let b = LockToken::mint();
        assert_eq!(a.pid, b.pid);
        assert_ne!(a, b);
    }

    #[test]
    fn current_process_is_alive_and_reaped_child_is_not() {
        assert!(process_alive(std::process::id()));
        assert!(!process_alive(dead_pid()));
    }

    #[test]
    fn expired_and_dead_entries_are_reclaimable() {
        let live = LockEntry {
            holder: LockToken::mint(),
            expires_at_ms: now_ms() + 60_000,
        };
        assert_eq!(reclaim_reason(&live, now_ms()), None);

        let expired = LockEntry {
            expires_at_ms: now_ms().saturating_sub(1),
            ..live.clone()
        };
        assert_eq!(reclaim_reason(&expired, now_ms()), Some(ReclaimReason::Expired));

        let dead = LockEntry {
            holder: LockToken {
                pid: dead_pid(),
                nonce: 1,
            },
            ..live
        };
        assert_eq!(reclaim_reason(&dead, now_ms()), Some(ReclaimReason::DeadHolder));
    }

    #[test]
    fn acquire_times_out_and_releases_partial_set() {
        let cache = LocalCache::new();
        let stats = StoreStats::default();
        let other = LockToken::mint();
        cache.try_lock("ns:lock:2", &other, Duration::from_secs(30)).unwrap();

        let err = acquire(&cache, vec!["ns:lock:2".into(), "ns:lock:1".into()], quick(), &stats)
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::LockConflict { ref page, .. } if page == "ns:lock:2"));
        // "ns:lock:1" 已先拿到，失败后必须释放
        assert_eq!(cache.lock_holder("ns:lock:1").unwrap(), None);
        assert_eq!(stats.report().lock_waits, 1);
    }

    #[test]
    fn guard_releases_on_drop() {
        let cache = LocalCache::new();
        let stats = StoreStats::default();
        {
            let g = acquire(&cache, vec!["k".into()], quick(), &stats).unwrap();
            assert_eq!(cache.lock_holder("k").unwrap().as_ref(), Some(g.token()));
        }
        assert_eq!(cache.lock_holder("k").unwrap(), None);
    }

    #[test]
    fn lock_of_dead_holder_is_reclaimed() {
        let cache = LocalCache::new();
        let stats = StoreStats::default();
        let ghost = LockToken {
            pid: dead_pid(),
            nonce: 7,
        };
        cache.try_lock("k", &ghost, Duration::from_secs(600)).unwrap();

        let g = acquire(&cache, vec!["k".into()], quick(), &stats).unwrap();
        assert_eq!(cache.lock_holder("k").unwrap().as_ref(), Some(g.token()));
        assert_eq!(stats.report().locks_reclaimed, 1);
    }
}
