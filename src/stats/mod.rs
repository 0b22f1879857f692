use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// 存储运行计数（无锁原子，随 `PagedStore` 共享）
#[derive(Debug, Default)]
pub struct StoreStats {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    /// 缓存未命中后从表加载的页数
    pub page_loads: AtomicU64,
    pub page_writebacks: AtomicU64,
    /// 命名空间版本在读-改-写期间变化而放弃的回写
    pub stale_writebacks_skipped: AtomicU64,
    pub lock_waits: AtomicU64,
    pub locks_reclaimed: AtomicU64,
    pub rows_written: AtomicU64,
    pub rows_deleted: AtomicU64,
    /// 回写失败后主动失效的页
    pub invalidations: AtomicU64,
}

impl StoreStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        if n > 0 {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub fn report(&self) -> StatsReport {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsReport {
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            page_loads: load(&self.page_loads),
            page_writebacks: load(&self.page_writebacks),
            stale_writebacks_skipped: load(&self.stale_writebacks_skipped),
            lock_waits: load(&self.lock_waits),
            locks_reclaimed: load(&self.locks_reclaimed),
            rows_written: load(&self.rows_written),
            rows_deleted: load(&self.rows_deleted),
            invalidations: load(&self.invalidations),
            ..Default::default()
        }
    }
}

/// 计数快照 + 存储规模（由调用方补充）
#[derive(Clone, Debug, Default)]
pub struct StatsReport {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub page_loads: u64,
    pub page_writebacks: u64,
    pub stale_writebacks_skipped: u64,
    pub lock_waits: u64,
    pub locks_reclaimed: u64,
    pub rows_written: u64,
    pub rows_deleted: u64,
    pub invalidations: u64,
    /// 表行数
    pub table_rows: usize,
    /// 缓存条目数
    pub cache_entries: usize,
    /// 缓存估算内存（字节）
    pub cache_bytes: u64,
    /// 进程级 RSS（从 /proc/self/statm 读取）
    pub process_rss_bytes: u64,
}

impl StatsReport {
    /// 命中率（无访问时为 None）
    pub fn hit_ratio(&self) -> Option<f64> {
        let total = self.cache_hits + self.cache_misses;
        (total > 0).then(|| self.cache_hits as f64 / total as f64)
    }

    /// 从 /proc/self/statm 读取进程 RSS
    pub fn read_process_rss() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                // statm 格式: size resident shared text lib data dt (单位: 页)
                let parts: Vec<&str> = s.split_whitespace().collect();
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096)
            .unwrap_or(0)
    }
}

fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for StatsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ratio = match self.hit_ratio() {
            Some(r) => format!("{:.1}%", r * 100.0),
            None => "-".to_string(),
        };
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           pagetree Store Report                  ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(
            f,
            "║ Process RSS: {:>35} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Cache:                                           ║")?;
        writeln!(
            f,
            "║   entries:      {:>10}  ({:>10})          ║",
            self.cache_entries,
            human_bytes(self.cache_bytes)
        )?;
        writeln!(
            f,
            "║   hits/misses:  {:>10} / {:<10}         ║",
            self.cache_hits, self.cache_misses
        )?;
        writeln!(f, "║   hit ratio:    {:>10}                       ║", ratio)?;
        writeln!(
            f,
            "║   page loads:   {:>10}                       ║",
            self.page_loads
        )?;
        writeln!(
            f,
            "║   write-backs:  {:>10}  (stale skip {:>6})   ║",
            self.page_writebacks, self.stale_writebacks_skipped
        )?;
        writeln!(
            f,
            "║   invalidated:  {:>10}                       ║",
            self.invalidations
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Locks:                                           ║")?;
        writeln!(
            f,
            "║   waits:        {:>10}                       ║",
            self.lock_waits
        )?;
        writeln!(
            f,
            "║   reclaimed:    {:>10}                       ║",
            self.locks_reclaimed
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Table:                                           ║")?;
        writeln!(
            f,
            "║   rows:         {:>10}                       ║",
            self.table_rows
        )?;
        writeln!(
            f,
            "║   written:      {:>10}                       ║",
            self.rows_written
        )?;
        writeln!(
            f,
            "║   deleted:      {:>10}                       ║",
            self.rows_deleted
        )?;
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
