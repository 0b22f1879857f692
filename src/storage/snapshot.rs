use serde::{Deserialize, Serialize};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::Xxh3;

use crate::error::StorageError;
use crate::storage::Row;

/// 表快照文件 Header
const MAGIC: u32 = 0x5054_5331; // "PTS1"
const VERSION_CURRENT: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8; // magic + version + state + data_len + checksum

/// 快照内容：全部行 + 对应的 WAL seal 边界
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableImage {
    /// 该快照已包含 seal_id 及之前的全部 WAL
    pub seal_id: u64,
    pub rows: Vec<Row>,
}

/// 原子快照存储（atomic replacement）
///
/// 落盘流程：
/// 1) 写 rows.snap.tmp 的 INCOMPLETE header（len/checksum 先置 0）
/// 2) `bincode::serialize_into(file)` 流式写 body，并边写边计算 xxh3 / data_len
/// 3) seek 回开头覆盖 COMMITTED header（写入真实 len/checksum）
/// 4) fsync(tmpfile)
/// 5) rename(tmp, target)：原子替换（POSIX 保证）
/// 6) fsync(dir)：确保目录项更新落盘
///
/// 任何一步崩溃，target 要么是旧快照要么是新快照；
/// 加载时校验 magic + version + state + data_len + checksum，任何不一致都拒绝。
pub struct SnapshotStore {
    path: PathBuf,
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn header(state: u32, data_len: u64, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    h[4..8].copy_from_slice(&VERSION_CURRENT.to_le_bytes());
    h[8..12].copy_from_slice(&state.to_le_bytes());
    h[12..20].copy_from_slice(&data_len.to_le_bytes());
    h[20..28].copy_from_slice(&checksum.to_le_bytes());
    h
}

fn u32_at(data: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(b)
}

fn u64_at(data: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(b)
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// 加载快照；文件缺失返回 None，校验失败返回 `Corrupted`
    /// （表是事实来源，不能把坏快照当空表）
    pub fn load(&self) -> Result<Option<TableImage>, StorageError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let data = std::fs::read(&self.path)?;
        let bad = |why: String| {
            tracing::warn!("Snapshot {} rejected: {}", self.path.display(), why);
            StorageError::Corrupted(format!("{}: {}", self.path.display(), why))
        };
        if data.len() < HEADER_SIZE {
            return Err(bad("too small".into()));
        }

        let magic = u32_at(&data, 0);
        let version = u32_at(&data, 4);
        let state = u32_at(&data, 8);
        let data_len = u64_at(&data, 12);
        let stored_checksum = u64_at(&data, 20);

        if magic != MAGIC {
            return Err(bad(format!("magic mismatch: {:#x} != {:#x}", magic, MAGIC)));
        }
        if version != VERSION_CURRENT {
            return Err(bad(format!(
                "version mismatch: {} != {}",
                version, VERSION_CURRENT
            )));
        }
        if state != STATE_COMMITTED {
            return Err(bad("state INCOMPLETE".into()));
        }

        let body = &data[HEADER_SIZE..];
        if body.len() as u64 != data_len {
            return Err(bad("data length mismatch".into()));
        }

        let computed = xxhash_rust::xxh3::xxh3_64(body);
        if computed != stored_checksum {
            return Err(bad(format!(
                "checksum mismatch: {:#x} != {:#x}",
                computed, stored_checksum
            )));
        }

        Ok(Some(bincode::deserialize::<TableImage>(body)?))
    }

    /// 原子写入快照
    pub fn write_atomic(&self, image: &TableImage) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("snap.tmp");

        // 1) INCOMPLETE header，然后流式写 body（不在内存里拼整个 body）
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&header(STATE_INCOMPLETE, 0, 0))?;

        // 2) 流式写 body 并计算长度/校验
        let (data_len, checksum) = {
            let mut cw = ChecksumWriter::new(&mut file);
            bincode::serialize_into(&mut cw, image)?;
            cw.finish()
        };

        // 3) seek 回开头覆盖 COMMITTED header
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header(STATE_COMMITTED, data_len, checksum))?;

        // 4) fsync
        file.sync_all()?;
        drop(file);

        // 5) rename 原子替换
        std::fs::rename(&tmp_path, &self.path)?;

        // 6) fsync(dir)
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        tracing::debug!(
            "Snapshot written: {} rows, {} bytes",
            image.rows.len(),
            HEADER_SIZE as u64 + data_len
        );
        Ok(())
    }
}
