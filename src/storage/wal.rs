use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_64;

use crate::core::KeyPath;
use crate::error::StorageError;
use crate::storage::Row;

const WAL_MAGIC: u32 = 0x4C41_5750; // "PWAL"
const WAL_VERSION: u32 = 1;
const WAL_FILE: &str = "rows.wal";
const SEAL_PREFIX: &str = "rows.wal.seal-";
/// len(u32) + checksum(u64)
const RECORD_HEADER: usize = 4 + 8;

fn now_seal_id() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// 一条日志记录：已解析为具体主键的行级变更
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    Upsert(Vec<Row>),
    Delete(Vec<KeyPath>),
    Truncate,
}

#[derive(Clone, Debug)]
pub struct WalReplayResult {
    pub ops: Vec<WalOp>,
    pub sealed_used: usize,
    pub truncated_tail_records: usize,
}

/// Append-only 行变更日志（WAL）。
///
/// - current: rows.wal
/// - sealed: rows.wal.seal-<id>（checkpoint 边界切分）
pub struct WalStore {
    dir: PathBuf,
    current: PathBuf,
    file: Mutex<File>,
}

impl WalStore {
    pub fn open_in_dir(dir: PathBuf) -> Result<Self, StorageError> {
        std::fs::create_dir_all(&dir)?;
        let current = dir.join(WAL_FILE);
        let f = open_or_init(&current)?;
        Ok(Self {
            dir,
            current,
            file: Mutex::new(f),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 追加并 fsync；返回后记录已持久
    pub fn append(&self, ops: &[WalOp]) -> Result<(), StorageError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::new();
        for op in ops {
            let payload = bincode::serialize(op)?;
            let len: u32 = payload
                .len()
                .try_into()
                .map_err(|_| StorageError::Corrupted(format!("WAL record too large ({} bytes)", payload.len())))?;
            buf.extend_from_slice(&len.to_le_bytes());
            buf.extend_from_slice(&xxh3_64(&payload).to_le_bytes());
            buf.extend_from_slice(&payload);
        }
        let mut f = self.file.lock();
        f.write_all(&buf)?;
        f.flush()?;
        f.sync_data()?;
        Ok(())
    }

    /// seal：把当前 WAL rename 成 sealed 文件，并创建新的空 WAL。
    /// 返回 seal_id（写进 snapshot，作为回放起点）。
    pub fn seal(&self) -> Result<u64, StorageError> {
        let mut f = self.file.lock();
        f.flush()?;

        let id = now_seal_id();
        let sealed = self.dir.join(format!("{SEAL_PREFIX}{id:016x}"));
        if self.current.exists() {
            std::fs::rename(&self.current, &sealed)?;
        }
        // 持有锁期间替换句柄，避免并发 append 写进 sealed 文件
        *f = open_or_init(&self.current)?;
        Ok(id)
    }

    pub fn cleanup_sealed_up_to(&self, seal_id: u64) -> Result<(), StorageError> {
        if seal_id == 0 {
            return Ok(());
        }
        for ent in std::fs::read_dir(&self.dir)? {
            let Ok(ent) = ent else { continue };
            let p = ent.path();
            if let Some(id) = parse_seal_id(&p) {
                if id <= seal_id {
                    let _ = std::fs::remove_file(p);
                }
            }
        }
        Ok(())
    }

    /// 回放：只读取 seal_id > checkpoint 的 sealed WAL + 当前 WAL。
    pub fn replay_since_seal(&self, checkpoint_seal_id: u64) -> Result<WalReplayResult, StorageError> {
        let mut sealed = Vec::new();
        for ent in std::fs::read_dir(&self.dir)? {
            let Ok(ent) = ent else { continue };
            let p = ent.path();
            if let Some(id) = parse_seal_id(&p) {
                if id > checkpoint_seal_id {
                    sealed.push((id, p));
                }
            }
        }
        sealed.sort_by_key(|(id, _)| *id);

        let mut ops = Vec::new();
        let mut truncated = 0usize;
        for (_, p) in sealed.iter() {
            let (mut o, t) = read_wal_file(p)?;
            truncated += t;
            ops.append(&mut o);
        }
        let (mut cur, t) = read_wal_file(&self.current)?;
        truncated += t;
        ops.append(&mut cur);

        if truncated > 0 {
            tracing::warn!(
                "WAL replay in {} dropped {} torn/corrupt tail record(s)",
                self.dir.display(),
                truncated
            );
        }

        Ok(WalReplayResult {
            ops,
            sealed_used: sealed.len(),
            truncated_tail_records: truncated,
        })
    }
}

fn write_header(path: &Path) -> Result<(), StorageError> {
    let mut f = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    f.write_all(&WAL_MAGIC.to_le_bytes())?;
    f.write_all(&WAL_VERSION.to_le_bytes())?;
    f.sync_data()?;
    Ok(())
}

fn open_append(path: &Path) -> Result<File, StorageError> {
    Ok(OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?)
}

fn open_or_init(path: &Path) -> Result<File, StorageError> {
    if !path.exists() {
        write_header(path)?;
        return open_append(path);
    }

    let mut f = open_append(path)?;
    let mut hdr = [0u8; 8];
    f.seek(SeekFrom::Start(0))?;
    if f.read_exact(&mut hdr).is_err() {
        // 空文件/截断：重写 header
        drop(f);
        write_header(path)?;
        return open_append(path);
    }

    let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    let ver = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        tracing::warn!(
            "WAL header mismatch in {} (magic {:#x}, version {}), starting fresh",
            path.display(),
            magic,
            ver
        );
        drop(f);
        write_header(path)?;
        return open_append(path);
    }

    Ok(f)
}

fn parse_seal_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let hex = name.strip_prefix(SEAL_PREFIX)?;
    u64::from_str_radix(hex, 16).ok()
}

fn read_wal_file(path: &Path) -> Result<(Vec<WalOp>, usize), StorageError> {
    if !path.exists() {
        return Ok((Vec::new(), 0));
    }
    let mut f = File::open(path)?;

    let mut hdr = [0u8; 8];
    if f.read_exact(&mut hdr).is_err() {
        return Ok((Vec::new(), 0));
    }
    let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
    let ver = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
    if magic != WAL_MAGIC || ver != WAL_VERSION {
        return Ok((Vec::new(), 0));
    }

    let mut out = Vec::new();
    let mut truncated_tail = 0usize;
    loop {
        let start = f.stream_position()?;
        let mut rh = [0u8; RECORD_HEADER];
        match f.read_exact(&mut rh) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // 干净结尾：start 恰好在文件末尾；半个 header 也算撕裂
                let end = f.seek(SeekFrom::End(0))?;
                if start != end {
                    truncated_tail += 1;
                }
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes([rh[0], rh[1], rh[2], rh[3]]) as usize;
        let mut sum = [0u8; 8];
        sum.copy_from_slice(&rh[4..12]);
        let checksum = u64::from_le_bytes(sum);

        let mut buf = vec![0u8; len];
        if f.read_exact(&mut buf).is_err() {
            truncated_tail += 1;
            break;
        }
        if xxh3_64(&buf) != checksum {
            // 校验失败：视为截断/损坏，停止读取（保守）。
            truncated_tail += 1;
            break;
        }
        match bincode::deserialize::<WalOp>(&buf) {
            Ok(op) => out.push(op),
            Err(e) => {
                tracing::warn!("Undecodable WAL record in {}: {}", path.display(), e);
                truncated_tail += 1;
                break;
            }
        }
    }
    Ok((out, truncated_tail))
}
