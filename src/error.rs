use thiserror::Error;

/// 被包装的底层原因（对应源框架的 child exception）
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// 存储后端错误（表层）
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("table '{0}' is not installed")]
    NotInstalled(String),

    #[error("table '{0}' already exists")]
    AlreadyExists(String),

    #[error("table '{0}' does not exist")]
    NotFound(String),

    #[error("corrupted table file: {0}")]
    Corrupted(String),
}

/// 缓存后端错误
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),

    #[error("cache codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// PagedStore 的错误分类（kind，而非具体类型）
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("table '{table}' already exists")]
    AlreadyExists { table: String },

    #[error("table '{table}' does not exist")]
    NotFound { table: String },

    #[error("persistence failure during {op} ({context}): {source}")]
    Persistence {
        op: &'static str,
        context: String,
        #[source]
        source: Cause,
    },

    #[error("could not acquire lock on page '{page}' (held by {holder})")]
    LockConflict { page: String, holder: String },

    #[error("cache failure during {op}: {source}")]
    Cache {
        op: &'static str,
        #[source]
        source: CacheError,
    },
}

impl StoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        StoreError::Validation(msg.into())
    }

    pub fn persistence(
        op: &'static str,
        context: impl Into<String>,
        source: impl Into<Cause>,
    ) -> Self {
        StoreError::Persistence {
            op,
            context: context.into(),
            source: source.into(),
        }
    }

    /// install/uninstall 时“目标状态已满足”，调用方可视为 no-op。
    pub fn is_already_satisfied(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyExists { .. } | StoreError::NotFound { .. }
        )
    }

    /// 把存储层错误归类：schema 生命周期错误单独上浮，其余都算 Persistence。
    pub(crate) fn from_storage(op: &'static str, context: impl Into<String>, e: StorageError) -> Self {
        match e {
            StorageError::AlreadyExists(table) => StoreError::AlreadyExists { table },
            StorageError::NotFound(table) => StoreError::NotFound { table },
            other => StoreError::persistence(op, context, other),
        }
    }
}

/// 字典树结构错误（StructuralInvariantError）
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrieError {
    #[error("malformed trie node at {path}: {reason}")]
    Structure { path: String, reason: String },

    #[error("trie depth exceeds column count {columns} at {path}")]
    DepthExceeded { path: String, columns: usize },
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_errors_are_already_satisfied() {
        let e = StoreError::from_storage("install", "t", StorageError::AlreadyExists("t".into()));
        assert!(e.is_already_satisfied());
        let e = StoreError::from_storage("uninstall", "t", StorageError::NotFound("t".into()));
        assert!(e.is_already_satisfied());
    }

    #[test]
    fn io_failures_become_persistence_with_context() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let e = StoreError::from_storage("set", "(1,a,b,c,2)", StorageError::Io(io));
        assert!(!e.is_already_satisfied());
        let msg = e.to_string();
        assert!(msg.contains("set"));
        assert!(msg.contains("(1,a,b,c,2)"));
        assert!(std::error::Error::source(&e).is_some());
    }
}
