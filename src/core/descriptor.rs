use serde::{Deserialize, Serialize};

use crate::core::key::{Level, SEGMENT_MAX_CHARS};
use crate::error::{Result, StoreError};

/// 单页缓存键（monolithic 策略下整表共用）
pub const MONOLITHIC_PAGE: &str = "all";

/// 缓存策略：同一个引擎，按描述符切换页键
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    /// 页键 = L5
    #[default]
    Paged,
    /// 页键 = 常量，整表一个缓存条目
    Monolithic,
    /// 不缓存，直接读写表
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Int,
    Varchar,
    Longtext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnType,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub indexed: bool,
}

impl ColumnDef {
    fn new(name: &str, kind: ColumnType, width: Option<u32>, indexed: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            width,
            indexed,
        }
    }
}

/// 表/缓存描述符：通用存储与具体表之间唯一的耦合点
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub name: String,
    /// 顺序固定：L5, L4, L3, L2, L1, L0
    pub columns: Vec<ColumnDef>,
    pub cache_namespace: String,
    #[serde(default)]
    pub cache_strategy: CacheStrategy,
}

impl TableDescriptor {
    /// 标准五级表：L5 int / L4..L2 varchar(32) / L1 int / L0 longtext，分页缓存
    pub fn standard(name: &str) -> Self {
        let w = Some(SEGMENT_MAX_CHARS as u32);
        Self {
            name: name.to_string(),
            columns: vec![
                ColumnDef::new("L5", ColumnType::Int, None, true),
                ColumnDef::new("L4", ColumnType::Varchar, w, true),
                ColumnDef::new("L3", ColumnType::Varchar, w, true),
                ColumnDef::new("L2", ColumnType::Varchar, w, true),
                ColumnDef::new("L1", ColumnType::Int, None, true),
                ColumnDef::new("L0", ColumnType::Longtext, None, false),
            ],
            cache_namespace: name.to_string(),
            cache_strategy: CacheStrategy::Paged,
        }
    }

    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.cache_strategy = strategy;
        self
    }

    pub fn with_namespace(mut self, ns: &str) -> Self {
        self.cache_namespace = ns.to_string();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(StoreError::validation("descriptor has an empty table name"));
        }
        if self.cache_strategy != CacheStrategy::None && self.cache_namespace.is_empty() {
            return Err(StoreError::validation(format!(
                "table '{}' caches but has no cache namespace",
                self.name
            )));
        }
        if self.columns.len() != 6 {
            return Err(StoreError::validation(format!(
                "table '{}' needs 5 key columns + 1 value column, got {}",
                self.name,
                self.columns.len()
            )));
        }
        for (col, level) in self.columns.iter().zip(Level::ALL) {
            let want = if level.is_int() {
                ColumnType::Int
            } else {
                ColumnType::Varchar
            };
            if col.kind != want {
                return Err(StoreError::validation(format!(
                    "column '{}' ({level}) must be {want:?}, got {:?}",
                    col.name, col.kind
                )));
            }
            if want == ColumnType::Varchar
                && col.width.map_or(true, |w| w as usize > SEGMENT_MAX_CHARS)
            {
                return Err(StoreError::validation(format!(
                    "column '{}' ({level}) needs a width <= {SEGMENT_MAX_CHARS}",
                    col.name
                )));
            }
        }
        let value = &self.columns[5];
        if value.kind != ColumnType::Longtext {
            return Err(StoreError::validation(format!(
                "value column '{}' must be Longtext",
                value.name
            )));
        }
        let mut names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.columns.len() {
            return Err(StoreError::validation(format!(
                "table '{}' has duplicate column names",
                self.name
            )));
        }
        Ok(())
    }

    pub fn column_name(&self, level: Level) -> &str {
        let i = Level::ALL.iter().position(|l| *l == level).unwrap_or(0);
        &self.columns[i].name
    }

    /// L5 所在的缓存页键；None 策略不缓存
    pub fn page_key(&self, l5: i64) -> Option<String> {
        match self.cache_strategy {
            CacheStrategy::Paged => Some(l5.to_string()),
            CacheStrategy::Monolithic => Some(MONOLITHIC_PAGE.to_string()),
            CacheStrategy::None => None,
        }
    }
}
