use serde::{Deserialize, Serialize};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

use crate::error::{Result, StoreError};

/// 段键（L4..L2）最大字符数，对应表列宽 varchar(32)
pub const SEGMENT_MAX_CHARS: usize = 32;

/// 字典树通配键；在存储键空间中保留，不允许作为段键
pub const WILDCARD: &str = "*";

/// 五级键中的层级（外 → 内：L5 .. L1）
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Level {
    L5,
    L4,
    L3,
    L2,
    L1,
}

impl Level {
    pub const ALL: [Level; 5] = [Level::L5, Level::L4, Level::L3, Level::L2, Level::L1];

    pub fn from_number(n: u8) -> Result<Self> {
        match n {
            5 => Ok(Level::L5),
            4 => Ok(Level::L4),
            3 => Ok(Level::L3),
            2 => Ok(Level::L2),
            1 => Ok(Level::L1),
            other => Err(StoreError::validation(format!(
                "level must be in 1..=5, got {other}"
            ))),
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Level::L5 => 5,
            Level::L4 => 4,
            Level::L3 => 3,
            Level::L2 => 2,
            Level::L1 => 1,
        }
    }

    /// L5/L1 是整数列，L4..L2 是字符串段
    pub fn is_int(self) -> bool {
        matches!(self, Level::L5 | Level::L1)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.number())
    }
}

/// 单个键分量的值
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Component {
    Int(i64),
    Str(String),
}

impl Component {
    /// CLI 输入：能解析为整数则视为整数
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(v) => Component::Int(v),
            Err(_) => Component::Str(raw.to_string()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Component::Int(v) => Some(*v),
            Component::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Component::Int(_) => None,
            Component::Str(s) => Some(s),
        }
    }

    pub fn fits(&self, level: Level) -> bool {
        match self {
            Component::Int(_) => level.is_int(),
            Component::Str(_) => !level.is_int(),
        }
    }
}

impl From<i64> for Component {
    fn from(v: i64) -> Self {
        Component::Int(v)
    }
}

impl From<&str> for Component {
    fn from(v: &str) -> Self {
        Component::Str(v.to_string())
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Component::Int(v) => write!(f, "{v}"),
            Component::Str(s) => write!(f, "'{s}'"),
        }
    }
}

/// 段键规范化：NFC + 长度/保留字校验
pub fn normalize_segment(level: Level, raw: &str) -> Result<String> {
    let s: String = raw.nfc().collect();
    if s.is_empty() {
        return Err(StoreError::validation(format!("{level} segment is empty")));
    }
    if s == WILDCARD {
        return Err(StoreError::validation(format!(
            "{level} segment '*' is reserved"
        )));
    }
    let chars = s.chars().count();
    if chars > SEGMENT_MAX_CHARS {
        return Err(StoreError::validation(format!(
            "{level} segment exceeds {SEGMENT_MAX_CHARS} chars (got {chars})"
        )));
    }
    Ok(s)
}

/// 完整五级主键 (L5, L4, L3, L2, L1)
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyPath {
    pub l5: i64,
    pub l4: String,
    pub l3: String,
    pub l2: String,
    pub l1: i64,
}

impl KeyPath {
    pub fn new(l5: i64, l4: &str, l3: &str, l2: &str, l1: i64) -> Result<Self> {
        Ok(Self {
            l5,
            l4: normalize_segment(Level::L4, l4)?,
            l3: normalize_segment(Level::L3, l3)?,
            l2: normalize_segment(Level::L2, l2)?,
            l1,
        })
    }

    /// 对外部直接构造（字段是 pub）的键重新校验
    pub fn checked(&self) -> Result<Self> {
        Self::new(self.l5, &self.l4, &self.l3, &self.l2, self.l1)
    }

    pub fn component(&self, level: Level) -> Component {
        match level {
            Level::L5 => Component::Int(self.l5),
            Level::L4 => Component::Str(self.l4.clone()),
            Level::L3 => Component::Str(self.l3.clone()),
            Level::L2 => Component::Str(self.l2.clone()),
            Level::L1 => Component::Int(self.l1),
        }
    }

    pub fn matches_component(&self, level: Level, c: &Component) -> bool {
        match (level, c) {
            (Level::L5, Component::Int(v)) => self.l5 == *v,
            (Level::L4, Component::Str(s)) => &self.l4 == s,
            (Level::L3, Component::Str(s)) => &self.l3 == s,
            (Level::L2, Component::Str(s)) => &self.l2 == s,
            (Level::L1, Component::Int(v)) => self.l1 == *v,
            _ => false,
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{},{},{},{})",
            self.l5, self.l4, self.l3, self.l2, self.l1
        )
    }
}

/// 部分键：L5 必填，其余由外到内连续指定
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyPrefix {
    pub l5: i64,
    pub l4: Option<String>,
    pub l3: Option<String>,
    pub l2: Option<String>,
    pub l1: Option<i64>,
}

impl KeyPrefix {
    pub fn page(l5: i64) -> Self {
        Self {
            l5,
            l4: None,
            l3: None,
            l2: None,
            l1: None,
        }
    }

    pub fn l4(mut self, v: &str) -> Self {
        self.l4 = Some(v.to_string());
        self
    }

    pub fn l3(mut self, v: &str) -> Self {
        self.l3 = Some(v.to_string());
        self
    }

    pub fn l2(mut self, v: &str) -> Self {
        self.l2 = Some(v.to_string());
        self
    }

    pub fn l1(mut self, v: i64) -> Self {
        self.l1 = Some(v);
        self
    }

    /// 由外到内的分量序列构造（CLI 用）
    pub fn from_components(parts: &[Component]) -> Result<Self> {
        if parts.is_empty() {
            return Err(StoreError::validation("prefix needs at least L5"));
        }
        if parts.len() > 5 {
            return Err(StoreError::validation(format!(
                "prefix has {} components, at most 5 allowed",
                parts.len()
            )));
        }
        let int_at = |i: usize, level: Level| -> Result<i64> {
            parts[i]
                .as_int()
                .ok_or_else(|| StoreError::validation(format!("{level} must be an integer")))
        };
        // 段键允许数字形态（"42" 作为字符串段）
        let str_at = |i: usize, level: Level| -> Result<String> {
            match &parts[i] {
                Component::Str(s) => normalize_segment(level, s),
                Component::Int(v) => normalize_segment(level, &v.to_string()),
            }
        };
        let mut p = KeyPrefix::page(int_at(0, Level::L5)?);
        if parts.len() > 1 {
            p.l4 = Some(str_at(1, Level::L4)?);
        }
        if parts.len() > 2 {
            p.l3 = Some(str_at(2, Level::L3)?);
        }
        if parts.len() > 3 {
            p.l2 = Some(str_at(3, Level::L2)?);
        }
        if parts.len() > 4 {
            p.l1 = Some(int_at(4, Level::L1)?);
        }
        Ok(p)
    }

    /// 连续性 + 段键规范化
    pub fn checked(&self) -> Result<Self> {
        let gap = (self.l4.is_none() && (self.l3.is_some() || self.l2.is_some() || self.l1.is_some()))
            || (self.l3.is_none() && (self.l2.is_some() || self.l1.is_some()))
            || (self.l2.is_none() && self.l1.is_some());
        if gap {
            return Err(StoreError::validation(format!(
                "prefix {self} skips an outer level"
            )));
        }
        Ok(Self {
            l5: self.l5,
            l4: self
                .l4
                .as_deref()
                .map(|s| normalize_segment(Level::L4, s))
                .transpose()?,
            l3: self
                .l3
                .as_deref()
                .map(|s| normalize_segment(Level::L3, s))
                .transpose()?,
            l2: self
                .l2
                .as_deref()
                .map(|s| normalize_segment(Level::L2, s))
                .transpose()?,
            l1: self.l1,
        })
    }

    pub fn covers(&self, path: &KeyPath) -> bool {
        self.l5 == path.l5
            && self.l4.as_ref().map_or(true, |v| v == &path.l4)
            && self.l3.as_ref().map_or(true, |v| v == &path.l3)
            && self.l2.as_ref().map_or(true, |v| v == &path.l2)
            && self.l1.map_or(true, |v| v == path.l1)
    }
}

impl From<&KeyPath> for KeyPrefix {
    fn from(p: &KeyPath) -> Self {
        Self {
            l5: p.l5,
            l4: Some(p.l4.clone()),
            l3: Some(p.l3.clone()),
            l2: Some(p.l2.clone()),
            l1: Some(p.l1),
        }
    }
}

impl fmt::Display for KeyPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.l5)?;
        for s in [&self.l4, &self.l3, &self.l2] {
            match s {
                Some(v) => write!(f, ",{v}")?,
                None => write!(f, ",_")?,
            }
        }
        match self.l1 {
            Some(v) => write!(f, ",{v})"),
            None => write!(f, ",_)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_rules() {
        assert!(KeyPath::new(1, "", "b", "c", 1).is_err());
        assert!(KeyPath::new(1, "*", "b", "c", 1).is_err());
        let long = "x".repeat(SEGMENT_MAX_CHARS + 1);
        assert!(KeyPath::new(1, &long, "b", "c", 1).is_err());
        let ok = "é".repeat(SEGMENT_MAX_CHARS);
        assert!(KeyPath::new(1, &ok, "b", "c", 1).is_ok());
    }

    #[test]
    fn segments_are_nfc_normalized() {
        // "e" + combining acute → "é"
        let decomposed = "caf\u{0065}\u{0301}";
        let p = KeyPath::new(1, decomposed, "b", "c", 1).unwrap();
        assert_eq!(p.l4, "caf\u{00e9}");
        assert_eq!(p, KeyPath::new(1, "café", "b", "c", 1).unwrap());
    }

    #[test]
    fn prefix_must_be_contiguous() {
        let mut p = KeyPrefix::page(1);
        p.l3 = Some("x".into());
        assert!(p.checked().is_err());
        assert!(KeyPrefix::page(1).l4("a").l3("b").checked().is_ok());
    }

    #[test]
    fn prefix_from_components() {
        let p = KeyPrefix::from_components(&[7.into(), "a".into(), "b".into()]).unwrap();
        assert_eq!(p, KeyPrefix::page(7).l4("a").l3("b"));
        assert!(KeyPrefix::from_components(&["x".into()]).is_err());
        assert!(KeyPrefix::from_components(&[]).is_err());
    }

    #[test]
    fn prefix_covers_paths() {
        let path = KeyPath::new(2, "a", "b", "c", 9).unwrap();
        assert!(KeyPrefix::page(2).covers(&path));
        assert!(KeyPrefix::page(2).l4("a").l3("b").covers(&path));
        assert!(!KeyPrefix::page(2).l4("z").covers(&path));
        assert!(!KeyPrefix::page(3).covers(&path));
        assert!(KeyPrefix::from(&path).covers(&path));
    }

    #[test]
    fn component_type_fit() {
        assert!(Component::Int(1).fits(Level::L5));
        assert!(Component::Int(1).fits(Level::L1));
        assert!(!Component::Int(1).fits(Level::L3));
        assert!(Component::from("k").fits(Level::L2));
        assert!(!Component::from("k").fits(Level::L1));
        assert!(Level::from_number(0).is_err());
        assert_eq!(Level::from_number(3).unwrap(), Level::L3);
    }
}
