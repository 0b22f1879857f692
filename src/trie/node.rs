use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::core::key::WILDCARD;
use crate::error::TrieError;

/// 稀疏决策树节点
///
/// - `Terminal`：在此接受，不再消费后续列（`true` 与 `{}` 统一为该形态）
/// - `Branch`：列值 → 子节点，保持插入顺序；至少一个子节点
#[derive(Clone, Debug, PartialEq)]
pub enum TrieNode {
    Terminal,
    Branch(Branch),
}

/// 有序、键唯一的子节点表
#[derive(Clone, Debug, Default)]
pub struct Branch {
    entries: Vec<(String, TrieNode)>,
}

impl Branch {
    pub fn new() -> Self {
        Self::default()
    }

    /// 插入子节点；同一分支内重复键是结构错误
    pub fn insert(&mut self, key: impl Into<String>, child: TrieNode) -> Result<(), TrieError> {
        let key = key.into();
        if self.get(&key).is_some() {
            return Err(TrieError::Structure {
                path: "$".to_string(),
                reason: format!("duplicate key '{key}' in one branch"),
            });
        }
        self.entries.push((key, child));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&TrieNode> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn wildcard(&self) -> Option<&TrieNode> {
        self.get(WILDCARD)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TrieNode)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn from_entries_unchecked(entries: Vec<(String, TrieNode)>) -> Self {
        Self { entries }
    }
}

/// 结构等价：与子节点顺序无关
impl PartialEq for Branch {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|o| o == v))
    }
}

impl TrieNode {
    /// 由 (键, 子节点) 构造；空表归一为 Terminal
    pub fn branch<K, I>(entries: I) -> Result<Self, TrieError>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, TrieNode)>,
    {
        let mut b = Branch::new();
        for (k, v) in entries {
            b.insert(k, v)?;
        }
        Ok(Self::from_branch(b))
    }

    pub(crate) fn from_branch(b: Branch) -> Self {
        if b.is_empty() {
            TrieNode::Terminal
        } else {
            TrieNode::Branch(b)
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TrieNode::Terminal)
    }

    /// 从已解析的 JSON 构造（注意：不开 preserve_order 时 serde_json 的对象按键排序，
    /// 需要保留文档顺序请用 [`TrieNode::parse`]）
    pub fn from_json(v: &serde_json::Value) -> Result<Self, TrieError> {
        from_json_at(v, "$")
    }

    /// 从 JSON 文本解析，保留文档顺序
    pub fn parse(text: &str) -> Result<Self, TrieError> {
        serde_json::from_str(text).map_err(|e| TrieError::Structure {
            path: "$".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            TrieNode::Terminal => serde_json::Value::Object(serde_json::Map::new()),
            TrieNode::Branch(b) => serde_json::Value::Object(
                b.iter().map(|(k, v)| (k.to_string(), v.to_json())).collect(),
            ),
        }
    }

    /// 给定每列的具体值，判断是否被接受。
    ///
    /// 具体键优先；`*` 只覆盖没有具体兄弟的值。
    pub fn accepts(&self, values: &[&str]) -> bool {
        let mut node = self;
        let mut depth = 0usize;
        loop {
            match node {
                TrieNode::Terminal => return true,
                TrieNode::Branch(b) => {
                    let Some(v) = values.get(depth) else {
                        return false;
                    };
                    match b.get(v).or_else(|| b.wildcard()) {
                        Some(child) => node = child,
                        None => return false,
                    }
                    depth += 1;
                }
            }
        }
    }

    /// 最大深度（Terminal 为 0）
    pub fn depth(&self) -> usize {
        match self {
            TrieNode::Terminal => 0,
            TrieNode::Branch(b) => 1 + b.iter().map(|(_, c)| c.depth()).max().unwrap_or(0),
        }
    }
}

fn from_json_at(v: &serde_json::Value, path: &str) -> Result<TrieNode, TrieError> {
    match v {
        serde_json::Value::Bool(true) => Ok(TrieNode::Terminal),
        serde_json::Value::Object(m) => {
            let mut b = Branch::new();
            for (k, child) in m {
                let sub = format!("{path}/{k}");
                let node = from_json_at(child, &sub)?;
                b.insert(k.clone(), node).map_err(|e| relocate(e, path))?;
            }
            Ok(TrieNode::from_branch(b))
        }
        other => Err(TrieError::Structure {
            path: path.to_string(),
            reason: format!("expected `true` or an object, got {other}"),
        }),
    }
}

fn relocate(e: TrieError, path: &str) -> TrieError {
    match e {
        TrieError::Structure { reason, .. } => TrieError::Structure {
            path: path.to_string(),
            reason,
        },
        other => other,
    }
}

impl fmt::Display for TrieNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for TrieNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            TrieNode::Terminal => serializer.serialize_map(Some(0))?.end(),
            TrieNode::Branch(b) => {
                let mut map = serializer.serialize_map(Some(b.len()))?;
                for (k, v) in b.iter() {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

struct TrieVisitor;

impl<'de> Visitor<'de> for TrieVisitor {
    type Value = TrieNode;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("`true` or a map of column value to trie node")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<TrieNode, E> {
        if v {
            Ok(TrieNode::Terminal)
        } else {
            Err(E::custom("`false` is not a trie node"))
        }
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<TrieNode, A::Error> {
        let mut b = Branch::new();
        while let Some((k, v)) = access.next_entry::<String, TrieNode>()? {
            b.insert(k, v).map_err(de::Error::custom)?;
        }
        Ok(TrieNode::from_branch(b))
    }
}

impl<'de> Deserialize<'de> for TrieNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(TrieVisitor)
    }
}
