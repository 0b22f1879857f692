use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::core::key::WILDCARD;
use crate::error::TrieError;
use crate::trie::node::TrieNode;

/// 一条被接受路径的列赋值（有序、部分）；`*` 列被省略
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlatTuple(Vec<(String, String)>);

impl FlatTuple {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(c, v)| (c.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<C: Into<String>, V: Into<String>> FromIterator<(C, V)> for FlatTuple {
    fn from_iter<I: IntoIterator<Item = (C, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(c, v)| (c.into(), v.into())).collect())
    }
}

impl Serialize for FlatTuple {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (c, v) in &self.0 {
            map.serialize_entry(c, v)?;
        }
        map.end()
    }
}

/// 深度优先枚举所有被接受路径，顺序 = 各分支的子节点顺序。
///
/// 纯函数；树比列更深时返回 `DepthExceeded`。
pub fn flatten<S: AsRef<str>>(trie: &TrieNode, columns: &[S]) -> Result<Vec<FlatTuple>, TrieError> {
    let columns: Vec<&str> = columns.iter().map(|c| c.as_ref()).collect();
    let mut out = Vec::new();
    let mut path: Vec<(String, String)> = Vec::with_capacity(columns.len());
    let mut trail: Vec<&str> = Vec::with_capacity(columns.len());
    walk(trie, &columns, 0, &mut path, &mut trail, &mut out)?;
    Ok(out)
}

fn walk<'a>(
    node: &'a TrieNode,
    columns: &[&str],
    depth: usize,
    path: &mut Vec<(String, String)>,
    trail: &mut Vec<&'a str>,
    out: &mut Vec<FlatTuple>,
) -> Result<(), TrieError> {
    let branch = match node {
        TrieNode::Terminal => {
            out.push(FlatTuple(path.clone()));
            return Ok(());
        }
        TrieNode::Branch(b) => b,
    };
    let Some(column) = columns.get(depth) else {
        return Err(TrieError::DepthExceeded {
            path: format!("$/{}", trail.join("/")),
            columns: columns.len(),
        });
    };

    for (key, child) in branch.iter() {
        trail.push(key);
        if key == WILDCARD {
            walk(child, columns, depth + 1, path, trail, out)?;
        } else {
            path.push((column.to_string(), key.to_string()));
            walk(child, columns, depth + 1, path, trail, out)?;
            path.pop();
        }
        trail.pop();
    }
    Ok(())
}
