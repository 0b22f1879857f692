use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::key::{Component, KeyPath, KeyPrefix, Level};

/// L0：任意可经 serde 往返的值
pub type Value = serde_json::Value;

/// L1 → L0
pub type Leaf = BTreeMap<i64, Value>;
/// L2 → L1 → L0
pub type L2Map = BTreeMap<String, Leaf>;
/// L3 → ...
pub type L3Map = BTreeMap<String, L2Map>;
/// 一页：某个 L5 下的完整子树 L4 → L3 → L2 → L1 → L0
pub type Page = BTreeMap<String, L3Map>;
/// L5 → Page
pub type Tree = BTreeMap<i64, Page>;

/// 一条记录：主键 + 值
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HierarchicalRecord {
    pub path: KeyPath,
    pub value: Value,
}

impl HierarchicalRecord {
    pub fn new(path: KeyPath, value: Value) -> Self {
        Self { path, value }
    }
}

/// 写入（覆盖）一条记录，返回旧值
pub fn insert(tree: &mut Tree, path: &KeyPath, value: Value) -> Option<Value> {
    tree.entry(path.l5)
        .or_default()
        .entry(path.l4.clone())
        .or_default()
        .entry(path.l3.clone())
        .or_default()
        .entry(path.l2.clone())
        .or_default()
        .insert(path.l1, value)
}

pub fn get<'a>(tree: &'a Tree, path: &KeyPath) -> Option<&'a Value> {
    tree.get(&path.l5)?
        .get(&path.l4)?
        .get(&path.l3)?
        .get(&path.l2)?
        .get(&path.l1)
}

pub fn from_records(records: impl IntoIterator<Item = HierarchicalRecord>) -> Tree {
    let mut t = Tree::new();
    for r in records {
        insert(&mut t, &r.path, r.value);
    }
    t
}

/// 按主键顺序展开为记录
pub fn records(tree: &Tree) -> Vec<HierarchicalRecord> {
    let mut out = Vec::new();
    for (l5, page) in tree {
        for (l4, l3m) in page {
            for (l3, l2m) in l3m {
                for (l2, leaf) in l2m {
                    for (l1, v) in leaf {
                        out.push(HierarchicalRecord {
                            path: KeyPath {
                                l5: *l5,
                                l4: l4.clone(),
                                l3: l3.clone(),
                                l2: l2.clone(),
                                l1: *l1,
                            },
                            value: v.clone(),
                        });
                    }
                }
            }
        }
    }
    out
}

pub fn page_len(page: &Page) -> usize {
    page.values()
        .flat_map(|l3m| l3m.values())
        .flat_map(|l2m| l2m.values())
        .map(|leaf| leaf.len())
        .sum()
}

pub fn len(tree: &Tree) -> usize {
    tree.values().map(page_len).sum()
}

/// 把 src 深度合并进 dst（src 覆盖同键）
pub fn merge(dst: &mut Tree, src: &Tree) {
    for r in records(src) {
        insert(dst, &r.path, r.value);
    }
}

/// 收窄到前缀；未命中返回空树（不留空的中间层）
pub fn narrow(tree: &Tree, prefix: &KeyPrefix) -> Tree {
    let mut out = Tree::new();
    let Some(page) = tree.get(&prefix.l5) else {
        return out;
    };
    let page = match &prefix.l4 {
        None => page.clone(),
        Some(l4) => {
            let sub = page.get(l4).map(|m| narrow_l3(m, prefix)).unwrap_or_default();
            single(l4, sub)
        }
    };
    if !page.is_empty() {
        out.insert(prefix.l5, page);
    }
    out
}

fn narrow_l3(m: &L3Map, prefix: &KeyPrefix) -> L3Map {
    match &prefix.l3 {
        None => m.clone(),
        Some(l3) => {
            let sub = m.get(l3).map(|m| narrow_l2(m, prefix)).unwrap_or_default();
            single(l3, sub)
        }
    }
}

fn narrow_l2(m: &L2Map, prefix: &KeyPrefix) -> L2Map {
    match &prefix.l2 {
        None => m.clone(),
        Some(l2) => {
            let sub = m.get(l2).map(|leaf| narrow_leaf(leaf, prefix)).unwrap_or_default();
            single(l2, sub)
        }
    }
}

fn narrow_leaf(leaf: &Leaf, prefix: &KeyPrefix) -> Leaf {
    match prefix.l1 {
        None => leaf.clone(),
        Some(l1) => leaf
            .get(&l1)
            .map(|v| BTreeMap::from([(l1, v.clone())]))
            .unwrap_or_default(),
    }
}

fn single<V: IsEmpty>(k: &str, v: V) -> BTreeMap<String, V> {
    if v.is_empty_map() {
        BTreeMap::new()
    } else {
        BTreeMap::from([(k.to_string(), v)])
    }
}

trait IsEmpty {
    fn is_empty_map(&self) -> bool;
}

impl<K, V> IsEmpty for BTreeMap<K, V> {
    fn is_empty_map(&self) -> bool {
        self.is_empty()
    }
}

fn int_hit(values: &[Component], v: i64) -> bool {
    values.iter().any(|c| c.as_int() == Some(v))
}

fn str_hit(values: &[Component], s: &str) -> bool {
    values.iter().any(|c| c.as_str() == Some(s))
}

/// 删除 `level` 上等于任一 `values` 的全部记录，并递归剪掉空分支。
///
/// 返回删除的叶子（记录）数。
pub fn prune_matching(tree: &mut Tree, level: Level, values: &[Component]) -> usize {
    let mut removed = 0usize;
    tree.retain(|l5, page| {
        if level == Level::L5 && int_hit(values, *l5) {
            removed += page_len(page);
            return false;
        }
        page.retain(|l4, l3m| {
            if level == Level::L4 && str_hit(values, l4) {
                removed += l3m.values().flat_map(|m| m.values()).map(|l| l.len()).sum::<usize>();
                return false;
            }
            l3m.retain(|l3, l2m| {
                if level == Level::L3 && str_hit(values, l3) {
                    removed += l2m.values().map(|l| l.len()).sum::<usize>();
                    return false;
                }
                l2m.retain(|l2, leaf| {
                    if level == Level::L2 && str_hit(values, l2) {
                        removed += leaf.len();
                        return false;
                    }
                    if level == Level::L1 {
                        let before = leaf.len();
                        leaf.retain(|l1, _| !int_hit(values, *l1));
                        removed += before - leaf.len();
                    }
                    !leaf.is_empty()
                });
                !l2m.is_empty()
            });
            !l3m.is_empty()
        });
        !page.is_empty()
    });
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kp(l5: i64, l4: &str, l3: &str, l2: &str, l1: i64) -> KeyPath {
        KeyPath::new(l5, l4, l3, l2, l1).unwrap()
    }

    fn sample() -> Tree {
        from_records([
            HierarchicalRecord::new(kp(1, "A", "X", "K", 1), json!(1)),
            HierarchicalRecord::new(kp(1, "A", "X", "K", 2), json!("two")),
            HierarchicalRecord::new(kp(1, "A", "Y", "Z", 1), json!(null)),
            HierarchicalRecord::new(kp(1, "B", "X", "K", 1), json!({"a": [1, 2]})),
            HierarchicalRecord::new(kp(2, "A", "X", "K", 1), json!(true)),
        ])
    }

    #[test]
    fn insert_get_and_records_roundtrip() {
        let t = sample();
        assert_eq!(len(&t), 5);
        assert_eq!(get(&t, &kp(1, "A", "X", "K", 2)), Some(&json!("two")));
        assert_eq!(get(&t, &kp(1, "A", "X", "K", 3)), None);
        assert_eq!(from_records(records(&t)), t);
    }

    #[test]
    fn narrow_keeps_full_key_structure() {
        let t = sample();
        let n = narrow(&t, &KeyPrefix::page(1).l4("A").l3("X"));
        assert_eq!(len(&n), 2);
        assert_eq!(n[&1]["A"]["X"]["K"][&2], json!("two"));

        assert!(narrow(&t, &KeyPrefix::page(1).l4("A").l3("Q")).is_empty());
        assert!(narrow(&t, &KeyPrefix::page(9)).is_empty());
        assert_eq!(len(&narrow(&t, &KeyPrefix::page(1))), 4);
    }

    #[test]
    fn prune_removes_empty_branches() {
        let mut t = sample();
        // L3='Y' 只有一条记录，删除后 (1,A,Y) 整枝消失
        let removed = prune_matching(&mut t, Level::L3, &["Y".into()]);
        assert_eq!(removed, 1);
        assert!(!t[&1]["A"].contains_key("Y"));

        // L2='K' 清空 L5=2 整页
        let removed = prune_matching(&mut t, Level::L2, &["K".into()]);
        assert_eq!(removed, 4);
        assert!(t.is_empty());
    }

    #[test]
    fn prune_ignores_mistyped_components() {
        let mut t = sample();
        assert_eq!(prune_matching(&mut t, Level::L1, &["1".into()]), 0);
        assert_eq!(prune_matching(&mut t, Level::L1, &[1.into()]), 4);
        assert_eq!(len(&t), 1);
        assert_eq!(get(&t, &kp(1, "A", "X", "K", 2)), Some(&json!("two")));
    }

    #[test]
    fn merge_overlays_values() {
        let mut a = sample();
        let b = from_records([HierarchicalRecord::new(kp(1, "A", "X", "K", 1), json!(99))]);
        merge(&mut a, &b);
        assert_eq!(get(&a, &kp(1, "A", "X", "K", 1)), Some(&json!(99)));
        assert_eq!(len(&a), 5);
    }
}
