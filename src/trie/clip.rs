use crate::core::key::WILDCARD;
use crate::error::TrieError;
use crate::trie::node::{Branch, TrieNode};

/// 自底向上最小化决策树。
///
/// 1. 先裁剪全部子节点（后序）
/// 2. 若 `*` 子节点裁剪后为 Terminal：整个分支收缩为 Terminal（兄弟全部冗余）
/// 3. 兄弟合并：
///    - 已有 `*`：删除子树与 `*` 相同的具体兄弟
///    - 没有 `*`：第一组（文档顺序）≥2 个子树相同的兄弟合并为一个 `*`，
///      放在该组第一个成员的位置；随后重新套用规则 2
///
/// 整树收缩时返回 Terminal，序列化为 `{}`（接受一切）。幂等：`clip(clip(t)) == clip(t)`。
pub fn clip(trie: &TrieNode) -> TrieNode {
    match trie {
        TrieNode::Terminal => TrieNode::Terminal,
        TrieNode::Branch(b) => clip_branch(b),
    }
}

/// JSON 入口：解析 → 裁剪 → 序列化
pub fn clip_json(v: &serde_json::Value) -> Result<serde_json::Value, TrieError> {
    Ok(clip(&TrieNode::from_json(v)?).to_json())
}

fn clip_branch(b: &Branch) -> TrieNode {
    let mut entries: Vec<(String, TrieNode)> =
        b.iter().map(|(k, c)| (k.to_string(), clip(c))).collect();

    if absorbs(&entries) {
        return TrieNode::Terminal;
    }

    match entries.iter().position(|(k, _)| k == WILDCARD) {
        Some(w) => {
            let shared = entries[w].1.clone();
            entries.retain(|(k, c)| k == WILDCARD || *c != shared);
        }
        None => {
            if let Some(group) = first_identical_group(&entries) {
                entries = merge_group(entries, &group);
                if absorbs(&entries) {
                    return TrieNode::Terminal;
                }
            }
        }
    }

    TrieNode::from_branch(Branch::from_entries_unchecked(entries))
}

fn absorbs(entries: &[(String, TrieNode)]) -> bool {
    entries
        .iter()
        .any(|(k, c)| k == WILDCARD && c.is_terminal())
}

/// 第一组子树相同的兄弟下标（≥2）
fn first_identical_group(entries: &[(String, TrieNode)]) -> Option<Vec<usize>> {
    for i in 0..entries.len() {
        let same: Vec<usize> = (i..entries.len())
            .filter(|&j| entries[j].1 == entries[i].1)
            .collect();
        if same.len() >= 2 {
            return Some(same);
        }
    }
    None
}

fn merge_group(entries: Vec<(String, TrieNode)>, group: &[usize]) -> Vec<(String, TrieNode)> {
    let first = group[0];
    let mut out = Vec::with_capacity(entries.len() + 1 - group.len());
    for (i, (k, c)) in entries.into_iter().enumerate() {
        if i == first {
            out.push((WILDCARD.to_string(), c));
        } else if !group.contains(&i) {
            out.push((k, c));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trie::flatten::flatten;

    fn t(text: &str) -> TrieNode {
        TrieNode::parse(text).unwrap()
    }

    fn fixtures() -> Vec<TrieNode> {
        vec![
            t(r#"{"D":{"*":{"G":{},"K":{},"T":{}},"F":{"I":{}}}}"#),
            t(r#"{"A":{"B":{"D":{"E":{"G":true,"K":true,"T":true},"F":{"I":true}}}}}"#),
            t(r#"{"A":{"*":true},"B":{"X":{},"Y":{}}}"#),
            t(r#"{"A":{"X":{"1":true}},"B":{"X":{"1":true}},"C":{"Y":true}}"#),
            t(r#"{"*":{"P":true},"A":{"P":true},"B":{"Q":true}}"#),
            t(r#"{"A":{"X":{"1":true},"Y":{"2":true}},"B":{"Z":true}}"#),
            t(r#"{"A":true}"#),
            TrieNode::Terminal,
        ]
    }

    #[test]
    fn wildcard_absorbs_siblings() {
        let got = clip(&t(r#"{"D":{"*":{"G":{},"K":{},"T":{}},"F":{"I":{}}}}"#));
        assert_eq!(got.to_json(), serde_json::json!({"D": {}}));
    }

    #[test]
    fn full_collapse_clips_to_empty_map() {
        let got = clip(&t(r#"{"A":{"*":true},"B":{"X":{},"Y":{}}}"#));
        assert_eq!(got, TrieNode::Terminal);
        assert_eq!(got.to_json(), serde_json::json!({}));

        assert_eq!(clip(&t(r#"{"*":true}"#)), TrieNode::Terminal);
        assert_eq!(clip(&t(r#"{"*":{"*":{"x":true,"y":true}}}"#)), TrieNode::Terminal);
    }

    #[test]
    fn clip_is_idempotent() {
        for f in fixtures() {
            let once = clip(&f);
            assert_eq!(clip(&once), once, "not idempotent for {f}");
        }
    }

    #[test]
    fn identical_siblings_merge_into_wildcard_at_first_position() {
        let got = clip(&t(r#"{"C":{"Y":true},"A":{"X":{"1":true}},"B":{"X":{"1":true}}}"#));
        let TrieNode::Branch(b) = &got else {
            panic!("expected branch, got {got}");
        };
        let keys: Vec<&str> = b.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["C", "*"]);
        assert_eq!(b.wildcard().unwrap(), &t(r#"{"X":{"1":true}}"#));
    }

    #[test]
    fn siblings_equal_to_existing_wildcard_are_dropped() {
        let src = t(r#"{"*":{"P":true},"A":{"P":true},"B":{"Q":true}}"#);
        let got = clip(&src);
        assert_eq!(got, t(r#"{"*":{"P":true},"B":{"Q":true}}"#));

        // 语义不变：逐一比对具体赋值
        for a in ["A", "B", "Z"] {
            for b in ["P", "Q", "R"] {
                assert_eq!(src.accepts(&[a, b]), got.accepts(&[a, b]), "({a},{b})");
            }
        }
    }

    #[test]
    fn distinct_siblings_are_kept() {
        let src = t(r#"{"A":{"X":{"1":true},"Y":{"2":true}},"B":{"Z":true}}"#);
        assert_eq!(clip(&src), src);
        let cols = ["C1", "C2", "C3"];
        assert_eq!(
            flatten(&clip(&src), &cols).unwrap(),
            flatten(&src, &cols).unwrap()
        );
    }

    #[test]
    fn clip_json_reports_structure_errors() {
        assert!(clip_json(&serde_json::json!({"A": 1})).is_err());
        assert_eq!(
            clip_json(&serde_json::json!({"A": {"*": true}})).unwrap(),
            serde_json::json!({"A": {}})
        );
    }
}
