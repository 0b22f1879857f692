//! 有序行集合：MemoryTable 与 FileTable 共用的内存表示。

use std::collections::BTreeMap;

use crate::core::{Component, KeyPath, KeyPrefix, Level};
use crate::storage::Row;

pub type RowMap = BTreeMap<KeyPath, String>;

fn page_floor(l5: i64) -> KeyPath {
    KeyPath {
        l5,
        l4: String::new(),
        l3: String::new(),
        l2: String::new(),
        l1: i64::MIN,
    }
}

/// 同一 L5 的行在 BTreeMap 中连续：range 起点 + take_while
pub fn select(rows: &RowMap, prefix: &KeyPrefix) -> Vec<Row> {
    rows.range(page_floor(prefix.l5)..)
        .take_while(|(k, _)| k.l5 == prefix.l5)
        .filter(|(k, _)| prefix.covers(k))
        .map(|(k, v)| Row::new(k.clone(), v.clone()))
        .collect()
}

pub fn select_all(rows: &RowMap) -> Vec<Row> {
    rows.iter()
        .map(|(k, v)| Row::new(k.clone(), v.clone()))
        .collect()
}

/// 只保留会改变表内容的行（新增或值不同）
pub fn changed<'a>(rows: &RowMap, incoming: &'a [Row]) -> Vec<&'a Row> {
    let mut seen: BTreeMap<&KeyPath, &'a Row> = BTreeMap::new();
    // 同一批内重复主键：后者覆盖前者
    for r in incoming {
        seen.insert(&r.path, r);
    }
    seen.into_values()
        .filter(|r| rows.get(&r.path) != Some(&r.value))
        .collect()
}

pub fn apply_upsert<'a>(rows: &mut RowMap, incoming: impl IntoIterator<Item = &'a Row>) -> usize {
    let mut n = 0;
    for r in incoming {
        if rows.insert(r.path.clone(), r.value.clone()).as_ref() != Some(&r.value) {
            n += 1;
        }
    }
    n
}

pub fn matching_keys(
    rows: &RowMap,
    level: Level,
    values: &[Component],
    pages: Option<&[i64]>,
) -> Vec<KeyPath> {
    let hit = |k: &KeyPath| values.iter().any(|c| k.matches_component(level, c));
    match pages {
        None => rows.keys().filter(|k| hit(*k)).cloned().collect(),
        Some(pages) => pages
            .iter()
            .flat_map(|&l5| {
                rows.range(page_floor(l5)..)
                    .take_while(move |(k, _)| k.l5 == l5)
                    .map(|(k, _)| k)
            })
            .filter(|k| hit(*k))
            .cloned()
            .collect(),
    }
}

pub fn apply_delete(rows: &mut RowMap, keys: &[KeyPath]) -> usize {
    keys.iter().filter(|k| rows.remove(*k).is_some()).count()
}

pub fn pages_matching(rows: &RowMap, level: Level, values: &[Component]) -> Vec<i64> {
    let mut pages: Vec<i64> = rows
        .keys()
        .filter(|k| values.iter().any(|c| k.matches_component(level, c)))
        .map(|k| k.l5)
        .collect();
    pages.dedup();
    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(l5: i64, l4: &str, l1: i64, v: &str) -> Row {
        Row::new(KeyPath::new(l5, l4, "x", "y", l1).unwrap(), v.to_string())
    }

    #[test]
    fn select_stays_within_page() {
        let mut m = RowMap::new();
        apply_upsert(
            &mut m,
            &[row(-1, "A", 1, "1"), row(1, "A", 1, "2"), row(1, "B", 2, "3"), row(2, "A", 1, "4")],
        );
        assert_eq!(select(&m, &KeyPrefix::page(1)).len(), 2);
        assert_eq!(select(&m, &KeyPrefix::page(1).l4("B")).len(), 1);
        assert_eq!(select(&m, &KeyPrefix::page(-1)).len(), 1);
        assert!(select(&m, &KeyPrefix::page(9)).is_empty());
    }

    #[test]
    fn changed_skips_identical_values() {
        let mut m = RowMap::new();
        apply_upsert(&mut m, &[row(1, "A", 1, "1")]);
        let incoming = [row(1, "A", 1, "1"), row(1, "A", 2, "2"), row(1, "A", 2, "3")];
        let c = changed(&m, &incoming);
        assert_eq!(c.len(), 1);
        assert_eq!(c[0].value, "3");
    }

    #[test]
    fn delete_restricted_to_pages() {
        let mut m = RowMap::new();
        apply_upsert(&mut m, &[row(1, "A", 1, "1"), row(2, "A", 1, "2"), row(3, "B", 1, "3")]);
        let vals = [Component::from("A")];
        assert_eq!(pages_matching(&m, Level::L4, &vals), vec![1, 2]);
        let keys = matching_keys(&m, Level::L4, &vals, Some(&[2][..]));
        assert_eq!(keys.len(), 1);
        assert_eq!(apply_delete(&mut m, &keys), 1);
        assert_eq!(m.len(), 2);
    }
}
