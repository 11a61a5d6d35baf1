// Key filtering, ordering and limiting of map emissions

use super::{Emission, QueryOptions};
use crate::collate::collate;
use serde_json::Value;
use std::cmp::Ordering;

/// Select, order and truncate `rows` according to `options`.
///
/// Rows are ordered by key, then by document id; rows of one document with
/// equal keys stay in emission order. A descending query reverses the whole
/// ordered sequence before `limit` is applied.
pub fn plan(mut rows: Vec<Emission>, options: &QueryOptions) -> Vec<Emission> {
    match &options.key {
        Some(key) => rows.retain(|row| collate(&row.key, key) == Ordering::Equal),
        None => rows.retain(|row| {
            within_bounds(
                &row.key,
                options.startkey.as_ref(),
                options.endkey.as_ref(),
                options.descending,
            )
        }),
    }

    // stable, so same-document ties keep their emission order
    rows.sort_by(|a, b| collate(&a.key, &b.key).then_with(|| a.id.cmp(&b.id)));
    if options.descending {
        rows.reverse();
    }

    if let Some(limit) = options.limit {
        rows.truncate(limit);
    }
    rows
}

/// Range test with the bounds' roles swapped for descending scans
pub fn within_bounds(
    key: &Value,
    startkey: Option<&Value>,
    endkey: Option<&Value>,
    descending: bool,
) -> bool {
    let accept = |ord: Ordering| {
        if descending {
            ord != Ordering::Less
        } else {
            ord != Ordering::Greater
        }
    };

    startkey.map_or(true, |start| accept(collate(start, key)))
        && endkey.map_or(true, |end| accept(collate(key, end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(entries: &[(Value, &str)]) -> Vec<Emission> {
        entries
            .iter()
            .map(|(key, id)| Emission {
                key: key.clone(),
                value: Value::Null,
                id: id.to_string(),
            })
            .collect()
    }

    fn ids(rows: &[Emission]) -> Vec<&str> {
        rows.iter().map(|r| r.id.as_str()).collect()
    }

    #[test]
    fn test_within_bounds_ascending() {
        let (a, b) = (json!(2), json!(4));
        for (k, expected) in [(1, false), (2, true), (3, true), (4, true), (5, false)] {
            assert_eq!(within_bounds(&json!(k), Some(&a), Some(&b), false), expected, "key {k}");
        }
    }

    #[test]
    fn test_within_bounds_descending() {
        let (a, b) = (json!(4), json!(2));
        for (k, expected) in [(1, false), (2, true), (3, true), (4, true), (5, false)] {
            assert_eq!(within_bounds(&json!(k), Some(&a), Some(&b), true), expected, "key {k}");
        }
        assert!(within_bounds(&json!(100), None, None, true));
    }

    #[test]
    fn test_equal_keys_ordered_by_document_id() {
        let input = rows(&[(json!("k"), "c"), (json!("k"), "a"), (json!("j"), "z"), (json!("k"), "b")]);

        let asc = plan(input.clone(), &QueryOptions::new());
        assert_eq!(ids(&asc), vec!["z", "a", "b", "c"]);

        let desc = plan(input, &QueryOptions::new().descending(true));
        assert_eq!(ids(&desc), vec!["c", "b", "a", "z"]);
    }

    #[test]
    fn test_limit_counts_after_reverse() {
        let input = rows(&[(json!(1), "a"), (json!(3), "c"), (json!(2), "b")]);
        let out = plan(input, &QueryOptions::new().descending(true).limit(2));
        assert_eq!(ids(&out), vec!["c", "b"]);
    }

    #[test]
    fn test_key_match_uses_collation_equality() {
        let input = rows(&[(json!(1), "int"), (json!(1.0), "float"), (json!("1"), "str")]);
        let out = plan(input, &QueryOptions::new().key(1));
        assert_eq!(ids(&out), vec!["float", "int"]);
    }

    #[test]
    fn test_mixed_type_keys_follow_collation() {
        let input = rows(&[
            (json!({"a": 1}), "obj"),
            (json!("s"), "str"),
            (json!([1]), "arr"),
            (json!(null), "null"),
            (json!(true), "true"),
            (json!(0), "num"),
            (json!(false), "false"),
        ]);
        let out = plan(input, &QueryOptions::new());
        assert_eq!(ids(&out), vec!["null", "false", "true", "num", "str", "arr", "obj"]);
    }
}
