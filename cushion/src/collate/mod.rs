//! Total ordering over view keys.
//!
//! Keys are arbitrary JSON values. Values of different types order by type
//! rank: `null < false < true < numbers < strings < arrays < objects`.
//! Within a type:
//!
//! - numbers compare numerically and exactly, even between integers and
//!   floats beyond 2^53
//! - strings compare by Unicode code point
//! - arrays compare element by element, a shorter prefix sorting first
//! - objects compare as sequences of `(key, value)` pairs, then by length
//!
//! Composite keys are arrays, so `["a", 1] < ["a", 2] < ["b", 0]`.

use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Upper-bound sentinel for string ranges.
///
/// `endkey = prefix + MAX_STRING` selects every key that starts with
/// `prefix` followed by ordinary text.
pub const MAX_STRING: &str = "\u{0fff}";

/// Three-way comparison of two view keys.
pub fn collate(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => compare_numbers(x, y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => compare_seq(x.iter(), y.iter(), x.len(), y.len()),
        (Value::Object(x), Value::Object(y)) => {
            for ((ka, va), (kb, vb)) in x.iter().zip(y.iter()) {
                let ord = ka.cmp(kb).then_with(|| collate(va, vb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        // null, true and false each have their own rank
        _ => Ordering::Equal,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Ordering {
    match (as_integer(a), as_integer(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(x), None) => compare_integer_float(x, b.as_f64().unwrap_or(0.0)),
        (None, Some(y)) => compare_integer_float(y, a.as_f64().unwrap_or(0.0)).reverse(),
        (None, None) => {
            let x = a.as_f64().unwrap_or(0.0);
            let y = b.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
    }
}

fn as_integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

/// Exact comparison; widening `n` to `f64` would round above 2^53.
fn compare_integer_float(n: i128, f: f64) -> Ordering {
    let limit = 2f64.powi(127);
    if f >= limit {
        return Ordering::Less;
    }
    if f < -limit {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    n.cmp(&(whole as i128))
        .then_with(|| 0.0f64.partial_cmp(&(f - whole)).unwrap_or(Ordering::Equal))
}

fn compare_seq<'a>(
    a: impl Iterator<Item = &'a Value>,
    b: impl Iterator<Item = &'a Value>,
    len_a: usize,
    len_b: usize,
) -> Ordering {
    for (x, y) in a.zip(b) {
        let ord = collate(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    len_a.cmp(&len_b)
}
