//! Runtime values for the map-function interpreter.

use super::ast::FunctionDef;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;

/// Nesting limit when converting to JSON; guards against self-referencing arrays
const MAX_JSON_DEPTH: usize = 128;

#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<RefCell<BTreeMap<String, Value>>>),
    Function(Closure),
    Builtin(Builtin),
    /// A method looked up on a receiver, e.g. `tags.forEach`
    Method(Box<Value>, Method),
}

/// A function expression together with the frame it closed over
#[derive(Debug, Clone)]
pub struct Closure {
    pub def: Arc<FunctionDef>,
    pub env: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Emit,
    ParseInt,
    ParseFloat,
    IsNaN,
    /// The `Array` global; only `Array.isArray` is exposed
    ArrayNamespace,
    ArrayIsArray,
    /// The `Object` global; only `Object.keys` is exposed
    ObjectNamespace,
    ObjectKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    ForEach,
    IndexOf,
    Push,
    Join,
    ToLowerCase,
    ToUpperCase,
    Split,
    Trim,
    HasOwnProperty,
}

impl Value {
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        Value::Str(s.into())
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn object(entries: BTreeMap<String, Value>) -> Self {
        Value::Object(Rc::new(RefCell::new(entries)))
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            _ => true,
        }
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null | Value::Array(_) | Value::Object(_) => "object",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Function(_) | Value::Builtin(_) | Value::Method(..) => "function",
        }
    }

    pub fn is_callable(&self) -> bool {
        match self {
            Value::Function(_) | Value::Method(..) => true,
            Value::Builtin(b) => !matches!(b, Builtin::ArrayNamespace | Builtin::ObjectNamespace),
            _ => false,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Value::Undefined => f64::NAN,
            Value::Null => 0.0,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Number(n) => *n,
            Value::Str(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    0.0
                } else {
                    trimmed.parse::<f64>().unwrap_or(f64::NAN)
                }
            }
            Value::Array(items) => {
                let items = items.borrow();
                match items.len() {
                    0 => 0.0,
                    1 => items[0].to_number(),
                    _ => f64::NAN,
                }
            }
            _ => f64::NAN,
        }
    }

    /// String conversion as performed by `+` and `join`
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => s.to_string(),
            Value::Array(items) => items
                .borrow()
                .iter()
                .map(|v| match v {
                    Value::Undefined | Value::Null => String::new(),
                    other => other.to_js_string(),
                })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => "[object Object]".to_string(),
            Value::Function(_) | Value::Builtin(_) | Value::Method(..) => {
                "function () { [native code] }".to_string()
            }
        }
    }

    /// Deep copy of a JSON value into interpreter values
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::string(s.as_str()),
            serde_json::Value::Array(items) => {
                Value::array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Conversion applied to emitted keys and values.
    ///
    /// `undefined`, `NaN`, infinities and functions become `null`; object
    /// properties holding `undefined` or functions are dropped.
    pub fn to_json(&self) -> Result<serde_json::Value, String> {
        self.to_json_at(0)
    }

    fn to_json_at(&self, depth: usize) -> Result<serde_json::Value, String> {
        if depth > MAX_JSON_DEPTH {
            return Err("value is nested too deeply (cyclic structure?)".into());
        }
        Ok(match self {
            Value::Undefined | Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::Array(items) => {
                let items = items.borrow();
                let mut out = Vec::with_capacity(items.len());
                for item in items.iter() {
                    out.push(item.to_json_at(depth + 1)?);
                }
                serde_json::Value::Array(out)
            }
            Value::Object(entries) => {
                let entries = entries.borrow();
                let mut out = serde_json::Map::new();
                for (k, v) in entries.iter() {
                    if matches!(v, Value::Undefined) || v.is_callable() {
                        continue;
                    }
                    out.insert(k.clone(), v.to_json_at(depth + 1)?);
                }
                serde_json::Value::Object(out)
            }
            Value::Function(_) | Value::Builtin(_) | Value::Method(..) => serde_json::Value::Null,
        })
    }
}

/// Integral values within the exactly-representable range become JSON integers
fn number_to_json(n: f64) -> serde_json::Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if n.is_finite() && n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        return serde_json::Value::from(n as i64);
    }
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .unwrap_or(serde_json::Value::Null)
}

/// Number formatting following JavaScript's `String(n)` for common values
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let s = if n > 0.0 { "Infinity" } else { "-Infinity" };
        s.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e21 {
        format!("{}", n as i128)
    } else {
        format!("{n}")
    }
}
