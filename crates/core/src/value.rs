//! Configuration tree values
//!
//! The configuration is a rooted tree of named nodes. Interior nodes are
//! string-keyed mappings; leaves are strings, integers, booleans, ordered
//! sequences, or stage callback handles. Callbacks are the one leaf kind a
//! serde value cannot carry, which is why the tree has its own type instead
//! of reusing `serde_yaml::Value`.

use crate::errors::{Error, Result};
use crate::stage::Stage;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A stage callback: runs with the stage handle inside (or outside) the
/// build namespace and reports failure by returning an error.
pub type StageFn = Arc<dyn Fn(&Stage) -> Result<()> + Send + Sync>;

/// String-keyed mapping node. `BTreeMap` keeps iteration deterministic.
pub type Map = BTreeMap<String, Value>;

/// One node of the configuration tree.
#[derive(Clone)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    Seq(Vec<Value>),
    Map(Map),
    Func(StageFn),
}

impl Value {
    /// Short noun for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Int(_) => "integer",
            Value::Bool(_) => "boolean",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "mapping",
            Value::Func(_) => "callback",
        }
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, Value::Str(_) | Value::Int(_) | Value::Bool(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Value::Seq(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_func(&self) -> Option<StageFn> {
        match self {
            Value::Func(f) => Some(Arc::clone(f)),
            _ => None,
        }
    }

    /// Render a scalar leaf as a string. `None` for non-scalars.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Int(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Convert a parsed YAML document node into a tree node. Nulls, floats,
    /// tagged values, and non-string keys have no place in the tree and are
    /// configuration errors; `at` names the offending location.
    pub fn from_yaml(node: serde_yaml::Value, at: &str) -> Result<Value> {
        match node {
            serde_yaml::Value::Bool(b) => Ok(Value::Bool(b)),
            serde_yaml::Value::Number(n) => n.as_i64().map(Value::Int).ok_or_else(|| {
                Error::config(format!("non-integer number at '{at}' in config file"))
            }),
            serde_yaml::Value::String(s) => Ok(Value::Str(s)),
            serde_yaml::Value::Sequence(items) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, item) in items.into_iter().enumerate() {
                    out.push(Value::from_yaml(item, &format!("{at}[{i}]"))?);
                }
                Ok(Value::Seq(out))
            }
            serde_yaml::Value::Mapping(entries) => {
                let mut out = Map::new();
                for (key, val) in entries {
                    let key = key.as_str().map(str::to_owned).ok_or_else(|| {
                        Error::config(format!("non-string mapping key at '{at}' in config file"))
                    })?;
                    let child = Value::from_yaml(val, &format!("{at}.{key}"))?;
                    out.insert(key, child);
                }
                Ok(Value::Map(out))
            }
            serde_yaml::Value::Null => {
                Err(Error::config(format!("null value at '{at}' in config file")))
            }
            serde_yaml::Value::Tagged(_) => Err(Error::config(format!(
                "tagged value at '{at}' in config file"
            ))),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "Str({s:?})"),
            Value::Int(n) => write!(f, "Int({n})"),
            Value::Bool(b) => write!(f, "Bool({b})"),
            Value::Seq(items) => f.debug_tuple("Seq").field(items).finish(),
            Value::Map(m) => f.debug_tuple("Map").field(m).finish(),
            Value::Func(_) => write!(f, "Func(<callback>)"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Seq(a), Value::Seq(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Func(a), Value::Func(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<String>> for Value {
    fn from(items: Vec<String>) -> Self {
        Value::Seq(items.into_iter().map(Value::Str).collect())
    }
}

impl From<Vec<&str>> for Value {
    fn from(items: Vec<&str>) -> Self {
        Value::Seq(items.into_iter().map(Value::from).collect())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Seq(items)
    }
}
