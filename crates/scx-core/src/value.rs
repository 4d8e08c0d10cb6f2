//! Tagged runtime values and the single place where kind compatibility lives
//!
//! Argument values, return values and contract state are all [`Value`]s. The
//! declared types of an interface are [`ValueKind`]s, and [`ValueKind::coerce`]
//! is the only rule deciding whether a value may be bound to a declared type.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Persisted contract state: storage variable name → value.
/// A BTreeMap keeps serialization order deterministic.
pub type ContractState = BTreeMap<String, Value>;

/// A typed runtime value
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absence of a value
    Null,
    Boolean(bool),
    Integer(i64),
    /// Always finite; the guest rejects NaN and infinities
    Float(f64),
    Text(String),
    List(Vec<Value>),
    /// Ordered map (BTreeMap for deterministic iteration)
    Object(BTreeMap<String, Value>),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Object(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "\"{}\": {}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::List(_) => ValueKind::List,
            Value::Object(_) => ValueKind::Object,
        }
    }

    /// Check if value is "truthy" for branch evaluation
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::List(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        }
    }

    /// Approximate in-memory footprint in bytes, used for state ceilings
    pub fn approx_size(&self) -> usize {
        match self {
            Value::Null | Value::Boolean(_) => 1,
            Value::Integer(_) | Value::Float(_) => 8,
            Value::Text(s) => s.len() + 24,
            Value::List(items) => 24 + items.iter().map(Value::approx_size).sum::<usize>(),
            Value::Object(map) => {
                24 + map
                    .iter()
                    .map(|(k, v)| k.len() + v.approx_size())
                    .sum::<usize>()
            }
        }
    }

    /// Parse a command-line literal: JSON first, bare text otherwise.
    ///
    /// `0.3` is a float, `[1, 2]` a list, `true` a boolean, and `hello`
    /// (not valid JSON) the text `"hello"`.
    pub fn parse_literal(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap_or_else(|_| Value::Text(raw.to_string()))
    }
}

/// Approximate footprint of a whole contract state
pub fn state_size(state: &ContractState) -> usize {
    state.iter().map(|(k, v)| k.len() + v.approx_size()).sum()
}

/// Inflate a flat `name value name value ...` list into named arguments.
pub fn parse_kwargs(flat: &[String]) -> Result<BTreeMap<String, Value>> {
    if flat.len() % 2 != 0 {
        return Err(Error::Config(
            "argument list is unbalanced: expected name/value pairs".into(),
        ));
    }
    let mut args = BTreeMap::new();
    for pair in flat.chunks(2) {
        if args
            .insert(pair[0].clone(), Value::parse_literal(&pair[1]))
            .is_some()
        {
            return Err(Error::Config(format!("argument '{}' given twice", pair[0])));
        }
    }
    Ok(args)
}

// ── Kinds ─────────────────────────────────────────────────

/// The declared type of a parameter, return value or storage variable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ValueKind {
    Null,
    Boolean,
    Integer,
    Float,
    Text,
    List,
    Object,
}

impl ValueKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Boolean => "boolean",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Text => "text",
            ValueKind::List => "list",
            ValueKind::Object => "object",
        }
    }

    /// Bind `value` to this declared kind.
    ///
    /// Exact kind matches pass through unchanged. The only widening is
    /// integer → float, which converts the value. Anything else is `None`.
    pub fn coerce(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ValueKind::Float, Value::Integer(i)) => Some(Value::Float(*i as f64)),
            (kind, v) if v.kind() == kind => Some(v.clone()),
            _ => None,
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        self.coerce(value).is_some()
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ValueKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "int" | "integer" => Ok(ValueKind::Integer),
            "float" => Ok(ValueKind::Float),
            "str" | "text" | "string" => Ok(ValueKind::Text),
            "bool" | "boolean" => Ok(ValueKind::Boolean),
            "list" | "array" => Ok(ValueKind::List),
            "dict" | "object" | "map" => Ok(ValueKind::Object),
            "None" | "none" | "null" | "void" => Ok(ValueKind::Null),
            other => Err(format!("unknown type '{}'", other)),
        }
    }
}

impl TryFrom<String> for ValueKind {
    type Error = String;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ValueKind> for String {
    fn from(kind: ValueKind) -> Self {
        kind.as_str().to_string()
    }
}
