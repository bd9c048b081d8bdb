//! Canonical cell representation for fetched row tables.
//!
//! Every column position in a fetched row holds one [`Cell`]. The driver
//! decodes database values into cells according to the planner's column
//! metadata; [`Cell::FailedJoin`] marks positions that came from the child
//! side of an unmatched `LEFT JOIN` row and is never produced by decoding an
//! actual value.

use std::cmp::Ordering;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Typed scalar cell tagged with explicit type information so tables remain
/// unambiguous across drivers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Cell {
    /// Decoded SQL NULL in a matched row.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed 64-bit integer value.
    Int(i64),
    /// 64-bit floating point value.
    Float(f64),
    /// UTF-8 string value; also carries UUIDs, dates, times, and timestamps
    /// in their canonical textual form.
    String(String),
    /// Arbitrary binary payload.
    Bytes(Vec<u8>),
    /// Homogeneous array value (for array-typed columns).
    List(Vec<Cell>),
    /// Embedded JSON subtree.
    Json(serde_json::Value),
    /// Sentinel for a cell sourced from an unmatched LEFT JOIN row.
    FailedJoin,
}

impl Cell {
    /// Whether the cell carries no value at all.
    pub fn is_absent(&self) -> bool {
        matches!(self, Cell::Null | Cell::FailedJoin)
    }

    /// JSON rendering used by the built-in leaf encoder. `FailedJoin`
    /// renders as `null`; bytes render as base64 text.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Cell::Null | Cell::FailedJoin => serde_json::Value::Null,
            Cell::Bool(b) => serde_json::Value::Bool(*b),
            Cell::Int(i) => serde_json::Value::from(*i),
            Cell::Float(f) => serde_json::Value::from(*f),
            Cell::String(s) => serde_json::Value::String(s.clone()),
            Cell::Bytes(bs) => serde_json::Value::String(BASE64_ENGINE.encode(bs)),
            Cell::List(items) => {
                serde_json::Value::Array(items.iter().map(Cell::to_json).collect())
            }
            Cell::Json(v) => v.clone(),
        }
    }

    /// Value ordering for order-by evaluation. Absent cells and mismatched
    /// variants are incomparable; integers and floats compare numerically.
    pub fn partial_cmp(&self, other: &Cell) -> Option<Ordering> {
        match (self, other) {
            (Cell::Bool(a), Cell::Bool(b)) => Some(a.cmp(b)),
            (Cell::Int(a), Cell::Int(b)) => Some(a.cmp(b)),
            (Cell::Float(a), Cell::Float(b)) => a.partial_cmp(b),
            (Cell::Int(a), Cell::Float(b)) => (*a as f64).partial_cmp(b),
            (Cell::Float(a), Cell::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Cell::String(a), Cell::String(b)) => Some(a.cmp(b)),
            (Cell::Bytes(a), Cell::Bytes(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Null => write!(f, "null"),
            Cell::Bool(b) => write!(f, "{b}"),
            Cell::Int(i) => write!(f, "{i}"),
            Cell::Float(x) => write!(f, "{x}"),
            Cell::String(s) => write!(f, "{s}"),
            Cell::Bytes(bs) => write!(f, "{}", BASE64_ENGINE.encode(bs)),
            Cell::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Cell::Json(v) => write!(f, "{v}"),
            Cell::FailedJoin => write!(f, "<failed join>"),
        }
    }
}

impl From<bool> for Cell {
    fn from(v: bool) -> Cell {
        Cell::Bool(v)
    }
}

impl From<i64> for Cell {
    fn from(v: i64) -> Cell {
        Cell::Int(v)
    }
}

impl From<f64> for Cell {
    fn from(v: f64) -> Cell {
        Cell::Float(v)
    }
}

impl From<&str> for Cell {
    fn from(v: &str) -> Cell {
        Cell::String(v.to_string())
    }
}

impl From<String> for Cell {
    fn from(v: String) -> Cell {
        Cell::String(v)
    }
}

/// Single fetched row in planner column order.
pub type Row = Vec<Cell>;

/// Fetched result table.
pub type Table = Vec<Row>;
