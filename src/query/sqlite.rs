//! SQLite-backed driver, available behind the `sqlite` feature.
//!
//! Intended for embedded use and tests; the core stays driver-agnostic and
//! only this module links against `rusqlite`.

use std::sync::Mutex;

use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::error::{Result, TrellisError};
use crate::query::driver::SqlDriver;
use crate::query::fragment::{Bind, Fragment};
use crate::query::mapping::Codec;
use crate::query::planner::ColumnMeta;
use crate::query::value::{Cell, Table};

/// Driver executing mapped statements against a SQLite database.
pub struct SqliteDriver {
    conn: Mutex<Connection>,
}

impl SqliteDriver {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| TrellisError::driver(format!("open {path}: {e}")))?;
        Ok(SqliteDriver {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| TrellisError::driver(format!("open in-memory: {e}")))?;
        Ok(SqliteDriver {
            conn: Mutex::new(conn),
        })
    }

    /// Runs arbitrary setup statements (schema creation, fixture data).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql)
            .map_err(|e| TrellisError::driver(format!("batch: {e}")))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| TrellisError::driver("connection lock poisoned"))
    }
}

fn bind_param(bind: &Bind) -> rusqlite::types::Value {
    use rusqlite::types::Value;
    match &bind.value {
        Cell::Null | Cell::FailedJoin => Value::Null,
        Cell::Bool(b) => Value::Integer(i64::from(*b)),
        Cell::Int(i) => Value::Integer(*i),
        Cell::Float(f) => Value::Real(*f),
        Cell::String(s) => Value::Text(s.clone()),
        Cell::Bytes(bs) => Value::Blob(bs.clone()),
        Cell::List(items) => {
            let json = serde_json::Value::Array(items.iter().map(Cell::to_json).collect());
            Value::Text(json.to_string())
        }
        Cell::Json(v) => Value::Text(v.to_string()),
    }
}

fn decode_cell(value: ValueRef<'_>, meta: &ColumnMeta) -> Result<Cell> {
    match value {
        ValueRef::Null => {
            if meta.outer_join {
                Ok(Cell::FailedJoin)
            } else if meta.nullable {
                Ok(Cell::Null)
            } else {
                Err(TrellisError::driver(
                    "unexpected NULL in non-nullable column",
                ))
            }
        }
        other => decode_present(other, &meta.codec),
    }
}

fn decode_present(value: ValueRef<'_>, codec: &Codec) -> Result<Cell> {
    match codec {
        Codec::Bool => match value {
            ValueRef::Integer(i) => Ok(Cell::Bool(i != 0)),
            other => Err(type_mismatch("boolean", other)),
        },
        Codec::Int => match value {
            ValueRef::Integer(i) => Ok(Cell::Int(i)),
            other => Err(type_mismatch("integer", other)),
        },
        Codec::Float => match value {
            ValueRef::Real(f) => Ok(Cell::Float(f)),
            ValueRef::Integer(i) => Ok(Cell::Float(i as f64)),
            other => Err(type_mismatch("real", other)),
        },
        Codec::Str | Codec::Uuid | Codec::Date | Codec::Time | Codec::DateTime => match value {
            ValueRef::Text(bytes) => Ok(Cell::String(text(bytes)?)),
            other => Err(type_mismatch("text", other)),
        },
        Codec::Bytes => match value {
            ValueRef::Blob(bytes) => Ok(Cell::Bytes(bytes.to_vec())),
            other => Err(type_mismatch("blob", other)),
        },
        Codec::Json => match value {
            ValueRef::Text(bytes) => {
                let parsed = serde_json::from_str(&text(bytes)?)
                    .map_err(|e| TrellisError::driver(format!("malformed JSON cell: {e}")))?;
                Ok(Cell::Json(parsed))
            }
            other => Err(type_mismatch("json text", other)),
        },
        Codec::Array(inner) => match value {
            ValueRef::Text(bytes) => {
                let parsed: serde_json::Value = serde_json::from_str(&text(bytes)?)
                    .map_err(|e| TrellisError::driver(format!("malformed array cell: {e}")))?;
                let serde_json::Value::Array(items) = parsed else {
                    return Err(TrellisError::driver("array cell is not a JSON array"));
                };
                let cells = items
                    .into_iter()
                    .map(|item| json_to_cell(item, inner))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Cell::List(cells))
            }
            other => Err(type_mismatch("array text", other)),
        },
    }
}

fn json_to_cell(value: serde_json::Value, codec: &Codec) -> Result<Cell> {
    match (codec, value) {
        (Codec::Bool, serde_json::Value::Bool(b)) => Ok(Cell::Bool(b)),
        (Codec::Int, serde_json::Value::Number(n)) => n
            .as_i64()
            .map(Cell::Int)
            .ok_or_else(|| TrellisError::driver("non-integer array element")),
        (Codec::Float, serde_json::Value::Number(n)) => n
            .as_f64()
            .map(Cell::Float)
            .ok_or_else(|| TrellisError::driver("non-numeric array element")),
        (
            Codec::Str | Codec::Uuid | Codec::Date | Codec::Time | Codec::DateTime,
            serde_json::Value::String(s),
        ) => Ok(Cell::String(s)),
        (_, serde_json::Value::Null) => Ok(Cell::Null),
        (codec, other) => Err(TrellisError::driver(format!(
            "array element {other} does not decode as {codec:?}"
        ))),
    }
}

fn text(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| TrellisError::driver(format!("non-UTF-8 text cell: {e}")))
}

fn type_mismatch(expected: &str, got: ValueRef<'_>) -> TrellisError {
    TrellisError::driver(format!(
        "expected {expected} cell, got {:?}",
        got.data_type()
    ))
}

impl SqlDriver for SqliteDriver {
    fn fetch(&self, fragment: &Fragment, metas: &[ColumnMeta]) -> Result<Table> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(fragment.sql())
            .map_err(|e| TrellisError::driver(format!("prepare: {e}")))?;
        let params: Vec<rusqlite::types::Value> =
            fragment.binds().iter().map(bind_param).collect();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params))
            .map_err(|e| TrellisError::driver(format!("query: {e}")))?;
        let mut table = Table::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| TrellisError::driver(format!("row: {e}")))?
        {
            let mut decoded = Vec::with_capacity(metas.len());
            for (i, meta) in metas.iter().enumerate() {
                let value = row
                    .get_ref(i)
                    .map_err(|e| TrellisError::driver(format!("column {i}: {e}")))?;
                decoded.push(decode_cell(value, meta)?);
            }
            table.push(decoded);
        }
        Ok(table)
    }
}
