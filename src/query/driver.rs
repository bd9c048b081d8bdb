//! The SQL driver boundary.
//!
//! The core never talks to a database directly; it hands a compiled
//! [`Fragment`] plus per-column metadata to a driver and receives a row
//! table back.

use crate::error::Result;
use crate::query::fragment::Fragment;
use crate::query::planner::ColumnMeta;
use crate::query::value::Table;

/// Executes one parameterised statement and decodes its result table.
///
/// Implementations must supply cells in column order, decoding each with the
/// codec from its [`ColumnMeta`]. A SQL NULL in a column marked
/// `outer_join` decodes to [`Cell::FailedJoin`]; a NULL in a column merely
/// marked `nullable` decodes to [`Cell::Null`]; a NULL anywhere else is a
/// driver error.
///
/// [`Cell::FailedJoin`]: crate::query::value::Cell::FailedJoin
/// [`Cell::Null`]: crate::query::value::Cell::Null
pub trait SqlDriver: Send + Sync {
    fn fetch(&self, fragment: &Fragment, metas: &[ColumnMeta]) -> Result<Table>;
}
