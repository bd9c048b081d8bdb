#![forbid(unsafe_code)]

//! Query compilation and SQL projection planning.
//!
//! This module contains the whole pipeline from a validated GraphQL query
//! to a JSON result: the query algebra, the staging elaborator, the SQL
//! projection planner, the row-table cursor, and the interpreter shell that
//! drives fetches and coalesces sibling lookups.

/// The query operator algebra and its structural helpers.
pub mod algebra;

/// Row-table cursors walking fetched tables as GraphQL values.
pub mod cursor;

/// The SQL driver boundary trait.
pub mod driver;

/// Parameterised SQL text accumulation.
pub mod fragment;

/// The interpreter shell: fetch driving, staging completion, coalescing.
pub mod interpreter;

/// Declarative object-to-relational mapping metadata.
pub mod mapping;

/// Stage monitoring hooks.
pub mod monitor;

/// The SQL projection planner.
pub mod planner;

/// Predicate algebra over paths and constants.
pub mod predicate;

/// The staging elaborator inserting deferred sub-query boundaries.
pub mod stage;

/// Canonical cell representation for fetched rows.
pub mod value;

/// SQLite driver (feature `sqlite`).
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use algebra::{merge_queries, Query};
pub use cursor::{Cursor, SqlCursor};
pub use driver::SqlDriver;
pub use fragment::Fragment;
pub use interpreter::{InterpreterConfig, QueryInterpreter};
pub use mapping::{Codec, ColumnRef, FieldMapping, Join, Mapping, ObjectMapping};
pub use monitor::{Monitor, NoopMonitor, RecordingMonitor};
pub use planner::{ColumnMeta, MappedQuery};
pub use predicate::{Predicate, Term};
pub use stage::elaborate;
pub use value::{Cell, Row, Table};
