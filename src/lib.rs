#![forbid(unsafe_code)]

//! Declarative GraphQL-to-relational query mapping and execution.
//!
//! Given a validated GraphQL query and a [`Mapping`] describing how types
//! and fields land on tables, columns, and joins, trellis compiles a single
//! parameterised SQL statement projecting the minimum column set, interprets
//! the fetched row table through cursors, and assembles the JSON response,
//! deferring only the sub-selections a single statement cannot answer.

pub mod error;
pub mod query;
pub mod schema;

pub use crate::error::{Result, TrellisError};
pub use crate::query::{
    Cell, Codec, ColumnRef, Cursor, Fragment, InterpreterConfig, Join, MappedQuery, Mapping,
    ObjectMapping, Predicate, Query, QueryInterpreter, SqlDriver, Term,
};
pub use crate::schema::{Schema, Type};
