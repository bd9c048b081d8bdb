//! Cursors interpreting a fetched row table as a GraphQL value tree.
//!
//! A cursor carries its absolute path, its GraphQL type, a focus (a row
//! table for objects and lists, a single cell for leaves), and the mapped
//! query that produced the table. Cursors are immutable; narrowing, field
//! selection, and list expansion all return fresh cursors.

use std::sync::Arc;

use crate::error::{Result, TrellisError};
use crate::query::algebra::Env;
use crate::query::mapping::{ColumnRef, FieldMapping};
use crate::query::planner::MappedQuery;
use crate::query::value::{Cell, Table};
use crate::schema::Type;

/// Walker over one position of a query result.
#[derive(Clone, Debug)]
pub enum Cursor {
    Sql(SqlCursor),
    Leaf(LeafCursor),
}

/// Cursor whose focus is a row table.
#[derive(Clone, Debug)]
pub struct SqlCursor {
    path: Vec<String>,
    tpe: Type,
    table: Table,
    mapped: Arc<MappedQuery>,
    env: Env,
}

/// Cursor whose focus is a single scalar cell.
#[derive(Clone, Debug)]
pub struct LeafCursor {
    path: Vec<String>,
    tpe: Type,
    focus: Cell,
    env: Env,
}

impl Cursor {
    pub fn path(&self) -> &[String] {
        match self {
            Cursor::Sql(c) => &c.path,
            Cursor::Leaf(c) => &c.path,
        }
    }

    pub fn tpe(&self) -> &Type {
        match self {
            Cursor::Sql(c) => &c.tpe,
            Cursor::Leaf(c) => &c.tpe,
        }
    }

    /// Environment value visible at this position, if any.
    pub fn env(&self, name: &str) -> Option<&Cell> {
        match self {
            Cursor::Sql(c) => c.env.get(name),
            Cursor::Leaf(c) => c.env.get(name),
        }
    }

    /// Extends the environment for the subtree below this cursor.
    pub fn with_env(self, env: &Env) -> Cursor {
        match self {
            Cursor::Sql(mut c) => {
                c.env.extend(env.clone());
                Cursor::Sql(c)
            }
            Cursor::Leaf(mut c) => {
                c.env.extend(env.clone());
                Cursor::Leaf(c)
            }
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Cursor::Leaf(_))
    }

    /// The scalar cell at a leaf position.
    ///
    /// A failed-join cell under a non-nullable type is a planning bug and
    /// aborts.
    pub fn as_leaf(&self) -> Result<&Cell> {
        match self {
            Cursor::Leaf(c) => {
                if matches!(c.focus, Cell::FailedJoin) && !c.tpe.is_nullable() {
                    return Err(TrellisError::internal(format!(
                        "failed join under non-nullable leaf at /{}",
                        c.path.join("/")
                    )));
                }
                Ok(&c.focus)
            }
            Cursor::Sql(c) => Err(TrellisError::type_error(
                &c.path,
                "non-leaf treated as leaf",
            )),
        }
    }

    pub fn is_list(&self) -> bool {
        self.tpe().is_list()
    }

    /// Expands a list position into its element cursors.
    pub fn as_list(&self) -> Result<Vec<Cursor>> {
        match self {
            Cursor::Sql(c) => {
                let item = c.tpe.item().cloned().ok_or_else(|| {
                    TrellisError::type_error(&c.path, "non-list treated as list")
                })?;
                Ok(c.groups(&item)?.into_iter().map(Cursor::Sql).collect())
            }
            Cursor::Leaf(c) => {
                let item = c.tpe.item().cloned().ok_or_else(|| {
                    TrellisError::type_error(&c.path, "non-list treated as list")
                })?;
                match &c.focus {
                    Cell::List(items) => Ok(items
                        .iter()
                        .map(|cell| {
                            Cursor::Leaf(LeafCursor {
                                path: c.path.clone(),
                                tpe: item.clone(),
                                focus: cell.clone(),
                                env: c.env.clone(),
                            })
                        })
                        .collect()),
                    Cell::Null | Cell::FailedJoin => Ok(Vec::new()),
                    other => Err(TrellisError::type_error(
                        &c.path,
                        format!("cell {other:?} is not a list"),
                    )),
                }
            }
        }
    }

    pub fn is_nullable(&self) -> bool {
        self.tpe().is_nullable()
    }

    /// `None` when the focus is absent: an empty or fully unmatched table,
    /// or an absent scalar cell.
    pub fn as_nullable(&self) -> Result<Option<Cursor>> {
        match self {
            Cursor::Leaf(c) => {
                if c.focus.is_absent() {
                    Ok(None)
                } else {
                    Ok(Some(self.clone()))
                }
            }
            Cursor::Sql(c) => {
                if c.table.is_empty() {
                    return Ok(None);
                }
                let keys = c
                    .mapped
                    .mapping()
                    .key_columns(&c.path, c.tpe.underlying());
                if !keys.is_empty() {
                    let row = c.head_row()?;
                    let all_failed = keys.iter().all(|k| {
                        c.mapped
                            .index_of(k)
                            .map(|i| matches!(row[i], Cell::FailedJoin))
                            .unwrap_or(false)
                    });
                    if all_failed {
                        return Ok(None);
                    }
                }
                Ok(Some(self.clone()))
            }
        }
    }

    /// Whether the focused rows represent the given subtype.
    pub fn narrows_to(&self, subtype: &str) -> Result<bool> {
        let Cursor::Sql(c) = self else {
            return Err(TrellisError::type_error(
                self.path(),
                "cannot narrow a leaf",
            ));
        };
        let mapping = c.mapped.mapping();
        if !mapping.schema().is_subtype(subtype, c.tpe.underlying()) {
            return Err(TrellisError::type_error(
                &c.path,
                format!("{} is not a subtype of {}", subtype, c.tpe.underlying()),
            ));
        }
        if let Some(om) = mapping.object_mapping(&c.path, c.tpe.underlying()) {
            if let Some(discriminate) = &om.discriminate {
                return Ok((discriminate.0)(c)? == subtype);
            }
        }
        let keys = mapping.key_columns(&c.path, subtype);
        if keys.is_empty() {
            return Err(TrellisError::type_error(
                &c.path,
                format!("type {subtype} is not represented by the mapping"),
            ));
        }
        let row = c.head_row()?;
        Ok(keys.iter().all(|k| {
            c.mapped
                .index_of(k)
                .map(|i| !matches!(row[i], Cell::FailedJoin))
                .unwrap_or(false)
        }))
    }

    /// Retypes the cursor at a subtype.
    pub fn narrow(&self, subtype: &str) -> Result<Cursor> {
        match self {
            Cursor::Sql(c) => {
                if !c
                    .mapped
                    .mapping()
                    .schema()
                    .is_subtype(subtype, c.tpe.underlying())
                {
                    return Err(TrellisError::type_error(
                        &c.path,
                        format!("{} is not a subtype of {}", subtype, c.tpe.underlying()),
                    ));
                }
                let mut narrowed = c.clone();
                narrowed.tpe = Type::Named(subtype.to_string());
                Ok(Cursor::Sql(narrowed))
            }
            Cursor::Leaf(c) => Err(TrellisError::type_error(&c.path, "cannot narrow a leaf")),
        }
    }

    /// Selects a field, producing a leaf cursor for unstructured targets and
    /// a table cursor otherwise.
    pub fn field(&self, name: &str) -> Result<Cursor> {
        match self {
            Cursor::Sql(c) => c.field(name),
            Cursor::Leaf(c) => Err(TrellisError::type_error(
                &c.path,
                format!("cannot select field {name} on a leaf"),
            )),
        }
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        match self {
            Cursor::Sql(c) => c
                .mapped
                .mapping()
                .field_mapping(&c.path, c.tpe.underlying(), name)
                .map(FieldMapping::is_hidden)
                .unwrap_or(false),
            Cursor::Leaf(_) => false,
        }
    }

    /// Reads a hidden attribute value.
    pub fn attribute(&self, name: &str) -> Result<Cell> {
        let Cursor::Sql(c) = self else {
            return Err(TrellisError::type_error(
                self.path(),
                format!("no attribute {name} on a leaf"),
            ));
        };
        let fm = c
            .mapped
            .mapping()
            .field_mapping(&c.path, c.tpe.underlying(), name)
            .ok_or_else(|| {
                TrellisError::mapping(format!(
                    "no attribute mapping for {}.{}",
                    c.tpe.underlying(),
                    name
                ))
            })?
            .clone();
        match fm {
            FieldMapping::HiddenColumn { column, .. } => c.cell(&column),
            FieldMapping::ComputedAttribute { compute, .. }
            | FieldMapping::ComputedField { compute, .. } => (compute.0)(c),
            _ => Err(TrellisError::type_error(
                &c.path,
                format!("{name} is not an attribute"),
            )),
        }
    }
}

impl SqlCursor {
    /// Root cursor over a freshly fetched table.
    pub fn root(path: &[String], tpe: &Type, table: Table, mapped: Arc<MappedQuery>) -> Self {
        SqlCursor {
            path: path.to_vec(),
            tpe: tpe.clone(),
            table,
            mapped,
            env: Env::new(),
        }
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub fn tpe(&self) -> &Type {
        &self.tpe
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn mapped(&self) -> &Arc<MappedQuery> {
        &self.mapped
    }

    pub fn env(&self, name: &str) -> Option<&Cell> {
        self.env.get(name)
    }

    /// Reads the cell for `column` from the head row.
    pub fn cell(&self, column: &ColumnRef) -> Result<Cell> {
        let idx = self.mapped.index_of(column).ok_or_else(|| {
            TrellisError::internal(format!("column {column} missing from projection"))
        })?;
        Ok(self.head_row()?[idx].clone())
    }

    fn head_row(&self) -> Result<&Vec<Cell>> {
        self.table.first().ok_or_else(|| {
            TrellisError::type_error(&self.path, "empty focus")
        })
    }

    fn groups(&self, item: &Type) -> Result<Vec<SqlCursor>> {
        let groups = self.mapped.group(&self.table, &self.path, item)?;
        if groups.is_empty() {
            debug_assert!(self.table.len() <= 1, "unmatched list focus wider than one row");
        }
        Ok(groups
            .into_iter()
            .map(|rows| SqlCursor {
                path: self.path.clone(),
                tpe: item.clone(),
                table: rows,
                mapped: Arc::clone(&self.mapped),
                env: self.env.clone(),
            })
            .collect())
    }

    /// Expands this cursor into per-object groups of `item` type even when
    /// the declared type is not a list; used for scatter partitioning.
    pub fn group_as(&self, item: &Type) -> Result<Vec<SqlCursor>> {
        self.groups(item)
    }

    fn field(&self, name: &str) -> Result<Cursor> {
        let mapping = self.mapped.mapping();
        let fm = mapping
            .field_mapping(&self.path, self.tpe.underlying(), name)
            .ok_or_else(|| {
                TrellisError::mapping(format!(
                    "no field mapping for {}.{} at /{}",
                    self.tpe.underlying(),
                    name,
                    self.path.join("/")
                ))
            })?
            .clone();
        let child_tpe = mapping.schema().field_type(&self.tpe, name).ok_or_else(|| {
            TrellisError::mapping(format!(
                "no schema field {}.{}",
                self.tpe.underlying(),
                name
            ))
        })?;
        let mut child_path = self.path.clone();
        child_path.push(name.to_string());
        match fm {
            FieldMapping::ComputedField { compute, .. } => {
                let cell = (compute.0)(self)?;
                Ok(Cursor::Leaf(LeafCursor {
                    path: child_path,
                    tpe: child_tpe,
                    focus: cell,
                    env: self.env.clone(),
                }))
            }
            FieldMapping::JsonColumn { column, .. } => {
                let cell = self.cell(&column)?;
                Ok(Cursor::Leaf(LeafCursor {
                    path: child_path,
                    tpe: child_tpe,
                    focus: cell,
                    env: self.env.clone(),
                }))
            }
            FieldMapping::ColumnField { column, .. }
            | FieldMapping::HiddenColumn { column, .. } => {
                let cell = self.cell(&column)?;
                Ok(Cursor::Leaf(LeafCursor {
                    path: child_path,
                    tpe: child_tpe,
                    focus: cell,
                    env: self.env.clone(),
                }))
            }
            FieldMapping::JoinedObject { .. } => Ok(Cursor::Sql(SqlCursor {
                path: child_path,
                tpe: child_tpe,
                table: self.table.clone(),
                mapped: Arc::clone(&self.mapped),
                env: self.env.clone(),
            })),
            FieldMapping::ComputedAttribute { .. } => Err(TrellisError::type_error(
                &self.path,
                format!("{name} is an attribute, not a field"),
            )),
        }
    }
}

impl LeafCursor {
    pub fn focus(&self) -> &Cell {
        &self.focus
    }
}
