//! Declarative object-to-relational mapping metadata.
//!
//! A [`Mapping`] describes which GraphQL type and field maps to which table,
//! column, join, or computed value. The planner, elaborator, and cursor all
//! resolve through the lookup API here; resolution is deterministic with
//! path-scoped mappings taking precedence over unscoped ones.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::query::cursor::SqlCursor;
use crate::query::predicate::Predicate;
use crate::query::value::Cell;
use crate::schema::Schema;

/// Wire codec for one column: how literals bind and how cells decode.
///
/// Codecs are plain data with value equality; a given `(table, column)` pair
/// always carries the same codec within one mapping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Codec {
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    Uuid,
    Date,
    Time,
    DateTime,
    Json,
    Array(Box<Codec>),
}

impl Codec {
    /// Fallback encoder for an untyped literal, derived from its cell shape.
    pub fn for_cell(cell: &Cell) -> Option<Codec> {
        match cell {
            Cell::Bool(_) => Some(Codec::Bool),
            Cell::Int(_) => Some(Codec::Int),
            Cell::Float(_) => Some(Codec::Float),
            Cell::String(_) => Some(Codec::Str),
            Cell::Bytes(_) => Some(Codec::Bytes),
            Cell::Json(_) => Some(Codec::Json),
            _ => None,
        }
    }

    /// The element codec of an array codec, or the codec itself.
    pub fn element(&self) -> &Codec {
        match self {
            Codec::Array(inner) => inner,
            other => other,
        }
    }
}

/// A single table column together with its codec.
///
/// Equality and hashing cover `(table, column)` only; the codec is metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
    pub codec: Codec,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>, codec: Codec) -> Self {
        ColumnRef {
            table: table.into(),
            column: column.into(),
            codec,
        }
    }

    /// `table.column` as rendered into SQL text.
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.table, self.column)
    }
}

impl PartialEq for ColumnRef {
    fn eq(&self, other: &Self) -> bool {
        self.table == other.table && self.column == other.column
    }
}

impl Eq for ColumnRef {}

impl Hash for ColumnRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table.hash(state);
        self.column.hash(state);
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

/// An equi-join between a parent column and a child column.
///
/// Rendering is always `LEFT JOIN child.table ON parent = child`; the normal
/// form orders the endpoints lexicographically so the same edge written in
/// either direction deduplicates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub parent: ColumnRef,
    pub child: ColumnRef,
}

impl Join {
    pub fn new(parent: ColumnRef, child: ColumnRef) -> Self {
        Join { parent, child }
    }

    /// Endpoint pair ordered lexicographically by `(table, column)`.
    pub fn normal_form(&self) -> ((&str, &str), (&str, &str)) {
        let a = (self.parent.table.as_str(), self.parent.column.as_str());
        let b = (self.child.table.as_str(), self.child.column.as_str());
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

/// Closure computing a derived cell from the enclosing cursor.
#[derive(Clone)]
pub struct ComputeFn(pub Arc<dyn Fn(&SqlCursor) -> Result<Cell> + Send + Sync>);

impl ComputeFn {
    pub fn new(f: impl Fn(&SqlCursor) -> Result<Cell> + Send + Sync + 'static) -> Self {
        ComputeFn(Arc::new(f))
    }
}

impl fmt::Debug for ComputeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<compute fn>")
    }
}

impl PartialEq for ComputeFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Closure resolving the concrete subtype name for an interface mapping.
#[derive(Clone)]
pub struct Discriminate(pub Arc<dyn Fn(&SqlCursor) -> Result<String> + Send + Sync>);

impl Discriminate {
    pub fn new(f: impl Fn(&SqlCursor) -> Result<String> + Send + Sync + 'static) -> Self {
        Discriminate(Arc::new(f))
    }
}

impl fmt::Debug for Discriminate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<discriminate fn>")
    }
}

impl PartialEq for Discriminate {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// How one GraphQL field (or hidden attribute) of an object maps to SQL.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldMapping {
    /// Simple column exposed as a GraphQL field.
    ColumnField {
        name: String,
        column: ColumnRef,
        key: bool,
        discriminator: bool,
    },
    /// Nested object reached via zero or more joins.
    JoinedObject { name: String, joins: Vec<Join> },
    /// Hidden column used for joins and filters, not exposed as a field.
    HiddenColumn {
        name: String,
        column: ColumnRef,
        key: bool,
        nullable: bool,
        discriminator: bool,
    },
    /// Column holding an embedded JSON subtree.
    JsonColumn { name: String, column: ColumnRef },
    /// Field computed post-fetch from sibling columns.
    ComputedField {
        name: String,
        compute: ComputeFn,
        required: Vec<String>,
        hidden: bool,
    },
    /// Hidden attribute computed post-fetch from sibling columns.
    ComputedAttribute {
        name: String,
        compute: ComputeFn,
        required: Vec<String>,
    },
}

impl FieldMapping {
    pub fn column_field(name: impl Into<String>, column: ColumnRef) -> Self {
        FieldMapping::ColumnField {
            name: name.into(),
            column,
            key: false,
            discriminator: false,
        }
    }

    pub fn joined_object(name: impl Into<String>, joins: Vec<Join>) -> Self {
        FieldMapping::JoinedObject {
            name: name.into(),
            joins,
        }
    }

    pub fn hidden_column(name: impl Into<String>, column: ColumnRef) -> Self {
        FieldMapping::HiddenColumn {
            name: name.into(),
            column,
            key: false,
            nullable: false,
            discriminator: false,
        }
    }

    pub fn json_column(name: impl Into<String>, column: ColumnRef) -> Self {
        FieldMapping::JsonColumn {
            name: name.into(),
            column,
        }
    }

    pub fn computed_field(
        name: impl Into<String>,
        required: &[&str],
        compute: ComputeFn,
    ) -> Self {
        FieldMapping::ComputedField {
            name: name.into(),
            compute,
            required: required.iter().map(|s| s.to_string()).collect(),
            hidden: false,
        }
    }

    pub fn computed_attribute(
        name: impl Into<String>,
        required: &[&str],
        compute: ComputeFn,
    ) -> Self {
        FieldMapping::ComputedAttribute {
            name: name.into(),
            compute,
            required: required.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Marks a column or hidden column mapping as part of the key.
    pub fn key(mut self) -> Self {
        match &mut self {
            FieldMapping::ColumnField { key, .. } | FieldMapping::HiddenColumn { key, .. } => {
                *key = true
            }
            _ => {}
        }
        self
    }

    /// Marks a column or hidden column mapping as a subtype discriminator.
    pub fn discriminator(mut self) -> Self {
        match &mut self {
            FieldMapping::ColumnField { discriminator, .. }
            | FieldMapping::HiddenColumn { discriminator, .. } => *discriminator = true,
            _ => {}
        }
        self
    }

    /// Marks a hidden column as nullable, or a computed field as hidden.
    pub fn nullable(mut self) -> Self {
        if let FieldMapping::HiddenColumn { nullable, .. } = &mut self {
            *nullable = true;
        }
        self
    }

    pub fn hidden(mut self) -> Self {
        if let FieldMapping::ComputedField { hidden, .. } = &mut self {
            *hidden = true;
        }
        self
    }

    pub fn name(&self) -> &str {
        match self {
            FieldMapping::ColumnField { name, .. }
            | FieldMapping::JoinedObject { name, .. }
            | FieldMapping::HiddenColumn { name, .. }
            | FieldMapping::JsonColumn { name, .. }
            | FieldMapping::ComputedField { name, .. }
            | FieldMapping::ComputedAttribute { name, .. } => name,
        }
    }

    /// The backing column, for mappings that have exactly one.
    pub fn column(&self) -> Option<&ColumnRef> {
        match self {
            FieldMapping::ColumnField { column, .. }
            | FieldMapping::HiddenColumn { column, .. }
            | FieldMapping::JsonColumn { column, .. } => Some(column),
            _ => None,
        }
    }

    pub fn is_key(&self) -> bool {
        matches!(
            self,
            FieldMapping::ColumnField { key: true, .. }
                | FieldMapping::HiddenColumn { key: true, .. }
        )
    }

    pub fn is_discriminator(&self) -> bool {
        matches!(
            self,
            FieldMapping::ColumnField {
                discriminator: true,
                ..
            } | FieldMapping::HiddenColumn {
                discriminator: true,
                ..
            }
        )
    }

    /// Whether the mapping is invisible to GraphQL selection.
    pub fn is_hidden(&self) -> bool {
        matches!(
            self,
            FieldMapping::HiddenColumn { .. }
                | FieldMapping::ComputedAttribute { .. }
                | FieldMapping::ComputedField { hidden: true, .. }
        )
    }
}

/// Mapping of one GraphQL object or interface type onto SQL.
#[derive(Clone, Debug)]
pub struct ObjectMapping {
    /// Mapped GraphQL type name.
    pub tpe: String,
    /// Path scope; empty means the mapping applies everywhere.
    pub prefix: Vec<String>,
    pub fields: Vec<FieldMapping>,
    /// Present for interface mappings that can decide the concrete subtype
    /// at run time.
    pub discriminate: Option<Discriminate>,
}

impl ObjectMapping {
    pub fn new(tpe: impl Into<String>, fields: Vec<FieldMapping>) -> Self {
        ObjectMapping {
            tpe: tpe.into(),
            prefix: Vec::new(),
            fields,
            discriminate: None,
        }
    }

    /// Scopes the mapping to contexts whose path starts with `prefix`.
    pub fn prefixed(mut self, prefix: &[&str]) -> Self {
        self.prefix = prefix.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Attaches a run-time subtype discriminator, marking this as an
    /// interface mapping.
    pub fn discriminated_by(mut self, discriminate: Discriminate) -> Self {
        self.discriminate = Some(discriminate);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn key_fields(&self) -> impl Iterator<Item = &FieldMapping> {
        self.fields.iter().filter(|f| f.is_key())
    }

    pub fn key_columns(&self) -> Vec<ColumnRef> {
        self.fields
            .iter()
            .filter(|f| f.is_key())
            .filter_map(|f| f.column().cloned())
            .collect()
    }

    pub fn discriminator_columns(&self) -> Vec<ColumnRef> {
        self.fields
            .iter()
            .filter(|f| f.is_discriminator())
            .filter_map(|f| f.column().cloned())
            .collect()
    }
}

/// Complete mapping: schema handle, object mappings, and leaf codecs.
#[derive(Clone, Debug)]
pub struct Mapping {
    schema: Arc<Schema>,
    object_mappings: Vec<ObjectMapping>,
    leaf_codecs: HashMap<String, Codec>,
}

impl Mapping {
    pub fn new(schema: Schema) -> Self {
        Mapping {
            schema: Arc::new(schema),
            object_mappings: Vec::new(),
            leaf_codecs: HashMap::new(),
        }
    }

    pub fn with_object(mut self, mapping: ObjectMapping) -> Self {
        self.object_mappings.push(mapping);
        self
    }

    /// Registers the codec for a leaf (scalar or enum) type.
    pub fn with_leaf(mut self, tpe: impl Into<String>, codec: Codec) -> Self {
        self.leaf_codecs.insert(tpe.into(), codec);
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn leaf_codec(&self, tpe: &str) -> Option<&Codec> {
        self.leaf_codecs.get(tpe)
    }

    /// Index of the applicable object mapping for a path and type.
    ///
    /// A path-scoped mapping applies when its prefix is a prefix of `path`;
    /// the longest applicable prefix wins, ties resolve to declaration order.
    pub fn object_mapping_index(&self, path: &[String], tpe: &str) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (idx, om) in self.object_mappings.iter().enumerate() {
            if om.tpe != tpe {
                continue;
            }
            if !path_starts_with(path, &om.prefix) {
                continue;
            }
            let specificity = om.prefix.len();
            match best {
                Some((_, len)) if len >= specificity => {}
                _ => best = Some((idx, specificity)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    pub fn object_mapping(&self, path: &[String], tpe: &str) -> Option<&ObjectMapping> {
        self.object_mapping_index(path, tpe)
            .map(|idx| &self.object_mappings[idx])
    }

    pub fn object_mapping_at(&self, index: usize) -> &ObjectMapping {
        &self.object_mappings[index]
    }

    /// Resolves a field or attribute mapping, falling back to the mappings of
    /// the interfaces the type implements.
    pub fn field_mapping(&self, path: &[String], tpe: &str, name: &str) -> Option<&FieldMapping> {
        if let Some(fm) = self
            .object_mapping(path, tpe)
            .and_then(|om| om.field(name))
        {
            return Some(fm);
        }
        for iface in self.schema.interfaces_of(tpe) {
            if let Some(fm) = self
                .object_mapping(path, iface)
                .and_then(|om| om.field(name))
            {
                return Some(fm);
            }
        }
        // Narrowing from an interface: fields of implementors resolve too.
        if self.schema.is_interface(tpe) {
            for imp in self.schema.implementors(tpe) {
                if let Some(fm) = self
                    .object_mapping(path, imp)
                    .and_then(|om| om.field(name))
                {
                    return Some(fm);
                }
            }
        }
        None
    }

    pub fn key_columns(&self, path: &[String], tpe: &str) -> Vec<ColumnRef> {
        self.object_mapping(path, tpe)
            .map(|om| om.key_columns())
            .unwrap_or_default()
    }

    pub fn discriminator_columns(&self, path: &[String], tpe: &str) -> Vec<ColumnRef> {
        self.object_mapping(path, tpe)
            .map(|om| om.discriminator_columns())
            .unwrap_or_default()
    }

    /// Whether the mapping for `tpe` at `path` can discriminate subtypes,
    /// either through a run-time closure or discriminator columns.
    pub fn has_discriminator(&self, path: &[String], tpe: &str) -> bool {
        self.object_mapping(path, tpe)
            .map(|om| om.discriminate.is_some() || !om.discriminator_columns().is_empty())
            .unwrap_or(false)
    }

    /// Whether any path referenced by the predicate lands on a computed
    /// field or attribute, forcing post-SQL evaluation.
    pub fn predicate_is_post_sql(&self, pred: &Predicate, path: &[String], tpe: &str) -> bool {
        if pred.contains_matches() {
            return true;
        }
        pred.paths()
            .iter()
            .any(|hops| self.path_is_computed(hops, path, tpe))
    }

    fn path_is_computed(&self, hops: &[String], path: &[String], tpe: &str) -> bool {
        let mut cur_path = path.to_vec();
        let mut cur_tpe = tpe.to_string();
        for hop in hops {
            match self.field_mapping(&cur_path, &cur_tpe, hop) {
                Some(FieldMapping::ComputedField { .. })
                | Some(FieldMapping::ComputedAttribute { .. }) => return true,
                Some(FieldMapping::JoinedObject { .. }) => {
                    let Some(next) = self
                        .schema
                        .field_type(&crate::schema::Type::Named(cur_tpe.clone()), hop)
                    else {
                        return false;
                    };
                    cur_tpe = next.underlying().to_string();
                    cur_path.push(hop.clone());
                }
                _ => return false,
            }
        }
        false
    }
}

fn path_starts_with(path: &[String], prefix: &[String]) -> bool {
    prefix.len() <= path.len() && path[..prefix.len()] == prefix[..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{field, Type};

    fn col(table: &str, column: &str) -> ColumnRef {
        ColumnRef::new(table, column, Codec::Str)
    }

    fn schema() -> Schema {
        Schema::new("Query")
            .with_object(
                "Query",
                &[],
                vec![field("widget", Type::named("Widget"))],
            )
            .with_object("Widget", &[], vec![field("name", Type::named("String"))])
    }

    #[test]
    fn column_equality_ignores_codec() {
        let a = ColumnRef::new("t", "c", Codec::Str);
        let b = ColumnRef::new("t", "c", Codec::Int);
        assert_eq!(a, b);
    }

    #[test]
    fn join_normal_form_is_direction_independent() {
        let ab = Join::new(col("a", "x"), col("b", "y"));
        let ba = Join::new(col("b", "y"), col("a", "x"));
        assert_eq!(ab.normal_form(), ba.normal_form());
    }

    #[test]
    fn longest_prefix_wins() {
        let mapping = Mapping::new(schema())
            .with_object(ObjectMapping::new(
                "Widget",
                vec![FieldMapping::column_field("name", col("widgets", "name"))],
            ))
            .with_object(
                ObjectMapping::new(
                    "Widget",
                    vec![FieldMapping::column_field(
                        "name",
                        col("special_widgets", "name"),
                    )],
                )
                .prefixed(&["widget"]),
            );

        let path = vec!["widget".to_string()];
        let fm = mapping.field_mapping(&path, "Widget", "name").unwrap();
        assert_eq!(fm.column().unwrap().table, "special_widgets");

        let other_path = vec!["other".to_string()];
        let fm = mapping.field_mapping(&other_path, "Widget", "name").unwrap();
        assert_eq!(fm.column().unwrap().table, "widgets");
    }

    #[test]
    fn ties_resolve_to_declaration_order() {
        let mapping = Mapping::new(schema())
            .with_object(ObjectMapping::new(
                "Widget",
                vec![FieldMapping::column_field("name", col("first", "name"))],
            ))
            .with_object(ObjectMapping::new(
                "Widget",
                vec![FieldMapping::column_field("name", col("second", "name"))],
            ));
        let fm = mapping.field_mapping(&[], "Widget", "name").unwrap();
        assert_eq!(fm.column().unwrap().table, "first");
    }

    #[test]
    fn builder_flags_compose() {
        let fm = FieldMapping::column_field("id", col("t", "id"))
            .key()
            .discriminator();
        assert!(fm.is_key());
        assert!(fm.is_discriminator());
        assert!(!fm.is_hidden());

        let hidden = FieldMapping::hidden_column("tag", col("t", "tag")).nullable();
        assert!(hidden.is_hidden());
        assert!(matches!(
            hidden,
            FieldMapping::HiddenColumn { nullable: true, .. }
        ));
    }
}
