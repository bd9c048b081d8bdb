//! The SQL projection planner.
//!
//! [`MappedQuery::build`] walks an elaborated query against the mapping
//! metadata and computes everything needed to emit one SQL statement and
//! interpret its result: the projected column set in discovery order, the
//! required joins in topological order, the predicates to compile into the
//! WHERE clause, and per-column codec and nullability metadata.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, TrellisError};
use crate::query::algebra::{self, mk_selects, Query, STAGED_FIELD};
use crate::query::driver::SqlDriver;
use crate::query::fragment::Fragment;
use crate::query::mapping::{Codec, ColumnRef, FieldMapping, Join, Mapping};
use crate::query::predicate::{Predicate, Term};
use crate::query::value::{Cell, Table};
use crate::schema::Type;

/// Decode metadata for one projected column.
#[derive(Clone, Debug, PartialEq)]
pub struct ColumnMeta {
    /// Whether the column's table was introduced on the child side of a join.
    pub outer_join: bool,
    pub codec: Codec,
    /// Whether a matched row may carry SQL NULL in this column.
    pub nullable: bool,
}

/// The planner's output: one SQL statement plus the metadata needed to
/// decode and regroup its result table.
#[derive(Clone, Debug)]
pub struct MappedQuery {
    mapping: Arc<Mapping>,
    table: String,
    columns: Vec<ColumnRef>,
    metas: Vec<ColumnMeta>,
    predicates: Vec<(Vec<String>, Type, Predicate)>,
    joins: Vec<Join>,
}

impl MappedQuery {
    /// Plans `q` rooted at `path`/`tpe` against the mapping.
    pub fn build(q: &Query, path: &[String], tpe: &Type, mapping: &Arc<Mapping>) -> Result<Self> {
        let mut acc = Accumulator {
            mapping,
            columns: Vec::new(),
            joins: Vec::new(),
            predicates: Vec::new(),
            touched: Vec::new(),
        };
        acc.visit(q, path, tpe)?;
        if acc.columns.is_empty() {
            return Err(TrellisError::mapping(format!(
                "query at /{} projects no columns",
                path.join("/")
            )));
        }
        let table = acc.root_table()?;
        let joins = acc.ordered_joins(&table)?;
        let metas = acc
            .columns
            .iter()
            .map(|col| acc.meta(col, &joins))
            .collect();
        debug!(
            table = table.as_str(),
            columns = acc.columns.len(),
            joins = joins.len(),
            predicates = acc.predicates.len(),
            "mapped query planned"
        );
        Ok(MappedQuery {
            mapping: Arc::clone(mapping),
            table,
            columns: acc.columns,
            metas,
            predicates: acc.predicates,
            joins,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[ColumnRef] {
        &self.columns
    }

    pub fn metas(&self) -> &[ColumnMeta] {
        &self.metas
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn predicates(&self) -> &[(Vec<String>, Type, Predicate)] {
        &self.predicates
    }

    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    /// Position of a column in the projection.
    pub fn index_of(&self, col: &ColumnRef) -> Option<usize> {
        self.columns.iter().position(|c| c == col)
    }

    /// The final SQL statement with its bind list.
    pub fn fragment(&self) -> Result<Fragment> {
        let projected = self
            .columns
            .iter()
            .map(ColumnRef::qualified)
            .collect::<Vec<_>>()
            .join(", ");
        let mut f = Fragment::lit(format!("SELECT {} FROM {}", projected, self.table));
        for join in &self.joins {
            f = f.append(Fragment::lit(format!(
                " LEFT JOIN {} ON {} = {}",
                join.child.table,
                join.parent.qualified(),
                join.child.qualified()
            )));
        }
        let mut conjuncts = Vec::new();
        for (path, tpe, pred) in &self.predicates {
            if self
                .mapping
                .predicate_is_post_sql(pred, path, tpe.underlying())
            {
                continue;
            }
            conjuncts.push(self.compile_predicate(pred, path, tpe)?);
        }
        let where_clause = Fragment::where_and_opt(conjuncts);
        if !where_clause.is_empty() {
            f = f.append(Fragment::lit(" ")).append(where_clause);
        }
        Ok(f)
    }

    /// Compiles the statement and hands it to the driver.
    pub fn fetch(&self, driver: &dyn SqlDriver) -> Result<Table> {
        let fragment = self.fragment()?;
        debug!(sql = fragment.sql(), binds = fragment.binds().len(), "fetching");
        driver.fetch(&fragment, &self.metas)
    }

    /// Partitions a table into per-object row groups keyed on the key
    /// columns of `item_tpe` at `path`.
    ///
    /// Rows whose key projection contains any failed-join cell are stripped;
    /// the returned groups are ordered by the stringified key projection.
    pub fn group(&self, table: &Table, path: &[String], item_tpe: &Type) -> Result<Vec<Table>> {
        let keys = self.mapping.key_columns(path, item_tpe.underlying());
        if keys.is_empty() {
            return Err(TrellisError::mapping(format!(
                "no key columns for {} at /{}",
                item_tpe.underlying(),
                path.join("/")
            )));
        }
        let idxs = keys
            .iter()
            .map(|k| {
                self.index_of(k).ok_or_else(|| {
                    TrellisError::internal(format!("key column {k} missing from projection"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut groups: BTreeMap<String, Table> = BTreeMap::new();
        for row in table {
            if row.len() != self.columns.len() {
                return Err(TrellisError::internal(format!(
                    "row width {} does not match projection width {}",
                    row.len(),
                    self.columns.len()
                )));
            }
            let projection: Vec<&Cell> = idxs.iter().map(|i| &row[*i]).collect();
            if projection.iter().any(|c| matches!(c, Cell::FailedJoin)) {
                continue;
            }
            let key = projection
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join("\u{1f}");
            groups.entry(key).or_default().push(row.clone());
        }
        Ok(groups.into_values().collect())
    }

    fn compile_predicate(
        &self,
        pred: &Predicate,
        path: &[String],
        tpe: &Type,
    ) -> Result<Fragment> {
        match pred {
            Predicate::And(a, b) => Ok(Fragment::and_opt(vec![
                self.compile_predicate(a, path, tpe)?,
                self.compile_predicate(b, path, tpe)?,
            ])),
            Predicate::Or(a, b) => Ok(Fragment::or_opt(vec![
                self.compile_predicate(a, path, tpe)?,
                self.compile_predicate(b, path, tpe)?,
            ])),
            Predicate::Not(p) => Ok(Fragment::lit("NOT (")
                .append(self.compile_predicate(p, path, tpe)?)
                .append(Fragment::lit(")"))),
            Predicate::Eql(a, b) => self.binary(a, "=", b, path, tpe),
            Predicate::NEql(a, b) => self.binary(a, "!=", b, path, tpe),
            Predicate::Lt(a, b) => self.binary(a, "<", b, path, tpe),
            Predicate::LtEql(a, b) => self.binary(a, "<=", b, path, tpe),
            Predicate::Gt(a, b) => self.binary(a, ">", b, path, tpe),
            Predicate::GtEql(a, b) => self.binary(a, ">=", b, path, tpe),
            Predicate::In(term, values) => {
                let codec = self
                    .term_codec(term, path, tpe)
                    .or_else(|| values.first().and_then(Codec::for_cell))
                    .ok_or_else(|| {
                        TrellisError::predicate("cannot determine encoder for IN list")
                    })?;
                let lhs = self.term_fragment(term, path, tpe, None)?;
                Fragment::in_list(lhs, values, &codec)
            }
            Predicate::StartsWith(term, prefix) => Ok(self
                .term_fragment(term, path, tpe, Some(&Codec::Str))?
                .append(Fragment::lit(" LIKE "))
                .append(Fragment::bind(
                    Codec::Str,
                    Cell::String(format!("{prefix}%")),
                ))),
            Predicate::Like {
                term,
                pattern,
                case_insensitive,
            } => {
                let op = if *case_insensitive { " ILIKE " } else { " LIKE " };
                Ok(self
                    .term_fragment(term, path, tpe, Some(&Codec::Str))?
                    .append(Fragment::lit(op))
                    .append(Fragment::bind(Codec::Str, Cell::String(pattern.clone()))))
            }
            Predicate::Contains(x, y) => {
                // The container side keeps its own encoder; only the element
                // side unifies, against the container's element codec.
                let suggested = self
                    .term_codec(y, path, tpe)
                    .or_else(|| self.term_codec(x, path, tpe).map(|c| c.element().clone()));
                let fx = self.term_fragment(x, path, tpe, None)?;
                let fy = self.term_fragment(y, path, tpe, suggested.as_ref())?;
                Ok(fx.append(Fragment::lit(" = ")).append(fy))
            }
            Predicate::Matches(_, _) => Err(TrellisError::internal(
                "regular-expression predicates are evaluated post-fetch",
            )),
        }
    }

    fn binary(
        &self,
        a: &Term,
        op: &str,
        b: &Term,
        path: &[String],
        tpe: &Type,
    ) -> Result<Fragment> {
        let ca = self.term_codec(a, path, tpe);
        let cb = self.term_codec(b, path, tpe);
        if let (Some(x), Some(y)) = (&ca, &cb) {
            if x != y {
                return Err(TrellisError::mapping(format!(
                    "encoder mismatch between predicate sides: {x:?} vs {y:?}"
                )));
            }
        }
        let fa = self.term_fragment(a, path, tpe, cb.as_ref())?;
        let fb = self.term_fragment(b, path, tpe, ca.as_ref())?;
        Ok(fa
            .append(Fragment::lit(format!(" {op} ")))
            .append(fb))
    }

    fn term_fragment(
        &self,
        term: &Term,
        path: &[String],
        tpe: &Type,
        suggested: Option<&Codec>,
    ) -> Result<Fragment> {
        match term {
            Term::Const(cell) => {
                let codec = suggested
                    .cloned()
                    .or_else(|| Codec::for_cell(cell))
                    .ok_or_else(|| {
                        TrellisError::predicate(format!(
                            "cannot determine encoder for literal {cell:?}"
                        ))
                    })?;
                Ok(Fragment::bind(codec, cell.clone()))
            }
            Term::Path(hops) => {
                let col = self.column_for_path(hops, path, tpe)?;
                Ok(Fragment::lit(col.qualified()))
            }
            Term::ToUpperCase(t) => Ok(Fragment::lit("upper(")
                .append(self.term_fragment(t, path, tpe, Some(&Codec::Str))?)
                .append(Fragment::lit(")"))),
            Term::ToLowerCase(t) => Ok(Fragment::lit("lower(")
                .append(self.term_fragment(t, path, tpe, Some(&Codec::Str))?)
                .append(Fragment::lit(")"))),
            Term::AndB(a, b) => self.bit_binop(a, "&", b, path, tpe),
            Term::OrB(a, b) => self.bit_binop(a, "|", b, path, tpe),
            Term::XorB(a, b) => self.bit_binop(a, "#", b, path, tpe),
            Term::NotB(t) => Ok(Fragment::lit("~")
                .append(self.term_fragment(t, path, tpe, Some(&Codec::Int))?)),
        }
    }

    fn bit_binop(
        &self,
        a: &Term,
        op: &str,
        b: &Term,
        path: &[String],
        tpe: &Type,
    ) -> Result<Fragment> {
        Ok(self
            .term_fragment(a, path, tpe, Some(&Codec::Int))?
            .append(Fragment::lit(format!(" {op} ")))
            .append(self.term_fragment(b, path, tpe, Some(&Codec::Int))?))
    }

    fn term_codec(&self, term: &Term, path: &[String], tpe: &Type) -> Option<Codec> {
        match term {
            Term::Const(_) => None,
            Term::Path(hops) => self
                .column_for_path(hops, path, tpe)
                .ok()
                .map(|c| c.codec),
            Term::ToUpperCase(_) | Term::ToLowerCase(_) => Some(Codec::Str),
            Term::AndB(_, _) | Term::OrB(_, _) | Term::XorB(_, _) | Term::NotB(_) => {
                Some(Codec::Int)
            }
        }
    }

    /// Resolves a term path to the single column it denotes.
    pub fn column_for_path(
        &self,
        hops: &[String],
        path: &[String],
        tpe: &Type,
    ) -> Result<ColumnRef> {
        let mapping = &self.mapping;
        let mut cur_path = path.to_vec();
        let mut cur_tpe = tpe.clone();
        for hop in hops {
            let fm = mapping
                .field_mapping(&cur_path, cur_tpe.underlying(), hop)
                .ok_or_else(|| {
                    TrellisError::mapping(format!(
                        "no mapping for {}.{} at /{}",
                        cur_tpe.underlying(),
                        hop,
                        cur_path.join("/")
                    ))
                })?;
            match fm {
                FieldMapping::JoinedObject { .. } => {
                    let next = mapping.schema().field_type(&cur_tpe, hop).ok_or_else(|| {
                        TrellisError::mapping(format!(
                            "no schema field {}.{}",
                            cur_tpe.underlying(),
                            hop
                        ))
                    })?;
                    cur_path.push(hop.clone());
                    cur_tpe = next;
                }
                fm => {
                    return fm.column().cloned().ok_or_else(|| {
                        TrellisError::predicate(format!(
                            "path segment `{hop}` does not resolve to a column"
                        ))
                    });
                }
            }
        }
        Err(TrellisError::predicate(format!(
            "path /{} does not terminate at a column",
            hops.join("/")
        )))
    }
}

impl fmt::Display for MappedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fragment() {
            Ok(fragment) => writeln!(f, "{}", fragment.sql())?,
            Err(err) => writeln!(f, "<uncompilable: {err}>")?,
        }
        writeln!(
            f,
            "table={} columns={} joins={} predicates={}",
            self.table,
            self.columns.len(),
            self.joins.len(),
            self.predicates.len()
        )?;
        for (col, meta) in self.columns.iter().zip(&self.metas) {
            writeln!(
                f,
                "  {} codec={:?} nullable={} outer={}",
                col.qualified(),
                meta.codec,
                meta.nullable,
                meta.outer_join
            )?;
        }
        Ok(())
    }
}

struct Accumulator<'a> {
    mapping: &'a Arc<Mapping>,
    columns: Vec<ColumnRef>,
    joins: Vec<Join>,
    predicates: Vec<(Vec<String>, Type, Predicate)>,
    touched: Vec<usize>,
}

impl<'a> Accumulator<'a> {
    fn visit(&mut self, q: &Query, path: &[String], tpe: &Type) -> Result<()> {
        self.require_context(path, tpe);
        match q {
            Query::Select { name, child, .. } if name == STAGED_FIELD => {
                self.visit(child, path, tpe)
            }
            Query::Select { name, child, .. } => {
                self.require_field(path, tpe, name)?;
                let child_tpe = self
                    .mapping
                    .schema()
                    .field_type(tpe, name)
                    .ok_or_else(|| {
                        TrellisError::mapping(format!(
                            "no schema field {}.{}",
                            tpe.underlying(),
                            name
                        ))
                    })?;
                let mut child_path = path.to_vec();
                child_path.push(name.clone());
                self.visit(child, &child_path, &child_tpe)
            }
            Query::Context { path: p, child } => {
                if algebra::is_staged(child) {
                    self.visit(child, p, tpe)
                } else {
                    let t = self.mapping.schema().type_at_path(p).ok_or_else(|| {
                        TrellisError::mapping(format!("no type at path /{}", p.join("/")))
                    })?;
                    self.visit(child, p, &t)
                }
            }
            Query::Narrow { subtype, child } => {
                self.visit(child, path, &Type::Named(subtype.clone()))
            }
            Query::Filter { predicate, child } => {
                self.predicates
                    .push((path.to_vec(), tpe.clone(), predicate.clone()));
                let mut siblings = vec![(**child).clone()];
                for hops in predicate.paths() {
                    if self.path_is_schema_fields(&hops, tpe) {
                        siblings.push(mk_selects(&hops));
                    } else {
                        self.require_term_path(&hops, path, tpe)?;
                    }
                }
                let merged = algebra::merge_queries(siblings);
                self.visit(&merged, path, tpe)
            }
            Query::Group(children) => {
                for child in children {
                    self.visit(child, path, tpe)?;
                }
                Ok(())
            }
            Query::Unique(child) | Query::Count(child) => self.visit(child, path, tpe),
            Query::Wrap { child, .. }
            | Query::Rename { child, .. }
            | Query::Limit { child, .. }
            | Query::Offset { child, .. }
            | Query::OrderBy { child, .. }
            | Query::GroupBy { child, .. }
            | Query::Environment { child, .. }
            | Query::TransformCursor { child, .. } => self.visit(child, path, tpe),
            Query::Empty
            | Query::Introspect(_)
            | Query::Component { .. }
            | Query::Defer { .. }
            | Query::Skip { .. }
            | Query::UntypedNarrow { .. }
            | Query::UntypedSelect { .. } => Ok(()),
        }
    }

    /// Key and discriminator columns for the mapping at this level and for
    /// every interface the underlying type implements.
    fn require_context(&mut self, path: &[String], tpe: &Type) {
        let mapping = self.mapping;
        let name = tpe.underlying();
        let mut names: Vec<&str> = vec![name];
        names.extend(mapping.schema().interfaces_of(name).iter().map(String::as_str));
        for tname in names {
            if let Some(idx) = mapping.object_mapping_index(path, tname) {
                if !self.touched.contains(&idx) {
                    self.touched.push(idx);
                }
                let om = mapping.object_mapping_at(idx);
                for col in om.key_columns() {
                    self.add_column(col);
                }
                for col in om.discriminator_columns() {
                    self.add_column(col);
                }
            }
        }
    }

    fn require_field(&mut self, path: &[String], tpe: &Type, name: &str) -> Result<()> {
        let mapping = self.mapping;
        let fm = mapping
            .field_mapping(path, tpe.underlying(), name)
            .ok_or_else(|| {
                TrellisError::mapping(format!(
                    "no field mapping for {}.{} at /{}",
                    tpe.underlying(),
                    name,
                    path.join("/")
                ))
            })?
            .clone();
        match fm {
            FieldMapping::ColumnField { column, .. }
            | FieldMapping::HiddenColumn { column, .. }
            | FieldMapping::JsonColumn { column, .. } => {
                self.add_column(column);
                Ok(())
            }
            FieldMapping::JoinedObject { joins, .. } => {
                self.add_joins(&joins);
                Ok(())
            }
            FieldMapping::ComputedField { required, .. }
            | FieldMapping::ComputedAttribute { required, .. } => {
                for sibling in &required {
                    self.require_field(path, tpe, sibling)?;
                }
                Ok(())
            }
        }
    }

    /// Projects the columns and joins needed to evaluate a term path that
    /// cannot be expressed as plain schema-field selections.
    fn require_term_path(&mut self, hops: &[String], path: &[String], tpe: &Type) -> Result<()> {
        let mapping = self.mapping;
        let mut cur_path = path.to_vec();
        let mut cur_tpe = tpe.clone();
        for hop in hops {
            self.require_context(&cur_path, &cur_tpe);
            let fm = mapping
                .field_mapping(&cur_path, cur_tpe.underlying(), hop)
                .ok_or_else(|| {
                    TrellisError::mapping(format!(
                        "no mapping for predicate path segment {}.{} at /{}",
                        cur_tpe.underlying(),
                        hop,
                        cur_path.join("/")
                    ))
                })?
                .clone();
            match fm {
                FieldMapping::JoinedObject { joins, .. } => {
                    self.add_joins(&joins);
                    let next = mapping
                        .schema()
                        .field_type(&cur_tpe, hop)
                        .ok_or_else(|| {
                            TrellisError::mapping(format!(
                                "no schema field {}.{}",
                                cur_tpe.underlying(),
                                hop
                            ))
                        })?;
                    cur_path.push(hop.clone());
                    cur_tpe = next;
                }
                FieldMapping::ColumnField { column, .. }
                | FieldMapping::HiddenColumn { column, .. }
                | FieldMapping::JsonColumn { column, .. } => {
                    self.add_column(column);
                    return Ok(());
                }
                FieldMapping::ComputedField { required, .. }
                | FieldMapping::ComputedAttribute { required, .. } => {
                    for sibling in &required {
                        self.require_field(&cur_path, &cur_tpe, sibling)?;
                    }
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Whether every hop of the path is a plain schema field, making it
    /// expressible as a synthesised selection chain.
    fn path_is_schema_fields(&self, hops: &[String], tpe: &Type) -> bool {
        let schema = self.mapping.schema();
        let mut cur = tpe.clone();
        for hop in hops {
            match schema.field_type(&cur, hop) {
                Some(next) => cur = next,
                None => return false,
            }
        }
        true
    }

    fn add_column(&mut self, column: ColumnRef) {
        if !self.columns.contains(&column) {
            self.columns.push(column);
        }
    }

    fn add_joins(&mut self, joins: &[Join]) {
        for join in joins {
            self.add_column(join.parent.clone());
            self.add_column(join.child.clone());
            if !self
                .joins
                .iter()
                .any(|j| j.normal_form() == join.normal_form())
            {
                self.joins.push(join.clone());
            }
        }
    }

    /// The driving FROM table: a table that is not the child side of any
    /// join, or failing that, the table that parents the most distinct
    /// child tables.
    fn root_table(&self) -> Result<String> {
        let mut tables: Vec<&str> = Vec::new();
        for col in &self.columns {
            if !tables.contains(&col.table.as_str()) {
                tables.push(&col.table);
            }
        }
        let child_tables: HashSet<&str> =
            self.joins.iter().map(|j| j.child.table.as_str()).collect();
        let candidates: Vec<&str> = tables
            .iter()
            .copied()
            .filter(|t| !child_tables.contains(t))
            .collect();
        let pool = if candidates.is_empty() {
            tables
        } else {
            candidates
        };
        if pool.len() == 1 {
            return Ok(pool[0].to_string());
        }
        let mut best = pool[0];
        let mut best_children = distinct_children(&self.joins, best);
        for t in &pool[1..] {
            let n = distinct_children(&self.joins, t);
            if n > best_children {
                best = t;
                best_children = n;
            }
        }
        Ok(best.to_string())
    }

    /// Orders joins so each appears after the join introducing its parent
    /// table; no progress on a pass means the mapping is inconsistent.
    fn ordered_joins(&self, root: &str) -> Result<Vec<Join>> {
        let mut remaining: Vec<Join> = Vec::new();
        for join in &self.joins {
            if !remaining
                .iter()
                .any(|j| j.normal_form() == join.normal_form())
            {
                remaining.push(join.clone());
            }
        }
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(root.to_string());
        let mut out = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let mut rest = Vec::new();
            let mut progressed = false;
            for join in remaining {
                if seen.contains(join.parent.table.as_str()) {
                    seen.insert(join.child.table.clone());
                    out.push(join);
                    progressed = true;
                } else {
                    rest.push(join);
                }
            }
            if !progressed {
                return Err(TrellisError::mapping(format!(
                    "inconsistent join topology: {} join(s) unreachable from {}",
                    rest.len(),
                    root
                )));
            }
            remaining = rest;
        }
        Ok(out)
    }

    fn meta(&self, col: &ColumnRef, joins: &[Join]) -> ColumnMeta {
        let outer_join = joins.iter().any(|j| j.child.table == col.table);
        let nullable = outer_join || self.declared_nullable(col);
        ColumnMeta {
            outer_join,
            codec: col.codec.clone(),
            nullable,
        }
    }

    fn declared_nullable(&self, col: &ColumnRef) -> bool {
        let mapping = self.mapping;
        let schema = mapping.schema();
        for idx in &self.touched {
            let om = mapping.object_mapping_at(*idx);
            for fm in &om.fields {
                if fm.column() != Some(col) {
                    continue;
                }
                match fm {
                    FieldMapping::ColumnField { name, .. }
                    | FieldMapping::JsonColumn { name, .. } => {
                        let tpe = Type::Named(om.tpe.clone());
                        let field_nullable = schema
                            .field_type(&tpe, name)
                            .map(|t| t.is_nullable())
                            .unwrap_or(true);
                        let variant = schema
                            .interfaces_of(&om.tpe)
                            .iter()
                            .any(|iface| schema.is_variant_field(iface, name));
                        if field_nullable || variant {
                            return true;
                        }
                    }
                    FieldMapping::HiddenColumn { nullable: true, .. } => return true,
                    _ => {}
                }
            }
        }
        false
    }
}

fn distinct_children(joins: &[Join], table: &str) -> usize {
    joins
        .iter()
        .filter(|j| j.parent.table == table)
        .map(|j| j.child.table.as_str())
        .collect::<HashSet<_>>()
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::mapping::ObjectMapping;
    use crate::schema::{field, Schema};

    fn col(table: &str, column: &str, codec: Codec) -> ColumnRef {
        ColumnRef::new(table, column, codec)
    }

    fn fixture() -> Arc<Mapping> {
        let schema = Schema::new("Query")
            .with_object(
                "Query",
                &[],
                vec![field("widget", Type::named("Widget"))],
            )
            .with_object(
                "Widget",
                &[],
                vec![
                    field("id", Type::non_null(Type::named("ID"))),
                    field("label", Type::named("String")),
                    field("part", Type::named("Part")),
                ],
            )
            .with_object(
                "Part",
                &[],
                vec![
                    field("id", Type::non_null(Type::named("ID"))),
                    field("serial", Type::non_null(Type::named("String"))),
                ],
            );
        let widget_part_join = Join::new(
            col("widgets", "part_id", Codec::Int),
            col("parts", "id", Codec::Int),
        );
        Arc::new(
            Mapping::new(schema)
                .with_object(ObjectMapping::new(
                    "Query",
                    vec![FieldMapping::joined_object("widget", vec![])],
                ))
                .with_object(ObjectMapping::new(
                    "Widget",
                    vec![
                        FieldMapping::column_field("id", col("widgets", "id", Codec::Int)).key(),
                        FieldMapping::column_field("label", col("widgets", "label", Codec::Str)),
                        FieldMapping::joined_object("part", vec![widget_part_join]),
                    ],
                ))
                .with_object(ObjectMapping::new(
                    "Part",
                    vec![
                        FieldMapping::column_field("id", col("parts", "id", Codec::Int)).key(),
                        FieldMapping::column_field(
                            "serial",
                            col("parts", "serial", Codec::Str),
                        ),
                    ],
                )),
        )
    }

    fn widget_query(child: Query) -> Query {
        Query::select("widget", child)
    }

    #[test]
    fn planning_is_deterministic() {
        let mapping = fixture();
        let q = widget_query(Query::group(vec![
            Query::select("label", Query::Empty),
            Query::select("part", Query::select("serial", Query::Empty)),
        ]));
        let tpe = mapping.schema().query_type();
        let a = MappedQuery::build(&q, &[], &tpe, &mapping).unwrap();
        let b = MappedQuery::build(&q, &[], &tpe, &mapping).unwrap();
        assert_eq!(a.fragment().unwrap(), b.fragment().unwrap());
    }

    #[test]
    fn joins_deduplicate_by_normal_form() {
        let mapping = fixture();
        // Selecting through the same join twice must not duplicate it.
        let q = widget_query(Query::group(vec![
            Query::select("part", Query::select("serial", Query::Empty)),
            Query::select("part", Query::select("id", Query::Empty)),
        ]));
        let tpe = mapping.schema().query_type();
        let mapped = MappedQuery::build(&q, &[], &tpe, &mapping).unwrap();
        assert_eq!(mapped.joins().len(), 1);
        let sql = mapped.fragment().unwrap();
        assert_eq!(
            sql.sql(),
            "SELECT widgets.id, widgets.part_id, parts.id, parts.serial FROM widgets \
             LEFT JOIN parts ON widgets.part_id = parts.id"
        );
    }

    #[test]
    fn outer_joined_columns_are_nullable() {
        let mapping = fixture();
        let q = widget_query(Query::select("part", Query::select("serial", Query::Empty)));
        let tpe = mapping.schema().query_type();
        let mapped = MappedQuery::build(&q, &[], &tpe, &mapping).unwrap();
        let serial = col("parts", "serial", Codec::Str);
        let idx = mapped.index_of(&serial).unwrap();
        // Schema says serial is non-null; the outer join overrides it.
        assert!(mapped.metas()[idx].nullable);
        assert!(mapped.metas()[idx].outer_join);

        let id = col("widgets", "id", Codec::Int);
        let idx = mapped.index_of(&id).unwrap();
        assert!(!mapped.metas()[idx].nullable);
    }

    #[test]
    fn predicate_columns_are_projected() {
        let mapping = fixture();
        let q = widget_query(Query::filter(
            Predicate::Eql(Term::path(&["part", "serial"]), Term::constant("s-1")),
            Query::select("label", Query::Empty),
        ));
        let tpe = mapping.schema().query_type();
        let mapped = MappedQuery::build(&q, &[], &tpe, &mapping).unwrap();
        let serial = col("parts", "serial", Codec::Str);
        assert!(mapped.index_of(&serial).is_some());
        assert_eq!(mapped.joins().len(), 1);
        let sql = mapped.fragment().unwrap();
        assert!(sql.sql().ends_with("WHERE parts.serial = ?"));
        assert_eq!(sql.binds().len(), 1);
        assert_eq!(sql.binds()[0].codec, Codec::Str);
    }

    #[test]
    fn encoder_mismatch_is_fatal() {
        let mapping = fixture();
        let q = widget_query(Query::filter(
            Predicate::Eql(Term::path(&["id"]), Term::path(&["label"])),
            Query::Empty,
        ));
        let tpe = mapping.schema().query_type();
        let mapped = MappedQuery::build(&q, &[], &tpe, &mapping).unwrap();
        let err = mapped.fragment().unwrap_err();
        assert!(matches!(err, TrellisError::Mapping(_)));
    }

    #[test]
    fn unreachable_joins_are_inconsistent() {
        let schema = Schema::new("Query")
            .with_object("Query", &[], vec![field("thing", Type::named("Thing"))])
            .with_object(
                "Thing",
                &[],
                vec![
                    field("id", Type::non_null(Type::named("ID"))),
                    field("orphan", Type::named("Orphan")),
                ],
            )
            .with_object(
                "Orphan",
                &[],
                vec![field("id", Type::non_null(Type::named("ID")))],
            );
        // Both joins point into `a`/`b`, neither reachable from `things`.
        let mapping = Arc::new(
            Mapping::new(schema)
                .with_object(ObjectMapping::new(
                    "Query",
                    vec![FieldMapping::joined_object("thing", vec![])],
                ))
                .with_object(ObjectMapping::new(
                    "Thing",
                    vec![
                        FieldMapping::column_field("id", col("things", "id", Codec::Int)).key(),
                        FieldMapping::joined_object(
                            "orphan",
                            vec![
                                Join::new(
                                    col("a", "x", Codec::Int),
                                    col("b", "x", Codec::Int),
                                ),
                                Join::new(
                                    col("b", "y", Codec::Int),
                                    col("a", "y", Codec::Int),
                                ),
                            ],
                        ),
                    ],
                )),
        );
        let q = Query::select("thing", Query::select("orphan", Query::Empty));
        let tpe = mapping.schema().query_type();
        let err = MappedQuery::build(&q, &[], &tpe, &mapping).unwrap_err();
        assert!(matches!(err, TrellisError::Mapping(_)));
        assert!(err.to_string().contains("inconsistent join topology"));
    }

    #[test]
    fn grouping_is_stable_and_strips_failed_joins() {
        let mapping = fixture();
        let q = widget_query(Query::select("label", Query::Empty));
        let tpe = mapping.schema().query_type();
        let mapped = MappedQuery::build(&q, &[], &tpe, &mapping).unwrap();
        // columns: widgets.id, widgets.label
        let table: Table = vec![
            vec![Cell::Int(2), Cell::String("b".into())],
            vec![Cell::FailedJoin, Cell::Null],
            vec![Cell::Int(1), Cell::String("a".into())],
            vec![Cell::Int(2), Cell::String("b".into())],
        ];
        let path = vec!["widget".to_string()];
        let item = Type::named("Widget");
        let groups = mapped.group(&table, &path, &item).unwrap();
        assert_eq!(groups.len(), 2);
        // Ordered by stringified key projection: "1" before "2".
        assert_eq!(groups[0][0][0], Cell::Int(1));
        assert_eq!(groups[1][0][0], Cell::Int(2));
        assert_eq!(groups[1].len(), 2);
        let again = mapped.group(&table, &path, &item).unwrap();
        assert_eq!(groups, again);
    }
}
