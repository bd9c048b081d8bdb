//! The query interpreter shell.
//!
//! Drives one round trip per staging boundary: elaborate, plan, fetch,
//! walk the cursor tree into a JSON value, then complete any deferred
//! sub-queries in batches. Sibling root queries of the keyed-lookup shape
//! are coalesced into a single `IN`-list statement and their results
//! scattered back in request order.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;

use crate::error::{Result, TrellisError};
use crate::query::algebra::{self, GroupDiscriminator, Query, STAGED_FIELD};
use crate::query::cursor::{Cursor, SqlCursor};
use crate::query::driver::SqlDriver;
use crate::query::mapping::Mapping;
use crate::query::monitor::{Monitor, NoopMonitor};
use crate::query::planner::MappedQuery;
use crate::query::predicate::{Predicate, Term};
use crate::query::stage;
use crate::query::value::Cell;
use crate::schema::Type;

const DEFAULT_MAX_COALESCED_KEYS: usize = 1_000;

/// Interpreter options.
#[derive(Clone, Debug)]
pub struct InterpreterConfig {
    /// Whether sibling keyed lookups coalesce into `IN`-list statements.
    pub coalesce: bool,
    /// Upper bound on keys per coalesced statement; larger groups split.
    pub max_coalesced_keys: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            coalesce: true,
            max_coalesced_keys: DEFAULT_MAX_COALESCED_KEYS,
        }
    }
}

/// Result value under construction: JSON with holes for deferred
/// sub-queries.
#[derive(Clone, Debug)]
enum ProtoValue {
    Json(JsonValue),
    Object(Vec<(String, ProtoValue)>),
    List(Vec<ProtoValue>),
    Deferred(usize),
}

impl ProtoValue {
    fn complete(self, slots: &[Result<JsonValue>]) -> Result<JsonValue> {
        match self {
            ProtoValue::Json(v) => Ok(v),
            ProtoValue::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (name, value) in fields {
                    map.insert(name, value.complete(slots)?);
                }
                Ok(JsonValue::Object(map))
            }
            ProtoValue::List(items) => Ok(JsonValue::Array(
                items
                    .into_iter()
                    .map(|item| item.complete(slots))
                    .collect::<Result<Vec<_>>>()?,
            )),
            ProtoValue::Deferred(slot) => slots
                .get(slot)
                .cloned()
                .unwrap_or_else(|| Err(TrellisError::internal("missing deferred slot"))),
        }
    }
}

/// A deferred sub-query collected during a walk.
#[derive(Clone, Debug)]
struct StagedRequest {
    query: Query,
    tpe: Type,
    /// Root field of the deferred child, extracted from the staged result.
    field: String,
}

#[derive(Debug, Default)]
struct WalkCtx {
    staged: Vec<StagedRequest>,
}

/// The keyed-lookup shape eligible for sibling coalescing.
struct LookupShape<'a> {
    path: &'a [String],
    name: &'a str,
    term_path: &'a [String],
    value: &'a Cell,
    child: &'a Query,
}

fn lookup_shape(q: &Query) -> Option<LookupShape<'_>> {
    let Query::Context { path, child } = q else {
        return None;
    };
    let Query::Select {
        name,
        alias: None,
        child,
    } = child.as_ref()
    else {
        return None;
    };
    let Query::Filter { predicate, child } = child.as_ref() else {
        return None;
    };
    let Predicate::Eql(Term::Path(term_path), Term::Const(value)) = predicate else {
        return None;
    };
    Some(LookupShape {
        path,
        name,
        term_path,
        value,
        child,
    })
}

fn same_lookup(a: &LookupShape<'_>, b: &LookupShape<'_>) -> bool {
    a.path == b.path && a.name == b.name && a.term_path == b.term_path && a.child == b.child
}

/// Interpreter over one mapping, driver, and monitor.
pub struct QueryInterpreter {
    mapping: Arc<Mapping>,
    driver: Arc<dyn SqlDriver>,
    monitor: Arc<dyn Monitor>,
    config: InterpreterConfig,
}

impl QueryInterpreter {
    pub fn new(mapping: Arc<Mapping>, driver: Arc<dyn SqlDriver>) -> Self {
        QueryInterpreter {
            mapping,
            driver,
            monitor: Arc::new(NoopMonitor),
            config: InterpreterConfig::default(),
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_config(mut self, config: InterpreterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    /// Runs one root query to a JSON value.
    pub fn run(&self, q: &Query, tpe: &Type) -> Result<JsonValue> {
        let result = stage::elaborate(&self.mapping, q, tpe)
            .and_then(|elaborated| self.run_elaborated(&elaborated, tpe));
        self.monitor.result_computed(&result);
        result
    }

    /// Runs a batch of root queries, coalescing sibling keyed lookups, and
    /// returns per-query results in request order.
    pub fn run_root_queries(&self, queries: &[(Query, Type)]) -> Vec<Result<JsonValue>> {
        let mut results: Vec<Option<Result<JsonValue>>> = vec![None; queries.len()];
        let mut prepared: Vec<(usize, Query, Type)> = Vec::with_capacity(queries.len());
        for (i, (q, tpe)) in queries.iter().enumerate() {
            match stage::elaborate(&self.mapping, q, tpe) {
                Ok(elaborated) => prepared.push((i, elaborated, tpe.clone())),
                Err(err) => results[i] = Some(Err(err)),
            }
        }
        let indexed: Vec<(Query, Type)> = prepared
            .iter()
            .map(|(_, q, t)| (q.clone(), t.clone()))
            .collect();
        let batch = self.run_elaborated_batch(&indexed);
        for ((i, _, _), result) in prepared.into_iter().zip(batch) {
            results[i] = Some(result);
        }
        results
            .into_iter()
            .map(|r| {
                let r = r.unwrap_or_else(|| Err(TrellisError::internal("missing batch result")));
                self.monitor.result_computed(&r);
                r
            })
            .collect()
    }

    fn run_elaborated_batch(&self, queries: &[(Query, Type)]) -> Vec<Result<JsonValue>> {
        let mut results: Vec<Option<Result<JsonValue>>> = vec![None; queries.len()];
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for i in 0..queries.len() {
            let mut placed = false;
            if self.config.coalesce {
                if let Some(shape) = lookup_shape(&queries[i].0) {
                    for group in groups.iter_mut() {
                        if group.len() >= self.config.max_coalesced_keys {
                            continue;
                        }
                        let head = group[0];
                        if queries[head].1 != queries[i].1 {
                            continue;
                        }
                        let head_shape = match lookup_shape(&queries[head].0) {
                            Some(s) => s,
                            None => continue,
                        };
                        if same_lookup(&head_shape, &shape) {
                            group.push(i);
                            placed = true;
                            break;
                        }
                    }
                }
            }
            if !placed {
                groups.push(vec![i]);
            }
        }
        for group in groups {
            if group.len() == 1 || !self.config.coalesce {
                for i in group {
                    results[i] = Some(self.run_elaborated(&queries[i].0, &queries[i].1));
                }
            } else {
                self.run_coalesced(queries, &group, &mut results);
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(TrellisError::internal("missing batch result"))))
            .collect()
    }

    fn run_elaborated(&self, q: &Query, tpe: &Type) -> Result<JsonValue> {
        let root_path: Vec<String> = match q {
            Query::Context { path, .. } => path.clone(),
            _ => Vec::new(),
        };
        self.monitor.stage_started();
        let mapped = Arc::new(MappedQuery::build(q, &[], tpe, &self.mapping)?);
        let fragment = mapped.fragment()?;
        let table = self.driver.fetch(&fragment, mapped.metas())?;
        self.monitor.query_mapped(q, &fragment, table.len());
        debug!(rows = table.len(), sql = fragment.sql(), "stage fetched");
        let root = SqlCursor::root(&root_path, tpe, table, Arc::clone(&mapped));
        let mut ctx = WalkCtx::default();
        let proto = self.run_value(q, &Cursor::Sql(root), &mut ctx)?;
        self.monitor.stage_completed();
        let slots = self.resolve_slots(&ctx.staged);
        proto.complete(&slots)
    }

    fn run_coalesced(
        &self,
        queries: &[(Query, Type)],
        group: &[usize],
        results: &mut [Option<Result<JsonValue>>],
    ) {
        match self.run_coalesced_inner(queries, group) {
            Ok(per_member) => {
                for (i, result) in group.iter().zip(per_member) {
                    results[*i] = Some(result);
                }
            }
            Err(err) => {
                for i in group {
                    results[*i] = Some(Err(err.clone()));
                }
            }
        }
    }

    fn run_coalesced_inner(
        &self,
        queries: &[(Query, Type)],
        group: &[usize],
    ) -> Result<Vec<Result<JsonValue>>> {
        let tpe = queries[group[0]].1.clone();
        let head = lookup_shape(&queries[group[0]].0)
            .ok_or_else(|| TrellisError::internal("coalesced group lost its shape"))?;
        let path = head.path.to_vec();
        let name = head.name.to_string();
        let term_path = head.term_path.to_vec();
        let child = head.child.clone();
        let values: Vec<Cell> = group
            .iter()
            .map(|i| {
                lookup_shape(&queries[*i].0)
                    .map(|s| s.value.clone())
                    .ok_or_else(|| TrellisError::internal("coalesced group lost its shape"))
            })
            .collect::<Result<_>>()?;
        let mut distinct: Vec<Cell> = Vec::new();
        for v in &values {
            if !distinct.contains(v) {
                distinct.push(v.clone());
            }
        }
        debug!(
            keys = values.len(),
            distinct = distinct.len(),
            field = name.as_str(),
            "coalescing sibling lookups"
        );

        let combined = Query::Context {
            path: path.clone(),
            child: Box::new(Query::GroupBy {
                discriminator: GroupDiscriminator {
                    term: Term::Path(term_path.clone()),
                    buckets: distinct.clone(),
                },
                child: Box::new(Query::Select {
                    name: name.clone(),
                    alias: None,
                    child: Box::new(Query::Filter {
                        predicate: Predicate::In(Term::Path(term_path.clone()), distinct),
                        child: Box::new(child.clone()),
                    }),
                }),
            }),
        };

        self.monitor.stage_started();
        let mapped = Arc::new(MappedQuery::build(&combined, &[], &tpe, &self.mapping)?);
        let fragment = mapped.fragment()?;
        let table = self.driver.fetch(&fragment, mapped.metas())?;
        self.monitor.query_mapped(&combined, &fragment, table.len());
        let root = SqlCursor::root(&path, &tpe, table, Arc::clone(&mapped));

        let staged = name == STAGED_FIELD;
        let (members, field_cursor) = if staged {
            let members = root.group_as(&Type::Named(tpe.underlying().to_string()))?;
            (members, Cursor::Sql(root.clone()))
        } else {
            let field_cursor = Cursor::Sql(root.clone()).field(&name)?;
            let Cursor::Sql(field_sql) = &field_cursor else {
                return Err(TrellisError::type_error(
                    &path,
                    format!("coalesced field {name} is not object-mapped"),
                ));
            };
            let item = Type::Named(field_sql.tpe().underlying().to_string());
            (field_sql.group_as(&item)?, field_cursor)
        };
        let member_keys: Vec<Cell> = members
            .iter()
            .map(|m| {
                Term::Path(term_path.clone())
                    .eval(&Cursor::Sql(m.clone()))
                    .unwrap_or(Cell::Null)
            })
            .collect();

        let mut ctx = WalkCtx::default();
        let mut protos: Vec<Result<ProtoValue>> = Vec::with_capacity(group.len());
        for value in &values {
            let matching: Vec<Cursor> = members
                .iter()
                .zip(&member_keys)
                .filter(|(_, key)| *key == value)
                .map(|(m, _)| Cursor::Sql(m.clone()))
                .collect();
            let proto = if staged {
                match matching.first() {
                    Some(parent) => self.run_value(&child, parent, &mut ctx),
                    None => Ok(ProtoValue::Object(Vec::new())),
                }
            } else {
                self.continue_with_members(&child, &field_cursor, matching, &mut ctx)
                    .map(|value| ProtoValue::Object(vec![(name.clone(), value)]))
            };
            protos.push(proto);
        }
        self.monitor.stage_completed();

        let slots = self.resolve_slots(&ctx.staged);
        Ok(protos
            .into_iter()
            .map(|proto| proto.and_then(|p| p.complete(&slots)))
            .collect())
    }

    /// Runs the collected deferred sub-queries as one batch (so they
    /// coalesce) and extracts each staged field value.
    fn resolve_slots(&self, staged: &[StagedRequest]) -> Vec<Result<JsonValue>> {
        if staged.is_empty() {
            return Vec::new();
        }
        let requests: Vec<(Query, Type)> = staged
            .iter()
            .map(|s| (s.query.clone(), s.tpe.clone()))
            .collect();
        self.run_elaborated_batch(&requests)
            .into_iter()
            .zip(staged)
            .map(|(result, request)| {
                result.map(|value| match value {
                    JsonValue::Object(mut map) => {
                        map.remove(&request.field).unwrap_or(JsonValue::Null)
                    }
                    other => other,
                })
            })
            .collect()
    }

    fn run_value(&self, q: &Query, cursor: &Cursor, ctx: &mut WalkCtx) -> Result<ProtoValue> {
        match q {
            Query::Environment { env, child } => {
                self.run_value(child, &cursor.clone().with_env(env), ctx)
            }
            Query::TransformCursor { transform, child } => {
                let transformed = (transform.0)(cursor.clone())?;
                self.run_value(child, &transformed, ctx)
            }
            Query::Context { child, .. } => self.run_value(child, cursor, ctx),
            Query::Select { name, child, .. } if name == STAGED_FIELD => {
                self.run_value(child, cursor, ctx)
            }
            Query::Wrap { name, child } => Ok(ProtoValue::Object(vec![(
                name.clone(),
                self.run_value(child, cursor, ctx)?,
            )])),
            Query::Defer { child, parent_type } => {
                let Cursor::Sql(parent) = cursor else {
                    return Err(TrellisError::type_error(
                        cursor.path(),
                        "cannot defer from a leaf",
                    ));
                };
                let field = algebra::root_name(child)
                    .map(|(n, _)| n.to_string())
                    .ok_or_else(|| {
                        TrellisError::internal("deferred sub-query has no root selection")
                    })?;
                let staged = self.staged_query(parent, child)?;
                let slot = ctx.staged.len();
                ctx.staged.push(StagedRequest {
                    query: staged,
                    tpe: parent_type.clone(),
                    field,
                });
                Ok(ProtoValue::Deferred(slot))
            }
            Query::Skip { sense, cond, child } => {
                if cond == sense {
                    Ok(ProtoValue::Json(JsonValue::Null))
                } else {
                    self.run_value(child, cursor, ctx)
                }
            }
            Query::Component { .. } => Err(TrellisError::internal(
                "component queries are delegated to the general interpreter",
            )),
            Query::Introspect(_) => Err(TrellisError::internal(
                "introspection is delegated to the general interpreter",
            )),
            _ => match cursor {
                Cursor::Leaf(_) => {
                    if cursor.is_nullable() {
                        match cursor.as_nullable()? {
                            None => return Ok(ProtoValue::Json(JsonValue::Null)),
                            Some(_) => {}
                        }
                    }
                    Ok(ProtoValue::Json(cursor.as_leaf()?.to_json()))
                }
                Cursor::Sql(sql) => {
                    if cursor.is_list() {
                        let members = cursor.as_list()?;
                        return self.continue_with_members(q, cursor, members, ctx);
                    }
                    let keys = self
                        .mapping
                        .key_columns(sql.path(), sql.tpe().underlying());
                    if keys.is_empty() {
                        // Keyless object positions (the query root) are a
                        // single pseudo-group over the whole table.
                        return self.continue_with_members(
                            q,
                            cursor,
                            vec![cursor.clone()],
                            ctx,
                        );
                    }
                    if cursor.is_nullable() && cursor.as_nullable()?.is_none() {
                        return Ok(ProtoValue::Json(JsonValue::Null));
                    }
                    let item = Type::Named(sql.tpe().underlying().to_string());
                    let members = sql
                        .group_as(&item)?
                        .into_iter()
                        .map(Cursor::Sql)
                        .collect();
                    self.continue_with_members(q, cursor, members, ctx)
                }
            },
        }
    }

    /// Applies list-level operators to the member set, then materialises
    /// the remaining selection according to the position's declared type.
    fn continue_with_members(
        &self,
        q: &Query,
        position: &Cursor,
        members: Vec<Cursor>,
        ctx: &mut WalkCtx,
    ) -> Result<ProtoValue> {
        match q {
            Query::Filter { predicate, child } => {
                let post_sql = self.mapping.predicate_is_post_sql(
                    predicate,
                    position.path(),
                    position.tpe().underlying(),
                );
                let kept = if post_sql {
                    let mut kept = Vec::with_capacity(members.len());
                    for member in members {
                        if predicate.eval(&member)? {
                            kept.push(member);
                        }
                    }
                    kept
                } else {
                    members
                };
                self.continue_with_members(child, position, kept, ctx)
            }
            Query::OrderBy { selections, child } => {
                let mut sorted = members;
                sorted.sort_by(|a, b| algebra::compare_chain(selections, a, b));
                self.continue_with_members(child, position, sorted, ctx)
            }
            Query::Limit { count, child } => {
                let mut limited = members;
                limited.truncate(*count);
                self.continue_with_members(child, position, limited, ctx)
            }
            Query::Offset { count, child } => {
                let rest = members.into_iter().skip(*count).collect();
                self.continue_with_members(child, position, rest, ctx)
            }
            Query::Unique(child) => match members.len() {
                0 => {
                    if position.tpe().is_nullable() || position.tpe().is_list() {
                        Ok(ProtoValue::Json(JsonValue::Null))
                    } else {
                        Err(TrellisError::type_error(
                            position.path(),
                            "no row for unique selection",
                        ))
                    }
                }
                1 => {
                    let member = members.into_iter().next().expect("one member");
                    self.run_element(child, &member, ctx)
                }
                n => Err(TrellisError::type_error(
                    position.path(),
                    format!("{n} rows for unique selection"),
                )),
            },
            Query::Count(_) => Ok(ProtoValue::Json(JsonValue::from(members.len()))),
            Query::GroupBy {
                discriminator,
                child,
            } => {
                let mut buckets: Vec<Vec<Cursor>> =
                    vec![Vec::new(); discriminator.buckets.len()];
                for member in members {
                    if let Some(idx) = discriminator.bucket_of(&member) {
                        buckets[idx].push(member);
                    }
                }
                Ok(ProtoValue::List(
                    buckets
                        .into_iter()
                        .map(|bucket| self.continue_with_members(child, position, bucket, ctx))
                        .collect::<Result<Vec<_>>>()?,
                ))
            }
            _ => {
                if position.tpe().is_list() {
                    Ok(ProtoValue::List(
                        members
                            .iter()
                            .map(|member| self.run_element(q, member, ctx))
                            .collect::<Result<Vec<_>>>()?,
                    ))
                } else {
                    match members.len() {
                        0 => {
                            if position.tpe().is_nullable() {
                                Ok(ProtoValue::Json(JsonValue::Null))
                            } else {
                                Err(TrellisError::type_error(
                                    position.path(),
                                    "no row for non-nullable object",
                                ))
                            }
                        }
                        1 => {
                            let member = members.into_iter().next().expect("one member");
                            self.run_element(q, &member, ctx)
                        }
                        n => Err(TrellisError::type_error(
                            position.path(),
                            format!("{n} rows for a single object"),
                        )),
                    }
                }
            }
        }
    }

    /// Walks the selection over one object-shaped member.
    fn run_element(&self, q: &Query, member: &Cursor, ctx: &mut WalkCtx) -> Result<ProtoValue> {
        Ok(ProtoValue::Object(self.run_fields(q, member, ctx)?))
    }

    fn run_fields(
        &self,
        q: &Query,
        cursor: &Cursor,
        ctx: &mut WalkCtx,
    ) -> Result<Vec<(String, ProtoValue)>> {
        match q {
            Query::Group(children) => {
                let mut fields = Vec::new();
                for child in children {
                    fields.extend(self.run_fields(child, cursor, ctx)?);
                }
                Ok(fields)
            }
            Query::Select { name, alias, child } => {
                let field_cursor = cursor.field(name)?;
                let value = self.run_value(child, &field_cursor, ctx)?;
                Ok(vec![(alias.clone().unwrap_or_else(|| name.clone()), value)])
            }
            Query::Rename { name, child } => {
                let mut fields = self.run_fields(child, cursor, ctx)?;
                if let Some(first) = fields.first_mut() {
                    first.0 = name.clone();
                }
                Ok(fields)
            }
            Query::Wrap { name, child } => Ok(vec![(
                name.clone(),
                self.run_value(child, cursor, ctx)?,
            )]),
            Query::Narrow { subtype, child } => {
                if cursor.narrows_to(subtype)? {
                    self.run_fields(child, &cursor.narrow(subtype)?, ctx)
                } else {
                    Ok(Vec::new())
                }
            }
            Query::Environment { env, child } => {
                self.run_fields(child, &cursor.clone().with_env(env), ctx)
            }
            Query::TransformCursor { transform, child } => {
                let transformed = (transform.0)(cursor.clone())?;
                self.run_fields(child, &transformed, ctx)
            }
            Query::Skip { sense, cond, child } => {
                if cond == sense {
                    Ok(Vec::new())
                } else {
                    self.run_fields(child, cursor, ctx)
                }
            }
            Query::Empty => Ok(Vec::new()),
            other => Err(TrellisError::internal(format!(
                "unexpected query shape in field position: {other:?}"
            ))),
        }
    }

    /// Builds the follow-up query for a deferred child: the stored child
    /// re-selected under the staged sentinel, filtered on the parent's key
    /// values.
    fn staged_query(&self, parent: &SqlCursor, deferred_child: &Query) -> Result<Query> {
        let tpe_name = parent.tpe().underlying();
        let om = self
            .mapping
            .object_mapping(parent.path(), tpe_name)
            .ok_or_else(|| {
                TrellisError::mapping(format!(
                    "no object mapping for {} at /{}",
                    tpe_name,
                    parent.path().join("/")
                ))
            })?;
        let cursor = Cursor::Sql(parent.clone());
        let mut preds = Vec::new();
        for fm in om.key_fields() {
            let key = fm.name().to_string();
            let value = if fm.is_hidden() {
                cursor.attribute(&key)?
            } else {
                cursor.field(&key)?.as_leaf()?.clone()
            };
            preds.push(Predicate::Eql(Term::Path(vec![key]), Term::Const(value)));
        }
        // A keyless parent (the query root) needs no restriction: the
        // follow-up re-runs the child against the singleton root.
        let restricted = match Predicate::all(preds) {
            Some(key_pred) => Query::Filter {
                predicate: key_pred,
                child: Box::new(deferred_child.clone()),
            },
            None => deferred_child.clone(),
        };
        Ok(Query::Context {
            path: parent.path().to_vec(),
            child: Box::new(Query::select(STAGED_FIELD, restricted)),
        })
    }
}
