//! The query algebra: a tagged tree of operators over GraphQL selections.
//!
//! Queries arrive pre-validated against the schema; the algebra only encodes
//! structure. All transformations here (merging, flattening, path synthesis)
//! are purely structural, with no evaluation.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::query::cursor::Cursor;
use crate::query::predicate::{Predicate, Term};
use crate::query::value::Cell;
use crate::schema::Type;

/// Sentinel field name telling the planner to reuse the stored path and
/// parent type of a staged sub-query verbatim.
pub const STAGED_FIELD: &str = "__staged";

/// Environment attached to a subtree, readable by computed-field closures.
pub type Env = BTreeMap<String, Cell>;

/// A directive attached to an untyped selection.
#[derive(Clone, Debug, PartialEq)]
pub struct Directive {
    pub name: String,
    pub args: Vec<(String, Cell)>,
}

/// Closure rewriting a cursor in place of a subtree.
#[derive(Clone)]
pub struct CursorTransform(pub Arc<dyn Fn(Cursor) -> Result<Cursor> + Send + Sync>);

impl CursorTransform {
    pub fn new(f: impl Fn(Cursor) -> Result<Cursor> + Send + Sync + 'static) -> Self {
        CursorTransform(Arc::new(f))
    }
}

impl fmt::Debug for CursorTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<cursor transform>")
    }
}

impl PartialEq for CursorTransform {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Partition discriminator: groups a list result into buckets by term value.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupDiscriminator {
    pub term: Term,
    pub buckets: Vec<Cell>,
}

impl GroupDiscriminator {
    /// Index of the bucket the cursor belongs to, if any.
    pub fn bucket_of(&self, cursor: &Cursor) -> Option<usize> {
        let value = self.term.eval(cursor).ok()?;
        self.buckets.iter().position(|b| *b == value)
    }
}

/// One component of an `OrderBy`: a term extractor, direction, and null
/// placement.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderSelection {
    pub term: Term,
    pub ascending: bool,
    pub nulls_last: bool,
}

impl OrderSelection {
    pub fn ascending(term: Term) -> Self {
        OrderSelection {
            term,
            ascending: true,
            nulls_last: true,
        }
    }

    pub fn descending(term: Term) -> Self {
        OrderSelection {
            term,
            ascending: false,
            nulls_last: true,
        }
    }

    pub fn nulls_first(mut self) -> Self {
        self.nulls_last = false;
        self
    }

    /// Total order over cursors. Null placement is absolute: `nulls_last`
    /// puts absent values after present ones regardless of direction.
    pub fn compare(&self, a: &Cursor, b: &Cursor) -> Ordering {
        let va = self.term.eval(a).unwrap_or(Cell::Null);
        let vb = self.term.eval(b).unwrap_or(Cell::Null);
        match (va.is_absent(), vb.is_absent()) {
            (true, true) => Ordering::Equal,
            (true, false) => {
                if self.nulls_last {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (false, true) => {
                if self.nulls_last {
                    Ordering::Less
                } else {
                    Ordering::Greater
                }
            }
            (false, false) => {
                let ord = va.partial_cmp(&vb).unwrap_or(Ordering::Equal);
                if self.ascending {
                    ord
                } else {
                    ord.reverse()
                }
            }
        }
    }
}

/// Tie-break chain: the first non-equal selection decides.
pub fn compare_chain(selections: &[OrderSelection], a: &Cursor, b: &Cursor) -> Ordering {
    for sel in selections {
        let ord = sel.compare(a, b);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// A node of the query operator tree.
///
/// Siblings at the same level are expressed by `Group`; `Group` of `Group`
/// is flattened on construction.
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    /// Selection of a field, with an optional response alias.
    Select {
        name: String,
        alias: Option<String>,
        child: Box<Query>,
    },
    /// Selection carrying unprocessed directives, prior to elaboration.
    UntypedSelect {
        name: String,
        alias: Option<String>,
        directives: Vec<Directive>,
        child: Box<Query>,
    },
    /// Sibling queries at the same level.
    Group(Vec<Query>),
    /// Restriction of a list to its single element.
    Unique(Box<Query>),
    /// Restriction of a list by a predicate.
    Filter {
        predicate: Predicate,
        child: Box<Query>,
    },
    /// Restriction to a subtype of an interface.
    Narrow { subtype: String, child: Box<Query> },
    /// Narrowing by type name prior to elaboration.
    UntypedNarrow { subtype: String, child: Box<Query> },
    /// Injects an extra object layer under `name` into the result.
    Wrap { name: String, child: Box<Query> },
    /// Renames the result key of the child selection.
    Rename { name: String, child: Box<Query> },
    Limit { count: usize, child: Box<Query> },
    Offset { count: usize, child: Box<Query> },
    OrderBy {
        selections: Vec<OrderSelection>,
        child: Box<Query>,
    },
    /// Partitions a list result into buckets by discriminator value.
    GroupBy {
        discriminator: GroupDiscriminator,
        child: Box<Query>,
    },
    /// Replaces a list result by its length.
    Count(Box<Query>),
    /// Introspection subtree, delegated to the general interpreter.
    Introspect(Box<Query>),
    /// Attaches an environment readable by computed fields below.
    Environment { env: Env, child: Box<Query> },
    /// Re-roots the child at an absolute path.
    Context {
        path: Vec<String>,
        child: Box<Query>,
    },
    /// Subtree handled by an external component mapping.
    Component { component: String, child: Box<Query> },
    /// Sub-query deferred to a second round-trip, keyed on parent keys.
    Defer {
        child: Box<Query>,
        parent_type: Type,
    },
    /// Applies a cursor transformation before continuing.
    TransformCursor {
        transform: CursorTransform,
        child: Box<Query>,
    },
    /// Conditional inclusion (`@skip`/`@include`); hidden when `cond == sense`.
    Skip {
        sense: bool,
        cond: bool,
        child: Box<Query>,
    },
    Empty,
}

impl Query {
    pub fn select(name: impl Into<String>, child: Query) -> Query {
        Query::Select {
            name: name.into(),
            alias: None,
            child: Box::new(child),
        }
    }

    pub fn select_as(name: impl Into<String>, alias: impl Into<String>, child: Query) -> Query {
        Query::Select {
            name: name.into(),
            alias: Some(alias.into()),
            child: Box::new(child),
        }
    }

    /// Groups siblings, absorbing nested groups and dropping `Empty`.
    pub fn group(children: Vec<Query>) -> Query {
        let mut flat = Vec::with_capacity(children.len());
        for child in children {
            match child {
                Query::Empty => {}
                Query::Group(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Query::Empty,
            1 => flat.into_iter().next().expect("one element"),
            _ => Query::Group(flat),
        }
    }

    pub fn filter(predicate: Predicate, child: Query) -> Query {
        Query::Filter {
            predicate,
            child: Box::new(child),
        }
    }

    pub fn narrow(subtype: impl Into<String>, child: Query) -> Query {
        Query::Narrow {
            subtype: subtype.into(),
            child: Box::new(child),
        }
    }

    pub fn wrap(name: impl Into<String>, child: Query) -> Query {
        Query::Wrap {
            name: name.into(),
            child: Box::new(child),
        }
    }

    pub fn rename(name: impl Into<String>, child: Query) -> Query {
        Query::Rename {
            name: name.into(),
            child: Box::new(child),
        }
    }

    pub fn unique(child: Query) -> Query {
        Query::Unique(Box::new(child))
    }

    pub fn limit(count: usize, child: Query) -> Query {
        Query::Limit {
            count,
            child: Box::new(child),
        }
    }

    pub fn offset(count: usize, child: Query) -> Query {
        Query::Offset {
            count,
            child: Box::new(child),
        }
    }

    pub fn order_by(selections: Vec<OrderSelection>, child: Query) -> Query {
        Query::OrderBy {
            selections,
            child: Box::new(child),
        }
    }

    pub fn context(path: &[&str], child: Query) -> Query {
        Query::Context {
            path: path.iter().map(|s| s.to_string()).collect(),
            child: Box::new(child),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Query::Empty)
    }
}

/// Merges two sibling queries into one level.
pub fn merge(a: Query, b: Query) -> Query {
    Query::group(vec![a, b])
}

/// Expands a `Group` into its siblings; any other query is a single sibling.
pub fn ungroup(q: Query) -> Vec<Query> {
    match q {
        Query::Group(children) => children,
        Query::Empty => Vec::new(),
        other => vec![other],
    }
}

enum MergeSlot {
    Sel {
        name: String,
        alias: Option<String>,
        children: Vec<Query>,
    },
    USel {
        name: String,
        alias: Option<String>,
        directives: Vec<Directive>,
        children: Vec<Query>,
    },
    Nar {
        subtype: String,
        children: Vec<Query>,
    },
    Other(Query),
}

/// Folds sibling selections with the same `(name, alias)` into one, merging
/// their children recursively. `Narrow` siblings with the same target type
/// coalesce; `Empty` drops; first-occurrence order is preserved.
pub fn merge_queries(queries: Vec<Query>) -> Query {
    merge_siblings(queries, false)
}

/// The untyped variant of [`merge_queries`]: folds `UntypedSelect` siblings,
/// concatenating their directive lists.
pub fn merge_untyped_queries(queries: Vec<Query>) -> Query {
    merge_siblings(queries, true)
}

fn merge_siblings(queries: Vec<Query>, untyped: bool) -> Query {
    let mut slots: Vec<MergeSlot> = Vec::new();
    let mut pending = queries;
    pending.reverse();
    while let Some(q) = pending.pop() {
        match q {
            Query::Empty => {}
            Query::Group(children) => {
                for child in children.into_iter().rev() {
                    pending.push(child);
                }
            }
            Query::Select { name, alias, child } if !untyped => {
                let pos = slots.iter().position(|slot| {
                    matches!(slot, MergeSlot::Sel { name: n, alias: a, .. }
                        if *n == name && *a == alias)
                });
                match pos {
                    Some(p) => {
                        if let MergeSlot::Sel { children, .. } = &mut slots[p] {
                            children.push(*child);
                        }
                    }
                    None => slots.push(MergeSlot::Sel {
                        name,
                        alias,
                        children: vec![*child],
                    }),
                }
            }
            Query::UntypedSelect {
                name,
                alias,
                directives,
                child,
            } if untyped => {
                let pos = slots.iter().position(|slot| {
                    matches!(slot, MergeSlot::USel { name: n, alias: a, .. }
                        if *n == name && *a == alias)
                });
                match pos {
                    Some(p) => {
                        if let MergeSlot::USel {
                            directives: ds,
                            children,
                            ..
                        } = &mut slots[p]
                        {
                            ds.extend(directives);
                            children.push(*child);
                        }
                    }
                    None => slots.push(MergeSlot::USel {
                        name,
                        alias,
                        directives,
                        children: vec![*child],
                    }),
                }
            }
            Query::Narrow { subtype, child } => {
                let pos = slots.iter().position(|slot| {
                    matches!(slot, MergeSlot::Nar { subtype: s, .. } if *s == subtype)
                });
                match pos {
                    Some(p) => {
                        if let MergeSlot::Nar { children, .. } = &mut slots[p] {
                            children.push(*child);
                        }
                    }
                    None => slots.push(MergeSlot::Nar {
                        subtype,
                        children: vec![*child],
                    }),
                }
            }
            other => slots.push(MergeSlot::Other(other)),
        }
    }

    let merged = slots
        .into_iter()
        .map(|slot| match slot {
            MergeSlot::Sel {
                name,
                alias,
                children,
            } => Query::Select {
                name,
                alias,
                child: Box::new(merge_children(children, untyped)),
            },
            MergeSlot::USel {
                name,
                alias,
                directives,
                children,
            } => Query::UntypedSelect {
                name,
                alias,
                directives,
                child: Box::new(merge_children(children, untyped)),
            },
            MergeSlot::Nar { subtype, children } => Query::Narrow {
                subtype,
                child: Box::new(merge_children(children, untyped)),
            },
            MergeSlot::Other(q) => q,
        })
        .collect();
    Query::group(merged)
}

fn merge_children(mut children: Vec<Query>, untyped: bool) -> Query {
    if children.len() == 1 {
        children.remove(0)
    } else {
        merge_siblings(children, untyped)
    }
}

/// Chain of selections covering a single path.
pub fn mk_selects(path: &[String]) -> Query {
    path.iter()
        .rev()
        .fold(Query::Empty, |child, name| Query::select(name, child))
}

/// The minimal selection tree covering every given path, sharing common
/// prefixes.
pub fn mk_path_query(paths: &[Vec<String>]) -> Query {
    let mut heads: Vec<&String> = Vec::new();
    let mut tails: BTreeMap<&String, Vec<Vec<String>>> = BTreeMap::new();
    for path in paths {
        let Some(head) = path.first() else { continue };
        if !heads.contains(&head) {
            heads.push(head);
        }
        let entry = tails.entry(head).or_default();
        if path.len() > 1 {
            entry.push(path[1..].to_vec());
        }
    }
    let children = heads
        .into_iter()
        .map(|head| {
            let rest = tails.remove(head).unwrap_or_default();
            Query::select(head, mk_path_query(&rest))
        })
        .collect();
    Query::group(children)
}

/// The `(name, alias)` of the first selection, looking through
/// `Environment`, `TransformCursor`, `Rename`, and `Wrap` wrappers.
pub fn root_name(q: &Query) -> Option<(&str, Option<&str>)> {
    match q {
        Query::Select { name, alias, .. } | Query::UntypedSelect { name, alias, .. } => {
            Some((name, alias.as_deref()))
        }
        Query::Environment { child, .. }
        | Query::TransformCursor { child, .. }
        | Query::Rename { child, .. }
        | Query::Wrap { child, .. } => root_name(child),
        _ => None,
    }
}

/// The response key of the first selection: its alias if present, else its
/// field name.
pub fn result_name(q: &Query) -> Option<&str> {
    root_name(q).map(|(name, alias)| alias.unwrap_or(name))
}

/// Whether the query re-enters through the staged sentinel selection. Looks
/// through `GroupBy` in addition to the [`root_name`] wrappers, since
/// coalesced staged queries carry their discriminator outside the sentinel.
pub fn is_staged(q: &Query) -> bool {
    match q {
        Query::GroupBy { child, .. } => is_staged(child),
        _ => matches!(root_name(q), Some((STAGED_FIELD, _))),
    }
}

/// Whether a top-level selection (possibly inside a `Group`) selects `name`.
pub fn has_field(q: &Query, name: &str) -> bool {
    match q {
        Query::Group(children) => children.iter().any(|c| has_field(c, name)),
        _ => root_name(q).map(|(n, _)| n == name).unwrap_or(false),
    }
}

/// The alias of the top-level selection of `name`, if any.
pub fn field_alias<'a>(q: &'a Query, name: &str) -> Option<&'a str> {
    match q {
        Query::Group(children) => children.iter().find_map(|c| field_alias(c, name)),
        _ => match root_name(q) {
            Some((n, alias)) if n == name => alias,
            _ => None,
        },
    }
}

/// Replaces the child of the first selection, looking through wrappers.
pub fn subst_child(q: Query, new_child: Query) -> Query {
    match q {
        Query::Select { name, alias, .. } => Query::Select {
            name,
            alias,
            child: Box::new(new_child),
        },
        Query::UntypedSelect {
            name,
            alias,
            directives,
            ..
        } => Query::UntypedSelect {
            name,
            alias,
            directives,
            child: Box::new(new_child),
        },
        Query::Environment { env, child } => Query::Environment {
            env,
            child: Box::new(subst_child(*child, new_child)),
        },
        Query::TransformCursor { transform, child } => Query::TransformCursor {
            transform,
            child: Box::new(subst_child(*child, new_child)),
        },
        Query::Rename { name, child } => Query::Rename {
            name,
            child: Box::new(subst_child(*child, new_child)),
        },
        Query::Wrap { name, child } => Query::Wrap {
            name,
            child: Box::new(subst_child(*child, new_child)),
        },
        other => other,
    }
}

/// Applies `f` to every top-level selection, descending through groups and
/// wrappers.
pub fn map_fields(
    q: Query,
    f: &mut dyn FnMut(Query) -> Result<Query>,
) -> Result<Query> {
    match q {
        Query::Group(children) => {
            let mapped = children
                .into_iter()
                .map(|c| map_fields(c, f))
                .collect::<Result<Vec<_>>>()?;
            Ok(Query::group(mapped))
        }
        q @ (Query::Select { .. } | Query::UntypedSelect { .. }) => f(q),
        Query::Environment { env, child } => Ok(Query::Environment {
            env,
            child: Box::new(map_fields(*child, f)?),
        }),
        Query::TransformCursor { transform, child } => Ok(Query::TransformCursor {
            transform,
            child: Box::new(map_fields(*child, f)?),
        }),
        Query::Rename { name, child } => Ok(Query::Rename {
            name,
            child: Box::new(map_fields(*child, f)?),
        }),
        Query::Wrap { name, child } => Ok(Query::Wrap {
            name,
            child: Box::new(map_fields(*child, f)?),
        }),
        other => Ok(other),
    }
}
