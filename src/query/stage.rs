//! The staging elaborator.
//!
//! A sub-selection must be re-issued against the database as its own
//! statement when a single SQL query cannot answer it: nested non-leaf
//! lists would multiply row counts, re-entering an already visited mapping
//! means a cycle in the type graph, and an interface without a
//! discriminator cannot decide subtypes in SQL. The elaborator rewrites
//! such sub-selections into `Wrap(name, Defer(..))` boundaries; the
//! interpreter later completes each deferred child with a keyed follow-up
//! query.

use std::collections::HashSet;

use crate::error::{Result, TrellisError};
use crate::query::algebra::{self, Query, STAGED_FIELD};
use crate::query::mapping::{FieldMapping, Mapping};
use crate::schema::Type;

/// Visited-mapping state threaded through the walk. Reset at every staging
/// boundary.
#[derive(Clone, Debug, Default)]
struct Seen {
    types: HashSet<usize>,
    in_list: bool,
}

/// Rewrites `q` (rooted at the query type) inserting staging boundaries.
///
/// Applying the elaborator to its own output is the identity: existing
/// `Defer` nodes are left untouched.
pub fn elaborate(mapping: &Mapping, q: &Query, tpe: &Type) -> Result<Query> {
    let mut seen = Seen::default();
    walk(mapping, q, &[], tpe, &mut seen)
}

fn walk(
    mapping: &Mapping,
    q: &Query,
    path: &[String],
    tpe: &Type,
    seen: &mut Seen,
) -> Result<Query> {
    match q {
        Query::Select { name, child, .. } if name == STAGED_FIELD => {
            let inner = walk(mapping, child, path, tpe, seen)?;
            Ok(Query::select(STAGED_FIELD, inner))
        }
        Query::Select { name, alias, child } => {
            let schema = mapping.schema();
            let child_tpe = schema.field_type(tpe, name).ok_or_else(|| {
                TrellisError::mapping(format!("no schema field {}.{}", tpe.underlying(), name))
            })?;
            let mut child_path = path.to_vec();
            child_path.push(name.clone());
            let child_idx = mapping.object_mapping_index(&child_path, child_tpe.underlying());
            let in_list = non_leaf_list(mapping, path, tpe, name);
            let result_key = alias.clone().unwrap_or_else(|| name.clone());

            if let Some(idx) = child_idx {
                if seen.types.contains(&idx) || (seen.in_list && in_list) {
                    let mut fresh = Seen {
                        types: HashSet::from([idx]),
                        in_list: false,
                    };
                    let inner = walk(mapping, child, &child_path, &child_tpe, &mut fresh)?;
                    return Ok(Query::wrap(
                        result_key,
                        Query::Defer {
                            child: Box::new(Query::select(name, inner)),
                            parent_type: Type::Named(tpe.underlying().to_string()),
                        },
                    ));
                }
            }

            let child_name = child_tpe.underlying();
            if schema.is_interface(child_name)
                && !mapping.has_discriminator(&child_path, child_name)
                && selects_variant_field(mapping, child, child_name)
            {
                let mut fresh = Seen {
                    types: child_idx.into_iter().collect(),
                    in_list: false,
                };
                let inner = walk(mapping, child, &child_path, &child_tpe, &mut fresh)?;
                return Ok(Query::wrap(
                    result_key,
                    Query::Defer {
                        child: Box::new(Query::select(name, inner)),
                        parent_type: schema.query_type(),
                    },
                ));
            }

            if child_idx.is_some() {
                if let Some(cur) = mapping.object_mapping_index(path, tpe.underlying()) {
                    seen.types.insert(cur);
                }
            }
            seen.in_list = seen.in_list || in_list;
            let inner = walk(mapping, child, &child_path, &child_tpe, seen)?;
            Ok(Query::Select {
                name: name.clone(),
                alias: alias.clone(),
                child: Box::new(inner),
            })
        }
        Query::Group(children) => {
            let walked = children
                .iter()
                .map(|c| walk(mapping, c, path, tpe, seen))
                .collect::<Result<Vec<_>>>()?;
            Ok(Query::group(walked))
        }
        Query::Narrow { subtype, child } => {
            let inner = walk(mapping, child, path, &Type::Named(subtype.clone()), seen)?;
            Ok(Query::Narrow {
                subtype: subtype.clone(),
                child: Box::new(inner),
            })
        }
        Query::Context { path: p, child } => {
            let inner = if algebra::is_staged(child) {
                walk(mapping, child, p, tpe, seen)?
            } else {
                let t = mapping.schema().type_at_path(p).ok_or_else(|| {
                    TrellisError::mapping(format!("no type at path /{}", p.join("/")))
                })?;
                walk(mapping, child, p, &t, seen)?
            };
            Ok(Query::Context {
                path: p.clone(),
                child: Box::new(inner),
            })
        }
        Query::Filter { predicate, child } => Ok(Query::Filter {
            predicate: predicate.clone(),
            child: Box::new(walk(mapping, child, path, tpe, seen)?),
        }),
        Query::Unique(child) => Ok(Query::unique(walk(mapping, child, path, tpe, seen)?)),
        Query::Wrap { name, child } => Ok(Query::wrap(
            name.clone(),
            walk(mapping, child, path, tpe, seen)?,
        )),
        Query::Rename { name, child } => Ok(Query::rename(
            name.clone(),
            walk(mapping, child, path, tpe, seen)?,
        )),
        Query::Limit { count, child } => Ok(Query::limit(
            *count,
            walk(mapping, child, path, tpe, seen)?,
        )),
        Query::Offset { count, child } => Ok(Query::offset(
            *count,
            walk(mapping, child, path, tpe, seen)?,
        )),
        Query::OrderBy { selections, child } => Ok(Query::order_by(
            selections.clone(),
            walk(mapping, child, path, tpe, seen)?,
        )),
        Query::GroupBy {
            discriminator,
            child,
        } => Ok(Query::GroupBy {
            discriminator: discriminator.clone(),
            child: Box::new(walk(mapping, child, path, tpe, seen)?),
        }),
        Query::Count(child) => Ok(Query::Count(Box::new(walk(
            mapping, child, path, tpe, seen,
        )?))),
        Query::Environment { env, child } => Ok(Query::Environment {
            env: env.clone(),
            child: Box::new(walk(mapping, child, path, tpe, seen)?),
        }),
        Query::TransformCursor { transform, child } => Ok(Query::TransformCursor {
            transform: transform.clone(),
            child: Box::new(walk(mapping, child, path, tpe, seen)?),
        }),
        Query::Skip { sense, cond, child } => Ok(Query::Skip {
            sense: *sense,
            cond: *cond,
            child: Box::new(walk(mapping, child, path, tpe, seen)?),
        }),
        // Already-staged and delegated subtrees pass through untouched.
        Query::Defer { .. }
        | Query::Component { .. }
        | Query::Introspect(_)
        | Query::UntypedSelect { .. }
        | Query::UntypedNarrow { .. }
        | Query::Empty => Ok(q.clone()),
    }
}

/// A list of objects reached through a non-empty join: flattening one such
/// list into the row table is fine, nesting two multiplies row counts.
fn non_leaf_list(mapping: &Mapping, path: &[String], tpe: &Type, name: &str) -> bool {
    let schema = mapping.schema();
    let Some(ftpe) = schema.field_type(tpe, name) else {
        return false;
    };
    if !ftpe.is_list() || schema.is_unstructured(&ftpe) {
        return false;
    }
    matches!(
        mapping.field_mapping(path, tpe.underlying(), name),
        Some(FieldMapping::JoinedObject { joins, .. }) if !joins.is_empty()
    )
}

/// Whether the selection touches a field whose presence depends on the
/// runtime subtype of `interface`.
fn selects_variant_field(mapping: &Mapping, q: &Query, interface: &str) -> bool {
    let schema = mapping.schema();
    match q {
        Query::Group(children) => children
            .iter()
            .any(|c| selects_variant_field(mapping, c, interface)),
        Query::Select { name, .. } | Query::UntypedSelect { name, .. } => {
            schema.is_variant_field(interface, name)
        }
        Query::Narrow { child, .. }
        | Query::UntypedNarrow { child, .. }
        | Query::Wrap { child, .. }
        | Query::Rename { child, .. }
        | Query::Filter { child, .. }
        | Query::Unique(child)
        | Query::Limit { child, .. }
        | Query::Offset { child, .. }
        | Query::OrderBy { child, .. }
        | Query::GroupBy { child, .. }
        | Query::Count(child)
        | Query::Environment { child, .. }
        | Query::TransformCursor { child, .. }
        | Query::Skip { child, .. } => selects_variant_field(mapping, child, interface),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::mapping::{Codec, ColumnRef, Join, ObjectMapping};
    use crate::schema::{field, Schema};

    fn col(table: &str, column: &str) -> ColumnRef {
        ColumnRef::new(table, column, Codec::Int)
    }

    fn person_mapping() -> Mapping {
        let schema = Schema::new("Query")
            .with_object(
                "Query",
                &[],
                vec![field("person", Type::named("Person"))],
            )
            .with_object(
                "Person",
                &[],
                vec![
                    field("id", Type::non_null(Type::named("ID"))),
                    field("name", Type::named("String")),
                    field("manager", Type::named("Person")),
                ],
            );
        Mapping::new(schema)
            .with_object(ObjectMapping::new(
                "Query",
                vec![FieldMapping::joined_object("person", vec![])],
            ))
            .with_object(ObjectMapping::new(
                "Person",
                vec![
                    FieldMapping::column_field("id", col("person", "id")).key(),
                    FieldMapping::column_field("name", col("person", "name")),
                    FieldMapping::joined_object(
                        "manager",
                        vec![Join::new(col("person", "manager_id"), col("person", "id"))],
                    ),
                ],
            ))
    }

    fn manager_query() -> Query {
        // { person { name manager { name manager { name } } } }
        Query::select(
            "person",
            Query::group(vec![
                Query::select("name", Query::Empty),
                Query::select(
                    "manager",
                    Query::group(vec![
                        Query::select("name", Query::Empty),
                        Query::select("manager", Query::select("name", Query::Empty)),
                    ]),
                ),
            ]),
        )
    }

    fn count_defers(q: &Query) -> usize {
        match q {
            Query::Defer { child, .. } => 1 + count_defers(child),
            Query::Group(children) => children.iter().map(count_defers).sum(),
            Query::Select { child, .. }
            | Query::UntypedSelect { child, .. }
            | Query::Filter { child, .. }
            | Query::Narrow { child, .. }
            | Query::UntypedNarrow { child, .. }
            | Query::Wrap { child, .. }
            | Query::Rename { child, .. }
            | Query::Limit { child, .. }
            | Query::Offset { child, .. }
            | Query::OrderBy { child, .. }
            | Query::GroupBy { child, .. }
            | Query::Environment { child, .. }
            | Query::TransformCursor { child, .. }
            | Query::Skip { child, .. }
            | Query::Context { child, .. } => count_defers(child),
            Query::Unique(child) | Query::Count(child) | Query::Introspect(child) => {
                count_defers(child)
            }
            Query::Component { child, .. } => count_defers(child),
            Query::Empty => 0,
        }
    }

    #[test]
    fn cyclic_self_reference_stages_exactly_the_inner_revisit() {
        let mapping = person_mapping();
        let tpe = mapping.schema().query_type();
        let elaborated = elaborate(&mapping, &manager_query(), &tpe).unwrap();
        assert_eq!(count_defers(&elaborated), 1);

        // The outer manager stays inline; the inner one is deferred under a
        // wrap keyed by the field name.
        let Query::Select { child, .. } = &elaborated else {
            panic!("expected person select, got {elaborated:?}");
        };
        let Query::Group(children) = child.as_ref() else {
            panic!("expected group, got {child:?}");
        };
        let Query::Select { name, child: outer_manager, .. } = &children[1] else {
            panic!("expected manager select, got {:?}", children[1]);
        };
        assert_eq!(name, "manager");
        let Query::Group(inner) = outer_manager.as_ref() else {
            panic!("expected group, got {outer_manager:?}");
        };
        match &inner[1] {
            Query::Wrap { name, child } => {
                assert_eq!(name, "manager");
                match child.as_ref() {
                    Query::Defer { parent_type, child } => {
                        assert_eq!(parent_type.underlying(), "Person");
                        assert_eq!(algebra::root_name(child), Some(("manager", None)));
                    }
                    other => panic!("expected defer, got {other:?}"),
                }
            }
            other => panic!("expected wrap, got {other:?}"),
        }
    }

    #[test]
    fn elaboration_is_idempotent() {
        let mapping = person_mapping();
        let tpe = mapping.schema().query_type();
        let once = elaborate(&mapping, &manager_query(), &tpe).unwrap();
        let twice = elaborate(&mapping, &once, &tpe).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn nested_non_leaf_lists_are_staged() {
        let schema = Schema::new("Query")
            .with_object(
                "Query",
                &[],
                vec![field(
                    "movies",
                    Type::list(Type::non_null(Type::named("Movie"))),
                )],
            )
            .with_object(
                "Movie",
                &[],
                vec![
                    field("id", Type::non_null(Type::named("ID"))),
                    field(
                        "actors",
                        Type::list(Type::non_null(Type::named("Actor"))),
                    ),
                ],
            )
            .with_object(
                "Actor",
                &[],
                vec![
                    field("id", Type::non_null(Type::named("ID"))),
                    field(
                        "awards",
                        Type::list(Type::non_null(Type::named("Award"))),
                    ),
                ],
            )
            .with_object(
                "Award",
                &[],
                vec![
                    field("id", Type::non_null(Type::named("ID"))),
                    field("name", Type::named("String")),
                ],
            );
        let mapping = Mapping::new(schema)
            .with_object(ObjectMapping::new(
                "Query",
                vec![FieldMapping::joined_object("movies", vec![])],
            ))
            .with_object(ObjectMapping::new(
                "Movie",
                vec![
                    FieldMapping::column_field("id", col("movies", "id")).key(),
                    FieldMapping::joined_object(
                        "actors",
                        vec![Join::new(col("movies", "id"), col("actors", "movie_id"))],
                    ),
                ],
            ))
            .with_object(ObjectMapping::new(
                "Actor",
                vec![
                    FieldMapping::column_field("id", col("actors", "id")).key(),
                    FieldMapping::joined_object(
                        "awards",
                        vec![Join::new(col("actors", "id"), col("awards", "actor_id"))],
                    ),
                ],
            ))
            .with_object(ObjectMapping::new(
                "Award",
                vec![
                    FieldMapping::column_field("id", col("awards", "id")).key(),
                    FieldMapping::column_field("name", col("awards", "name")),
                ],
            ));

        let q = Query::select(
            "movies",
            Query::select(
                "actors",
                Query::select("awards", Query::select("name", Query::Empty)),
            ),
        );
        let tpe = mapping.schema().query_type();
        let elaborated = elaborate(&mapping, &q, &tpe).unwrap();
        assert_eq!(count_defers(&elaborated), 1);

        // The defer sits at `awards`, the second joined list on the path.
        let Query::Select { child, .. } = &elaborated else {
            panic!("expected movies select");
        };
        let Query::Select { name, child, .. } = child.as_ref() else {
            panic!("expected actors select");
        };
        assert_eq!(name, "actors");
        match child.as_ref() {
            Query::Wrap { name, child } => {
                assert_eq!(name, "awards");
                assert!(matches!(child.as_ref(), Query::Defer { .. }));
            }
            other => panic!("expected wrap, got {other:?}"),
        }
    }

    #[test]
    fn undiscriminated_interface_with_variant_field_defers_to_root() {
        let schema = Schema::new("Query")
            .with_object(
                "Query",
                &[],
                vec![field("media", Type::named("Media"))],
            )
            .with_interface(
                "Media",
                vec![
                    field("id", Type::non_null(Type::named("ID"))),
                    field("title", Type::named("String")),
                ],
            )
            .with_object(
                "Film",
                &["Media"],
                vec![
                    field("id", Type::non_null(Type::named("ID"))),
                    field("title", Type::named("String")),
                    field("runtime", Type::named("Int")),
                ],
            );
        let mapping = Mapping::new(schema)
            .with_object(ObjectMapping::new(
                "Query",
                vec![FieldMapping::joined_object("media", vec![])],
            ))
            .with_object(ObjectMapping::new(
                "Media",
                vec![
                    FieldMapping::column_field("id", col("media", "id")).key(),
                    FieldMapping::column_field("title", col("media", "title")),
                ],
            ))
            .with_object(ObjectMapping::new(
                "Film",
                vec![
                    FieldMapping::column_field("id", col("media", "id")).key(),
                    FieldMapping::column_field("runtime", col("media", "runtime")),
                ],
            ));

        let variant = Query::select(
            "media",
            Query::group(vec![
                Query::select("title", Query::Empty),
                Query::select("runtime", Query::Empty),
            ]),
        );
        let tpe = mapping.schema().query_type();
        let elaborated = elaborate(&mapping, &variant, &tpe).unwrap();
        match &elaborated {
            Query::Wrap { name, child } => {
                assert_eq!(name, "media");
                match child.as_ref() {
                    Query::Defer { parent_type, .. } => {
                        assert_eq!(parent_type.underlying(), "Query")
                    }
                    other => panic!("expected defer, got {other:?}"),
                }
            }
            other => panic!("expected wrap, got {other:?}"),
        }

        // Interface-declared fields alone do not defer.
        let plain = Query::select("media", Query::select("title", Query::Empty));
        let elaborated = elaborate(&mapping, &plain, &tpe).unwrap();
        assert_eq!(count_defers(&elaborated), 0);
    }

    #[test]
    fn plain_tree_queries_are_untouched() {
        let mapping = person_mapping();
        let tpe = mapping.schema().query_type();
        let q = Query::select(
            "person",
            Query::group(vec![
                Query::select("name", Query::Empty),
                Query::select("manager", Query::select("name", Query::Empty)),
            ]),
        );
        let elaborated = elaborate(&mapping, &q, &tpe).unwrap();
        assert_eq!(elaborated, q);
    }
}
