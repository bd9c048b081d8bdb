//! End-to-end scenarios over the movies mapping: keyed lookup, IN-list
//! selection, range filters, computed-field post-filtering, and sibling
//! coalescing.

use std::sync::{Arc, Mutex};

use serde_json::json;

use trellis::error::TrellisError;
use trellis::query::fragment::Fragment;
use trellis::query::interpreter::{InterpreterConfig, QueryInterpreter};
use trellis::query::mapping::{Codec, ColumnRef, ComputeFn, FieldMapping, Mapping, ObjectMapping};
use trellis::query::monitor::RecordingMonitor;
use trellis::query::planner::{ColumnMeta, MappedQuery};
use trellis::query::predicate::{Predicate, Term};
use trellis::query::value::{Cell, Table};
use trellis::query::{Query, SqlDriver};
use trellis::schema::{field, Schema, Type};
use trellis::Result;

const UUID_1: &str = "6a7837fc-b463-4d32-b628-0f4b3065cb21";
const UUID_2: &str = "2a40415c-ea6a-413f-bbef-a80ae280c4ff";
const UUID_3: &str = "e4bf1feb-e7ba-4e2d-b9a6-ba1dd10e3bb6";
const UUID_4: &str = "8ae5b13b-044c-4ff0-8b71-ccdb7d77cd88";
const UUID_5: &str = "9387ebcf-8faa-4d61-b35b-f01ba5fd5e5a";

fn movies_schema() -> Schema {
    Schema::new("Query")
        .with_scalar("Date")
        .with_enum("Genre", &["DRAMA", "ACTION", "COMEDY"])
        .with_object(
            "Query",
            &[],
            vec![
                field("movieById", Type::named("Movie")),
                field(
                    "moviesByGenres",
                    Type::list(Type::non_null(Type::named("Movie"))),
                ),
                field(
                    "moviesReleasedBetween",
                    Type::list(Type::non_null(Type::named("Movie"))),
                ),
                field(
                    "longMovies",
                    Type::list(Type::non_null(Type::named("Movie"))),
                ),
            ],
        )
        .with_object(
            "Movie",
            &[],
            vec![
                field("id", Type::non_null(Type::named("ID"))),
                field("title", Type::non_null(Type::named("String"))),
                field("genre", Type::non_null(Type::named("Genre"))),
                field("releasedate", Type::non_null(Type::named("Date"))),
                field("duration", Type::non_null(Type::named("Int"))),
                field(
                    "categories",
                    Type::non_null(Type::list(Type::non_null(Type::named("String")))),
                ),
                field("isLong", Type::non_null(Type::named("Boolean"))),
            ],
        )
}

fn col(column: &str, codec: Codec) -> ColumnRef {
    ColumnRef::new("movies", column, codec)
}

fn movies_mapping() -> Arc<Mapping> {
    let is_long = ComputeFn::new(|cursor| {
        match cursor.cell(&ColumnRef::new("movies", "duration", Codec::Int))? {
            Cell::Int(minutes) => Ok(Cell::Bool(minutes >= 180)),
            other => Err(TrellisError::internal(format!(
                "unexpected duration cell {other:?}"
            ))),
        }
    });
    let root_fields = ["movieById", "moviesByGenres", "moviesReleasedBetween", "longMovies"]
        .into_iter()
        .map(|name| FieldMapping::joined_object(name, vec![]))
        .collect();
    Arc::new(
        Mapping::new(movies_schema())
            .with_object(ObjectMapping::new("Query", root_fields))
            .with_object(ObjectMapping::new(
                "Movie",
                vec![
                    FieldMapping::column_field("id", col("id", Codec::Uuid)).key(),
                    FieldMapping::column_field("title", col("title", Codec::Str)),
                    FieldMapping::column_field("genre", col("genre", Codec::Str)),
                    FieldMapping::column_field("releasedate", col("releasedate", Codec::Date)),
                    FieldMapping::column_field("duration", col("duration", Codec::Int)),
                    FieldMapping::column_field(
                        "categories",
                        col("categories", Codec::Array(Box::new(Codec::Str))),
                    ),
                    FieldMapping::computed_field("isLong", &["duration"], is_long),
                ],
            ))
            .with_leaf("Genre", Codec::Str),
    )
}

/// One movie fixture row: (id, title, genre, releasedate, duration).
type MovieRow = (&'static str, &'static str, &'static str, &'static str, i64);

const MOVIES: &[MovieRow] = &[
    (UUID_1, "Celine et Julie Vont en Bateau", "DRAMA", "1974-10-07", 192),
    (UUID_2, "Duelle", "DRAMA", "1975-09-15", 121),
    (UUID_3, "L'Amour fou", "DRAMA", "1969-01-15", 252),
    (UUID_4, "Last Year at Marienbad", "DRAMA", "1961-06-25", 94),
    (UUID_5, "Zazie dans le Metro", "COMEDY", "1960-10-28", 89),
];

/// Serves the movies fixture, projecting whatever columns the statement
/// asks for and applying simple id/genre restrictions from the binds.
struct FixtureDriver {
    calls: Mutex<Vec<String>>,
}

impl FixtureDriver {
    fn new() -> Self {
        FixtureDriver {
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn cell_for(&self, movie: &MovieRow, column: &str) -> Cell {
        match column {
            "id" => Cell::String(movie.0.to_string()),
            "title" => Cell::String(movie.1.to_string()),
            "genre" => Cell::String(movie.2.to_string()),
            "releasedate" => Cell::String(movie.3.to_string()),
            "duration" => Cell::Int(movie.4),
            "categories" => Cell::List(vec![Cell::String("feature".into())]),
            other => panic!("fixture has no column movies.{other}"),
        }
    }
}

impl SqlDriver for FixtureDriver {
    fn fetch(&self, fragment: &Fragment, metas: &[ColumnMeta]) -> Result<Table> {
        self.calls.lock().unwrap().push(fragment.sql().to_string());
        let sql = fragment.sql();
        let projected: Vec<&str> = sql
            .strip_prefix("SELECT ")
            .and_then(|rest| rest.split(" FROM ").next())
            .expect("well-formed select")
            .split(", ")
            .map(|c| c.strip_prefix("movies.").expect("movies column"))
            .collect();
        assert_eq!(projected.len(), metas.len());
        let wanted: Vec<String> = fragment
            .binds()
            .iter()
            .map(|b| b.value.to_string())
            .collect();
        let rows = MOVIES
            .iter()
            .filter(|movie| {
                if sql.contains("movies.id IN") || sql.contains("movies.id = ?") {
                    wanted.iter().any(|w| w == movie.0)
                } else if sql.contains("movies.genre IN") {
                    wanted.iter().any(|w| w == movie.2)
                } else {
                    true
                }
            })
            .map(|movie| {
                projected
                    .iter()
                    .map(|column| self.cell_for(movie, column))
                    .collect()
            })
            .collect();
        Ok(rows)
    }
}

fn movie_by_id_query(id: &str) -> Query {
    Query::select(
        "movieById",
        Query::filter(
            Predicate::Eql(Term::path(&["id"]), Term::constant(id)),
            Query::group(vec![
                Query::select("title", Query::Empty),
                Query::select("genre", Query::Empty),
            ]),
        ),
    )
}

#[test]
fn movie_by_id_compiles_to_a_keyed_select() {
    let mapping = movies_mapping();
    let q = movie_by_id_query(UUID_1);
    let tpe = mapping.schema().query_type();
    let mapped = MappedQuery::build(&q, &[], &tpe, &mapping).unwrap();
    let fragment = mapped.fragment().unwrap();
    assert_eq!(
        fragment.sql(),
        "SELECT movies.id, movies.title, movies.genre FROM movies WHERE movies.id = ?"
    );
    assert_eq!(fragment.binds().len(), 1);
    assert_eq!(fragment.binds()[0].codec, Codec::Uuid);
    assert_eq!(fragment.binds()[0].value, Cell::String(UUID_1.into()));
}

#[test]
fn movie_by_id_runs_end_to_end() {
    let mapping = movies_mapping();
    let driver = Arc::new(FixtureDriver::new());
    let interpreter = QueryInterpreter::new(mapping.clone(), driver.clone());
    let result = interpreter
        .run(&movie_by_id_query(UUID_1), &mapping.schema().query_type())
        .unwrap();
    assert_eq!(
        result,
        json!({
            "movieById": {
                "title": "Celine et Julie Vont en Bateau",
                "genre": "DRAMA"
            }
        })
    );
    assert_eq!(driver.calls().len(), 1);
}

#[test]
fn movies_by_genres_compiles_to_an_in_list() {
    let mapping = movies_mapping();
    let q = Query::select(
        "moviesByGenres",
        Query::filter(
            Predicate::In(
                Term::path(&["genre"]),
                vec![Cell::String("ACTION".into()), Cell::String("COMEDY".into())],
            ),
            Query::select("title", Query::Empty),
        ),
    );
    let tpe = mapping.schema().query_type();
    let fragment = MappedQuery::build(&q, &[], &tpe, &mapping)
        .unwrap()
        .fragment()
        .unwrap();
    assert_eq!(
        fragment.sql(),
        "SELECT movies.id, movies.title, movies.genre FROM movies WHERE movies.genre IN (?, ?)"
    );
    assert_eq!(fragment.binds().len(), 2);

    let driver = Arc::new(FixtureDriver::new());
    let interpreter = QueryInterpreter::new(mapping.clone(), driver);
    let result = interpreter.run(&q, &tpe).unwrap();
    assert_eq!(
        result,
        json!({ "moviesByGenres": [ { "title": "Zazie dans le Metro" } ] })
    );
}

#[test]
fn released_between_compiles_to_a_half_open_range() {
    let mapping = movies_mapping();
    let q = Query::select(
        "moviesReleasedBetween",
        Query::filter(
            Predicate::not(Predicate::Lt(
                Term::path(&["releasedate"]),
                Term::constant("1970-01-01"),
            )),
            Query::filter(
                Predicate::Lt(
                    Term::path(&["releasedate"]),
                    Term::constant("1975-01-01"),
                ),
                Query::select("title", Query::Empty),
            ),
        ),
    );
    let tpe = mapping.schema().query_type();
    let fragment = MappedQuery::build(&q, &[], &tpe, &mapping)
        .unwrap()
        .fragment()
        .unwrap();
    assert!(fragment.sql().ends_with(
        "WHERE NOT (movies.releasedate < ?) AND movies.releasedate < ?"
    ));
    assert_eq!(fragment.binds().len(), 2);
    assert_eq!(fragment.binds()[0].codec, Codec::Date);
    assert_eq!(fragment.binds()[0].value, Cell::String("1970-01-01".into()));
    assert_eq!(fragment.binds()[1].value, Cell::String("1975-01-01".into()));
}

#[test]
fn long_movies_project_duration_and_filter_post_fetch() {
    let mapping = movies_mapping();
    let q = Query::select(
        "longMovies",
        Query::filter(
            Predicate::Eql(Term::path(&["isLong"]), Term::constant(true)),
            Query::select("title", Query::Empty),
        ),
    );
    let tpe = mapping.schema().query_type();
    let mapped = MappedQuery::build(&q, &[], &tpe, &mapping).unwrap();
    let fragment = mapped.fragment().unwrap();
    // duration rides along for the computed field; the predicate stays out
    // of the WHERE clause.
    assert_eq!(
        fragment.sql(),
        "SELECT movies.id, movies.title, movies.duration FROM movies"
    );
    assert!(fragment.binds().is_empty());

    let driver = Arc::new(FixtureDriver::new());
    let interpreter = QueryInterpreter::new(mapping.clone(), driver);
    let result = interpreter.run(&q, &tpe).unwrap();
    // Group order follows the stringified key projection (the UUID text).
    assert_eq!(
        result,
        json!({
            "longMovies": [
                { "title": "Celine et Julie Vont en Bateau" },
                { "title": "L'Amour fou" }
            ]
        })
    );
}

#[test]
fn starts_with_binds_the_prefix_pattern() {
    let mapping = movies_mapping();
    let q = Query::select(
        "moviesByGenres",
        Query::filter(
            Predicate::StartsWith(Term::path(&["title"]), "Duel".into()),
            Query::select("title", Query::Empty),
        ),
    );
    let tpe = mapping.schema().query_type();
    let fragment = MappedQuery::build(&q, &[], &tpe, &mapping)
        .unwrap()
        .fragment()
        .unwrap();
    assert!(fragment.sql().ends_with("WHERE movies.title LIKE ?"));
    assert_eq!(fragment.binds()[0].value, Cell::String("Duel%".into()));
}

#[test]
fn array_columns_decode_as_json_arrays() {
    let mapping = movies_mapping();
    let q = Query::select(
        "movieById",
        Query::filter(
            Predicate::Eql(Term::path(&["id"]), Term::constant(UUID_2)),
            Query::select("categories", Query::Empty),
        ),
    );
    let driver = Arc::new(FixtureDriver::new());
    let interpreter = QueryInterpreter::new(mapping.clone(), driver);
    let result = interpreter.run(&q, &mapping.schema().query_type()).unwrap();
    assert_eq!(result, json!({ "movieById": { "categories": ["feature"] } }));
}

#[test]
fn missing_movie_resolves_to_null() {
    let mapping = movies_mapping();
    let driver = Arc::new(FixtureDriver::new());
    let interpreter = QueryInterpreter::new(mapping.clone(), driver);
    let absent = "00000000-0000-0000-0000-000000000000";
    let result = interpreter
        .run(&movie_by_id_query(absent), &mapping.schema().query_type())
        .unwrap();
    assert_eq!(result, json!({ "movieById": null }));
}

#[test]
fn sibling_lookups_coalesce_into_one_in_list() {
    let mapping = movies_mapping();
    let tpe = mapping.schema().query_type();
    let ids = [UUID_1, UUID_2, UUID_3, UUID_4, UUID_5];
    let queries: Vec<(Query, Type)> = ids
        .iter()
        .map(|id| {
            (
                Query::context(&[], movie_by_id_query(id)),
                tpe.clone(),
            )
        })
        .collect();

    let coalesced_driver = Arc::new(FixtureDriver::new());
    let monitor = Arc::new(RecordingMonitor::new());
    let coalesced = QueryInterpreter::new(mapping.clone(), coalesced_driver.clone())
        .with_monitor(monitor.clone());
    let coalesced_results: Vec<_> = coalesced
        .run_root_queries(&queries)
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let calls = coalesced_driver.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0],
        "SELECT movies.id, movies.title, movies.genre FROM movies \
         WHERE movies.id IN (?, ?, ?, ?, ?)"
    );
    let snapshot = monitor.snapshot();
    assert_eq!(snapshot.queries_mapped, 1);
    assert_eq!(snapshot.results_computed, 5);

    // Scattered results line up with the request order.
    assert_eq!(
        coalesced_results[4],
        json!({ "movieById": { "title": "Zazie dans le Metro", "genre": "COMEDY" } })
    );

    // Running the same queries uncoalesced gives identical results.
    let individual_driver = Arc::new(FixtureDriver::new());
    let individual = QueryInterpreter::new(mapping.clone(), individual_driver.clone())
        .with_config(InterpreterConfig {
            coalesce: false,
            ..InterpreterConfig::default()
        });
    let individual_results: Vec<_> = individual
        .run_root_queries(&queries)
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    assert_eq!(individual_driver.calls().len(), 5);
    assert_eq!(coalesced_results, individual_results);
}

#[test]
fn empty_in_list_fails_compilation() {
    let mapping = movies_mapping();
    let q = Query::select(
        "moviesByGenres",
        Query::filter(
            Predicate::In(Term::path(&["genre"]), vec![]),
            Query::select("title", Query::Empty),
        ),
    );
    let tpe = mapping.schema().query_type();
    let err = MappedQuery::build(&q, &[], &tpe, &mapping)
        .unwrap()
        .fragment()
        .unwrap_err();
    assert!(matches!(err, TrellisError::Predicate(_)));
}
