//! Boolean and arithmetic predicate algebra over paths and constants.
//!
//! Predicates appear in `Filter` nodes of the query algebra. Most compile to
//! parameterised SQL through the planner; predicates touching computed fields
//! or regular-expression matches are evaluated here, post-SQL, against
//! cursors.

use std::cmp::Ordering;
use std::fmt;

use regex::Regex;

use crate::error::{Result, TrellisError};
use crate::query::cursor::Cursor;
use crate::query::value::Cell;

/// A term in a predicate: a constant, a path into the mapped object graph,
/// or an operator applied in expression position.
#[derive(Clone, Debug, PartialEq)]
pub enum Term {
    /// Literal value, bound as a SQL parameter.
    Const(Cell),
    /// Field or attribute path relative to the enclosing filter context.
    Path(Vec<String>),
    ToUpperCase(Box<Term>),
    ToLowerCase(Box<Term>),
    /// Bitwise AND over integer terms.
    AndB(Box<Term>, Box<Term>),
    /// Bitwise OR over integer terms.
    OrB(Box<Term>, Box<Term>),
    /// Bitwise XOR over integer terms.
    XorB(Box<Term>, Box<Term>),
    /// Bitwise complement of an integer term.
    NotB(Box<Term>),
}

impl Term {
    pub fn path(segments: &[&str]) -> Term {
        Term::Path(segments.iter().map(|s| s.to_string()).collect())
    }

    pub fn constant(cell: impl Into<Cell>) -> Term {
        Term::Const(cell.into())
    }

    /// Collects every path referenced by this term into `out`.
    pub fn paths(&self, out: &mut Vec<Vec<String>>) {
        match self {
            Term::Const(_) => {}
            Term::Path(p) => {
                if !out.contains(p) {
                    out.push(p.clone());
                }
            }
            Term::ToUpperCase(t) | Term::ToLowerCase(t) | Term::NotB(t) => t.paths(out),
            Term::AndB(a, b) | Term::OrB(a, b) | Term::XorB(a, b) => {
                a.paths(out);
                b.paths(out);
            }
        }
    }

    /// Evaluates the term against a cursor. Unmatched join cells evaluate
    /// to `Null`.
    pub fn eval(&self, cursor: &Cursor) -> Result<Cell> {
        match self {
            Term::Const(cell) => Ok(cell.clone()),
            Term::Path(segments) => resolve_path(cursor, segments),
            Term::ToUpperCase(t) => map_string(t.eval(cursor)?, str::to_uppercase),
            Term::ToLowerCase(t) => map_string(t.eval(cursor)?, str::to_lowercase),
            Term::AndB(a, b) => int_binop(a.eval(cursor)?, b.eval(cursor)?, |x, y| x & y),
            Term::OrB(a, b) => int_binop(a.eval(cursor)?, b.eval(cursor)?, |x, y| x | y),
            Term::XorB(a, b) => int_binop(a.eval(cursor)?, b.eval(cursor)?, |x, y| x ^ y),
            Term::NotB(t) => match t.eval(cursor)? {
                Cell::Int(x) => Ok(Cell::Int(!x)),
                other => Err(TrellisError::internal(format!(
                    "bitwise complement of non-integer cell {other:?}"
                ))),
            },
        }
    }
}

fn map_string(cell: Cell, f: impl Fn(&str) -> String) -> Result<Cell> {
    match cell {
        Cell::String(s) => Ok(Cell::String(f(&s))),
        Cell::Null | Cell::FailedJoin => Ok(Cell::Null),
        other => Err(TrellisError::internal(format!(
            "case mapping over non-string cell {other:?}"
        ))),
    }
}

fn int_binop(a: Cell, b: Cell, f: impl Fn(i64, i64) -> i64) -> Result<Cell> {
    match (a, b) {
        (Cell::Int(x), Cell::Int(y)) => Ok(Cell::Int(f(x, y))),
        (a, b) => Err(TrellisError::internal(format!(
            "bitwise operator over non-integer cells {a:?}, {b:?}"
        ))),
    }
}

fn resolve_path(cursor: &Cursor, segments: &[String]) -> Result<Cell> {
    let mut cur = cursor.clone();
    for (i, seg) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        if last && cur.has_attribute(seg) {
            let cell = cur.attribute(seg)?;
            return Ok(normalize_absent(cell));
        }
        cur = cur.field(seg)?;
    }
    Ok(normalize_absent(cur.as_leaf()?.clone()))
}

fn normalize_absent(cell: Cell) -> Cell {
    if matches!(cell, Cell::FailedJoin) {
        Cell::Null
    } else {
        cell
    }
}

/// A compiled regular expression with structural equality on its source.
#[derive(Clone, Debug)]
pub struct MatchPattern(pub Regex);

impl MatchPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(MatchPattern)
            .map_err(|e| TrellisError::predicate(format!("invalid match pattern: {e}")))
    }
}

impl PartialEq for MatchPattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

impl fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_str())
    }
}

/// Boolean predicate over terms.
#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
    Not(Box<Predicate>),
    Eql(Term, Term),
    NEql(Term, Term),
    Lt(Term, Term),
    LtEql(Term, Term),
    Gt(Term, Term),
    GtEql(Term, Term),
    /// Membership in a literal list; the list must be non-empty to compile.
    In(Term, Vec<Cell>),
    /// Membership of `y` in the (possibly array-valued) term `x`.
    Contains(Term, Term),
    Like {
        term: Term,
        pattern: String,
        case_insensitive: bool,
    },
    StartsWith(Term, String),
    /// Regular-expression match; never compiled to SQL.
    Matches(Term, MatchPattern),
}

impl Predicate {
    pub fn and(a: Predicate, b: Predicate) -> Predicate {
        Predicate::And(Box::new(a), Box::new(b))
    }

    pub fn or(a: Predicate, b: Predicate) -> Predicate {
        Predicate::Or(Box::new(a), Box::new(b))
    }

    pub fn not(p: Predicate) -> Predicate {
        Predicate::Not(Box::new(p))
    }

    /// Conjunction of a non-empty list of predicates, left-associated.
    pub fn all(mut preds: Vec<Predicate>) -> Option<Predicate> {
        let first = if preds.is_empty() {
            return None;
        } else {
            preds.remove(0)
        };
        Some(preds.into_iter().fold(first, Predicate::and))
    }

    /// The set of paths this predicate references, in first-occurrence order.
    pub fn paths(&self) -> Vec<Vec<String>> {
        let mut out = Vec::new();
        self.collect_paths(&mut out);
        out
    }

    fn collect_paths(&self, out: &mut Vec<Vec<String>>) {
        match self {
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.collect_paths(out);
                b.collect_paths(out);
            }
            Predicate::Not(p) => p.collect_paths(out),
            Predicate::Eql(a, b)
            | Predicate::NEql(a, b)
            | Predicate::Lt(a, b)
            | Predicate::LtEql(a, b)
            | Predicate::Gt(a, b)
            | Predicate::GtEql(a, b)
            | Predicate::Contains(a, b) => {
                a.paths(out);
                b.paths(out);
            }
            Predicate::In(t, _)
            | Predicate::Like { term: t, .. }
            | Predicate::StartsWith(t, _)
            | Predicate::Matches(t, _) => t.paths(out),
        }
    }

    /// Whether a regular-expression match occurs anywhere in the predicate.
    pub fn contains_matches(&self) -> bool {
        match self {
            Predicate::Matches(_, _) => true,
            Predicate::And(a, b) | Predicate::Or(a, b) => {
                a.contains_matches() || b.contains_matches()
            }
            Predicate::Not(p) => p.contains_matches(),
            _ => false,
        }
    }

    /// Post-SQL evaluation against a cursor.
    pub fn eval(&self, cursor: &Cursor) -> Result<bool> {
        match self {
            Predicate::And(a, b) => Ok(a.eval(cursor)? && b.eval(cursor)?),
            Predicate::Or(a, b) => Ok(a.eval(cursor)? || b.eval(cursor)?),
            Predicate::Not(p) => Ok(!p.eval(cursor)?),
            Predicate::Eql(a, b) => Ok(cells_equal(&a.eval(cursor)?, &b.eval(cursor)?)),
            Predicate::NEql(a, b) => Ok(!cells_equal(&a.eval(cursor)?, &b.eval(cursor)?)),
            Predicate::Lt(a, b) => ordered(cursor, a, b, |o| o == Ordering::Less),
            Predicate::LtEql(a, b) => ordered(cursor, a, b, |o| o != Ordering::Greater),
            Predicate::Gt(a, b) => ordered(cursor, a, b, |o| o == Ordering::Greater),
            Predicate::GtEql(a, b) => ordered(cursor, a, b, |o| o != Ordering::Less),
            Predicate::In(t, values) => {
                let v = t.eval(cursor)?;
                Ok(values.iter().any(|c| cells_equal(c, &v)))
            }
            Predicate::Contains(x, y) => {
                let xs = x.eval(cursor)?;
                let v = y.eval(cursor)?;
                match xs {
                    Cell::List(items) => Ok(items.iter().any(|c| cells_equal(c, &v))),
                    other => Ok(cells_equal(&other, &v)),
                }
            }
            Predicate::Like {
                term,
                pattern,
                case_insensitive,
            } => match term.eval(cursor)? {
                Cell::String(s) => Ok(like_match(&s, pattern, *case_insensitive)),
                _ => Ok(false),
            },
            Predicate::StartsWith(t, prefix) => match t.eval(cursor)? {
                Cell::String(s) => Ok(s.starts_with(prefix.as_str())),
                _ => Ok(false),
            },
            Predicate::Matches(t, pattern) => match t.eval(cursor)? {
                Cell::String(s) => Ok(pattern.0.is_match(&s)),
                _ => Ok(false),
            },
        }
    }
}

fn cells_equal(a: &Cell, b: &Cell) -> bool {
    if a.is_absent() && b.is_absent() {
        return true;
    }
    matches!(a.partial_cmp(b), Some(Ordering::Equal)) || a == b
}

fn ordered(
    cursor: &Cursor,
    a: &Term,
    b: &Term,
    accept: impl Fn(Ordering) -> bool,
) -> Result<bool> {
    let va = a.eval(cursor)?;
    let vb = b.eval(cursor)?;
    Ok(va.partial_cmp(&vb).map(accept).unwrap_or(false))
}

/// SQL `LIKE` semantics: `%` matches any run, `_` matches one character.
fn like_match(s: &str, pattern: &str, case_insensitive: bool) -> bool {
    let mut rx = String::with_capacity(pattern.len() + 8);
    if case_insensitive {
        rx.push_str("(?i)");
    }
    rx.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => rx.push_str(".*"),
            '_' => rx.push('.'),
            other => rx.push_str(&regex::escape(&other.to_string())),
        }
    }
    rx.push('$');
    Regex::new(&rx).map(|r| r.is_match(s)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_unioned_in_first_occurrence_order() {
        let p = Predicate::and(
            Predicate::Eql(Term::path(&["b"]), Term::constant(1i64)),
            Predicate::or(
                Predicate::Lt(Term::path(&["a"]), Term::constant(2i64)),
                Predicate::Gt(Term::path(&["b"]), Term::constant(0i64)),
            ),
        );
        assert_eq!(
            p.paths(),
            vec![vec!["b".to_string()], vec!["a".to_string()]]
        );
    }

    #[test]
    fn matches_is_detected_under_connectives() {
        let p = Predicate::not(Predicate::and(
            Predicate::Eql(Term::path(&["a"]), Term::constant(1i64)),
            Predicate::Matches(Term::path(&["a"]), MatchPattern::new("^x").unwrap()),
        ));
        assert!(p.contains_matches());
    }

    #[test]
    fn like_translates_sql_wildcards() {
        assert!(like_match("The Matrix", "The %", false));
        assert!(like_match("cat", "c_t", false));
        assert!(!like_match("cart", "c_t", false));
        assert!(like_match("CAT", "cat", true));
        assert!(!like_match("CAT", "cat", false));
        // Regex metacharacters in the pattern are literal.
        assert!(like_match("a.b", "a.b", false));
        assert!(!like_match("axb", "a.b", false));
    }

    #[test]
    fn all_folds_left() {
        let a = Predicate::Eql(Term::path(&["a"]), Term::constant(1i64));
        let b = Predicate::Eql(Term::path(&["b"]), Term::constant(2i64));
        let c = Predicate::Eql(Term::path(&["c"]), Term::constant(3i64));
        let folded = Predicate::all(vec![a.clone(), b.clone(), c.clone()]).unwrap();
        assert_eq!(folded, Predicate::and(Predicate::and(a, b), c));
        assert!(Predicate::all(vec![]).is_none());
    }
}
