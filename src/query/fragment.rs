//! Accumulator for parameterised SQL text with typed bind slots.
//!
//! A [`Fragment`] is an opaque pair of SQL text and bind list with an
//! associative concatenation and an empty identity. Constants never appear
//! in the text; they travel in the bind list with the codec that encodes
//! them.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};
use crate::query::mapping::Codec;
use crate::query::value::Cell;

/// One bind slot: the value and the codec that encodes it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bind {
    pub value: Cell,
    pub codec: Codec,
}

/// Parameterised SQL text plus its bind list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    sql: String,
    binds: Vec<Bind>,
}

impl Fragment {
    pub fn empty() -> Fragment {
        Fragment::default()
    }

    /// Literal SQL text with no binds.
    pub fn lit(sql: impl Into<String>) -> Fragment {
        Fragment {
            sql: sql.into(),
            binds: Vec::new(),
        }
    }

    /// A single `?` placeholder bound to `value` with `codec`.
    pub fn bind(codec: Codec, value: Cell) -> Fragment {
        Fragment {
            sql: "?".to_string(),
            binds: vec![Bind { value, codec }],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn binds(&self) -> &[Bind] {
        &self.binds
    }

    /// Associative concatenation.
    pub fn append(mut self, other: Fragment) -> Fragment {
        self.sql.push_str(&other.sql);
        self.binds.extend(other.binds);
        self
    }

    /// Concatenates non-empty fragments with a separator.
    pub fn join(parts: impl IntoIterator<Item = Fragment>, sep: &str) -> Fragment {
        let mut out = Fragment::empty();
        for part in parts {
            if part.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.sql.push_str(sep);
            }
            out = out.append(part);
        }
        out
    }

    /// Joins non-empty fragments with `AND`, parenthesising each.
    pub fn and_opt(parts: impl IntoIterator<Item = Fragment>) -> Fragment {
        Fragment::join(parts.into_iter().map(Fragment::parenthesize), " AND ")
    }

    /// Joins non-empty fragments with `OR`, parenthesising each.
    pub fn or_opt(parts: impl IntoIterator<Item = Fragment>) -> Fragment {
        Fragment::join(parts.into_iter().map(Fragment::parenthesize), " OR ")
    }

    /// `WHERE` clause over the conjunction of non-empty fragments, or the
    /// empty fragment when none remain. The conjuncts are joined bare; each
    /// compiled predicate is already self-delimiting.
    pub fn where_and_opt(parts: impl IntoIterator<Item = Fragment>) -> Fragment {
        let body = Fragment::join(parts, " AND ");
        if body.is_empty() {
            body
        } else {
            Fragment::lit("WHERE ").append(body)
        }
    }

    /// `lhs IN (?, ?, …)`; an empty value list fails compilation.
    pub fn in_list(lhs: Fragment, values: &[Cell], codec: &Codec) -> Result<Fragment> {
        if values.is_empty() {
            return Err(TrellisError::predicate("IN with an empty value list"));
        }
        let placeholders = values
            .iter()
            .map(|v| Fragment::bind(codec.clone(), v.clone()));
        Ok(lhs
            .append(Fragment::lit(" IN ("))
            .append(Fragment::join(placeholders, ", "))
            .append(Fragment::lit(")")))
    }

    fn parenthesize(self) -> Fragment {
        if self.is_empty() {
            self
        } else {
            Fragment::lit("(").append(self).append(Fragment::lit(")"))
        }
    }
}
