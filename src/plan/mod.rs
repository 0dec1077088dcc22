//! Placeholder rewriting.
//!
//! Callers write SQL with `?` or `:name` placeholders; PostgreSQL accepts
//! only `$N`. [`PlanInfo`] rewrites a command into canonical form in a single
//! byte-wise pass per placeholder style and records how caller parameters map
//! onto the `$N` positions. Edge bytes are whitelisted so placeholders inside
//! string literals, `::type` casts and array syntax are left untouched.

mod cache;
mod classify;

pub use cache::{CachedPlan, DEFAULT_PLAN_CACHE_SIZE, MAX_PLAN_CACHE_SIZE, PlanCache};

use std::collections::HashMap;

use classify::{named_placeholder_length, numbered_next_ok, numbered_prev_ok};

use crate::error::Error;
use crate::query::WireParam;
use crate::value::{ParamValue, QueryParams};

/// Placeholder style detected in a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderKind {
    /// `?` placeholders, bound by position.
    Numbered,
    /// `:name` placeholders, bound by name.
    Named,
}

/// A caller command analysed for placeholders: the original text, the `$N`
/// rewrite, and the parameter mapping needed to bind caller values.
#[derive(Debug, Clone)]
pub struct PlanInfo {
    sql: String,
    rewritten: String,
    kind: PlaceholderKind,
    names: Vec<String>,
    parameter_count: usize,
}

impl PlanInfo {
    /// Analyse a command.
    ///
    /// # Errors
    /// Fails when the command mixes `?` and `:name` placeholders.
    pub fn new(sql: impl Into<String>) -> Result<Self, Error> {
        let sql = sql.into();
        let (numbered_rewrite, numbered_count) = parse_numbered(&sql);
        let (named_rewrite, names) = parse_named(&sql);

        if !names.is_empty() && numbered_count > 0 {
            return Err(Error::Parse(
                "mixed named and numbered placeholders".to_string(),
            ));
        }

        if names.is_empty() {
            Ok(PlanInfo {
                sql,
                rewritten: numbered_rewrite,
                kind: PlaceholderKind::Numbered,
                names,
                parameter_count: numbered_count,
            })
        } else {
            let parameter_count = names.len();
            Ok(PlanInfo {
                sql,
                rewritten: named_rewrite,
                kind: PlaceholderKind::Named,
                names,
                parameter_count,
            })
        }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The command in canonical `$N` form.
    #[must_use]
    pub fn rewritten(&self) -> &str {
        &self.rewritten
    }

    #[must_use]
    pub fn kind(&self) -> PlaceholderKind {
        self.kind
    }

    /// Distinct placeholder names in first-appearance order; empty for
    /// numbered commands.
    #[must_use]
    pub fn names(&self) -> &[String] {
        &self.names
    }

    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    /// Bind caller parameters to the `$N` positions, in wire text form.
    ///
    /// # Errors
    /// `ParameterCountMismatch` when the number of values differs from the
    /// number of placeholders; `MissingParameter` when a position or name
    /// cannot be resolved.
    pub fn map_parameters(&self, params: &QueryParams) -> Result<Vec<WireParam>, Error> {
        if params.len() != self.parameter_count {
            return Err(Error::ParameterCountMismatch {
                expected: self.parameter_count,
                got: params.len(),
            });
        }

        match self.kind {
            PlaceholderKind::Numbered => self.map_numbered(params),
            PlaceholderKind::Named => self.map_named(params),
        }
    }

    fn map_numbered(&self, params: &QueryParams) -> Result<Vec<WireParam>, Error> {
        match params {
            QueryParams::None => Ok(Vec::new()),
            QueryParams::Positional(values) => {
                Ok(values.iter().map(ParamValue::to_wire_text).collect())
            }
            // Maps bind to numbered placeholders through decimal keys, the
            // way positional arrays behave in the scripting hosts this serves.
            QueryParams::Named(values) => (0..self.parameter_count)
                .map(|i| {
                    let key = i.to_string();
                    values
                        .get(&key)
                        .map(ParamValue::to_wire_text)
                        .ok_or(Error::MissingParameter(key))
                })
                .collect(),
        }
    }

    fn map_named(&self, params: &QueryParams) -> Result<Vec<WireParam>, Error> {
        let QueryParams::Named(values) = params else {
            // A positional sequence cannot satisfy a named command.
            return Err(Error::MissingParameter(
                self.names.first().cloned().unwrap_or_default(),
            ));
        };

        self.names
            .iter()
            .map(|name| {
                values
                    .get(name)
                    .map(ParamValue::to_wire_text)
                    .ok_or_else(|| Error::MissingParameter(name.clone()))
            })
            .collect()
    }
}

fn find_from(bytes: &[u8], needle: u8, from: usize) -> Option<usize> {
    bytes[from..].iter().position(|&b| b == needle).map(|i| from + i)
}

fn parse_numbered(sql: &str) -> (String, usize) {
    let bytes = sql.as_bytes();
    let mut rewritten = String::with_capacity(sql.len() + (sql.len() >> 1));
    let mut count: usize = 0;
    let mut pos = 0;
    let mut last_written = 0;

    while let Some(found) = find_from(bytes, b'?', pos) {
        rewritten.push_str(&sql[last_written..found]);
        last_written = found + 1;
        pos = found + 1;

        if numbered_prev_ok(bytes, found) && numbered_next_ok(bytes, found) {
            count += 1;
            rewritten.push('$');
            rewritten.push_str(&count.to_string());
        } else {
            rewritten.push('?');
        }
    }

    rewritten.push_str(&sql[last_written..]);
    (rewritten, count)
}

fn parse_named(sql: &str) -> (String, Vec<String>) {
    let bytes = sql.as_bytes();
    let mut names: Vec<String> = Vec::new();
    let mut numbers: HashMap<String, usize> = HashMap::new();
    let mut rewritten = String::with_capacity(sql.len() + (sql.len() >> 1));
    let mut pos = 0;
    let mut last_written = 0;

    while let Some(found) = find_from(bytes, b':', pos) {
        rewritten.push_str(&sql[last_written..found]);
        last_written = found + 1;
        pos = found + 1;

        let len = named_placeholder_length(bytes, found);
        if len > 0 {
            let name = &sql[found + 1..found + 1 + len];
            let number = *numbers.entry(name.to_string()).or_insert_with(|| {
                names.push(name.to_string());
                names.len()
            });
            rewritten.push('$');
            rewritten.push_str(&number.to_string());

            pos += len;
            last_written += len;
        } else {
            rewritten.push(':');
        }
    }

    rewritten.push_str(&sql[last_written..]);
    (rewritten, names)
}
