//! AST → SQL fragment compiler.
//!
//! One traversal, shared by every backend; only leaf emission goes through
//! the [`Dialect`] trait. The compiler produces a boolean predicate, the
//! ORDER BY / LIMIT / OFFSET clauses, and the positional parameter list the
//! caller must bind; operand values are never interpolated into the SQL
//! text.
//!
//! Operand dispatch is type-driven over the closed [`Param`] variants:
//! strings compare against the textual extraction directly, numeric and
//! boolean operands cast the extracted value first, and a null operand
//! rewrites `=` / `!=` to `IS NULL` / `IS NOT NULL` with the operand elided
//! from the parameter list entirely. Placeholders resolve against the bound
//! parameters once, then follow the same rules.
//!
//! Bind failures are accumulated across the whole pass, so a caller sees
//! every bad placeholder in one error rather than only the first.

use thiserror::Error;

use super::dialect::{CastType, Dialect};
use super::types::{
    CompareOp, Conjunction, Disjunction, Operand, OrderBy, OrderKey, Param, Predicate, Query, Term,
};

/// A single bind failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindError {
    #[error("placeholder ${index} out of range for {supplied} bound parameter(s)")]
    OutOfRange { index: usize, supplied: usize },
    #[error("null operand is not comparable with '{op}'")]
    NullComparison { op: &'static str },
}

/// All bind failures detected during one compile pass.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}", render(.errors))]
pub struct CompileError {
    pub errors: Vec<BindError>,
}

fn render(errors: &[BindError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Compiled output: SQL pieces plus the values to bind positionally.
///
/// `params` indices start after `param_offset` (see [`compile`]), so the
/// store can bind its own tenant/collection parameters first.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Parenthesized boolean expression, safe to AND onto other predicates.
    pub predicate: String,
    /// Full `ORDER BY ...` text, when the query ordered.
    pub order_by: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Values to bind, in placeholder order.
    pub params: Vec<Param>,
}

impl Fragment {
    /// ORDER BY / LIMIT / OFFSET tail, each piece prefixed with a space.
    pub fn clauses(&self) -> String {
        let mut sql = String::new();
        if let Some(order) = &self.order_by {
            sql.push(' ');
            sql.push_str(order);
        }
        if let Some(n) = self.limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }
        if let Some(n) = self.offset {
            sql.push_str(&format!(" OFFSET {n}"));
        }
        sql
    }
}

/// Compile one parsed query for the given dialect.
///
/// `column` is the JSON document column. `param_offset` is the number of
/// bind parameters the caller reserves ahead of the fragment's own; emitted
/// placeholder indices start at `param_offset + 1`.
pub fn compile(
    query: &Query,
    dialect: &dyn Dialect,
    bound: &[Param],
    column: &str,
    param_offset: usize,
) -> Result<Fragment, CompileError> {
    let mut compiler = Compiler {
        dialect,
        bound,
        column,
        next_index: param_offset + 1,
        params: Vec::new(),
        errors: Vec::new(),
    };

    let predicate = format!("({})", compiler.disjunction(&query.filter));
    let order_by = query.order_by.as_ref().map(|o| compiler.order_by(o));

    if !compiler.errors.is_empty() {
        return Err(CompileError {
            errors: compiler.errors,
        });
    }

    Ok(Fragment {
        predicate,
        order_by,
        limit: query.limit,
        offset: query.offset,
        params: compiler.params,
    })
}

struct Compiler<'a> {
    dialect: &'a dyn Dialect,
    bound: &'a [Param],
    column: &'a str,
    next_index: usize,
    params: Vec<Param>,
    errors: Vec<BindError>,
}

impl<'a> Compiler<'a> {
    fn disjunction(&mut self, d: &Disjunction) -> String {
        d.conjunctions
            .iter()
            .map(|c| self.conjunction(c))
            .collect::<Vec<_>>()
            .join(" OR ")
    }

    fn conjunction(&mut self, c: &Conjunction) -> String {
        c.terms
            .iter()
            .map(|t| self.term(t))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn term(&mut self, term: &Term) -> String {
        match term {
            Term::Predicate(p) => self.predicate(p),
            Term::Bool(b) => self.dialect.bool_literal(*b).to_string(),
            Term::Group(d) => format!("({})", self.disjunction(d)),
        }
    }

    fn predicate(&mut self, p: &Predicate) -> String {
        // Resolve placeholders first so literals and bound values flow
        // through identical dispatch arms.
        let value = match &p.operand {
            Operand::String(s) => Param::Str(s.clone()),
            Operand::Int(i) => Param::Int(*i),
            Operand::Float(f) => Param::Float(*f),
            Operand::Bool(b) => Param::Bool(*b),
            Operand::Null => Param::Null,
            Operand::Placeholder(index) => {
                if *index == 0 || *index > self.bound.len() {
                    self.errors.push(BindError::OutOfRange {
                        index: *index,
                        supplied: self.bound.len(),
                    });
                    return self.dialect.bool_literal(false).to_string();
                }
                self.bound[*index - 1].clone()
            }
        };

        let lhs = self.dialect.json_path(self.column, &p.path);
        let op = p.op.sql();
        match value {
            Param::Null => match p.op {
                CompareOp::Eq => format!("{lhs} IS NULL"),
                CompareOp::NotEq => format!("{lhs} IS NOT NULL"),
                other => {
                    self.errors.push(BindError::NullComparison { op: other.sql() });
                    self.dialect.bool_literal(false).to_string()
                }
            },
            // Textual extraction already yields a string-typed comparison.
            Param::Str(_) => {
                let rhs = self.push(value);
                format!("{lhs} {op} {rhs}")
            }
            Param::Int(_) => {
                let cast = self.dialect.cast(&lhs, CastType::Integer);
                let rhs = self.push(value);
                format!("{cast} {op} {rhs}")
            }
            Param::Float(_) => {
                let cast = self.dialect.cast(&lhs, CastType::Float);
                let rhs = self.push(value);
                format!("{cast} {op} {rhs}")
            }
            Param::Bool(_) => {
                let cast = self.dialect.cast(&lhs, CastType::Boolean);
                let rhs = self.push(value);
                format!("{cast} {op} {rhs}")
            }
        }
    }

    /// Append a bind value and return its placeholder text.
    fn push(&mut self, value: Param) -> String {
        let index = self.next_index;
        self.next_index += 1;
        self.params.push(value);
        self.dialect.placeholder(index)
    }

    fn order_by(&mut self, order: &OrderBy) -> String {
        let key = match &order.key {
            OrderKey::Path(path) => self.dialect.json_path(self.column, path),
            OrderKey::Cast(path) => {
                let extracted = self.dialect.json_path(self.column, path);
                self.dialect.cast(&extracted, CastType::Numeric)
            }
        };
        let mut sql = format!("ORDER BY {key}");
        match order.asc {
            Some(true) => sql.push_str(" ASC"),
            Some(false) => sql.push_str(" DESC"),
            None => {}
        }
        sql
    }
}
