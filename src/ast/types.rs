//! Query AST types for jsonstore.
//!
//! This module defines the internal representation shared by the parser and
//! the per-backend SQL compilers. The AST is designed to be:
//! - Backend-agnostic (dialects only differ in leaf emission)
//! - Immutable (built once per parse, consumed by one compile, discarded)
//! - Closed (operands are a tagged enum, so compilers pattern-match
//!   exhaustively instead of inspecting runtime types)

/// Top-level parsed query: a boolean filter plus optional
/// ordering and pagination clauses.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub filter: Disjunction,
    pub order_by: Option<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// One or more conjunctions joined by `OR`. OR binds looser than AND.
#[derive(Debug, Clone, PartialEq)]
pub struct Disjunction {
    pub conjunctions: Vec<Conjunction>,
}

/// One or more terms joined by `AND`.
#[derive(Debug, Clone, PartialEq)]
pub struct Conjunction {
    pub terms: Vec<Term>,
}

/// A single boolean unit of a conjunction.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    /// `path op operand`
    Predicate(Predicate),
    /// A bare `true` / `false` literal. `true` is the match-all filter.
    Bool(bool),
    /// A parenthesized sub-expression, recursing into the full grammar.
    Group(Disjunction),
}

/// A comparison between a JSON path and an operand.
#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub path: Path,
    pub op: CompareOp,
    pub operand: Operand,
}

/// Dot-separated descent through JSON object keys.
///
/// Segments are restricted by the lexer to `[A-Za-z_][A-Za-z0-9_]*`, which is
/// what makes inlining them into the dialects' JSON-descent syntax safe.
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub segments: Vec<String>,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CompareOp {
    /// SQL spelling of the operator. Identical across dialects.
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
        }
    }
}

/// Right-hand side of a predicate, resolved once at compile time.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    String(String),
    /// Numeric literal without a decimal point.
    Int(i64),
    /// Numeric literal with a decimal point.
    Float(f64),
    Bool(bool),
    Null,
    /// `$N`, 1-indexed into the caller's bound parameters.
    Placeholder(usize),
}

/// ORDER BY clause: a single key, optionally cast to a numeric type.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub key: OrderKey,
    /// `Some(true)` for ASC, `Some(false)` for DESC, `None` if unspecified.
    pub asc: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderKey {
    /// Order on the raw text representation of the value.
    Path(Path),
    /// `CAST(path)`: order numerically rather than lexically.
    Cast(Path),
}

/// A caller-supplied bound parameter, referenced from query text as `$N`.
///
/// The compiler dispatches on the variant to pick the SQL cast, and elides
/// `Null` entirely (rewriting `=`/`!=` to `IS [NOT] NULL`).
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Str(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Str(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Param::Int(value)
    }
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Param::Float(value)
    }
}

impl From<bool> for Param {
    fn from(value: bool) -> Self {
        Param::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compare_op_sql() {
        assert_eq!(CompareOp::Eq.sql(), "=");
        assert_eq!(CompareOp::NotEq.sql(), "!=");
        assert_eq!(CompareOp::LtEq.sql(), "<=");
    }

    #[test]
    fn test_param_from_impls() {
        assert_eq!(Param::from("alice"), Param::Str("alice".into()));
        assert_eq!(Param::from(21i64), Param::Int(21));
        assert_eq!(Param::from(true), Param::Bool(true));
    }

    #[test]
    fn test_query_clone_deep() {
        let q = Query {
            filter: Disjunction {
                conjunctions: vec![Conjunction {
                    terms: vec![Term::Predicate(Predicate {
                        path: Path {
                            segments: vec!["user".into(), "name".into()],
                        },
                        op: CompareOp::Eq,
                        operand: Operand::Placeholder(1),
                    })],
                }],
            },
            order_by: Some(OrderBy {
                key: OrderKey::Cast(Path {
                    segments: vec!["age".into()],
                }),
                asc: Some(false),
            }),
            limit: Some(10),
            offset: None,
        };
        assert_eq!(q, q.clone());
    }
}
