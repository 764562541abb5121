/// Query language AST and per-backend SQL compilation.
///
/// This module provides the pure (no I/O) half of the store's query
/// processing pipeline:
///
/// ```text
/// Query text
///       ↓
/// Lexer / Parser           (parser.rs)
///       ↓
/// Query AST                (types.rs)
///       ↓
/// Generic compiler         (compiler.rs)
///       ↓                      ↘
/// SQL fragment + binds      Dialect leaf emission  (dialect.rs)
/// ```
///
/// Parsing and compilation run before any transaction is opened, so a
/// malformed query never touches the backend.
pub mod compiler;
pub mod dialect;
pub mod parser;
pub mod types;

// Re-export key types for convenience
pub use compiler::{compile, BindError, CompileError, Fragment};
pub use dialect::{CastType, Dialect, PostgresDialect, SqliteDialect};
pub use parser::{parse, SyntaxError};
pub use types::*;
