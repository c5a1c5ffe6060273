//! AQL: tokenizer, recursive-descent parser, and AST.
//!
//! The surface covers `FOR/FILTER/LET/COLLECT/AGGREGATE/SORT/LIMIT/RETURN`,
//! `WITH` CTEs, first-class subqueries, graph traversal
//! (`OUTBOUND`/`INBOUND`, depth ranges, `SHORTEST_PATH ... TO`), the
//! quantifiers `ANY`/`ALL ... SATISFIES`, and the function surface
//! (`ST_*`, `SIMILARITY`, `PROXIMITY`, `FULLTEXT`). Syntax errors carry
//! the byte position of the offending token.

pub mod ast;
pub mod lexer;
pub mod parser;

pub use ast::{
    AggregateFn, BinaryOp, Collect, Cte, Direction, Expr, ForNode, ForSource, LetBinding,
    Limit, Literal, Quantifier, Query, SortSpec, UnaryOp,
};
pub use parser::parse;
