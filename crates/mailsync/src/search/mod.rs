//! Structured search
//!
//! A boolean tree of field predicates is compiled into a SQL selection with
//! bound parameters. UI query strings are parsed into the same tree.

mod compiler;
mod condition;
mod query_parser;

pub(crate) use compiler::escape_like;
pub use compiler::{CompiledQuery, QueryParam, compile, compile_node};
pub use condition::{
    Attribute, CustomField, SearchCondition, SearchConditionNode, SearchField,
    SearchSpecification,
};
pub use query_parser::{ParsedQuery, parse_query};
