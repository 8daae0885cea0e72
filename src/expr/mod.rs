//! Expression language over JSON documents.
//!
//! Match selectors and patch selects are written in a small language that
//! combines JSONPath selection (`$.spec.containers[*]`, filters, slices,
//! unions, recursive descent) with boolean, arithmetic and string
//! operators, a handful of builtin functions, and the placeholder form
//! `{#i: …}` used to recover which index or key a wildcard took.
//!
//! Two properties are load-bearing for the admission engine:
//!
//! * missing data evaluates to a distinguished [`Value::Undefined`], never
//!   to `null` and never to an error;
//! * boolean operators demand boolean operands, so `Undefined` cannot
//!   accidentally count as truthy.

pub mod ast;
pub mod eval;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod value;

pub use eval::EvalError;
pub use parser::ParseError;
pub use value::Value;

use crate::expr::ast::Expr;

/// A compiled expression, ready for repeated evaluation.
///
/// Compilation happens once at rule-ingestion time so that admission-time
/// work is evaluation only.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    pub fn compile(source: &str) -> Result<Self, ParseError> {
        let ast = parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against an already-converted document value.
    pub fn eval(&self, doc: &Value) -> Result<Value, EvalError> {
        eval::evaluate(&self.ast, doc)
    }

    /// Evaluate against a plain JSON document.
    pub fn eval_json(&self, doc: &serde_json::Value) -> Result<Value, EvalError> {
        self.eval(&Value::from(doc))
    }
}
