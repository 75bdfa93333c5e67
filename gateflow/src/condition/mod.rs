//! Condition evaluation.
//!
//! Conditions are boolean expressions over the trigger context, matrix
//! coordinates, run-scoped values and outputs of earlier stages:
//!
//! ```text
//! and(startsWith(ref, 'refs/tags/'), not(fork))
//! event == 'push' && outputs.version.changed == 'true'
//! in(matrix.os, 'linux', 'macos')
//! ```
//!
//! Evaluation fails closed: an expression that references anything
//! unavailable, or that hits a type error, evaluates to `false`.

mod evaluator;
mod lexer;
mod parser;

pub use evaluator::{EvalError, Evaluator, Scope, TriggerScope, Value};
pub use lexer::{LexError, Lexer, Token};
pub use parser::{Expr, ExprParser, ParseError, TextOp};

use tracing::debug;

/// A parsed condition expression.
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// Parses a condition.
    pub fn parse(source: impl Into<String>) -> Result<Self, ParseError> {
        let source = source.into();
        let expr = ExprParser::parse(&source)?;
        Ok(Self { source, expr })
    }

    /// Returns the original expression text.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the parsed expression.
    #[must_use]
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    /// Evaluates against `scope`, mapping every error to `false`.
    pub fn evaluate<S: Scope + ?Sized>(&self, scope: &S) -> bool {
        match Evaluator::new(scope).eval_bool(&self.expr) {
            Ok(result) => result,
            Err(err) => {
                debug!(condition = %self.source, error = %err, "Condition evaluated to false");
                false
            }
        }
    }

    /// Evaluates against `scope`, surfacing errors.
    pub fn try_evaluate<S: Scope + ?Sized>(&self, scope: &S) -> Result<bool, EvalError> {
        Evaluator::new(scope).eval_bool(&self.expr)
    }

    /// Returns the `(stage, key)` pairs read through `outputs.<stage>.<key>`.
    #[must_use]
    pub fn output_references(&self) -> Vec<(String, String)> {
        self.expr
            .references()
            .into_iter()
            .filter_map(|path| match path {
                [head, stage, key] if head == "outputs" => Some((stage.clone(), key.clone())),
                _ => None,
            })
            .collect()
    }
}

/// Parses and evaluates `expression` in one step.
///
/// Parse errors evaluate to `false` as well; use [`Condition::parse`] to
/// reject malformed expressions up front.
pub fn evaluate<S: Scope + ?Sized>(expression: &str, scope: &S) -> bool {
    match Condition::parse(expression) {
        Ok(condition) => condition.evaluate(scope),
        Err(err) => {
            debug!(condition = %expression, error = %err, "Condition failed to parse");
            false
        }
    }
}
