//! Evaluation of parsed conditions against a scope.

use super::parser::{Expr, TextOp};
use crate::core::TriggerContext;
use std::fmt;
use thiserror::Error;

/// Values produced while evaluating a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// A string.
    String(String),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// Error raised while evaluating a condition.
///
/// Never escapes [`super::evaluate`]: any error there means `false`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EvalError {
    /// A reference did not resolve (absent key, output not yet produced).
    #[error("'{0}' is not available")]
    Missing(String),

    /// An operand had the wrong type.
    #[error("expected {expected}, got '{found}'")]
    Type {
        /// The type the operator needs.
        expected: &'static str,
        /// The offending value.
        found: String,
    },
}

/// Read access to everything a condition may reference.
pub trait Scope {
    /// The trigger that started the run.
    fn trigger(&self) -> &TriggerContext;

    /// The value of a matrix dimension for the instance being evaluated.
    fn matrix_value(&self, _dimension: &str) -> Option<String> {
        None
    }

    /// A run-scoped output such as `release_tag`.
    fn run_value(&self, _key: &str) -> Option<String> {
        None
    }

    /// An output written by a stage that has already succeeded.
    fn output(&self, _stage: &str, _key: &str) -> Option<String> {
        None
    }
}

/// A scope exposing only the trigger.
#[derive(Debug, Clone, Copy)]
pub struct TriggerScope<'a>(pub &'a TriggerContext);

impl Scope for TriggerScope<'_> {
    fn trigger(&self) -> &TriggerContext {
        self.0
    }
}

/// Tree-walking evaluator.
pub struct Evaluator<'a, S: Scope + ?Sized> {
    scope: &'a S,
}

impl<'a, S: Scope + ?Sized> Evaluator<'a, S> {
    /// Creates an evaluator over `scope`.
    pub fn new(scope: &'a S) -> Self {
        Self { scope }
    }

    /// Evaluates `expr` to a value.
    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::String(s) => Ok(Value::String(s.clone())),
            Expr::Always => Ok(Value::Bool(true)),
            Expr::Reference(path) => self.resolve(path),
            Expr::Not(inner) => Ok(Value::Bool(!self.eval_bool(inner)?)),
            Expr::And(items) => {
                for item in items {
                    if !self.eval_bool(item)? {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            Expr::Or(items) => {
                for item in items {
                    if self.eval_bool(item)? {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Eq(a, b) => Ok(Value::Bool(self.eval(a)? == self.eval(b)?)),
            Expr::Ne(a, b) => Ok(Value::Bool(self.eval(a)? != self.eval(b)?)),
            Expr::Text(op, a, b) => {
                let a = self.eval_string(a)?;
                let b = self.eval_string(b)?;
                Ok(Value::Bool(match op {
                    TextOp::StartsWith => a.starts_with(&b),
                    TextOp::EndsWith => a.ends_with(&b),
                    TextOp::Contains => a.contains(&b),
                }))
            }
            Expr::In(needle, haystack) => {
                let needle = self.eval(needle)?;
                for item in haystack {
                    if self.eval(item)? == needle {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Expr::Matches(subject, regex) => {
                let subject = self.eval_string(subject)?;
                Ok(Value::Bool(regex.is_match(&subject)))
            }
        }
    }

    /// Evaluates `expr` and requires a boolean.
    pub fn eval_bool(&self, expr: &Expr) -> Result<bool, EvalError> {
        match self.eval(expr)? {
            Value::Bool(b) => Ok(b),
            Value::String(s) => Err(EvalError::Type {
                expected: "a boolean",
                found: s,
            }),
        }
    }

    fn eval_string(&self, expr: &Expr) -> Result<String, EvalError> {
        match self.eval(expr)? {
            Value::String(s) => Ok(s),
            Value::Bool(b) => Err(EvalError::Type {
                expected: "a string",
                found: b.to_string(),
            }),
        }
    }

    fn resolve(&self, path: &[String]) -> Result<Value, EvalError> {
        let missing = || EvalError::Missing(path.join("."));
        let trigger = self.scope.trigger();

        let parts: Vec<&str> = path.iter().map(String::as_str).collect();
        let value = match parts.as_slice() {
            ["ref"] => Value::String(trigger.git_ref.clone()),
            ["branch"] => Value::String(trigger.branch().to_string()),
            ["event"] => Value::String(trigger.event.to_string()),
            ["fork"] => Value::Bool(trigger.from_fork),
            ["actor"] => Value::String(trigger.actor.clone().ok_or_else(missing)?),
            ["ctx", key] => Value::String(trigger.value(key).ok_or_else(missing)?.to_string()),
            ["matrix", dim] => Value::String(self.scope.matrix_value(dim).ok_or_else(missing)?),
            ["run", key] => Value::String(self.scope.run_value(key).ok_or_else(missing)?),
            ["outputs", stage, key] => {
                Value::String(self.scope.output(stage, key).ok_or_else(missing)?)
            }
            _ => return Err(missing()),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::ExprParser;
    use crate::core::EventKind;
    use std::collections::HashMap;

    struct MapScope {
        trigger: TriggerContext,
        matrix: HashMap<String, String>,
        outputs: HashMap<(String, String), String>,
    }

    impl Scope for MapScope {
        fn trigger(&self) -> &TriggerContext {
            &self.trigger
        }

        fn matrix_value(&self, dimension: &str) -> Option<String> {
            self.matrix.get(dimension).cloned()
        }

        fn output(&self, stage: &str, key: &str) -> Option<String> {
            self.outputs.get(&(stage.to_string(), key.to_string())).cloned()
        }
    }

    fn scope() -> MapScope {
        let mut outputs = HashMap::new();
        outputs.insert(("version".to_string(), "tag".to_string()), "v1.3.0".to_string());
        MapScope {
            trigger: TriggerContext::new(EventKind::Push, "refs/tags/v1.3.0")
                .with_actor("release-bot")
                .with_value("channel", "stable"),
            matrix: HashMap::from([("os".to_string(), "linux".to_string())]),
            outputs,
        }
    }

    fn eval(input: &str) -> Result<Value, EvalError> {
        let expr = ExprParser::parse(input).unwrap();
        Evaluator::new(&scope()).eval(&expr)
    }

    #[test]
    fn test_trigger_references() {
        assert_eq!(eval("ref"), Ok(Value::String("refs/tags/v1.3.0".to_string())));
        assert_eq!(eval("branch"), Ok(Value::String("v1.3.0".to_string())));
        assert_eq!(eval("event == 'push'"), Ok(Value::Bool(true)));
        assert_eq!(eval("fork"), Ok(Value::Bool(false)));
        assert_eq!(eval("eq(actor, 'release-bot')"), Ok(Value::Bool(true)));
        assert_eq!(eval("eq(ctx.channel, 'stable')"), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_scope_references() {
        assert_eq!(eval("matrix.os == 'linux'"), Ok(Value::Bool(true)));
        assert_eq!(eval("outputs.version.tag == 'v1.3.0'"), Ok(Value::Bool(true)));
        assert_eq!(eval("outputs['version'].tag"), Ok(Value::String("v1.3.0".to_string())));
    }

    #[test]
    fn test_missing_reference_is_an_error() {
        assert_eq!(
            eval("ctx.absent == 'x'"),
            Err(EvalError::Missing("ctx.absent".to_string()))
        );
        assert!(eval("run.release_tag").is_err());
        assert!(eval("nonsense.path").is_err());
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(eval("startsWith(ref, 'refs/tags/')"), Ok(Value::Bool(true)));
        assert_eq!(eval("endsWith(ref, '.0')"), Ok(Value::Bool(true)));
        assert_eq!(eval("contains(ref, 'heads')"), Ok(Value::Bool(false)));
        assert_eq!(eval("in(event, 'pull_request', 'push')"), Ok(Value::Bool(true)));
        assert_eq!(eval(r"matches(branch, '^v\d+\.\d+\.\d+$')"), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_short_circuit() {
        assert_eq!(eval("or(always(), ctx.absent == 'x')"), Ok(Value::Bool(true)));
        assert_eq!(eval("and(false, ctx.absent == 'x')"), Ok(Value::Bool(false)));
    }

    #[test]
    fn test_type_errors() {
        assert!(matches!(eval("not(ref)"), Err(EvalError::Type { .. })));
        assert!(matches!(eval("startsWith(fork, 'x')"), Err(EvalError::Type { .. })));
    }
}
