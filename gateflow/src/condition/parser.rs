//! Parser producing a condition AST from tokens.
//!
//! ```text
//! expr       := or
//! or         := and ( '||' and )*
//! and        := unary ( '&&' unary )*
//! unary      := '!' unary | comparison
//! comparison := primary ( ( '==' | '!=' ) primary )?
//! primary    := literal | '(' expr ')' | call | reference
//! call       := ident '(' ( expr ( ',' expr )* )? ')'
//! reference  := ident ( '.' ident | '[' string ']' )*
//! ```

use super::lexer::{LexError, Lexer, Token};
use regex::Regex;
use thiserror::Error;

/// Condition AST node.
#[derive(Debug, Clone)]
pub enum Expr {
    /// Boolean literal.
    Bool(bool),
    /// String literal.
    String(String),
    /// Dotted / indexed path into the evaluation scope.
    Reference(Vec<String>),
    /// `!expr` or `not(expr)`.
    Not(Box<Expr>),
    /// `a && b` or `and(a, b, ...)`.
    And(Vec<Expr>),
    /// `a || b` or `or(a, b, ...)`.
    Or(Vec<Expr>),
    /// `a == b` or `eq(a, b)`.
    Eq(Box<Expr>, Box<Expr>),
    /// `a != b` or `ne(a, b)`.
    Ne(Box<Expr>, Box<Expr>),
    /// String predicate functions.
    Text(TextOp, Box<Expr>, Box<Expr>),
    /// `in(needle, a, b, ...)`.
    In(Box<Expr>, Vec<Expr>),
    /// `matches(subject, 'pattern')`, pattern compiled at parse time.
    Matches(Box<Expr>, Regex),
    /// `always()`.
    Always,
}

/// String predicates taking two operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextOp {
    /// `startsWith(a, b)`
    StartsWith,
    /// `endsWith(a, b)`
    EndsWith,
    /// `contains(a, b)`
    Contains,
}

impl Expr {
    /// Collects every reference path in the expression, in source order.
    #[must_use]
    pub fn references(&self) -> Vec<&[String]> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a [String]>) {
        match self {
            Self::Reference(path) => out.push(path),
            Self::Not(inner) => inner.collect_references(out),
            Self::And(items) | Self::Or(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            Self::Eq(a, b) | Self::Ne(a, b) | Self::Text(_, a, b) => {
                a.collect_references(out);
                b.collect_references(out);
            }
            Self::In(needle, haystack) => {
                needle.collect_references(out);
                for item in haystack {
                    item.collect_references(out);
                }
            }
            Self::Matches(subject, _) => subject.collect_references(out),
            Self::Bool(_) | Self::String(_) | Self::Always => {}
        }
    }
}

/// Parse error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The input could not be tokenized.
    #[error("{0}")]
    Lex(#[from] LexError),

    /// A token appeared where it is not allowed.
    #[error("unexpected {found}, expected {expected}")]
    Unexpected {
        /// What was found.
        found: String,
        /// What the grammar wanted.
        expected: String,
    },

    /// Call to a function the evaluator does not provide.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Wrong number of arguments.
    #[error("function '{name}' expects {expected} argument(s), got {got}")]
    Arity {
        /// Function name.
        name: String,
        /// Expected count description.
        expected: String,
        /// Actual count.
        got: usize,
    },

    /// `matches` was given a non-literal or invalid pattern.
    #[error("invalid pattern: {0}")]
    Pattern(String),
}

/// Recursive-descent parser for condition expressions.
pub struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    /// Parses a complete expression.
    pub fn parse(input: &str) -> Result<Expr, ParseError> {
        let tokens = Lexer::new(input).tokenize()?;
        let mut parser = Self { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        parser.expect(&Token::Eof, "end of input")?;
        Ok(expr)
    }

    fn peek(&self) -> &Token {
        self.tokens.get(self.pos).unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, expected: &str) -> Result<(), ParseError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        ParseError::Unexpected {
            found: self.peek().to_string(),
            expected: expected.to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut items = vec![self.parse_and()?];
        while self.eat(&Token::Or) {
            items.push(self.parse_and()?);
        }
        Ok(if items.len() == 1 { items.remove(0) } else { Expr::Or(items) })
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut items = vec![self.parse_unary()?];
        while self.eat(&Token::And) {
            items.push(self.parse_unary()?);
        }
        Ok(if items.len() == 1 { items.remove(0) } else { Expr::And(items) })
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let left = self.parse_primary()?;
        if self.eat(&Token::Eq) {
            let right = self.parse_primary()?;
            return Ok(Expr::Eq(Box::new(left), Box::new(right)));
        }
        if self.eat(&Token::Ne) {
            let right = self.parse_primary()?;
            return Ok(Expr::Ne(Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Token::True => Ok(Expr::Bool(true)),
            Token::False => Ok(Expr::Bool(false)),
            Token::String(s) => Ok(Expr::String(s)),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Identifier(name) => {
                if self.eat(&Token::LParen) {
                    let args = self.parse_args()?;
                    build_call(&name, args)
                } else {
                    self.parse_reference(name)
                }
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("a value"))
            }
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma, "',' or ')'")?;
        }
    }

    fn parse_reference(&mut self, head: String) -> Result<Expr, ParseError> {
        let mut path = vec![head];
        loop {
            if self.eat(&Token::Dot) {
                match self.advance() {
                    Token::Identifier(part) => path.push(part),
                    _ => {
                        self.pos = self.pos.saturating_sub(1);
                        return Err(self.unexpected("a property name"));
                    }
                }
            } else if self.eat(&Token::LBracket) {
                match self.advance() {
                    Token::String(part) => path.push(part),
                    _ => {
                        self.pos = self.pos.saturating_sub(1);
                        return Err(self.unexpected("a quoted key"));
                    }
                }
                self.expect(&Token::RBracket, "']'")?;
            } else {
                return Ok(Expr::Reference(path));
            }
        }
    }
}

fn arity(name: &str, args: &[Expr], expected: usize) -> Result<(), ParseError> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(ParseError::Arity {
            name: name.to_string(),
            expected: expected.to_string(),
            got: args.len(),
        })
    }
}

fn arity_at_least(name: &str, args: &[Expr], min: usize) -> Result<(), ParseError> {
    if args.len() >= min {
        Ok(())
    } else {
        Err(ParseError::Arity {
            name: name.to_string(),
            expected: format!("at least {min}"),
            got: args.len(),
        })
    }
}

fn pair(args: Vec<Expr>) -> (Box<Expr>, Box<Expr>) {
    let mut it = args.into_iter();
    let a = it.next().unwrap_or(Expr::Bool(false));
    let b = it.next().unwrap_or(Expr::Bool(false));
    (Box::new(a), Box::new(b))
}

fn build_call(name: &str, mut args: Vec<Expr>) -> Result<Expr, ParseError> {
    match name.to_ascii_lowercase().as_str() {
        "always" => {
            arity(name, &args, 0)?;
            Ok(Expr::Always)
        }
        "not" => {
            arity(name, &args, 1)?;
            Ok(Expr::Not(Box::new(args.remove(0))))
        }
        "and" => {
            arity_at_least(name, &args, 2)?;
            Ok(Expr::And(args))
        }
        "or" => {
            arity_at_least(name, &args, 2)?;
            Ok(Expr::Or(args))
        }
        "eq" => {
            arity(name, &args, 2)?;
            let (a, b) = pair(args);
            Ok(Expr::Eq(a, b))
        }
        "ne" => {
            arity(name, &args, 2)?;
            let (a, b) = pair(args);
            Ok(Expr::Ne(a, b))
        }
        "startswith" | "endswith" | "contains" => {
            arity(name, &args, 2)?;
            let op = match name.to_ascii_lowercase().as_str() {
                "startswith" => TextOp::StartsWith,
                "endswith" => TextOp::EndsWith,
                _ => TextOp::Contains,
            };
            let (a, b) = pair(args);
            Ok(Expr::Text(op, a, b))
        }
        "in" => {
            arity_at_least(name, &args, 2)?;
            let needle = args.remove(0);
            Ok(Expr::In(Box::new(needle), args))
        }
        "matches" => {
            arity(name, &args, 2)?;
            let (subject, pattern) = pair(args);
            let Expr::String(pattern) = *pattern else {
                return Err(ParseError::Pattern(
                    "the pattern must be a string literal".to_string(),
                ));
            };
            let regex = Regex::new(&pattern).map_err(|e| ParseError::Pattern(e.to_string()))?;
            Ok(Expr::Matches(subject, regex))
        }
        _ => Err(ParseError::UnknownFunction(name.to_string())),
    }
}
