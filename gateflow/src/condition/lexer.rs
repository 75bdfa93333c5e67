//! Tokenizer for condition expressions.

use std::fmt;
use thiserror::Error;

/// Token types for condition expressions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// `true`
    True,
    /// `false`
    False,
    /// A single-quoted string literal. `''` escapes a quote.
    String(String),
    /// A bare identifier, e.g. `ref`, `startsWith`, `build-linux`.
    Identifier(String),
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `!`
    Not,
    /// `.`
    Dot,
    /// `,`
    Comma,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// End of input.
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::True => write!(f, "true"),
            Self::False => write!(f, "false"),
            Self::String(s) => write!(f, "'{s}'"),
            Self::Identifier(s) => write!(f, "{s}"),
            Self::Eq => write!(f, "=="),
            Self::Ne => write!(f, "!="),
            Self::And => write!(f, "&&"),
            Self::Or => write!(f, "||"),
            Self::Not => write!(f, "!"),
            Self::Dot => write!(f, "."),
            Self::Comma => write!(f, ","),
            Self::LParen => write!(f, "("),
            Self::RParen => write!(f, ")"),
            Self::LBracket => write!(f, "["),
            Self::RBracket => write!(f, "]"),
            Self::Eof => write!(f, "end of input"),
        }
    }
}

/// Lexer error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("lex error at position {position}: {message}")]
pub struct LexError {
    /// What went wrong.
    pub message: String,
    /// Byte offset in the input.
    pub position: usize,
}

/// Lexer for condition expressions.
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    /// Creates a lexer over `input`.
    #[must_use]
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
        }
    }

    /// Tokenizes the entire input. The last token is always [`Token::Eof`].
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, LexError> {
        while self.chars.next_if(|(_, c)| c.is_whitespace()).is_some() {}

        let Some((position, c)) = self.chars.next() else {
            return Ok(Token::Eof);
        };

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            ',' => Token::Comma,
            '.' => Token::Dot,
            '=' => self.expect_second('=', Token::Eq, position)?,
            '&' => self.expect_second('&', Token::And, position)?,
            '|' => self.expect_second('|', Token::Or, position)?,
            '!' => {
                if self.chars.next_if(|(_, c)| *c == '=').is_some() {
                    Token::Ne
                } else {
                    Token::Not
                }
            }
            '\'' => Token::String(self.read_string(position)?),
            c if is_ident_start(c) => {
                let mut ident = String::from(c);
                while let Some((_, c)) = self.chars.next_if(|(_, c)| is_ident_continue(*c)) {
                    ident.push(c);
                }
                match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Identifier(ident),
                }
            }
            other => {
                return Err(LexError {
                    message: format!("unexpected character '{other}'"),
                    position,
                })
            }
        };

        Ok(token)
    }

    fn expect_second(&mut self, want: char, token: Token, position: usize) -> Result<Token, LexError> {
        if self.chars.next_if(|(_, c)| *c == want).is_some() {
            Ok(token)
        } else {
            Err(LexError {
                message: format!("expected '{want}{want}'"),
                position,
            })
        }
    }

    fn read_string(&mut self, start: usize) -> Result<String, LexError> {
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some((_, '\'')) => {
                    if self.chars.next_if(|(_, c)| *c == '\'').is_some() {
                        value.push('\'');
                    } else {
                        return Ok(value);
                    }
                }
                Some((_, c)) => value.push(c),
                None => {
                    return Err(LexError {
                        message: "unterminated string literal".to_string(),
                        position: start,
                    })
                }
            }
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}
