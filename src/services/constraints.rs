//! Define-constraint evaluation.
//!
//! A define constraint is a boolean expression over build symbols, e.g.
//! `UNITY_ANDROID || (UNITY_IOS && !DISABLE_PATCHING)`. Active symbols evaluate
//! to `true`, every other symbol to `false`. Supported operators are `||`, `&&`,
//! `!` and their keyword forms `OR`, `AND`, `NOT`, with the usual precedence
//! (NOT binds tighter than AND, AND tighter than OR) and parentheses.

use crate::models::ActiveDefines;
use regex::Regex;
use thiserror::Error;

/// Maximum parenthesis/negation nesting accepted before giving up.
const MAX_DEPTH: usize = 64;

/// Errors raised for malformed constraint expressions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("unexpected '{found}' at offset {offset}")]
    UnexpectedToken { offset: usize, found: String },

    #[error("expression ended unexpectedly")]
    UnexpectedEnd,

    #[error("unsupported operator '{found}' at offset {offset}")]
    InvalidOperator { offset: usize, found: String },

    #[error("unclosed parenthesis at offset {offset}")]
    UnclosedParenthesis { offset: usize },

    #[error("expression nested too deeply")]
    TooDeep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Or,
    And,
    Not,
    Open,
    Close,
    Value(bool),
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    kind: TokenKind,
    text: &'a str,
    offset: usize,
}

/// Evaluates define constraints against a set of active symbols.
///
/// Holds only the compiled tokenizer pattern, so a single instance can be shared
/// across threads and called concurrently with different inputs.
#[derive(Debug, Clone)]
pub struct ConstraintEvaluator {
    token_pattern: Regex,
}

impl ConstraintEvaluator {
    pub fn new() -> Self {
        Self {
            // Stray single `|`/`&` are matched so they can be rejected
            token_pattern: Regex::new(r"\|\||&&|!|\(|\)|[|&]|[^\s|&!()]+")
                .expect("Invalid constraint token regex"),
        }
    }

    /// Evaluate one constraint expression.
    ///
    /// An empty expression is vacuously `true`.
    pub fn evaluate(&self, expression: &str, defines: &ActiveDefines) -> Result<bool, EvaluationError> {
        if expression.trim().is_empty() {
            return Ok(true);
        }

        let tokens = self.tokenize(expression, defines)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            depth: 0,
        };

        let value = parser.parse_or()?;
        match parser.peek() {
            None => Ok(value),
            Some(token) => Err(EvaluationError::UnexpectedToken {
                offset: token.offset,
                found: token.text.to_string(),
            }),
        }
    }

    /// Evaluate a list of constraints; all of them must pass.
    ///
    /// Every expression is evaluated so a malformed one is reported even when
    /// an earlier constraint already failed.
    pub fn evaluate_all<S: AsRef<str>>(
        &self,
        constraints: &[S],
        defines: &ActiveDefines,
    ) -> Result<bool, EvaluationError> {
        let mut all_pass = true;
        for constraint in constraints {
            all_pass &= self.evaluate(constraint.as_ref(), defines)?;
        }
        Ok(all_pass)
    }

    fn tokenize<'a>(
        &self,
        expression: &'a str,
        defines: &ActiveDefines,
    ) -> Result<Vec<Token<'a>>, EvaluationError> {
        self.token_pattern
            .find_iter(expression)
            .map(|m| {
                let text = m.as_str();
                let kind = match text {
                    "||" => TokenKind::Or,
                    "&&" => TokenKind::And,
                    "!" => TokenKind::Not,
                    "(" => TokenKind::Open,
                    ")" => TokenKind::Close,
                    "|" | "&" => {
                        return Err(EvaluationError::InvalidOperator {
                            offset: m.start(),
                            found: text.to_string(),
                        });
                    }
                    symbol if defines.contains(symbol) => TokenKind::Value(true),
                    word => keyword(word).unwrap_or(TokenKind::Value(false)),
                };
                Ok(Token {
                    kind,
                    text,
                    offset: m.start(),
                })
            })
            .collect()
    }
}

impl Default for ConstraintEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

fn keyword(word: &str) -> Option<TokenKind> {
    const KEYWORDS: [(&str, TokenKind); 5] = [
        ("true", TokenKind::Value(true)),
        ("false", TokenKind::Value(false)),
        ("OR", TokenKind::Or),
        ("AND", TokenKind::And),
        ("NOT", TokenKind::Not),
    ];
    KEYWORDS
        .iter()
        .find(|(kw, _)| kw.eq_ignore_ascii_case(word))
        .map(|(_, kind)| *kind)
}

struct Parser<'t, 'a> {
    tokens: &'t [Token<'a>],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'_, 'a> {
    fn peek(&self) -> Option<Token<'a>> {
        self.tokens.get(self.pos).copied()
    }

    fn next_if(&mut self, kind: TokenKind) -> bool {
        if self.peek().is_some_and(|t| t.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn descend(&mut self) -> Result<(), EvaluationError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvaluationError::TooDeep);
        }
        Ok(())
    }

    // or := and ('||' and)*
    fn parse_or(&mut self) -> Result<bool, EvaluationError> {
        let mut value = self.parse_and()?;
        while self.next_if(TokenKind::Or) {
            let rhs = self.parse_and()?;
            value = value || rhs;
        }
        Ok(value)
    }

    // and := unary ('&&' unary)*
    fn parse_and(&mut self) -> Result<bool, EvaluationError> {
        let mut value = self.parse_unary()?;
        while self.next_if(TokenKind::And) {
            let rhs = self.parse_unary()?;
            value = value && rhs;
        }
        Ok(value)
    }

    // unary := '!' unary | primary
    fn parse_unary(&mut self) -> Result<bool, EvaluationError> {
        if self.next_if(TokenKind::Not) {
            self.descend()?;
            let value = self.parse_unary()?;
            self.depth -= 1;
            return Ok(!value);
        }
        self.parse_primary()
    }

    // primary := value | '(' or ')'
    fn parse_primary(&mut self) -> Result<bool, EvaluationError> {
        let token = self.peek().ok_or(EvaluationError::UnexpectedEnd)?;
        self.pos += 1;

        match token.kind {
            TokenKind::Value(value) => Ok(value),
            TokenKind::Open => {
                self.descend()?;
                let value = self.parse_or()?;
                if !self.next_if(TokenKind::Close) {
                    return Err(match self.peek() {
                        Some(t) => EvaluationError::UnexpectedToken {
                            offset: t.offset,
                            found: t.text.to_string(),
                        },
                        None => EvaluationError::UnclosedParenthesis {
                            offset: token.offset,
                        },
                    });
                }
                self.depth -= 1;
                Ok(value)
            }
            _ => Err(EvaluationError::UnexpectedToken {
                offset: token.offset,
                found: token.text.to_string(),
            }),
        }
    }
}
