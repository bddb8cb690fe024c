//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Content filter expressions
//!
//! A filter decides per action whether it is wanted in the image:
//! `attr=value` terms combined with `&`, `|` and parentheses, e.g.
//! `doc=false | locale.fr=true`. An action that does not carry the
//! attribute a term names passes that term; filters only ever
//! restrict actions that declare themselves filterable.
//!
//! The filters chosen for a package are persisted as one expression
//! per line next to the installed state and re-applied to the old
//! manifest on upgrade, so what was filtered out stays filtered out.

use crate::actions::Action;
use miette::Diagnostic;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FilterError>;

#[derive(Debug, Error, Diagnostic, PartialEq)]
pub enum FilterError {
    #[error("unexpected end of filter expression: {0:?}")]
    #[diagnostic(
        code(pkg::filter_error::unexpected_end),
        help("Filter expressions look like: attr=value [& attr=value | (…)]")
    )]
    UnexpectedEnd(String),

    #[error("unexpected token {token:?} in filter expression {expr:?}")]
    #[diagnostic(code(pkg::filter_error::unexpected_token))]
    UnexpectedToken { expr: String, token: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Term { attr: String, value: String },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn matches(&self, action: &Action) -> bool {
        match self {
            Expr::Term { attr, value } => match action.attr(attr) {
                // absent attribute: the action is not filterable on
                // this axis and passes
                None => true,
                Some(actual) => actual == value,
            },
            Expr::And(a, b) => a.matches(action) && b.matches(action),
            Expr::Or(a, b) => a.matches(action) || b.matches(action),
        }
    }
}

/// A compiled filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    source: String,
    expr: Expr,
}

impl Filter {
    /// Parse a filter expression. `&` binds tighter than `|`.
    pub fn parse(text: &str) -> Result<Filter> {
        let tokens = tokenize(text)?;
        let mut parser = Tokens {
            expr: text,
            tokens,
            pos: 0,
        };
        let expr = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(FilterError::UnexpectedToken {
                expr: text.to_string(),
                token: parser.tokens[parser.pos].text(),
            });
        }
        Ok(Filter {
            source: text.trim().to_string(),
            expr,
        })
    }

    pub fn matches(&self, action: &Action) -> bool {
        self.expr.matches(action)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Filter> {
        Filter::parse(s)
    }
}

/// AND together all filters for one action.
pub fn apply_filters(action: &Action, filters: &[Filter]) -> bool {
    filters.iter().all(|f| f.matches(action))
}

/// Parse a persisted filter file body: one expression per line,
/// blank lines and `#` comments skipped.
pub fn parse_filter_lines(content: &str) -> Result<Vec<Filter>> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(Filter::parse)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Term { attr: String, value: String },
    And,
    Or,
    Open,
    Close,
}

impl Token {
    fn text(&self) -> String {
        match self {
            Token::Term { attr, value } => format!("{}={}", attr, value),
            Token::And => "&".to_string(),
            Token::Or => "|".to_string(),
            Token::Open => "(".to_string(),
            Token::Close => ")".to_string(),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() {
        let c = rest.chars().next().unwrap_or(' ');
        match c {
            '&' => {
                tokens.push(Token::And);
                rest = rest[1..].trim_start();
            }
            '|' => {
                tokens.push(Token::Or);
                rest = rest[1..].trim_start();
            }
            '(' => {
                tokens.push(Token::Open);
                rest = rest[1..].trim_start();
            }
            ')' => {
                tokens.push(Token::Close);
                rest = rest[1..].trim_start();
            }
            _ => {
                let end = rest
                    .find(|ch: char| ch.is_whitespace() || "&|()".contains(ch))
                    .unwrap_or(rest.len());
                let word = &rest[..end];
                match word.split_once('=') {
                    Some((attr, value)) if !attr.is_empty() && !value.is_empty() => {
                        tokens.push(Token::Term {
                            attr: attr.to_string(),
                            value: value.to_string(),
                        });
                    }
                    _ => {
                        return Err(FilterError::UnexpectedToken {
                            expr: text.to_string(),
                            token: word.to_string(),
                        });
                    }
                }
                rest = rest[end..].trim_start();
            }
        }
    }
    Ok(tokens)
}

struct Tokens<'a> {
    expr: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Tokens<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut left = self.atom()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.atom()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.peek().cloned() {
            Some(Token::Term { attr, value }) => {
                self.pos += 1;
                Ok(Expr::Term { attr, value })
            }
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                match self.peek() {
                    Some(Token::Close) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(FilterError::UnexpectedEnd(self.expr.to_string())),
                }
            }
            Some(token) => Err(FilterError::UnexpectedToken {
                expr: self.expr.to_string(),
                token: token.text(),
            }),
            None => Err(FilterError::UnexpectedEnd(self.expr.to_string())),
        }
    }
}
