//! Boolean filter expressions and their parser.
//!
//! The grammar is small:
//!
//! ```text
//! expr    := or
//! or      := and ( ("or" | "||") and )*
//! and     := unary ( ("and" | "&&") unary )*
//! unary   := ("not" | "!") unary | primary
//! primary := "true" | "false" | "(" expr ")" | IDENT "(" STRING ")"
//! ```
//!
//! Strings are single- or double-quoted, with `\\`, `\"`, `\'`, `\n` and `\t`
//! escapes. Keywords are case-insensitive. For example:
//!
//! ```
//! use mtailgrep::FilterExpr;
//!
//! let expr: FilterExpr = r#"keyword("ERROR") and not imatch("health ?check")"#.parse().unwrap();
//! assert_eq!(
//!     expr,
//!     FilterExpr::and(
//!         FilterExpr::predicate("keyword", "ERROR"),
//!         FilterExpr::not(FilterExpr::predicate("imatch", "health ?check")),
//!     )
//! );
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

const MAX_DEPTH: usize = 128;

/// An immutable filter expression tree.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum FilterExpr {
    Literal(bool),
    Not(Box<FilterExpr>),
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    /// A named string test applied to the line, e.g. `keyword("foo")`.
    Predicate { method: String, argument: String },
}

impl FilterExpr {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        let mut parser = Parser {
            tokens,
            index: 0,
            depth: 0,
        };

        let expr = parser.parse_or()?;
        match parser.peek() {
            (_, Token::Eof) => Ok(expr),
            (offset, token) => Err(parse_error(*offset, format!("unexpected {}", token))),
        }
    }

    pub fn not(expr: FilterExpr) -> Self {
        FilterExpr::Not(Box::new(expr))
    }

    pub fn and(lhs: FilterExpr, rhs: FilterExpr) -> Self {
        FilterExpr::And(Box::new(lhs), Box::new(rhs))
    }

    pub fn or(lhs: FilterExpr, rhs: FilterExpr) -> Self {
        FilterExpr::Or(Box::new(lhs), Box::new(rhs))
    }

    pub fn predicate(method: impl Into<String>, argument: impl Into<String>) -> Self {
        FilterExpr::Predicate {
            method: method.into(),
            argument: argument.into(),
        }
    }
}

impl FromStr for FilterExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FilterExpr::parse(s)
    }
}

impl fmt::Display for FilterExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpr::Literal(value) => write!(f, "{}", value),
            FilterExpr::Not(inner) => write!(f, "not {}", inner),
            FilterExpr::And(lhs, rhs) => write!(f, "({} and {})", lhs, rhs),
            FilterExpr::Or(lhs, rhs) => write!(f, "({} or {})", lhs, rhs),
            FilterExpr::Predicate { method, argument } => {
                write!(f, "{}(\"{}\")", method, escape(argument))
            }
        }
    }
}

fn escape(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\t' => escaped.push_str("\\t"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    True,
    False,
    Ident(String),
    Str(String),
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::And => f.write_str("'and'"),
            Token::Or => f.write_str("'or'"),
            Token::Not => f.write_str("'not'"),
            Token::True => f.write_str("'true'"),
            Token::False => f.write_str("'false'"),
            Token::Ident(name) => write!(f, "identifier {:?}", name),
            Token::Str(s) => write!(f, "string {:?}", s),
            Token::Eof => f.write_str("end of input"),
        }
    }
}

fn parse_error(offset: usize, message: impl Into<String>) -> Error {
    Error::Parse {
        offset,
        message: message.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push((start, Token::LParen));
            }
            ')' => {
                chars.next();
                tokens.push((start, Token::RParen));
            }
            '!' => {
                chars.next();
                tokens.push((start, Token::Not));
            }
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => {
                        let token = if c == '&' { Token::And } else { Token::Or };
                        tokens.push((start, token));
                    }
                    _ => return Err(parse_error(start, format!("expected '{}{}'", c, c))),
                }
            }
            '"' | '\'' => {
                chars.next();
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, ch)) if ch == c => break,
                        Some((at, '\\')) => match chars.next() {
                            Some((_, 'n')) => value.push('\n'),
                            Some((_, 't')) => value.push('\t'),
                            Some((_, ch @ ('\\' | '"' | '\''))) => value.push(ch),
                            Some((_, other)) => {
                                return Err(parse_error(at, format!("unknown escape '\\{}'", other)))
                            }
                            None => return Err(parse_error(start, "unterminated string")),
                        },
                        Some((_, ch)) => value.push(ch),
                        None => return Err(parse_error(start, "unterminated string")),
                    }
                }
                tokens.push((start, Token::Str(value)));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut word = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "true" => Token::True,
                    "false" => Token::False,
                    _ => Token::Ident(word),
                };
                tokens.push((start, token));
            }
            other => return Err(parse_error(start, format!("unexpected character {:?}", other))),
        }
    }

    tokens.push((input.len(), Token::Eof));
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    index: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &(usize, Token) {
        // The token list always ends with `Eof`, which is never consumed.
        &self.tokens[self.index.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> (usize, Token) {
        let token = self.peek().clone();
        if token.1 != Token::Eof {
            self.index += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.advance() {
            (_, ref token) if *token == expected => Ok(()),
            (offset, token) => Err(parse_error(
                offset,
                format!("expected {}, found {}", expected, token),
            )),
        }
    }

    fn enter(&mut self, offset: usize) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(parse_error(offset, "expression nested too deeply"));
        }
        Ok(())
    }

    fn parse_or(&mut self) -> Result<FilterExpr> {
        let mut expr = self.parse_and()?;
        while self.peek().1 == Token::Or {
            self.advance();
            expr = FilterExpr::or(expr, self.parse_and()?);
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<FilterExpr> {
        let mut expr = self.parse_unary()?;
        while self.peek().1 == Token::And {
            self.advance();
            expr = FilterExpr::and(expr, self.parse_unary()?);
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<FilterExpr> {
        let offset = self.peek().0;
        self.enter(offset)?;

        let expr = if self.peek().1 == Token::Not {
            self.advance();
            FilterExpr::not(self.parse_unary()?)
        } else {
            self.parse_primary()?
        };

        self.depth -= 1;
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<FilterExpr> {
        match self.advance() {
            (_, Token::True) => Ok(FilterExpr::Literal(true)),
            (_, Token::False) => Ok(FilterExpr::Literal(false)),
            (_, Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            (_, Token::Ident(method)) => {
                self.expect(Token::LParen)?;
                let argument = match self.advance() {
                    (_, Token::Str(value)) => value,
                    (offset, token) => {
                        return Err(parse_error(
                            offset,
                            format!("expected string argument to {}, found {}", method, token),
                        ))
                    }
                };
                self.expect(Token::RParen)?;
                Ok(FilterExpr::Predicate { method, argument })
            }
            (offset, token) => Err(parse_error(
                offset,
                format!("expected expression, found {}", token),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kw(arg: &str) -> FilterExpr {
        FilterExpr::predicate("keyword", arg)
    }

    #[test]
    fn test_precedence() {
        // and binds tighter than or, not tighter than both
        let expr = FilterExpr::parse(r#"keyword("a") or not keyword("b") and keyword("c")"#).unwrap();
        assert_eq!(
            expr,
            FilterExpr::or(kw("a"), FilterExpr::and(FilterExpr::not(kw("b")), kw("c")))
        );
    }

    #[test]
    fn test_parens_and_symbols() {
        let expr = FilterExpr::parse(r#"!(keyword('a') || keyword("b")) && TRUE"#).unwrap();
        assert_eq!(
            expr,
            FilterExpr::and(
                FilterExpr::not(FilterExpr::or(kw("a"), kw("b"))),
                FilterExpr::Literal(true)
            )
        );
    }

    #[test]
    fn test_left_associative() {
        let expr = FilterExpr::parse(r#"keyword("a") and keyword("b") and keyword("c")"#).unwrap();
        assert_eq!(
            expr,
            FilterExpr::and(FilterExpr::and(kw("a"), kw("b")), kw("c"))
        );
    }

    #[test]
    fn test_string_escapes() {
        let expr = FilterExpr::parse(r#"match("say \"hi\"\t\\d+")"#).unwrap();
        assert_eq!(expr, FilterExpr::predicate("match", "say \"hi\"\t\\d+"));
    }

    #[test]
    fn test_unknown_method_still_parses() {
        // Method names are checked when the filter is compiled
        let expr = FilterExpr::parse(r#"nope("x")"#).unwrap();
        assert_eq!(expr, FilterExpr::predicate("nope", "x"));
    }

    #[test]
    fn test_errors() {
        let cases = [
            ("", 0),
            ("keyword(\"a\"", 11),
            ("keyword(a)", 8),
            ("keyword(\"a\") and", 16),
            ("keyword(\"a\") keyword(\"b\")", 13),
            ("\"open", 0),
            ("a & b", 2),
            ("#", 0),
        ];

        for (input, expected_offset) in cases {
            match FilterExpr::parse(input) {
                Err(Error::Parse { offset, .. }) => {
                    assert_eq!(offset, expected_offset, "wrong offset for {:?}", input)
                }
                other => panic!("expected parse error for {:?}, got {:?}", input, other),
            }
        }
    }

    #[test]
    fn test_depth_limit() {
        let input = format!("{}true", "not ".repeat(MAX_DEPTH + 1));
        assert!(FilterExpr::parse(&input).is_err());

        let input = format!("{}true", "not ".repeat(10));
        assert!(FilterExpr::parse(&input).is_ok());
    }

    #[test]
    fn test_display_reparses() {
        let expr = FilterExpr::parse(r#"not (keyword("a") or imatch("x\"y")) and false"#).unwrap();
        let printed = expr.to_string();
        assert_eq!(FilterExpr::parse(&printed).unwrap(), expr);
    }
}
