// src/variables/condition.rs

//! Condition expressions
//!
//! Grammar (keywords are case-insensitive):
//!
//! ```text
//! expr       := and ( OR and )*
//! and        := unary ( AND unary )*
//! unary      := NOT unary | primary
//! primary    := '(' expr ')' | operand ( cmp-op operand )?
//! operand    := identifier | "string" | integer | v-version
//! cmp-op     := = | <> | < | <= | > | >=
//! ```
//!
//! A word such as `v2Enabled` that does not parse as a version is an
//! identifier.
//!
//! A lone operand is truthy when it resolves to a non-empty string, a
//! non-zero number, or any version. Comparisons against an absent variable
//! are false, except `<>` which is true when the other side is present.

use super::{Snapshot, Value};
use crate::error::{Error, Result};
use crate::version::Version;
use std::cmp::Ordering;
use std::fmt;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            Self::Eq => ord == Ordering::Equal,
            Self::Ne => ord != Ordering::Equal,
            Self::Lt => ord == Ordering::Less,
            Self::Le => ord != Ordering::Greater,
            Self::Gt => ord == Ordering::Greater,
            Self::Ge => ord != Ordering::Less,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Ver(Version),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone)]
enum Operand {
    Variable(String),
    Literal(Value),
}

#[derive(Debug, Clone)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CompareOp, Operand),
    Truthy(Operand),
}

/// A parsed condition, reusable across evaluations
#[derive(Debug, Clone)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            source,
            tokens: &tokens,
            pos: 0,
        };
        if tokens.is_empty() {
            return Err(parser.error(0, "empty condition"));
        }
        let expr = parser.parse_or()?;
        if let Some((offset, tok)) = parser.peek() {
            return Err(parser.error(*offset, &format!("unexpected {:?}", tok)));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, vars: &Snapshot<'_>) -> bool {
        eval(&self.expr, vars)
    }
}

fn syntax(source: &str, position: usize, message: impl Into<String>) -> Error {
    Error::ConditionSyntax {
        condition: source.to_string(),
        position,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => {
                i += 1;
                continue;
            }
            b'(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            b')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            b'=' => {
                tokens.push((start, Token::Op(CompareOp::Eq)));
                i += 1;
            }
            b'<' => {
                let (op, len) = match bytes.get(i + 1) {
                    Some(b'>') => (CompareOp::Ne, 2),
                    Some(b'=') => (CompareOp::Le, 2),
                    _ => (CompareOp::Lt, 1),
                };
                tokens.push((start, Token::Op(op)));
                i += len;
            }
            b'>' => {
                let (op, len) = match bytes.get(i + 1) {
                    Some(b'=') => (CompareOp::Ge, 2),
                    _ => (CompareOp::Gt, 1),
                };
                tokens.push((start, Token::Op(op)));
                i += len;
            }
            b'"' => {
                let close = source[i + 1..]
                    .find('"')
                    .ok_or_else(|| syntax(source, start, "unterminated string"))?;
                tokens.push((start, Token::Str(source[i + 1..i + 1 + close].to_string())));
                i += close + 2;
            }
            b'-' | b'0'..=b'9' => {
                i += 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let text = &source[start..i];
                let n = text
                    .parse::<i64>()
                    .map_err(|_| syntax(source, start, format!("invalid number '{}'", text)))?;
                tokens.push((start, Token::Int(n)));
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                if matches!(c, b'v' | b'V')
                    && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)
                    && let Some((end, v)) = version_literal(source, start)
                {
                    tokens.push((start, Token::Ver(v)));
                    i = end;
                    continue;
                }
                i = identifier_end(bytes, start);
                let word = &source[start..i];
                let token = match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    _ => Token::Ident(word.to_string()),
                };
                tokens.push((start, token));
            }
            _ => {
                let ch = source[i..].chars().next().unwrap_or('?');
                return Err(syntax(source, start, format!("unexpected character '{}'", ch)));
            }
        }
    }

    Ok(tokens)
}

fn identifier_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || matches!(bytes[i], b'_' | b'.')) {
        i += 1;
    }
    i
}

/// A `v1.2.3` literal starting at `start`, or `None` when the text does not
/// parse as a version and should be read as an identifier instead
fn version_literal(source: &str, start: usize) -> Option<(usize, Version)> {
    let bytes = source.as_bytes();
    let mut end = start + 1;
    while end < bytes.len()
        && (bytes[end].is_ascii_alphanumeric() || matches!(bytes[end], b'.' | b'-' | b'+'))
    {
        end += 1;
    }
    Version::parse(&source[start..end]).ok().map(|v| (end, v))
}

struct Parser<'a> {
    source: &'a str,
    tokens: &'a [(usize, Token)],
    pos: usize,
}

impl Parser<'_> {
    fn error(&self, position: usize, message: &str) -> Error {
        syntax(self.source, position, message)
    }

    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek().is_some_and(|(_, t)| t == token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn end_offset(&self) -> usize {
        self.source.len()
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;
        while self.eat(&Token::And) {
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        if self.eat(&Token::LParen) {
            let inner = self.parse_or()?;
            if !self.eat(&Token::RParen) {
                let at = self.peek().map_or(self.end_offset(), |(o, _)| *o);
                return Err(self.error(at, "expected ')'"));
            }
            return Ok(inner);
        }

        let left = self.parse_operand()?;
        if let Some((_, Token::Op(op))) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.parse_operand()?;
            return Ok(Expr::Compare(left, op, right));
        }
        Ok(Expr::Truthy(left))
    }

    fn parse_operand(&mut self) -> Result<Operand> {
        let Some((offset, token)) = self.peek() else {
            return Err(self.error(self.end_offset(), "unexpected end of condition"));
        };
        let operand = match token {
            Token::Ident(name) => Operand::Variable(name.clone()),
            Token::Str(s) => Operand::Literal(Value::String(s.clone())),
            Token::Int(n) => Operand::Literal(Value::Numeric(*n)),
            Token::Ver(v) => Operand::Literal(Value::Version(v.clone())),
            other => return Err(self.error(*offset, &format!("expected operand, found {:?}", other))),
        };
        self.pos += 1;
        Ok(operand)
    }
}

/// Operand after variable resolution
enum Resolved<'a> {
    Absent,
    Str(&'a str),
    Num(i64),
    Ver(&'a Version),
}

fn resolve<'a>(operand: &'a Operand, vars: &'a Snapshot<'_>) -> Resolved<'a> {
    let value = match operand {
        Operand::Variable(name) => match vars.lookup(name) {
            Some(v) => v,
            None => return Resolved::Absent,
        },
        Operand::Literal(v) => v,
    };
    match value {
        Value::String(s) => Resolved::Str(s),
        Value::SecureString(s) => Resolved::Str(s.expose()),
        Value::Numeric(n) => Resolved::Num(*n),
        Value::Version(v) => Resolved::Ver(v),
    }
}

fn as_version(r: &Resolved<'_>) -> Option<Version> {
    match r {
        Resolved::Ver(v) => Some((*v).clone()),
        Resolved::Num(n) => u64::try_from(*n).ok().map(|n| Version::new(vec![n])),
        Resolved::Str(s) => Version::parse(s).ok(),
        Resolved::Absent => None,
    }
}

fn compare(left: &Resolved<'_>, op: CompareOp, right: &Resolved<'_>) -> bool {
    use Resolved::*;

    match (left, right) {
        (Absent, Absent) => false,
        (Absent, _) | (_, Absent) => op == CompareOp::Ne,
        (Ver(_), _) | (_, Ver(_)) => match (as_version(left), as_version(right)) {
            (Some(a), Some(b)) => op.holds(a.cmp(&b)),
            _ => op == CompareOp::Ne,
        },
        (Num(a), Num(b)) => op.holds(a.cmp(b)),
        (Str(a), Str(b)) => op.holds(a.cmp(b)),
        // Mixed string/number: numeric when the string parses, otherwise unequal
        (Num(a), Str(b)) => match b.trim().parse::<i64>() {
            Ok(b) => op.holds(a.cmp(&b)),
            Err(_) => op == CompareOp::Ne,
        },
        (Str(a), Num(b)) => match a.trim().parse::<i64>() {
            Ok(a) => op.holds(a.cmp(b)),
            Err(_) => op == CompareOp::Ne,
        },
    }
}

fn eval(expr: &Expr, vars: &Snapshot<'_>) -> bool {
    match expr {
        Expr::Or(a, b) => eval(a, vars) || eval(b, vars),
        Expr::And(a, b) => eval(a, vars) && eval(b, vars),
        Expr::Not(inner) => !eval(inner, vars),
        Expr::Truthy(operand) => match resolve(operand, vars) {
            Resolved::Absent => false,
            Resolved::Str(s) => !s.is_empty(),
            Resolved::Num(n) => n != 0,
            Resolved::Ver(_) => true,
        },
        Expr::Compare(l, op, r) => compare(&resolve(l, vars), *op, &resolve(r, vars)),
    }
}
