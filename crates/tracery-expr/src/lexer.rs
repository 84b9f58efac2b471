use serde_json::Number;
use winnow::ascii::{digit1, multispace0};
use winnow::combinator::{alt, opt};
use winnow::error::{ContextError, ErrMode};
use winnow::token::{any, one_of, take_while};
use winnow::{ModalResult, Parser};

use tracery_types::TraceryError;

use crate::ast::CompareOp;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Dot,
    Op(CompareOp),
    Ident(String),
    Str(String),
    Number(Number),
}

impl Tok {
    pub(crate) fn describe(&self) -> String {
        match self {
            Tok::LBracket => "'['".into(),
            Tok::RBracket => "']'".into(),
            Tok::LParen => "'('".into(),
            Tok::RParen => "')'".into(),
            Tok::Comma => "','".into(),
            Tok::Dot => "'.'".into(),
            Tok::Op(op) => format!("'{}'", op.symbol()),
            Tok::Ident(name) => format!("'{name}'"),
            Tok::Str(s) => format!("string '{s}'"),
            Tok::Number(n) => format!("number {n}"),
        }
    }
}

/// A token and the byte offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Lexeme {
    pub tok: Tok,
    pub offset: usize,
}

pub(crate) fn syntax_error(source: &str, offset: usize, message: impl Into<String>) -> TraceryError {
    TraceryError::ExpressionSyntax {
        expression: source.to_string(),
        offset,
        message: message.into(),
    }
}

fn ws<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    multispace0.parse_next(input)
}

/// Identifiers and keywords: [A-Za-z_][A-Za-z0-9_]*. Whether a name is
/// allowed is the parser's decision.
fn identifier(input: &mut &str) -> ModalResult<Tok> {
    (
        take_while(1, |c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(0.., |c: char| c.is_ascii_alphanumeric() || c == '_'),
    )
        .take()
        .map(|s: &str| Tok::Ident(s.to_string()))
        .parse_next(input)
}

/// Single- or double-quoted string with backslash escapes.
fn string_literal(input: &mut &str) -> ModalResult<Tok> {
    let quote = one_of(['"', '\'']).parse_next(input)?;
    let mut s = String::new();
    loop {
        let c = any.parse_next(input)?;
        if c == quote {
            break;
        }
        if c == '\\' {
            let esc = any.parse_next(input)?;
            match esc {
                'n' => s.push('\n'),
                't' => s.push('\t'),
                '\\' | '\'' | '"' => s.push(esc),
                other => {
                    s.push('\\');
                    s.push(other);
                }
            }
        } else {
            s.push(c);
        }
    }
    Ok(Tok::Str(s))
}

fn parse_number(text: &str) -> Option<Number> {
    if text.contains('.') {
        return text.parse::<f64>().ok().and_then(Number::from_f64);
    }
    text.parse::<i64>()
        .ok()
        .map(Number::from)
        .or_else(|| text.parse::<f64>().ok().and_then(Number::from_f64))
}

/// Optional leading minus, digits, optional fraction. The minus sign is only
/// ever part of a numeric literal; there is no unary negation operator.
fn number(input: &mut &str) -> ModalResult<Tok> {
    let text: &str = (opt('-'), digit1, opt(('.', digit1)))
        .take()
        .parse_next(input)?;
    parse_number(text)
        .map(Tok::Number)
        .ok_or_else(|| ErrMode::Backtrack(ContextError::new()))
}

fn operator(input: &mut &str) -> ModalResult<Tok> {
    alt((
        "==".value(CompareOp::Eq),
        "!=".value(CompareOp::NotEq),
        "<=".value(CompareOp::LtEq),
        ">=".value(CompareOp::GtEq),
        "<".value(CompareOp::Lt),
        ">".value(CompareOp::Gt),
    ))
    .map(Tok::Op)
    .parse_next(input)
}

fn punct(input: &mut &str) -> ModalResult<Tok> {
    alt((
        '['.value(Tok::LBracket),
        ']'.value(Tok::RBracket),
        '('.value(Tok::LParen),
        ')'.value(Tok::RParen),
        ','.value(Tok::Comma),
        '.'.value(Tok::Dot),
    ))
    .parse_next(input)
}

fn lexeme(input: &mut &str) -> ModalResult<Tok> {
    alt((string_literal, number, operator, punct, identifier)).parse_next(input)
}

/// Split `source` into tokens. Any character outside the token set is
/// rejected here, before the parser ever sees it.
pub(crate) fn tokenize(source: &str) -> Result<Vec<Lexeme>, TraceryError> {
    let mut input = source;
    let mut out = Vec::new();
    loop {
        let _ = ws.parse_next(&mut input);
        if input.is_empty() {
            break;
        }
        let offset = source.len() - input.len();
        let next = input.chars().next();
        match lexeme.parse_next(&mut input) {
            Ok(tok) => out.push(Lexeme { tok, offset }),
            Err(_) => {
                let message = match next {
                    Some('"') | Some('\'') => "unterminated string literal".to_string(),
                    Some(c) => format!("unexpected character '{c}'"),
                    None => "unexpected end of input".to_string(),
                };
                return Err(syntax_error(source, offset, message));
            }
        }
    }
    Ok(out)
}
