//! Allowlist parser for the condition language.
//!
//! Grammar:
//! ```text
//! expr        ::= or_expr
//! or_expr     ::= and_expr ( 'or' and_expr )*
//! and_expr    ::= not_expr ( 'and' not_expr )*
//! not_expr    ::= 'not' not_expr | comparison
//! comparison  ::= operand ( comp_op operand )?
//! comp_op     ::= '==' | '!=' | '<' | '<=' | '>' | '>=' | 'in' | 'not' 'in'
//! operand     ::= literal | field | list | '(' expr ')'
//! field       ::= 'row' ( '[' key ']' )+ | 'row' '.' 'get' '(' string ( ',' literal )? ')'
//! key         ::= string | integer
//! list        ::= '[' ( literal ( ',' literal )* ','? )? ']'
//! literal     ::= string | number | 'true' | 'false' | 'null' | 'True' | 'False' | 'None'
//! ```
//!
//! Anything not produced by these rules is a parse error. Comparisons do not
//! chain, and nesting through parentheses or `not` is capped at [`MAX_DEPTH`].

use serde_json::Value;
use tracery_types::TraceryError;

use crate::ast::{CompareOp, Expr, FieldKey, FieldPath};
use crate::lexer::{syntax_error, tokenize, Lexeme, Tok};

pub const MAX_DEPTH: usize = 32;

struct Parser<'s> {
    source: &'s str,
    tokens: Vec<Lexeme>,
    pos: usize,
    depth: usize,
}

pub(crate) fn parse(source: &str) -> Result<Expr, TraceryError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(syntax_error(source, 0, "empty expression"));
    }
    let mut parser = Parser {
        source,
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or_expr()?;
    if let Some(lexeme) = parser.tokens.get(parser.pos) {
        return Err(syntax_error(
            source,
            lexeme.offset,
            format!("unexpected {}", lexeme.tok.describe()),
        ));
    }
    Ok(expr)
}

/// A single clause stands alone; two or more share one flat node.
fn connective(mut clauses: Vec<Expr>, wrap: fn(Vec<Expr>) -> Expr) -> Expr {
    if clauses.len() == 1 {
        if let Some(only) = clauses.pop() {
            return only;
        }
    }
    wrap(clauses)
}

fn is_keyword(tok: Option<&Tok>, word: &str) -> bool {
    matches!(tok, Some(Tok::Ident(name)) if name == word)
}

impl<'s> Parser<'s> {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|l| &l.tok)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Tok> {
        self.tokens.get(self.pos + ahead).map(|l| &l.tok)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|l| l.offset)
            .unwrap_or(self.source.len())
    }

    fn error(&self, message: impl Into<String>) -> TraceryError {
        syntax_error(self.source, self.offset(), message)
    }

    fn advance(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).map(|l| l.tok.clone());
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Tok) -> Result<(), TraceryError> {
        match self.peek() {
            Some(tok) if *tok == expected => {
                self.pos += 1;
                Ok(())
            }
            Some(tok) => Err(self.error(format!(
                "expected {}, found {}",
                expected.describe(),
                tok.describe()
            ))),
            None => Err(self.error(format!(
                "expected {}, found end of expression",
                expected.describe()
            ))),
        }
    }

    fn enter(&mut self) -> Result<(), TraceryError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!("nesting deeper than {MAX_DEPTH} levels")));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn or_expr(&mut self) -> Result<Expr, TraceryError> {
        let mut clauses = vec![self.and_expr()?];
        while is_keyword(self.peek(), "or") {
            self.pos += 1;
            clauses.push(self.and_expr()?);
        }
        Ok(connective(clauses, Expr::Or))
    }

    fn and_expr(&mut self) -> Result<Expr, TraceryError> {
        let mut clauses = vec![self.not_expr()?];
        while is_keyword(self.peek(), "and") {
            self.pos += 1;
            clauses.push(self.not_expr()?);
        }
        Ok(connective(clauses, Expr::And))
    }

    fn not_expr(&mut self) -> Result<Expr, TraceryError> {
        if is_keyword(self.peek(), "not") {
            self.pos += 1;
            self.enter()?;
            let inner = self.not_expr()?;
            self.leave();
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    /// Returns the operator at the cursor and how many tokens it spans.
    fn peek_compare_op(&self) -> Option<(CompareOp, usize)> {
        match self.peek() {
            Some(Tok::Op(op)) => Some((*op, 1)),
            Some(Tok::Ident(name)) if name == "in" => Some((CompareOp::In, 1)),
            Some(Tok::Ident(name)) if name == "not" && is_keyword(self.peek_at(1), "in") => {
                Some((CompareOp::NotIn, 2))
            }
            _ => None,
        }
    }

    fn comparison(&mut self) -> Result<Expr, TraceryError> {
        let left = self.operand()?;
        let Some((op, width)) = self.peek_compare_op() else {
            return Ok(left);
        };
        self.pos += width;
        let right = self.operand()?;
        if self.peek_compare_op().is_some() {
            return Err(self.error("chained comparisons are not allowed; combine with 'and'"));
        }
        Ok(Expr::Compare {
            left: Box::new(left),
            op,
            right: Box::new(right),
        })
    }

    fn operand(&mut self) -> Result<Expr, TraceryError> {
        let expr = match self.peek().cloned() {
            None => return Err(self.error("unexpected end of expression")),
            Some(Tok::LParen) => {
                self.pos += 1;
                self.enter()?;
                let inner = self.or_expr()?;
                self.expect(Tok::RParen)?;
                self.leave();
                inner
            }
            Some(Tok::LBracket) => self.list()?,
            Some(Tok::Ident(name)) if name == "row" => {
                self.pos += 1;
                self.field()?
            }
            Some(_) => Expr::Literal(self.literal()?),
        };
        // Nothing may be applied to an operand: no calls, attributes, or subscripts.
        match self.peek() {
            Some(Tok::LParen) => Err(self.error("function calls are not allowed")),
            Some(Tok::Dot) => Err(self.error("attribute access is not allowed")),
            Some(Tok::LBracket) => Err(self.error("subscripts are only allowed on 'row'")),
            _ => Ok(expr),
        }
    }

    fn literal(&mut self) -> Result<Value, TraceryError> {
        let value = match self.peek() {
            Some(Tok::Str(s)) => Value::String(s.clone()),
            Some(Tok::Number(n)) => Value::Number(n.clone()),
            Some(Tok::Ident(name)) => match name.as_str() {
                "true" | "True" => Value::Bool(true),
                "false" | "False" => Value::Bool(false),
                "null" | "None" => Value::Null,
                other => return Err(self.error(format!("name '{other}' is not allowed"))),
            },
            Some(tok) => return Err(self.error(format!("unexpected {}", tok.describe()))),
            None => return Err(self.error("unexpected end of expression")),
        };
        self.pos += 1;
        Ok(value)
    }

    fn list(&mut self) -> Result<Expr, TraceryError> {
        self.expect(Tok::LBracket)?;
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&Tok::RBracket) {
                self.pos += 1;
                break;
            }
            items.push(self.literal()?);
            match self.advance() {
                Some(Tok::Comma) => continue,
                Some(Tok::RBracket) => break,
                Some(tok) => {
                    self.pos -= 1;
                    return Err(self.error(format!(
                        "expected ',' or ']' in list, found {}",
                        tok.describe()
                    )));
                }
                None => return Err(self.error("unterminated list")),
            }
        }
        Ok(Expr::List(items))
    }

    fn field(&mut self) -> Result<Expr, TraceryError> {
        match self.peek() {
            Some(Tok::LBracket) => {
                let mut keys = Vec::new();
                while self.peek() == Some(&Tok::LBracket) {
                    self.pos += 1;
                    let key = match self.peek() {
                        Some(Tok::Str(s)) => FieldKey::Name(s.clone()),
                        Some(Tok::Number(n)) if n.is_i64() => {
                            FieldKey::Index(n.as_i64().unwrap_or_default())
                        }
                        _ => {
                            return Err(
                                self.error("field keys must be string or integer literals")
                            )
                        }
                    };
                    self.pos += 1;
                    self.expect(Tok::RBracket)?;
                    keys.push(key);
                }
                Ok(Expr::Field(FieldPath { keys }))
            }
            Some(Tok::Dot) => {
                self.pos += 1;
                if !is_keyword(self.peek(), "get") {
                    return Err(self.error(
                        "attribute access is not allowed; only row.get(...) is permitted",
                    ));
                }
                self.pos += 1;
                self.expect(Tok::LParen)?;
                let key = match self.peek() {
                    Some(Tok::Str(s)) => s.clone(),
                    _ => return Err(self.error("row.get() key must be a string literal")),
                };
                self.pos += 1;
                let default = if self.peek() == Some(&Tok::Comma) {
                    self.pos += 1;
                    Some(self.literal()?)
                } else {
                    None
                };
                self.expect(Tok::RParen)?;
                Ok(Expr::Get { key, default })
            }
            _ => Err(self.error("'row' must be followed by a field lookup")),
        }
    }
}
