use thiserror::Error;

use crate::lexer::{Token, TokenKind};
use crate::value::Value;

#[derive(Error, Debug, Clone)]
#[error("{message} at offset {offset} in `{source_text}`")]
pub struct ParseError {
    pub source_text: String,
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(source: &str, offset: usize, message: &str) -> Self {
        ParseError {
            source_text: source.to_string(),
            offset,
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone)]
pub enum Ast {
    Literal(Value),
    Ident(String),
    Member(Box<Ast>, String),
    Call(String, Vec<Ast>),
    Not(Box<Ast>),
    Binary(BinOp, Box<Ast>, Box<Ast>),
}

/// Known builtins; anything else is rejected at parse time so a typo in a
/// `when` clause surfaces at config load, not mid-task.
const BUILTINS: &[&str] = &["includes", "startsWith", "trim", "length", "default"];

pub fn parse(tokens: &[Token], source: &str) -> Result<Ast, ParseError> {
    let mut parser = Parser {
        tokens,
        source,
        pos: 0,
    };
    let ast = parser.or_expr()?;
    parser.expect_eof()?;
    Ok(ast)
}

struct Parser<'a> {
    tokens: &'a [Token],
    source: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn bump(&mut self) -> Token {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if &self.peek().kind == kind {
            let _ = self.bump();
            true
        } else {
            false
        }
    }

    fn error(&self, message: &str) -> ParseError {
        ParseError::new(self.source, self.peek().pos, message)
    }

    fn expect_eof(&self) -> Result<(), ParseError> {
        if self.peek().kind == TokenKind::Eof {
            Ok(())
        } else {
            Err(self.error("unexpected trailing input"))
        }
    }

    fn or_expr(&mut self) -> Result<Ast, ParseError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&TokenKind::OrOr) {
            let rhs = self.and_expr()?;
            lhs = Ast::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Ast, ParseError> {
        let mut lhs = self.equality()?;
        while self.eat(&TokenKind::AndAnd) {
            let rhs = self.equality()?;
            lhs = Ast::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Ast, ParseError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::NotEq => BinOp::Ne,
                _ => break,
            };
            let _ = self.bump();
            let rhs = self.comparison()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn comparison(&mut self) -> Result<Ast, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                _ => break,
            };
            let _ = self.bump();
            let rhs = self.unary()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Ast, ParseError> {
        if self.eat(&TokenKind::Bang) {
            return Ok(Ast::Not(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Ast, ParseError> {
        let mut node = self.primary()?;
        loop {
            if self.eat(&TokenKind::Dot) {
                match self.bump().kind {
                    TokenKind::Ident(name) => {
                        node = Ast::Member(Box::new(node), name);
                    }
                    _ => return Err(self.error("expected property name after '.'")),
                }
            } else {
                break;
            }
        }
        Ok(node)
    }

    fn primary(&mut self) -> Result<Ast, ParseError> {
        let tok = self.bump();
        match tok.kind {
            TokenKind::Number(n) => Ok(Ast::Literal(Value::Number(n))),
            TokenKind::Str(s) => Ok(Ast::Literal(Value::Str(s))),
            TokenKind::True => Ok(Ast::Literal(Value::Bool(true))),
            TokenKind::False => Ok(Ast::Literal(Value::Bool(false))),
            TokenKind::Null => Ok(Ast::Literal(Value::Null)),
            TokenKind::LParen => {
                let inner = self.or_expr()?;
                if self.eat(&TokenKind::RParen) {
                    Ok(inner)
                } else {
                    Err(self.error("expected ')'"))
                }
            }
            TokenKind::Ident(name) => {
                if self.eat(&TokenKind::LParen) {
                    if !BUILTINS.contains(&name.as_str()) {
                        return Err(ParseError::new(
                            self.source,
                            tok.pos,
                            &format!("unknown function '{name}'"),
                        ));
                    }
                    let mut args = Vec::new();
                    if !self.eat(&TokenKind::RParen) {
                        loop {
                            args.push(self.or_expr()?);
                            if self.eat(&TokenKind::Comma) {
                                continue;
                            }
                            if self.eat(&TokenKind::RParen) {
                                break;
                            }
                            return Err(self.error("expected ',' or ')' in argument list"));
                        }
                    }
                    Ok(Ast::Call(name, args))
                } else {
                    Ok(Ast::Ident(name))
                }
            }
            _ => Err(ParseError::new(self.source, tok.pos, "expected expression")),
        }
    }
}
