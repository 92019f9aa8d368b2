use super::lexer::Tok;
use crate::{Error, Result};

/// Expression tree. There are no statements, assignments or loops; a
/// formula is a single expression over the evaluation context.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Ident(String),
    /// `object.field`
    Member(Box<Expr>, String),
    /// `object[index]`
    Index(Box<Expr>, Box<Expr>),
    /// `name(args)` or `Math.name(args)` - callee is a fixed path, so only
    /// the closed intrinsic set is callable.
    Call(Vec<String>, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

pub struct Parser<'a> {
    formula: &'a str,
    tokens: Vec<Tok>,
    pos: usize,
}

impl<'a> Parser<'a> {
    pub fn new(formula: &'a str, tokens: Vec<Tok>) -> Self {
        Self {
            formula,
            tokens,
            pos: 0,
        }
    }

    pub fn parse(mut self) -> Result<Expr> {
        let expr = self.expr_bp(0)?;
        if self.pos != self.tokens.len() {
            return Err(self.err(format!("unexpected trailing token {:?}", self.tokens[self.pos])));
        }
        Ok(expr)
    }

    fn err(&self, message: String) -> Error {
        Error::FormulaParse {
            formula: self.formula.to_string(),
            message,
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Tok) -> Result<()> {
        match self.bump() {
            Some(tok) if &tok == expected => Ok(()),
            Some(tok) => Err(self.err(format!("expected {:?}, found {:?}", expected, tok))),
            None => Err(self.err(format!("expected {:?}, found end of formula", expected))),
        }
    }

    /// Pratt loop. `min_bp` is the minimum binding power the caller accepts.
    fn expr_bp(&mut self, min_bp: u8) -> Result<Expr> {
        let mut lhs = self.prefix()?;

        loop {
            let op = match self.peek() {
                Some(Tok::Question) => {
                    // Ternary binds loosest and is right-associative.
                    if min_bp > 1 {
                        break;
                    }
                    self.bump();
                    let then = self.expr_bp(0)?;
                    self.expect(&Tok::Colon)?;
                    let otherwise = self.expr_bp(1)?;
                    lhs = Expr::Ternary(Box::new(lhs), Box::new(then), Box::new(otherwise));
                    continue;
                }
                Some(Tok::OrOr) => (BinaryOp::Or, 3, 4),
                Some(Tok::AndAnd) => (BinaryOp::And, 5, 6),
                Some(Tok::EqEq) => (BinaryOp::Eq, 7, 8),
                Some(Tok::NotEq) => (BinaryOp::Ne, 7, 8),
                Some(Tok::Lt) => (BinaryOp::Lt, 9, 10),
                Some(Tok::Le) => (BinaryOp::Le, 9, 10),
                Some(Tok::Gt) => (BinaryOp::Gt, 9, 10),
                Some(Tok::Ge) => (BinaryOp::Ge, 9, 10),
                Some(Tok::Plus) => (BinaryOp::Add, 11, 12),
                Some(Tok::Minus) => (BinaryOp::Sub, 11, 12),
                Some(Tok::Star) => (BinaryOp::Mul, 13, 14),
                Some(Tok::Slash) => (BinaryOp::Div, 13, 14),
                Some(Tok::Percent) => (BinaryOp::Rem, 13, 14),
                _ => break,
            };

            let (op, l_bp, r_bp) = op;
            if l_bp < min_bp {
                break;
            }
            self.bump();
            let rhs = self.expr_bp(r_bp)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr> {
        let expr = match self.bump() {
            Some(Tok::Number(n)) => Expr::Number(n),
            Some(Tok::Str(s)) => Expr::Str(s),
            Some(Tok::True) => Expr::Bool(true),
            Some(Tok::False) => Expr::Bool(false),
            Some(Tok::Null) => Expr::Null,
            Some(Tok::Ident(name)) => Expr::Ident(name),
            Some(Tok::Minus) => {
                let operand = self.expr_bp(15)?;
                Expr::Unary(UnaryOp::Neg, Box::new(operand))
            }
            Some(Tok::Bang) => {
                let operand = self.expr_bp(15)?;
                Expr::Unary(UnaryOp::Not, Box::new(operand))
            }
            Some(Tok::LParen) => {
                let inner = self.expr_bp(0)?;
                self.expect(&Tok::RParen)?;
                inner
            }
            Some(tok) => return Err(self.err(format!("unexpected token {:?}", tok))),
            None => return Err(self.err("empty formula".to_string())),
        };

        self.postfix(expr)
    }

    fn postfix(&mut self, mut expr: Expr) -> Result<Expr> {
        loop {
            match self.peek() {
                Some(Tok::Dot) => {
                    self.bump();
                    let name = match self.bump() {
                        Some(Tok::Ident(name)) => name,
                        other => {
                            return Err(self.err(format!(
                                "expected property name after `.`, found {:?}",
                                other
                            )))
                        }
                    };
                    expr = Expr::Member(Box::new(expr), name);
                }
                Some(Tok::LBracket) => {
                    self.bump();
                    let index = self.expr_bp(0)?;
                    self.expect(&Tok::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Some(Tok::LParen) => {
                    let path = match callee_path(&expr) {
                        Some(path) => path,
                        // `(a + b)(x)` and friends: nothing user-defined is
                        // callable, so reject instead of guessing.
                        None => return Err(self.err("only intrinsic functions are callable".to_string())),
                    };
                    self.bump();
                    let mut args = Vec::new();
                    if self.peek() != Some(&Tok::RParen) {
                        loop {
                            args.push(self.expr_bp(0)?);
                            match self.peek() {
                                Some(Tok::Comma) => {
                                    self.bump();
                                }
                                _ => break,
                            }
                        }
                    }
                    self.expect(&Tok::RParen)?;
                    expr = Expr::Call(path, args);
                }
                _ => break,
            }
        }
        Ok(expr)
    }
}

fn callee_path(expr: &Expr) -> Option<Vec<String>> {
    match expr {
        Expr::Ident(name) => Some(vec![name.clone()]),
        Expr::Member(base, name) => {
            let mut path = callee_path(base)?;
            path.push(name.clone());
            Some(path)
        }
        _ => None,
    }
}
