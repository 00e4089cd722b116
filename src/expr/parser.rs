//! Recursive-descent parser producing the expression AST.
//!
//! Grammar (Python expression subset, lowest precedence first):
//!
//! ```text
//! ternary    := or_expr [ 'if' or_expr 'else' ternary ]
//! or_expr    := and_expr ( 'or' and_expr )*
//! and_expr   := not_expr ( 'and' not_expr )*
//! not_expr   := 'not' not_expr | comparison
//! comparison := arith ( ('=='|'!='|'<'|'<='|'>'|'>=') arith )*
//! arith      := term ( ('+'|'-') term )*
//! term       := unary ( ('*'|'/'|'//'|'%') unary )*
//! unary      := ('-'|'+') unary | power
//! power      := atom [ '**' unary ]
//! atom       := literal | list | call | ident | '(' ternary ')'
//! call       := ident '(' args ')' | ident '.' ident '(' args ')'
//! ```
//!
//! Attribute access is only legal as a call on a namespace identifier
//! (`random.choice(...)`); everything else is rejected at parse time.

use super::lexer::{Token, tokenize};
use super::value::Value;
use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    List(Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    /// Short-circuiting boolean chain; `all` selects and vs. or.
    BoolChain { all: bool, operands: Vec<Expr> },
    /// Python-style chained comparison: `a < b <= c`.
    Compare { first: Box<Expr>, rest: Vec<(CmpOp, Expr)> },
    /// `body if cond else orelse`
    Conditional {
        body: Box<Expr>,
        cond: Box<Expr>,
        orelse: Box<Expr>,
    },
    /// Call to a safe function; namespaced calls use "random.choice" form.
    Call { func: String, args: Vec<Expr> },
}

/// Parse an expression string into an AST.
pub fn parse(src: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.ternary()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::syntax(
            parser.pos,
            format!("unexpected trailing token {:?}", parser.tokens[parser.pos]),
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExprError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(ExprError::syntax(
                self.pos,
                format!("expected {:?}, found {:?}", expected, self.peek()),
            ))
        }
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let body = self.or_expr()?;
        if self.eat(&Token::If) {
            let cond = self.or_expr()?;
            self.expect(&Token::Else)?;
            let orelse = self.ternary()?;
            Ok(Expr::Conditional {
                body: Box::new(body),
                cond: Box::new(cond),
                orelse: Box::new(orelse),
            })
        } else {
            Ok(body)
        }
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let first = self.and_expr()?;
        if self.peek() != Some(&Token::Or) {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::Or) {
            operands.push(self.and_expr()?);
        }
        Ok(Expr::BoolChain { all: false, operands })
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let first = self.not_expr()?;
        if self.peek() != Some(&Token::And) {
            return Ok(first);
        }
        let mut operands = vec![first];
        while self.eat(&Token::And) {
            operands.push(self.not_expr()?);
        }
        Ok(Expr::BoolChain { all: true, operands })
    }

    fn not_expr(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let inner = self.not_expr()?;
            Ok(Expr::Unary(UnaryOp::Not, Box::new(inner)))
        } else {
            self.comparison()
        }
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let first = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Eq) => CmpOp::Eq,
                Some(Token::NotEq) => CmpOp::NotEq,
                Some(Token::Lt) => CmpOp::Lt,
                Some(Token::LtEq) => CmpOp::LtEq,
                Some(Token::Gt) => CmpOp::Gt,
                Some(Token::GtEq) => CmpOp::GtEq,
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Compare {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn arith(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::DoubleSlash) => BinaryOp::FloorDiv,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Pos, Box::new(self.unary()?)))
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, ExprError> {
        let base = self.atom()?;
        if self.eat(&Token::DoubleStar) {
            // right-associative, binds tighter than unary on the right
            let exponent = self.unary()?;
            Ok(Expr::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ))
        } else {
            Ok(base)
        }
    }

    fn atom(&mut self) -> Result<Expr, ExprError> {
        match self.advance() {
            Some(Token::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Token::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::Str(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::None) => Ok(Expr::Literal(Value::None)),
            Some(Token::LParen) => {
                let inner = self.ternary()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(&Token::Comma)?;
                        // tolerate a trailing comma before ]
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                    }
                }
                Ok(Expr::List(items))
            }
            Some(Token::Ident(name)) => {
                if self.eat(&Token::Dot) {
                    let method = match self.advance() {
                        Some(Token::Ident(method)) => method,
                        other => {
                            return Err(ExprError::syntax(
                                self.pos,
                                format!("expected method name after '.', found {other:?}"),
                            ));
                        }
                    };
                    self.expect(&Token::LParen)?;
                    let args = self.call_args()?;
                    Ok(Expr::Call {
                        func: format!("{name}.{method}"),
                        args,
                    })
                } else if self.eat(&Token::LParen) {
                    let args = self.call_args()?;
                    Ok(Expr::Call { func: name, args })
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            other => Err(ExprError::syntax(
                self.pos,
                format!("unexpected token {other:?}"),
            )),
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.ternary()?);
            if self.eat(&Token::RParen) {
                break;
            }
            self.expect(&Token::Comma)?;
        }
        Ok(args)
    }
}
