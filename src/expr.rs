//! Restricted arithmetic expressions over named symbols.
//!
//! Supports numbers, symbols, `+ - * / ^` (also `**`), parentheses and a
//! fixed set of functions. Nothing else is evaluated.

use std::collections::BTreeMap;

use crate::error::{FeaError, FeaResult};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Symbol(String),
    Neg(Box<Expr>),
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Call { name: String, args: Vec<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Parse and evaluate in one go.
pub fn evaluate(expression: &str, symbols: &BTreeMap<String, f64>) -> FeaResult<f64> {
    let expr = parse(expression)?;
    eval(&expr, symbols).map_err(|message| FeaError::expression(expression, message))
}

pub fn parse(expression: &str) -> FeaResult<Expr> {
    let tokens = tokenize(expression).map_err(|m| FeaError::expression(expression, m))?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser
        .expression()
        .map_err(|m| FeaError::expression(expression, m))?;
    if parser.pos != parser.tokens.len() {
        return Err(FeaError::expression(
            expression,
            format!("unexpected token {:?}", parser.tokens[parser.pos]),
        ));
    }
    Ok(expr)
}

fn tokenize(expression: &str) -> Result<Vec<Token>, String> {
    let bytes = expression.as_bytes();
    let mut idx = 0usize;
    let mut tokens = Vec::new();
    while idx < bytes.len() {
        let b = bytes[idx];
        if b.is_ascii_whitespace() {
            idx += 1;
            continue;
        }
        match b {
            b'+' => tokens.push(Token::Plus),
            b'-' => tokens.push(Token::Minus),
            b'*' if bytes.get(idx + 1) == Some(&b'*') => {
                tokens.push(Token::Caret);
                idx += 1;
            }
            b'*' => tokens.push(Token::Star),
            b'/' => tokens.push(Token::Slash),
            b'^' => tokens.push(Token::Caret),
            b'(' => tokens.push(Token::LParen),
            b')' => tokens.push(Token::RParen),
            b',' => tokens.push(Token::Comma),
            _ if b.is_ascii_digit() || b == b'.' => {
                let start = idx;
                idx += 1;
                while idx < bytes.len() {
                    let c = bytes[idx];
                    let exponent_sign =
                        matches!(c, b'+' | b'-') && matches!(bytes[idx - 1], b'e' | b'E');
                    if c.is_ascii_digit() || c == b'.' || matches!(c, b'e' | b'E') || exponent_sign {
                        idx += 1;
                    } else {
                        break;
                    }
                }
                let raw = &expression[start..idx];
                let value = raw
                    .parse::<f64>()
                    .map_err(|e| format!("invalid numeric literal '{}': {}", raw, e))?;
                tokens.push(Token::Number(value));
                continue;
            }
            _ if b.is_ascii_alphabetic() || b == b'_' => {
                let start = idx;
                while idx < bytes.len() && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_') {
                    idx += 1;
                }
                tokens.push(Token::Ident(expression[start..idx].to_string()));
                continue;
            }
            _ => return Err(format!("unsupported character '{}'", b as char)),
        }
        idx += 1;
    }
    if tokens.is_empty() {
        return Err("expression is empty".to_string());
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expression(&mut self) -> Result<Expr, String> {
        let mut left = self.term()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(BinaryOp::Add),
            Some(Token::Minus) => Some(BinaryOp::Sub),
            _ => None,
        } {
            self.pos += 1;
            let right = self.term()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(BinaryOp::Mul),
            Some(Token::Slash) => Some(BinaryOp::Div),
            _ => None,
        } {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary { op, left: Box::new(left), right: Box::new(right) };
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // Right associative: 2^3^2 == 2^(3^2)
    fn power(&mut self) -> Result<Expr, String> {
        let base = self.primary()?;
        if self.peek() == Some(&Token::Caret) {
            self.pos += 1;
            let exponent = self.unary()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Number(v)),
            Some(Token::Ident(name)) => {
                if self.peek() != Some(&Token::LParen) {
                    return Ok(Expr::Symbol(name));
                }
                self.pos += 1;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.expression()?);
                        match self.next() {
                            Some(Token::Comma) => continue,
                            Some(Token::RParen) => break,
                            other => return Err(format!("expected ',' or ')' but found {:?}", other)),
                        }
                    }
                } else {
                    self.pos += 1;
                }
                Ok(Expr::Call { name, args })
            }
            Some(Token::LParen) => {
                let inner = self.expression()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    other => Err(format!("expected ')' but found {:?}", other)),
                }
            }
            other => Err(format!("unexpected {:?}", other)),
        }
    }
}

pub fn eval(expr: &Expr, symbols: &BTreeMap<String, f64>) -> Result<f64, String> {
    let value = match expr {
        Expr::Number(v) => *v,
        Expr::Symbol(name) => match symbols.get(name) {
            Some(v) => *v,
            None => match name.as_str() {
                "pi" => std::f64::consts::PI,
                _ => return Err(format!("unknown symbol '{}'", name)),
            },
        },
        Expr::Neg(inner) => -eval(inner, symbols)?,
        Expr::Binary { op, left, right } => {
            let lhs = eval(left, symbols)?;
            let rhs = eval(right, symbols)?;
            match op {
                BinaryOp::Add => lhs + rhs,
                BinaryOp::Sub => lhs - rhs,
                BinaryOp::Mul => lhs * rhs,
                BinaryOp::Div => {
                    if rhs.abs() < f64::EPSILON {
                        return Err("division by zero".to_string());
                    }
                    lhs / rhs
                }
                BinaryOp::Pow => lhs.powf(rhs),
            }
        }
        Expr::Call { name, args } => {
            let values = args
                .iter()
                .map(|a| eval(a, symbols))
                .collect::<Result<Vec<_>, _>>()?;
            call(name, &values)?
        }
    };
    if value.is_finite() {
        Ok(value)
    } else {
        Err("expression produced a non-finite value".to_string())
    }
}

fn call(name: &str, args: &[f64]) -> Result<f64, String> {
    let unary = |f: fn(f64) -> f64| -> Result<f64, String> {
        match args {
            [x] => Ok(f(*x)),
            _ => Err(format!("{}() expects exactly 1 argument", name)),
        }
    };
    match name {
        "abs" => unary(f64::abs),
        "sqrt" => match args {
            [x] if *x < 0.0 => Err("sqrt() requires non-negative input".to_string()),
            _ => unary(f64::sqrt),
        },
        "sin" => unary(f64::sin),
        "cos" => unary(f64::cos),
        "tan" => unary(f64::tan),
        "atan" => unary(f64::atan),
        "min" | "max" if !args.is_empty() => {
            let init = args[0];
            Ok(args[1..].iter().fold(init, |acc, v| {
                if name == "min" { acc.min(*v) } else { acc.max(*v) }
            }))
        }
        "pow" => match args {
            [base, exponent] => Ok(base.powf(*exponent)),
            _ => Err("pow() expects exactly 2 arguments".to_string()),
        },
        _ => Err(format!("unsupported function '{}'", name)),
    }
}
