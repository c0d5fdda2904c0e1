//! Template and expression parsing.
//!
//! Two entry points: [`parse_template`] for TOML string attributes (literal
//! text with `${...}` interpolations, `$${` escaping a literal `${`) and
//! [`parse_expression`] for bare expression source as found inside an
//! interpolation.
//!
//! Grammar, loosest to tightest binding:
//!
//! ```text
//! ternary    = or ("?" ternary ":" ternary)?
//! or         = and ("||" and)*
//! and        = equality ("&&" equality)*
//! equality   = comparison (("==" | "!=") comparison)*
//! comparison = additive (("<" | "<=" | ">" | ">=") additive)*
//! additive   = multiplicative (("+" | "-") multiplicative)*
//! multiplicative = unary (("*" | "/" | "%") unary)*
//! unary      = ("!" | "-") unary | postfix
//! postfix    = primary ("." ident | "[" ternary "]")*
//! primary    = number | string | "true" | "false" | "null"
//!            | "(" ternary ")" | "[" elements "]" | "{" entries "}"
//!            | ident "(" args ")" | "var" "." ident | "count" "." "index"
//!            | "each" "." ("key" | "value") | ident "." ident
//! ```

use super::{BinOp, Expr, TemplatePart, UnaryOp};
use crate::addr::ResourceId;
use crate::error::EvalError;
use crate::value::Value;

/// Parse a TOML string attribute into an expression.
///
/// A string without `${` is a plain literal. A string that consists of a
/// single interpolation and nothing else evaluates to the inner expression
/// itself, preserving its type. Anything else is a template that renders
/// to a string.
pub fn parse_template(src: &str) -> Result<Expr, EvalError> {
    if !src.contains('$') {
        return Ok(Expr::Literal(Value::String(src.to_string())));
    }

    let chars: Vec<char> = src.chars().collect();
    let mut parts: Vec<TemplatePart> = Vec::new();
    let mut lit = String::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '$' && matches!(chars.get(i + 1), Some('$')) && matches!(chars.get(i + 2), Some('{')) {
            lit.push_str("${");
            i += 3;
        } else if chars[i] == '$' && matches!(chars.get(i + 1), Some('{')) {
            let start = i + 2;
            let end = find_interp_end(&chars, start)?;
            let inner: String = chars[start..end].iter().collect();
            if !lit.is_empty() {
                parts.push(TemplatePart::Lit(std::mem::take(&mut lit)));
            }
            parts.push(TemplatePart::Interp(parse_expression(&inner)?));
            i = end + 1;
        } else {
            lit.push(chars[i]);
            i += 1;
        }
    }
    if !lit.is_empty() {
        parts.push(TemplatePart::Lit(lit));
    }

    match parts.as_slice() {
        [] => Ok(Expr::Literal(Value::String(String::new()))),
        [TemplatePart::Lit(text)] => Ok(Expr::Literal(Value::String(text.clone()))),
        [TemplatePart::Interp(expr)] => Ok(expr.clone()),
        _ => Ok(Expr::Template(parts)),
    }
}

/// Find the index of the `}` closing an interpolation that starts at
/// `start`, skipping string literals and nested braces in the inner source.
fn find_interp_end(chars: &[char], start: usize) -> Result<usize, EvalError> {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '"' => {
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(EvalError::Parse {
                        message: "unterminated string inside interpolation".to_string(),
                    });
                }
            }
            '{' => depth += 1,
            '}' => {
                if depth == 0 {
                    return Ok(i);
                }
                depth -= 1;
            }
            _ => {}
        }
        i += 1;
    }
    Err(EvalError::Parse {
        message: "unterminated interpolation (missing '}')".to_string(),
    })
}

/// Parse bare expression source.
pub fn parse_expression(src: &str) -> Result<Expr, EvalError> {
    let toks = lex(src)?;
    let mut parser = Parser { toks, pos: 0 };
    let expr = parser.ternary()?;
    match parser.peek() {
        None => Ok(expr),
        Some(tok) => Err(EvalError::Parse {
            message: format!("unexpected {} after expression", tok.describe()),
        }),
    }
}

// ============================================================================
// Lexer
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Dot,
    Colon,
    Question,
    Assign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

impl Tok {
    fn describe(&self) -> String {
        match self {
            Tok::Ident(name) => format!("identifier {name:?}"),
            Tok::Int(i) => format!("number {i}"),
            Tok::Float(f) => format!("number {f}"),
            Tok::Str(s) => format!("string {s:?}"),
            Tok::LParen => "'('".to_string(),
            Tok::RParen => "')'".to_string(),
            Tok::LBracket => "'['".to_string(),
            Tok::RBracket => "']'".to_string(),
            Tok::LBrace => "'{'".to_string(),
            Tok::RBrace => "'}'".to_string(),
            Tok::Comma => "','".to_string(),
            Tok::Dot => "'.'".to_string(),
            Tok::Colon => "':'".to_string(),
            Tok::Question => "'?'".to_string(),
            Tok::Assign => "'='".to_string(),
            Tok::EqEq => "'=='".to_string(),
            Tok::NotEq => "'!='".to_string(),
            Tok::Lt => "'<'".to_string(),
            Tok::Le => "'<='".to_string(),
            Tok::Gt => "'>'".to_string(),
            Tok::Ge => "'>='".to_string(),
            Tok::AndAnd => "'&&'".to_string(),
            Tok::OrOr => "'||'".to_string(),
            Tok::Bang => "'!'".to_string(),
            Tok::Plus => "'+'".to_string(),
            Tok::Minus => "'-'".to_string(),
            Tok::Star => "'*'".to_string(),
            Tok::Slash => "'/'".to_string(),
            Tok::Percent => "'%'".to_string(),
        }
    }
}

fn lex(src: &str) -> Result<Vec<Tok>, EvalError> {
    let chars: Vec<char> = src.chars().collect();
    let mut toks = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            '[' => {
                toks.push(Tok::LBracket);
                i += 1;
            }
            ']' => {
                toks.push(Tok::RBracket);
                i += 1;
            }
            '{' => {
                toks.push(Tok::LBrace);
                i += 1;
            }
            '}' => {
                toks.push(Tok::RBrace);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            '.' => {
                toks.push(Tok::Dot);
                i += 1;
            }
            ':' => {
                toks.push(Tok::Colon);
                i += 1;
            }
            '?' => {
                toks.push(Tok::Question);
                i += 1;
            }
            '+' => {
                toks.push(Tok::Plus);
                i += 1;
            }
            '-' => {
                toks.push(Tok::Minus);
                i += 1;
            }
            '*' => {
                toks.push(Tok::Star);
                i += 1;
            }
            '/' => {
                toks.push(Tok::Slash);
                i += 1;
            }
            '%' => {
                toks.push(Tok::Percent);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::EqEq);
                    i += 2;
                } else {
                    toks.push(Tok::Assign);
                    i += 1;
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::NotEq);
                    i += 2;
                } else {
                    toks.push(Tok::Bang);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Le);
                    i += 2;
                } else {
                    toks.push(Tok::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    toks.push(Tok::Ge);
                    i += 2;
                } else {
                    toks.push(Tok::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    toks.push(Tok::AndAnd);
                    i += 2;
                } else {
                    return Err(EvalError::Parse {
                        message: "expected '&&'".to_string(),
                    });
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    toks.push(Tok::OrOr);
                    i += 2;
                } else {
                    return Err(EvalError::Parse {
                        message: "expected '||'".to_string(),
                    });
                }
            }
            '"' => {
                let (tok, next) = lex_string(&chars, i)?;
                toks.push(tok);
                i = next;
            }
            '0'..='9' => {
                let (tok, next) = lex_number(&chars, i)?;
                toks.push(tok);
                i = next;
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                toks.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(EvalError::Parse {
                    message: format!("unexpected character {other:?}"),
                });
            }
        }
    }
    Ok(toks)
}

fn lex_string(chars: &[char], start: usize) -> Result<(Tok, usize), EvalError> {
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '"' => return Ok((Tok::Str(out), i + 1)),
            '\\' => {
                let escaped = chars.get(i + 1).ok_or_else(|| EvalError::Parse {
                    message: "unterminated string".to_string(),
                })?;
                match escaped {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    'r' => out.push('\r'),
                    '"' => out.push('"'),
                    '\\' => out.push('\\'),
                    '$' => out.push('$'),
                    other => {
                        return Err(EvalError::Parse {
                            message: format!("unsupported escape sequence \\{other}"),
                        });
                    }
                }
                i += 2;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(EvalError::Parse {
        message: "unterminated string".to_string(),
    })
}

fn lex_number(chars: &[char], start: usize) -> Result<(Tok, usize), EvalError> {
    let mut i = start;
    while i < chars.len() && chars[i].is_ascii_digit() {
        i += 1;
    }
    // A '.' only continues the number when a digit follows; otherwise it
    // is attribute access on an integer-valued expression.
    let is_float = chars.get(i) == Some(&'.')
        && chars.get(i + 1).is_some_and(|c| c.is_ascii_digit());
    if is_float {
        i += 1;
        while i < chars.len() && chars[i].is_ascii_digit() {
            i += 1;
        }
        let text: String = chars[start..i].iter().collect();
        let value = text.parse::<f64>().map_err(|_| EvalError::Parse {
            message: format!("invalid number {text:?}"),
        })?;
        Ok((Tok::Float(value), i))
    } else {
        let text: String = chars[start..i].iter().collect();
        let value = text.parse::<i64>().map_err(|_| EvalError::Parse {
            message: format!("invalid number {text:?}"),
        })?;
        Ok((Tok::Int(value), i))
    }
}

// ============================================================================
// Parser
// ============================================================================

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok, context: &str) -> Result<(), EvalError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("{} {}", tok.describe(), context)))
        }
    }

    fn unexpected(&self, wanted: &str) -> EvalError {
        let found = match self.peek() {
            Some(tok) => tok.describe(),
            None => "end of expression".to_string(),
        };
        EvalError::Parse {
            message: format!("expected {wanted}, found {found}"),
        }
    }

    fn ident(&mut self, context: &str) -> Result<String, EvalError> {
        match self.peek() {
            Some(Tok::Ident(_)) => {
                let Some(Tok::Ident(name)) = self.bump() else {
                    unreachable!()
                };
                Ok(name)
            }
            _ => Err(self.unexpected(&format!("identifier {context}"))),
        }
    }

    fn ternary(&mut self) -> Result<Expr, EvalError> {
        let cond = self.or_expr()?;
        if self.eat(&Tok::Question) {
            let then = self.ternary()?;
            self.expect(&Tok::Colon, "in conditional")?;
            let otherwise = self.ternary()?;
            Ok(Expr::Cond {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            })
        } else {
            Ok(cond)
        }
    }

    fn or_expr(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.and_expr()?;
        while self.eat(&Tok::OrOr) {
            let rhs = self.and_expr()?;
            lhs = binary(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.equality()?;
        while self.eat(&Tok::AndAnd) {
            let rhs = self.equality()?;
            lhs = binary(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn equality(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.comparison()?;
        loop {
            let op = if self.eat(&Tok::EqEq) {
                BinOp::Eq
            } else if self.eat(&Tok::NotEq) {
                BinOp::Ne
            } else {
                return Ok(lhs);
            };
            let rhs = self.comparison()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn comparison(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.additive()?;
        loop {
            let op = if self.eat(&Tok::Le) {
                BinOp::Le
            } else if self.eat(&Tok::Lt) {
                BinOp::Lt
            } else if self.eat(&Tok::Ge) {
                BinOp::Ge
            } else if self.eat(&Tok::Gt) {
                BinOp::Gt
            } else {
                return Ok(lhs);
            };
            let rhs = self.additive()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn additive(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = if self.eat(&Tok::Plus) {
                BinOp::Add
            } else if self.eat(&Tok::Minus) {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat(&Tok::Star) {
                BinOp::Mul
            } else if self.eat(&Tok::Slash) {
                BinOp::Div
            } else if self.eat(&Tok::Percent) {
                BinOp::Mod
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        if self.eat(&Tok::Bang) {
            Ok(Expr::Unary {
                op: UnaryOp::Not,
                expr: Box::new(self.unary()?),
            })
        } else if self.eat(&Tok::Minus) {
            Ok(Expr::Unary {
                op: UnaryOp::Neg,
                expr: Box::new(self.unary()?),
            })
        } else {
            self.postfix()
        }
    }

    fn postfix(&mut self) -> Result<Expr, EvalError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Tok::Dot) {
                let attr = self.ident("after '.'")?;
                expr = Expr::GetAttr {
                    base: Box::new(expr),
                    attr,
                };
            } else if self.eat(&Tok::LBracket) {
                let index = self.ternary()?;
                self.expect(&Tok::RBracket, "to close index")?;
                expr = Expr::Index {
                    base: Box::new(expr),
                    index: Box::new(index),
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        match self.bump() {
            Some(Tok::Int(i)) => Ok(Expr::Literal(Value::Int(i))),
            Some(Tok::Float(f)) => Ok(Expr::Literal(Value::Float(f))),
            Some(Tok::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Tok::LParen) => {
                let expr = self.ternary()?;
                self.expect(&Tok::RParen, "to close group")?;
                Ok(expr)
            }
            Some(Tok::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Tok::RBracket) {
                    loop {
                        items.push(self.ternary()?);
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                        if self.peek() == Some(&Tok::RBracket) {
                            break;
                        }
                    }
                    self.expect(&Tok::RBracket, "to close list")?;
                }
                Ok(Expr::List(items))
            }
            Some(Tok::LBrace) => {
                let mut entries = Vec::new();
                if !self.eat(&Tok::RBrace) {
                    loop {
                        let key = match self.bump() {
                            Some(Tok::Ident(name)) => name,
                            Some(Tok::Str(s)) => s,
                            _ => {
                                self.pos = self.pos.saturating_sub(1);
                                return Err(self.unexpected("map key"));
                            }
                        };
                        self.expect(&Tok::Assign, "after map key")?;
                        entries.push((key, self.ternary()?));
                        if !self.eat(&Tok::Comma) {
                            break;
                        }
                        if self.peek() == Some(&Tok::RBrace) {
                            break;
                        }
                    }
                    self.expect(&Tok::RBrace, "to close map")?;
                }
                Ok(Expr::Map(entries))
            }
            Some(Tok::Ident(name)) => self.ident_expr(name),
            Some(tok) => Err(EvalError::Parse {
                message: format!("unexpected {}", tok.describe()),
            }),
            None => Err(EvalError::Parse {
                message: "unexpected end of expression".to_string(),
            }),
        }
    }

    fn ident_expr(&mut self, name: String) -> Result<Expr, EvalError> {
        match name.as_str() {
            "true" => return Ok(Expr::Literal(Value::Bool(true))),
            "false" => return Ok(Expr::Literal(Value::Bool(false))),
            "null" => return Ok(Expr::Literal(Value::Null)),
            _ => {}
        }

        if self.peek() == Some(&Tok::LParen) {
            self.pos += 1;
            let mut args = Vec::new();
            if !self.eat(&Tok::RParen) {
                loop {
                    args.push(self.ternary()?);
                    if !self.eat(&Tok::Comma) {
                        break;
                    }
                }
                self.expect(&Tok::RParen, "to close argument list")?;
            }
            return Ok(Expr::Call { name, args });
        }

        match name.as_str() {
            "var" => {
                self.expect(&Tok::Dot, "after 'var'")?;
                Ok(Expr::Var(self.ident("after 'var.'")?))
            }
            "count" => {
                self.expect(&Tok::Dot, "after 'count'")?;
                let field = self.ident("after 'count.'")?;
                if field == "index" {
                    Ok(Expr::CountIndex)
                } else {
                    Err(EvalError::Parse {
                        message: format!("unknown count field {field:?} (expected count.index)"),
                    })
                }
            }
            "each" => {
                self.expect(&Tok::Dot, "after 'each'")?;
                let field = self.ident("after 'each.'")?;
                match field.as_str() {
                    "key" => Ok(Expr::EachKey),
                    "value" => Ok(Expr::EachValue),
                    _ => Err(EvalError::Parse {
                        message: format!(
                            "unknown each field {field:?} (expected each.key or each.value)"
                        ),
                    }),
                }
            }
            _ => {
                self.expect(&Tok::Dot, "after resource type")?;
                let resource = self.ident("after resource type")?;
                Ok(Expr::ResourceRef(ResourceId::new(name, resource)))
            }
        }
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}
