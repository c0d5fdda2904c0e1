//! Expression language for manifest attributes.
//!
//! Attribute values in manifests are expressions: plain TOML scalars are
//! literals, strings may interpolate `${...}` parts, and arrays/tables
//! construct lists/maps element by element. Inside `${...}` the grammar
//! supports variable and resource references, indexing, function calls,
//! conditionals, and the usual boolean/comparison/arithmetic operators.
//!
//! Parsing and evaluation are split: [`parser`] turns source text into an
//! [`Expr`], [`eval`] resolves an `Expr` against an [`EvalContext`], and
//! [`funcs`] holds the pure function library.

pub mod eval;
pub mod funcs;
pub mod parser;

pub use eval::{EvalContext, NoResources, ResourceLookup, ResourceValues, Shape};
pub use parser::{parse_expression, parse_template};

use crate::addr::ResourceId;
use crate::error::EvalError;
use crate::value::Value;
use std::collections::BTreeSet;

/// One parsed attribute expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Literal value
    Literal(Value),
    /// String with interpolated parts
    Template(Vec<TemplatePart>),
    /// List constructor
    List(Vec<Expr>),
    /// Map constructor, in source order
    Map(Vec<(String, Expr)>),
    /// `var.<name>`
    Var(String),
    /// `count.index`
    CountIndex,
    /// `each.key`
    EachKey,
    /// `each.value`
    EachValue,
    /// `<type>.<name>` resource reference
    ResourceRef(ResourceId),
    /// `<base>.<attr>`
    GetAttr { base: Box<Expr>, attr: String },
    /// `<base>[<index>]`
    Index { base: Box<Expr>, index: Box<Expr> },
    /// `<name>(<args>)`
    Call { name: String, args: Vec<Expr> },
    /// `<cond> ? <then> : <otherwise>`
    Cond {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    /// `!<expr>` or `-<expr>`
    Unary { op: UnaryOp, expr: Box<Expr> },
    /// `<lhs> <op> <rhs>`
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

/// Literal part or interpolation inside a template string.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Lit(String),
    Interp(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl Expr {
    /// Convert a raw TOML attribute value into an expression. Strings go
    /// through template parsing; arrays and tables become constructors so
    /// their elements can interpolate too.
    pub fn from_toml(value: &toml::Value) -> Result<Self, EvalError> {
        match value {
            toml::Value::String(s) => parse_template(s),
            toml::Value::Integer(i) => Ok(Expr::Literal(Value::Int(*i))),
            toml::Value::Float(f) => Ok(Expr::Literal(Value::Float(*f))),
            toml::Value::Boolean(b) => Ok(Expr::Literal(Value::Bool(*b))),
            toml::Value::Datetime(d) => Ok(Expr::Literal(Value::String(d.to_string()))),
            toml::Value::Array(items) => Ok(Expr::List(
                items.iter().map(Expr::from_toml).collect::<Result<_, _>>()?,
            )),
            toml::Value::Table(entries) => Ok(Expr::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), Expr::from_toml(v)?)))
                    .collect::<Result<_, EvalError>>()?,
            )),
        }
    }

    /// Every resource this expression references, including references in
    /// both branches of a conditional. Used for dependency scanning.
    pub fn references(&self) -> BTreeSet<ResourceId> {
        let mut out = BTreeSet::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs(&self, out: &mut BTreeSet<ResourceId>) {
        match self {
            Expr::Literal(_)
            | Expr::Var(_)
            | Expr::CountIndex
            | Expr::EachKey
            | Expr::EachValue => {}
            Expr::Template(parts) => {
                for part in parts {
                    if let TemplatePart::Interp(expr) = part {
                        expr.collect_refs(out);
                    }
                }
            }
            Expr::List(items) => {
                for item in items {
                    item.collect_refs(out);
                }
            }
            Expr::Map(entries) => {
                for (_, value) in entries {
                    value.collect_refs(out);
                }
            }
            Expr::ResourceRef(id) => {
                out.insert(id.clone());
            }
            Expr::GetAttr { base, .. } => base.collect_refs(out),
            Expr::Index { base, index } => {
                base.collect_refs(out);
                index.collect_refs(out);
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.collect_refs(out);
                }
            }
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => {
                cond.collect_refs(out);
                then.collect_refs(out);
                otherwise.collect_refs(out);
            }
            Expr::Unary { expr, .. } => expr.collect_refs(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_refs(out);
                rhs.collect_refs(out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_scalars() {
        let table: toml::Value = toml::from_str("a = 1\nb = true\nc = \"plain\"").unwrap();
        let map = table.as_table().unwrap();
        assert_eq!(
            Expr::from_toml(&map["a"]).unwrap(),
            Expr::Literal(Value::Int(1))
        );
        assert_eq!(
            Expr::from_toml(&map["b"]).unwrap(),
            Expr::Literal(Value::Bool(true))
        );
        assert_eq!(
            Expr::from_toml(&map["c"]).unwrap(),
            Expr::Literal(Value::from("plain"))
        );
    }

    #[test]
    fn test_from_toml_parses_templates_in_arrays() {
        let table: toml::Value = toml::from_str("a = [\"${var.x}\", \"y\"]").unwrap();
        let expr = Expr::from_toml(&table.as_table().unwrap()["a"]).unwrap();
        assert_eq!(
            expr,
            Expr::List(vec![
                Expr::Var("x".to_string()),
                Expr::Literal(Value::from("y")),
            ])
        );
    }

    #[test]
    fn test_references_sees_both_conditional_branches() {
        let expr = parse_expression(r#"var.flag ? net.a.id : net.b.id"#).unwrap();
        let refs = expr.references();
        assert!(refs.contains(&ResourceId::new("net", "a")));
        assert!(refs.contains(&ResourceId::new("net", "b")));
        assert_eq!(refs.len(), 2);
    }

    #[test]
    fn test_references_ignores_vars_and_literals() {
        let expr = parse_expression(r#"format("%s-%d", var.name, 1 + 2)"#).unwrap();
        assert!(expr.references().is_empty());
    }
}
