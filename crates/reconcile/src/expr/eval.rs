//! Expression evaluation against bound variables and resource values.
//!
//! An [`EvalContext`] pairs the run's variables with a [`ResourceLookup`]
//! that serves resource instance values. Lookups are pluggable because the
//! same expressions are evaluated at three different moments: during
//! cardinality expansion (upstream attributes resolved lazily), at plan time
//! (computed attributes of pending creates are unknown), and at apply time
//! (everything concrete).
//!
//! Unknown values propagate: an operation on an unknown operand yields
//! unknown rather than an error, except where the result shape itself would
//! depend on the unknown (conditions, cardinality).

use super::{BinOp, Expr, TemplatePart, UnaryOp, funcs};
use crate::addr::{Address, InstanceKey, ResourceId};
use crate::error::EvalError;
use crate::value::Value;
use std::collections::BTreeMap;

/// Concrete instance set of one declaration after cardinality expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// No `count` or `for_each`
    Single,
    /// `count = n`; instances `[0]` through `[n-1]`
    Count(usize),
    /// `for_each`; one instance per key, in map order
    Keys(Vec<String>),
}

impl Shape {
    /// Addresses of every instance, in instance order.
    pub fn addresses(&self, id: &ResourceId) -> Vec<Address> {
        match self {
            Shape::Single => vec![Address::single(id.clone())],
            Shape::Count(n) => (0..*n)
                .map(|i| Address::indexed(id.clone(), i as i64))
                .collect(),
            Shape::Keys(keys) => keys
                .iter()
                .map(|k| Address::keyed(id.clone(), k.clone()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Shape::Single => 1,
            Shape::Count(n) => *n,
            Shape::Keys(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of resource instance values for evaluation.
pub trait ResourceLookup {
    /// Expanded shape of a declaration, or `None` if it is not declared.
    fn shape(&self, id: &ResourceId) -> Option<Shape>;

    /// Value of one instance (its attribute map). `Err(NotReady)` when the
    /// instance exists but has not been evaluated yet at this point in the
    /// run.
    fn instance(&self, addr: &Address) -> Result<Value, EvalError>;
}

/// Lookup for contexts with no resources in scope (variable validation,
/// output-only evaluation tests).
pub struct NoResources;

impl ResourceLookup for NoResources {
    fn shape(&self, _id: &ResourceId) -> Option<Shape> {
        None
    }

    fn instance(&self, addr: &Address) -> Result<Value, EvalError> {
        Err(EvalError::NotReady {
            address: addr.to_string(),
        })
    }
}

/// Map-backed [`ResourceLookup`]: declarations are registered with their
/// shape, then instance values filled in as they become available.
#[derive(Debug, Default)]
pub struct ResourceValues {
    entries: BTreeMap<ResourceId, (Shape, BTreeMap<InstanceKey, Value>)>,
}

impl ResourceValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a declaration's expanded shape with no values yet.
    pub fn declare(&mut self, id: ResourceId, shape: Shape) {
        self.entries.insert(id, (shape, BTreeMap::new()));
    }

    /// Fill in the value of one instance. The declaration must have been
    /// registered first.
    pub fn set(&mut self, addr: &Address, value: Value) {
        if let Some((_, slots)) = self.entries.get_mut(&addr.id) {
            slots.insert(addr.key.clone(), value);
        }
    }
}

impl ResourceLookup for ResourceValues {
    fn shape(&self, id: &ResourceId) -> Option<Shape> {
        self.entries.get(id).map(|(shape, _)| shape.clone())
    }

    fn instance(&self, addr: &Address) -> Result<Value, EvalError> {
        let (_, slots) = self.entries.get(&addr.id).ok_or_else(|| {
            EvalError::UnknownResource {
                reference: addr.id.to_string(),
            }
        })?;
        slots
            .get(&addr.key)
            .cloned()
            .ok_or_else(|| EvalError::NotReady {
                address: addr.to_string(),
            })
    }
}

/// Everything an expression may reference during one evaluation.
pub struct EvalContext<'a> {
    vars: &'a BTreeMap<String, Value>,
    resources: &'a dyn ResourceLookup,
    count_index: Option<i64>,
    each: Option<(String, Value)>,
}

impl<'a> EvalContext<'a> {
    pub fn new(vars: &'a BTreeMap<String, Value>, resources: &'a dyn ResourceLookup) -> Self {
        Self {
            vars,
            resources,
            count_index: None,
            each: None,
        }
    }

    /// Scope `count.index` to one counted instance.
    pub fn with_count(mut self, index: i64) -> Self {
        self.count_index = Some(index);
        self
    }

    /// Scope `each.key` / `each.value` to one for_each instance.
    pub fn with_each(mut self, key: impl Into<String>, value: Value) -> Self {
        self.each = Some((key.into(), value));
        self
    }

    /// Scope the instance builtins to match an address's key.
    pub fn for_key(self, key: &InstanceKey, each_value: Option<&Value>) -> Self {
        match key {
            InstanceKey::None => self,
            InstanceKey::Index(i) => self.with_count(*i),
            InstanceKey::Key(k) => self.with_each(
                k.clone(),
                each_value.cloned().unwrap_or(Value::Null),
            ),
        }
    }
}

impl Expr {
    /// Evaluate this expression to a concrete (or unknown) value.
    pub fn evaluate(&self, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Template(parts) => eval_template(parts, ctx),
            Expr::List(items) => Ok(Value::List(
                items
                    .iter()
                    .map(|item| item.evaluate(ctx))
                    .collect::<Result<_, _>>()?,
            )),
            Expr::Map(entries) => {
                let mut out = BTreeMap::new();
                for (key, value) in entries {
                    out.insert(key.clone(), value.evaluate(ctx)?);
                }
                Ok(Value::Map(out))
            }
            Expr::Var(name) => {
                ctx.vars
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EvalError::UnknownVariable { name: name.clone() })
            }
            Expr::CountIndex => ctx
                .count_index
                .map(Value::Int)
                .ok_or(EvalError::NoInstanceContext {
                    name: "count.index",
                }),
            Expr::EachKey => ctx
                .each
                .as_ref()
                .map(|(key, _)| Value::from(key.as_str()))
                .ok_or(EvalError::NoInstanceContext { name: "each.key" }),
            Expr::EachValue => ctx
                .each
                .as_ref()
                .map(|(_, value)| value.clone())
                .ok_or(EvalError::NoInstanceContext { name: "each.value" }),
            Expr::ResourceRef(id) => eval_resource_ref(id, ctx),
            Expr::GetAttr { base, attr } => {
                let base = base.evaluate(ctx)?;
                get_attr(&base, attr)
            }
            Expr::Index { base, index } => {
                let base = base.evaluate(ctx)?;
                let index = index.evaluate(ctx)?;
                get_index(&base, &index)
            }
            Expr::Call { name, args } => {
                let args: Vec<Value> = args
                    .iter()
                    .map(|arg| arg.evaluate(ctx))
                    .collect::<Result<_, _>>()?;
                // coalesce is the one function whose job is to look past
                // unknowns; everything else is unknown-in, unknown-out.
                if name != "coalesce" && args.iter().any(Value::contains_unknown) {
                    return Ok(Value::Unknown);
                }
                funcs::call(name, &args)
            }
            Expr::Cond {
                cond,
                then,
                otherwise,
            } => match cond.evaluate(ctx)? {
                // The untaken branch is never evaluated, so it may
                // reference resources that do not exist in that branch.
                Value::Bool(true) => then.evaluate(ctx),
                Value::Bool(false) => otherwise.evaluate(ctx),
                Value::Unknown => Ok(Value::Unknown),
                other => Err(EvalError::Type {
                    message: format!("condition must be a bool, got {}", other.type_name()),
                }),
            },
            Expr::Unary { op, expr } => eval_unary(*op, &expr.evaluate(ctx)?),
            Expr::Binary { op, lhs, rhs } => eval_binary(*op, lhs, rhs, ctx),
        }
    }
}

fn eval_template(parts: &[TemplatePart], ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
    let mut out = String::new();
    for part in parts {
        match part {
            TemplatePart::Lit(text) => out.push_str(text),
            TemplatePart::Interp(expr) => match expr.evaluate(ctx)? {
                Value::Unknown => return Ok(Value::Unknown),
                Value::String(s) => out.push_str(&s),
                Value::Int(i) => out.push_str(&i.to_string()),
                Value::Float(x) => out.push_str(&x.to_string()),
                Value::Bool(b) => out.push_str(&b.to_string()),
                other => {
                    return Err(EvalError::Type {
                        message: format!(
                            "cannot interpolate a {} into a string",
                            other.type_name()
                        ),
                    });
                }
            },
        }
    }
    Ok(Value::String(out))
}

/// A bare resource reference evaluates to the instance's attribute map, a
/// list of maps (count), or a map of maps (for_each).
fn eval_resource_ref(id: &ResourceId, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
    let shape = ctx
        .resources
        .shape(id)
        .ok_or_else(|| EvalError::UnknownResource {
            reference: id.to_string(),
        })?;
    match shape {
        Shape::Single => ctx.resources.instance(&Address::single(id.clone())),
        Shape::Count(n) => {
            let mut items = Vec::with_capacity(n);
            for i in 0..n {
                items.push(
                    ctx.resources
                        .instance(&Address::indexed(id.clone(), i as i64))?,
                );
            }
            Ok(Value::List(items))
        }
        Shape::Keys(keys) => {
            let mut entries = BTreeMap::new();
            for key in keys {
                let value = ctx
                    .resources
                    .instance(&Address::keyed(id.clone(), key.clone()))?;
                entries.insert(key, value);
            }
            Ok(Value::Map(entries))
        }
    }
}

fn get_attr(base: &Value, attr: &str) -> Result<Value, EvalError> {
    match base {
        Value::Unknown => Ok(Value::Unknown),
        Value::Map(entries) => entries.get(attr).cloned().ok_or_else(|| {
            EvalError::MissingAttr {
                name: attr.to_string(),
            }
        }),
        other => Err(EvalError::Type {
            message: format!("cannot access .{attr} on a {}", other.type_name()),
        }),
    }
}

fn get_index(base: &Value, index: &Value) -> Result<Value, EvalError> {
    if base.is_unknown() || index.is_unknown() {
        return Ok(Value::Unknown);
    }
    match (base, index) {
        (Value::List(items), Value::Int(i)) => {
            // Indexing into an empty expansion (count = 0) must be a hard
            // error, never a silent null.
            if *i < 0 || *i as usize >= items.len() {
                Err(EvalError::IndexOutOfBounds {
                    index: *i,
                    len: items.len(),
                })
            } else {
                Ok(items[*i as usize].clone())
            }
        }
        (Value::Map(entries), Value::String(key)) => {
            entries
                .get(key)
                .cloned()
                .ok_or_else(|| EvalError::MissingAttr { name: key.clone() })
        }
        (base, index) => Err(EvalError::Type {
            message: format!(
                "cannot index a {} with a {}",
                base.type_name(),
                index.type_name()
            ),
        }),
    }
}

fn eval_unary(op: UnaryOp, value: &Value) -> Result<Value, EvalError> {
    if value.is_unknown() {
        return Ok(Value::Unknown);
    }
    match (op, value) {
        (UnaryOp::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (UnaryOp::Neg, Value::Int(i)) => Ok(Value::Int(-i)),
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Not, other) => Err(EvalError::Type {
            message: format!("'!' expects a bool, got {}", other.type_name()),
        }),
        (UnaryOp::Neg, other) => Err(EvalError::Type {
            message: format!("'-' expects a number, got {}", other.type_name()),
        }),
    }
}

fn eval_binary(
    op: BinOp,
    lhs: &Expr,
    rhs: &Expr,
    ctx: &EvalContext<'_>,
) -> Result<Value, EvalError> {
    // && and || short-circuit the same way conditionals do.
    if matches!(op, BinOp::And | BinOp::Or) {
        return match (op, lhs.evaluate(ctx)?) {
            (BinOp::And, Value::Bool(false)) => Ok(Value::Bool(false)),
            (BinOp::Or, Value::Bool(true)) => Ok(Value::Bool(true)),
            (_, Value::Bool(_)) => match rhs.evaluate(ctx)? {
                Value::Bool(b) => Ok(Value::Bool(b)),
                Value::Unknown => Ok(Value::Unknown),
                other => Err(logic_type_error(op, &other)),
            },
            (_, Value::Unknown) => Ok(Value::Unknown),
            (_, other) => Err(logic_type_error(op, &other)),
        };
    }

    let lhs = lhs.evaluate(ctx)?;
    let rhs = rhs.evaluate(ctx)?;
    if lhs.is_unknown() || rhs.is_unknown() {
        return Ok(Value::Unknown);
    }

    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => compare(op, &lhs, &rhs),
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            arithmetic(op, &lhs, &rhs)
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

fn logic_type_error(op: BinOp, value: &Value) -> EvalError {
    let symbol = if op == BinOp::And { "&&" } else { "||" };
    EvalError::Type {
        message: format!("'{symbol}' expects bools, got {}", value.type_name()),
    }
}

/// Equality with int/float numeric coercion.
fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_float(), rhs.as_float()) {
        (Some(a), Some(b)) => a == b,
        _ => lhs == rhs,
    }
}

fn compare(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    let ordering = match (lhs, rhs) {
        (Value::String(a), Value::String(b)) => a.cmp(b),
        _ => {
            let a = lhs.as_float().ok_or_else(|| compare_type_error(lhs, rhs))?;
            let b = rhs.as_float().ok_or_else(|| compare_type_error(lhs, rhs))?;
            a.partial_cmp(&b).ok_or_else(|| EvalError::Type {
                message: "cannot compare NaN".to_string(),
            })?
        }
    };
    let result = match op {
        BinOp::Lt => ordering.is_lt(),
        BinOp::Le => ordering.is_le(),
        BinOp::Gt => ordering.is_gt(),
        BinOp::Ge => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn compare_type_error(lhs: &Value, rhs: &Value) -> EvalError {
    EvalError::Type {
        message: format!(
            "cannot compare {} with {}",
            lhs.type_name(),
            rhs.type_name()
        ),
    }
}

fn arithmetic(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    if let (Value::Int(a), Value::Int(b)) = (lhs, rhs) {
        let result = match op {
            BinOp::Add => a.checked_add(*b),
            BinOp::Sub => a.checked_sub(*b),
            BinOp::Mul => a.checked_mul(*b),
            BinOp::Div => {
                if *b == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                a.checked_div(*b)
            }
            BinOp::Mod => {
                if *b == 0 {
                    return Err(EvalError::DivisionByZero);
                }
                a.checked_rem(*b)
            }
            _ => unreachable!(),
        };
        return result.map(Value::Int).ok_or_else(|| EvalError::Type {
            message: "integer overflow".to_string(),
        });
    }

    let a = lhs.as_float().ok_or_else(|| arith_type_error(lhs))?;
    let b = rhs.as_float().ok_or_else(|| arith_type_error(rhs))?;
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a / b
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(EvalError::DivisionByZero);
            }
            a % b
        }
        _ => unreachable!(),
    };
    Ok(Value::Float(result))
}

fn arith_type_error(value: &Value) -> EvalError {
    EvalError::Type {
        message: format!("arithmetic expects numbers, got {}", value.type_name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{parse_expression, parse_template};

    fn vars(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_string(), value.clone()))
            .collect()
    }

    fn attrs(pairs: &[(&str, Value)]) -> Value {
        Value::Map(
            pairs
                .iter()
                .map(|(name, value)| ((*name).to_string(), value.clone()))
                .collect(),
        )
    }

    fn eval(src: &str, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        parse_expression(src).unwrap().evaluate(ctx)
    }

    #[test]
    fn test_variable_lookup() {
        let vars = vars(&[("env", Value::from("prod"))]);
        let ctx = EvalContext::new(&vars, &NoResources);
        assert_eq!(eval("var.env", &ctx).unwrap(), Value::from("prod"));
        assert!(matches!(
            eval("var.missing", &ctx),
            Err(EvalError::UnknownVariable { .. })
        ));
    }

    #[test]
    fn test_template_rendering() {
        let vars = vars(&[("env", Value::from("prod")), ("n", Value::Int(3))]);
        let ctx = EvalContext::new(&vars, &NoResources);
        let expr = parse_template("svc-${var.env}-${var.n * 2}").unwrap();
        assert_eq!(expr.evaluate(&ctx).unwrap(), Value::from("svc-prod-6"));
    }

    #[test]
    fn test_template_with_unknown_part_is_unknown() {
        let vars = BTreeMap::new();
        let mut resources = ResourceValues::new();
        let id = ResourceId::new("net", "main");
        resources.declare(id.clone(), Shape::Single);
        resources.set(
            &Address::single(id),
            attrs(&[("id", Value::Unknown)]),
        );
        let ctx = EvalContext::new(&vars, &resources);
        let expr = parse_template("prefix-${net.main.id}").unwrap();
        assert_eq!(expr.evaluate(&ctx).unwrap(), Value::Unknown);
    }

    #[test]
    fn test_conditional_short_circuits_untaken_branch() {
        // vault.main is not declared at all; the false branch must still
        // evaluate because the reference is never touched.
        let vars = vars(&[("secure", Value::Bool(false))]);
        let ctx = EvalContext::new(&vars, &NoResources);
        let out = eval(r#"var.secure ? vault.main.id : "none""#, &ctx).unwrap();
        assert_eq!(out, Value::from("none"));
    }

    #[test]
    fn test_conditional_taken_branch_errors_on_missing_resource() {
        let vars = vars(&[("secure", Value::Bool(true))]);
        let ctx = EvalContext::new(&vars, &NoResources);
        assert!(matches!(
            eval(r#"var.secure ? vault.main.id : "none""#, &ctx),
            Err(EvalError::UnknownResource { .. })
        ));
    }

    #[test]
    fn test_indexing_empty_expansion_is_an_error() {
        let vars = BTreeMap::new();
        let mut resources = ResourceValues::new();
        resources.declare(ResourceId::new("replica", "set"), Shape::Count(0));
        let ctx = EvalContext::new(&vars, &resources);
        assert!(matches!(
            eval("replica.set[0]", &ctx),
            Err(EvalError::IndexOutOfBounds { index: 0, len: 0 })
        ));
    }

    #[test]
    fn test_counted_reference_evaluates_to_list() {
        let vars = BTreeMap::new();
        let mut resources = ResourceValues::new();
        let id = ResourceId::new("replica", "set");
        resources.declare(id.clone(), Shape::Count(2));
        resources.set(&Address::indexed(id.clone(), 0), attrs(&[("port", Value::Int(80))]));
        resources.set(&Address::indexed(id, 1), attrs(&[("port", Value::Int(81))]));
        let ctx = EvalContext::new(&vars, &resources);
        assert_eq!(eval("length(replica.set)", &ctx).unwrap(), Value::Int(2));
        assert_eq!(eval("replica.set[1].port", &ctx).unwrap(), Value::Int(81));
    }

    #[test]
    fn test_not_ready_instance() {
        let vars = BTreeMap::new();
        let mut resources = ResourceValues::new();
        resources.declare(ResourceId::new("net", "main"), Shape::Single);
        let ctx = EvalContext::new(&vars, &resources);
        assert!(matches!(
            eval("net.main.id", &ctx),
            Err(EvalError::NotReady { .. })
        ));
    }

    #[test]
    fn test_instance_builtins() {
        let vars = BTreeMap::new();
        let ctx = EvalContext::new(&vars, &NoResources).with_count(2);
        assert_eq!(eval("count.index", &ctx).unwrap(), Value::Int(2));
        assert!(matches!(
            eval("each.key", &ctx),
            Err(EvalError::NoInstanceContext { .. })
        ));

        let ctx = EvalContext::new(&vars, &NoResources)
            .with_each("primary", Value::from("10.0.1.0/24"));
        assert_eq!(eval("each.key", &ctx).unwrap(), Value::from("primary"));
        assert_eq!(eval("each.value", &ctx).unwrap(), Value::from("10.0.1.0/24"));
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        let vars = BTreeMap::new();
        let ctx = EvalContext::new(&vars, &NoResources);
        assert_eq!(eval("7 % 3", &ctx).unwrap(), Value::Int(1));
        assert_eq!(eval("1 + 2 * 3", &ctx).unwrap(), Value::Int(7));
        assert_eq!(eval("10 / 4", &ctx).unwrap(), Value::Int(2));
        assert_eq!(eval("10.0 / 4", &ctx).unwrap(), Value::Float(2.5));
        assert_eq!(eval("1 == 1.0", &ctx).unwrap(), Value::Bool(true));
        assert_eq!(eval(r#""a" < "b""#, &ctx).unwrap(), Value::Bool(true));
        assert!(matches!(eval("1 / 0", &ctx), Err(EvalError::DivisionByZero)));
    }

    #[test]
    fn test_logic_short_circuit() {
        let vars = vars(&[("on", Value::Bool(false))]);
        let ctx = EvalContext::new(&vars, &NoResources);
        // rhs would error with UnknownVariable if evaluated
        assert_eq!(eval("var.on && var.missing", &ctx).unwrap(), Value::Bool(false));
        assert_eq!(eval("!var.on || var.missing", &ctx).unwrap(), Value::Bool(true));
        assert!(eval("var.on || var.missing", &ctx).is_err());
    }

    #[test]
    fn test_unknown_propagates_through_operators_and_calls() {
        let vars = BTreeMap::new();
        let mut resources = ResourceValues::new();
        let id = ResourceId::new("net", "main");
        resources.declare(id.clone(), Shape::Single);
        resources.set(&Address::single(id), attrs(&[("id", Value::Unknown)]));
        let ctx = EvalContext::new(&vars, &resources);

        assert_eq!(eval("net.main.id == \"x\"", &ctx).unwrap(), Value::Unknown);
        assert_eq!(eval("upper(net.main.id)", &ctx).unwrap(), Value::Unknown);
        assert_eq!(
            eval("coalesce(net.main.id, \"fallback\")", &ctx).unwrap(),
            Value::from("fallback")
        );
    }

    #[test]
    fn test_unknown_condition_is_unknown() {
        let vars = BTreeMap::new();
        let mut resources = ResourceValues::new();
        let id = ResourceId::new("net", "main");
        resources.declare(id.clone(), Shape::Single);
        resources.set(
            &Address::single(id),
            attrs(&[("ready", Value::Unknown)]),
        );
        let ctx = EvalContext::new(&vars, &resources);
        assert_eq!(
            eval("net.main.ready ? 1 : 2", &ctx).unwrap(),
            Value::Unknown
        );
    }
}
