//! Dependency graph construction.
//!
//! Building the graph happens in three passes over the declarations:
//!
//! 1. **Cardinality expansion**, in declaration order. `count` / `for_each`
//!    expressions may reference variables and earlier-declared resources;
//!    upstream attribute values are resolved lazily (and recursively) as the
//!    expansion needs them. Computed attributes are unknown at this point,
//!    so a cardinality that depends on one is a hard error: the shape of
//!    the graph cannot wait for apply.
//! 2. **Edge scanning**: every resource reference in an instance's attribute
//!    and cardinality expressions, plus explicit `depends_on`, adds edges
//!    from the instance to every instance of the referenced declaration.
//!    References in untaken conditional branches still contribute edges when
//!    the target exists; they only matter for ordering.
//! 3. **Cycle check and topological order**: DFS reports the full cycle path;
//!    Kahn's algorithm orders the DAG with ties broken by declaration order,
//!    so plans are reproducible for unchanged input.

use crate::addr::{Address, ResourceId};
use crate::error::{CycleError, Error, EvalError, Result};
use crate::expr::{EvalContext, ResourceLookup, Shape};
use crate::manifest::{Declaration, Manifest};
use crate::schema::Registry;
use crate::value::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

/// One concrete resource instance after expansion.
#[derive(Debug)]
pub struct Instance {
    pub addr: Address,
    /// Index into `Manifest::resources`
    pub decl_index: usize,
    /// `each.value` for for_each instances
    pub each_value: Option<Value>,
}

/// Expanded instances, their dependency edges, and a deterministic
/// topological order. Built fresh each run; never persisted.
pub struct Graph<'a> {
    manifest: &'a Manifest,
    instances: Vec<Instance>,
    /// `deps[i]` holds the instance indices `i` depends on
    deps: Vec<BTreeSet<usize>>,
    order: Vec<usize>,
    shapes: BTreeMap<ResourceId, Shape>,
}

impl<'a> Graph<'a> {
    /// Expand cardinalities and build the ordered dependency graph.
    pub fn build(
        manifest: &'a Manifest,
        registry: &Registry,
        vars: &BTreeMap<String, Value>,
    ) -> Result<Self> {
        let (instances, shapes) = expand(manifest, registry, vars)?;
        let deps = scan_edges(manifest, &instances, &shapes)?;
        check_cycles(&instances, &deps)?;
        let order = topo_order(&instances, &deps);
        log::debug!(
            "graph: {} instance(s), {} edge(s)",
            instances.len(),
            deps.iter().map(BTreeSet::len).sum::<usize>()
        );
        Ok(Self {
            manifest,
            instances,
            deps,
            order,
            shapes,
        })
    }

    pub fn manifest(&self) -> &'a Manifest {
        self.manifest
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    /// Instance indices in dependency order (parents before children).
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn declaration(&self, instance: &Instance) -> &'a Declaration {
        &self.manifest.resources[instance.decl_index]
    }

    pub fn dependencies(&self, index: usize) -> &BTreeSet<usize> {
        &self.deps[index]
    }

    /// Addresses this instance depends on, for recording into state.
    pub fn dependency_addresses(&self, index: usize) -> Vec<Address> {
        self.deps[index]
            .iter()
            .map(|&dep| self.instances[dep].addr.clone())
            .collect()
    }

    pub fn shapes(&self) -> &BTreeMap<ResourceId, Shape> {
        &self.shapes
    }

    pub fn find(&self, addr: &Address) -> Option<usize> {
        self.instances
            .iter()
            .position(|instance| &instance.addr == addr)
    }
}

// ============================================================================
// Cardinality expansion
// ============================================================================

/// Lazily resolves earlier-declared instances' values while cardinality
/// expressions are being evaluated. Attribute maps are computed on demand
/// and memoized; an attribute chain that loops back on itself is reported
/// as a reference cycle.
struct ExpansionScope<'a> {
    manifest: &'a Manifest,
    registry: &'a Registry,
    vars: &'a BTreeMap<String, Value>,
    shapes: BTreeMap<ResourceId, Shape>,
    each_values: BTreeMap<Address, Value>,
    cache: RefCell<BTreeMap<Address, Value>>,
    active: RefCell<Vec<Address>>,
}

impl ResourceLookup for ExpansionScope<'_> {
    fn shape(&self, id: &ResourceId) -> Option<Shape> {
        // Declarations not yet expanded (later in the file set) are out of
        // scope here, exactly like undeclared ones: the graph's shape may
        // only depend on what comes before.
        self.shapes.get(id).cloned()
    }

    fn instance(&self, addr: &Address) -> std::result::Result<Value, EvalError> {
        if let Some(value) = self.cache.borrow().get(addr) {
            return Ok(value.clone());
        }
        if self.active.borrow().contains(addr) {
            let mut path: Vec<String> = self
                .active
                .borrow()
                .iter()
                .map(Address::to_string)
                .collect();
            path.push(addr.to_string());
            return Err(EvalError::Cycle { path });
        }

        let decl = self
            .manifest
            .resources
            .iter()
            .find(|decl| decl.id == addr.id)
            .ok_or_else(|| EvalError::UnknownResource {
                reference: addr.id.to_string(),
            })?;

        self.active.borrow_mut().push(addr.clone());
        let result = self.evaluate_instance(decl, addr);
        self.active.borrow_mut().pop();

        let value = result?;
        self.cache
            .borrow_mut()
            .insert(addr.clone(), value.clone());
        Ok(value)
    }
}

impl ExpansionScope<'_> {
    fn evaluate_instance(&self, decl: &Declaration, addr: &Address) -> std::result::Result<Value, EvalError> {
        let each_value = self.each_values.get(addr);
        let ctx = EvalContext::new(self.vars, self).for_key(&addr.key, each_value);

        let mut attrs: BTreeMap<String, Value> = BTreeMap::new();
        for (name, expr) in &decl.attrs {
            let value = expr
                .evaluate(&ctx)
                .map_err(|e| e.at(format!("{addr}.{name}")))?;
            attrs.insert(name.clone(), value);
        }
        self.registry.apply_defaults(&decl.id.kind, &mut attrs);
        // Computed attributes exist but have no value before apply.
        if let Some(schema) = self.registry.get(&decl.id.kind) {
            for (name, attr) in &schema.attr {
                if attr.computed {
                    attrs.entry(name.clone()).or_insert(Value::Unknown);
                }
            }
        }
        Ok(Value::Map(attrs))
    }
}

fn expand(
    manifest: &Manifest,
    registry: &Registry,
    vars: &BTreeMap<String, Value>,
) -> Result<(Vec<Instance>, BTreeMap<ResourceId, Shape>)> {
    let mut scope = ExpansionScope {
        manifest,
        registry,
        vars,
        shapes: BTreeMap::new(),
        each_values: BTreeMap::new(),
        cache: RefCell::new(BTreeMap::new()),
        active: RefCell::new(Vec::new()),
    };
    let mut instances = Vec::new();

    for (decl_index, decl) in manifest.resources.iter().enumerate() {
        let ctx = EvalContext::new(vars, &scope);
        let shape = expand_declaration(decl, &ctx)?;

        match &shape {
            Shape::Single => instances.push(Instance {
                addr: Address::single(decl.id.clone()),
                decl_index,
                each_value: None,
            }),
            Shape::Count(n) => {
                for i in 0..*n {
                    instances.push(Instance {
                        addr: Address::indexed(decl.id.clone(), i as i64),
                        decl_index,
                        each_value: None,
                    });
                }
            }
            Shape::Keys(keys) => {
                // Shape::Keys is only built from an evaluated map, so the
                // entries are retrievable; record each.value per instance.
                let entries = evaluate_for_each(decl, &ctx)?;
                for key in keys {
                    let addr = Address::keyed(decl.id.clone(), key.clone());
                    scope
                        .each_values
                        .insert(addr.clone(), entries[key].clone());
                    instances.push(Instance {
                        addr,
                        decl_index,
                        each_value: Some(entries[key].clone()),
                    });
                }
            }
        }
        scope.shapes.insert(decl.id.clone(), shape);
    }

    Ok((instances, scope.shapes))
}

fn expand_declaration(decl: &Declaration, ctx: &EvalContext<'_>) -> Result<Shape> {
    if let Some(expr) = &decl.count {
        let value = expr
            .evaluate(ctx)
            .map_err(|e| Error::Eval(e.at(format!("{}.count", decl.id))))?;
        let count = match value {
            Value::Int(n) if n >= 0 => n as usize,
            Value::Unknown => {
                return Err(EvalError::UnknownCardinality {
                    address: decl.id.to_string(),
                }
                .into());
            }
            other => {
                return Err(Error::Eval(
                    EvalError::Type {
                        message: format!(
                            "count must be a non-negative int, got {other}"
                        ),
                    }
                    .at(format!("{}.count", decl.id)),
                ));
            }
        };
        return Ok(Shape::Count(count));
    }

    if decl.for_each.is_some() {
        let entries = evaluate_for_each(decl, ctx)?;
        return Ok(Shape::Keys(entries.keys().cloned().collect()));
    }

    Ok(Shape::Single)
}

fn evaluate_for_each(
    decl: &Declaration,
    ctx: &EvalContext<'_>,
) -> Result<BTreeMap<String, Value>> {
    let expr = decl
        .for_each
        .as_ref()
        .expect("caller checked for_each is set");
    let location = format!("{}.for_each", decl.id);
    let value = expr
        .evaluate(ctx)
        .map_err(|e| Error::Eval(e.at(location.clone())))?;
    match value {
        Value::Map(entries) => {
            for key in entries.keys() {
                if key.contains('"') || key.contains('\\') {
                    return Err(Error::Eval(
                        EvalError::Type {
                            message: format!(
                                "for_each key {key:?} may not contain quotes or backslashes"
                            ),
                        }
                        .at(location),
                    ));
                }
            }
            Ok(entries)
        }
        Value::Unknown => Err(EvalError::UnknownCardinality {
            address: decl.id.to_string(),
        }
        .into()),
        other => Err(Error::Eval(
            EvalError::Type {
                message: format!("for_each must be a map, got {}", other.type_name()),
            }
            .at(location),
        )),
    }
}

// ============================================================================
// Edges, cycles, topological order
// ============================================================================

fn scan_edges(
    manifest: &Manifest,
    instances: &[Instance],
    shapes: &BTreeMap<ResourceId, Shape>,
) -> Result<Vec<BTreeSet<usize>>> {
    // Instances of one declaration are contiguous and in instance order.
    let mut by_id: BTreeMap<&ResourceId, Vec<usize>> = BTreeMap::new();
    for (index, instance) in instances.iter().enumerate() {
        by_id.entry(&instance.addr.id).or_default().push(index);
    }

    let mut deps = vec![BTreeSet::new(); instances.len()];
    for (index, instance) in instances.iter().enumerate() {
        let decl = &manifest.resources[instance.decl_index];

        let mut referenced: BTreeSet<ResourceId> = BTreeSet::new();
        for (_, expr) in &decl.attrs {
            referenced.extend(expr.references());
        }
        if let Some(expr) = &decl.count {
            referenced.extend(expr.references());
        }
        if let Some(expr) = &decl.for_each {
            referenced.extend(expr.references());
        }

        for id in &referenced {
            if *id == decl.id {
                continue; // self-references surface as eval errors, not edges
            }
            // Unresolvable references in untaken conditional branches are
            // legitimate; only declared targets contribute edges.
            if shapes.contains_key(id) {
                if let Some(targets) = by_id.get(id) {
                    deps[index].extend(targets.iter().copied());
                }
            }
        }

        for id in &decl.depends_on {
            if !shapes.contains_key(id) {
                return Err(EvalError::UnknownResource {
                    reference: id.to_string(),
                }
                .into());
            }
            if let Some(targets) = by_id.get(id) {
                deps[index].extend(targets.iter().copied());
            }
        }
    }
    Ok(deps)
}

fn check_cycles(instances: &[Instance], deps: &[BTreeSet<usize>]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Grey,
        Black,
    }

    fn visit(
        node: usize,
        deps: &[BTreeSet<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::Grey;
        stack.push(node);
        for &dep in &deps[node] {
            match marks[dep] {
                Mark::Grey => {
                    let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    return Some(stack[start..].to_vec());
                }
                Mark::White => {
                    if let Some(cycle) = visit(dep, deps, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Black => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Black;
        None
    }

    let mut marks = vec![Mark::White; instances.len()];
    for node in 0..instances.len() {
        if marks[node] == Mark::White {
            let mut stack = Vec::new();
            if let Some(cycle) = visit(node, deps, &mut marks, &mut stack) {
                let path = cycle
                    .iter()
                    .map(|&n| instances[n].addr.to_string())
                    .collect();
                return Err(CycleError { path }.into());
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm; ready nodes are taken in instance (declaration) order.
fn topo_order(instances: &[Instance], deps: &[BTreeSet<usize>]) -> Vec<usize> {
    let mut indegree = vec![0usize; instances.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); instances.len()];
    for (index, dep_set) in deps.iter().enumerate() {
        indegree[index] = dep_set.len();
        for &dep in dep_set {
            dependents[dep].push(index);
        }
    }

    let mut ready: BTreeSet<usize> = indegree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(instances.len());

    while let Some(&node) = ready.iter().next() {
        ready.remove(&node);
        order.push(node);
        for &dependent in &dependents[node] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }
    order
}
