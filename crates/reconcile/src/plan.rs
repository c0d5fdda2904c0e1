//! Diffing desired configuration against state into an ordered action list.
//!
//! The planner walks instances in topological order, evaluates each one's
//! attributes with upstream values in scope, and diffs the result against
//! the state record at the same address. Upstream computed attributes
//! resolve from state when the upstream action leaves the remote object in
//! place (no-op, update) and to unknown when the object will be created or
//! replaced; a desired attribute that is still unknown cannot be proven
//! equal to state, so it forces at least an update.
//!
//! Destroys come first in the plan, children before parents, using the
//! dependency addresses recorded in state (the graph no longer knows
//! removed resources). Everything else follows in topological order.

use crate::addr::Address;
use crate::error::{Error, PlanError, Result};
use crate::expr::{EvalContext, ResourceLookup, ResourceValues, Shape};
use crate::graph::Graph;
use crate::manifest::Manifest;
use crate::schema::{OnChange, Registry};
use crate::state::StateDocument;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// What the executor will do at one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Create,
    Update,
    /// Destroy-and-recreate as one action; `destroy_before_create` on the
    /// action picks the ordering within the pair
    Replace,
    Destroy,
    NoOp,
}

impl ActionKind {
    pub fn is_noop(self) -> bool {
        self == ActionKind::NoOp
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Create => "create",
            ActionKind::Update => "update",
            ActionKind::Replace => "replace",
            ActionKind::Destroy => "destroy",
            ActionKind::NoOp => "no-op",
        })
    }
}

/// One attribute difference between state and desired configuration.
#[derive(Debug, Clone)]
pub struct AttrChange {
    pub attr: String,
    /// `None` when the attribute is newly set
    pub before: Option<Value>,
    /// `None` when the attribute was removed from configuration
    pub after: Option<Value>,
}

/// One planned step.
#[derive(Debug)]
pub struct Action {
    pub addr: Address,
    pub kind: ActionKind,
    /// Evaluated desired attributes; may contain unknowns until apply.
    /// Empty for destroys.
    pub desired: BTreeMap<String, Value>,
    pub changes: Vec<AttrChange>,
    pub destroy_before_create: bool,
    /// Addresses whose actions must finish successfully first
    pub waits_on: Vec<Address>,
}

/// Count of planned actions by kind.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub destroy: usize,
    pub noop: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to destroy",
            self.create, self.update, self.replace, self.destroy
        )
    }
}

/// Ordered action list for one run. Destroys first (children before
/// parents), then creates/updates/replaces in topological order.
#[derive(Debug, Default)]
pub struct Plan {
    pub actions: Vec<Action>,
}

impl Plan {
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in &self.actions {
            match action.kind {
                ActionKind::Create => summary.create += 1,
                ActionKind::Update => summary.update += 1,
                ActionKind::Replace => summary.replace += 1,
                ActionKind::Destroy => summary.destroy += 1,
                ActionKind::NoOp => summary.noop += 1,
            }
        }
        summary
    }

    /// Whether applying this plan would touch anything remote.
    pub fn has_changes(&self) -> bool {
        self.actions.iter().any(|action| !action.kind.is_noop())
    }

    pub fn get(&self, addr: &Address) -> Option<&Action> {
        self.actions.iter().find(|action| &action.addr == addr)
    }
}

/// Produces a [`Plan`] from a built graph and prior state.
pub struct Planner<'a> {
    graph: &'a Graph<'a>,
    registry: &'a Registry,
    vars: &'a BTreeMap<String, Value>,
    state: &'a StateDocument,
}

impl<'a> Planner<'a> {
    pub fn new(
        graph: &'a Graph<'a>,
        registry: &'a Registry,
        vars: &'a BTreeMap<String, Value>,
        state: &'a StateDocument,
    ) -> Self {
        Self {
            graph,
            registry,
            vars,
            state,
        }
    }

    /// Plan towards the desired configuration.
    pub fn plan(&self) -> Result<Plan> {
        let mut values = ResourceValues::new();
        for (id, shape) in self.graph.shapes() {
            values.declare(id.clone(), shape.clone());
        }

        let instances = self.graph.instances();
        let mut planned: Vec<Option<Action>> = Vec::with_capacity(instances.len());
        planned.resize_with(instances.len(), || None);

        for &index in self.graph.order() {
            let instance = &instances[index];
            let decl = self.graph.declaration(instance);
            let addr = &instance.addr;
            let kind_name = &addr.id.kind;

            let ctx =
                EvalContext::new(self.vars, &values).for_key(&addr.key, instance.each_value.as_ref());
            let mut desired: BTreeMap<String, Value> = BTreeMap::new();
            for (name, expr) in &decl.attrs {
                let value = expr
                    .evaluate(&ctx)
                    .map_err(|e| Error::Eval(e.at(format!("{addr}.{name}"))))?;
                desired.insert(name.clone(), value);
            }
            self.registry.apply_defaults(kind_name, &mut desired);
            self.registry.validate_values(addr, &desired)?;

            let (kind, changes) = match self.state.get(addr) {
                None => {
                    let changes = desired
                        .iter()
                        .map(|(name, value)| AttrChange {
                            attr: name.clone(),
                            before: None,
                            after: Some(value.clone()),
                        })
                        .collect();
                    (ActionKind::Create, changes)
                }
                Some(record) => self.diff(addr, &desired, &record.attrs)?,
            };

            // What downstream expressions see from this instance.
            let mut visible = desired.clone();
            match kind {
                ActionKind::Create | ActionKind::Replace => {
                    if let Some(schema) = self.registry.get(kind_name) {
                        for (name, attr) in &schema.attr {
                            if attr.computed {
                                visible.insert(name.clone(), Value::Unknown);
                            }
                        }
                    }
                }
                _ => {
                    if let Some(record) = self.state.get(addr) {
                        for (name, value) in &record.attrs {
                            if self.registry.is_computed(kind_name, name) {
                                visible.insert(name.clone(), value.clone());
                            }
                        }
                    }
                }
            }
            values.set(addr, Value::Map(visible));

            planned[index] = Some(Action {
                addr: addr.clone(),
                kind,
                desired,
                changes,
                destroy_before_create: kind == ActionKind::Replace
                    && self.registry.destroy_before_create(kind_name),
                waits_on: self.graph.dependency_addresses(index),
            });
        }

        let mut plan = Plan {
            actions: self.destroys_for(&self.desired_addresses()),
        };
        for &index in self.graph.order() {
            if let Some(action) = planned[index].take() {
                plan.actions.push(action);
            }
        }
        log::info!("plan: {}", plan.summary());
        Ok(plan)
    }

    /// Plan against an empty desired set: destroy everything in state.
    pub fn plan_destroy(&self) -> Result<Plan> {
        let plan = Plan {
            actions: self.destroys_for(&BTreeSet::new()),
        };
        log::info!("plan: {}", plan.summary());
        Ok(plan)
    }

    fn desired_addresses(&self) -> BTreeSet<String> {
        self.graph
            .instances()
            .iter()
            .map(|instance| instance.addr.to_string())
            .collect()
    }

    /// Destroy actions for state records without a surviving declaration,
    /// ordered children before parents.
    fn destroys_for(&self, keep: &BTreeSet<String>) -> Vec<Action> {
        let doomed: BTreeMap<&String, &crate::state::ResourceRecord> = self
            .state
            .resources
            .iter()
            .filter(|(address, _)| !keep.contains(*address))
            .collect();

        // A record waits on every doomed record that depended on it; Kahn
        // over that relation yields children first, ties by address.
        let mut waits: BTreeMap<&String, Vec<Address>> = BTreeMap::new();
        let mut blocking: BTreeMap<&String, usize> = BTreeMap::new();
        for &address in doomed.keys() {
            waits.insert(address, Vec::new());
            blocking.insert(address, 0);
        }
        for (&address, record) in &doomed {
            for dep in &record.dependencies {
                let dep_key = dep.to_string();
                if let Some((&parent, _)) = doomed.get_key_value(&dep_key) {
                    // Keys were validated when the state document was loaded.
                    let child = Address::parse(address).expect("state addresses are valid");
                    waits.get_mut(&parent).expect("parent registered").push(child);
                    *blocking.get_mut(&parent).expect("parent registered") += 1;
                }
            }
        }

        let mut ready: BTreeSet<&String> = blocking
            .iter()
            .filter(|&(_, &count)| count == 0)
            .map(|(&address, _)| address)
            .collect();
        let mut actions = Vec::with_capacity(doomed.len());
        while let Some(&address) = ready.iter().next() {
            ready.remove(address);
            // Keys were validated when the state document was loaded.
            let addr = Address::parse(address).expect("state addresses are valid");
            actions.push(Action {
                addr,
                kind: ActionKind::Destroy,
                desired: BTreeMap::new(),
                changes: Vec::new(),
                destroy_before_create: false,
                waits_on: waits.get(address).cloned().unwrap_or_default(),
            });
            for dep in &doomed[address].dependencies {
                let dep_key = dep.to_string();
                if let Some((&parent, _)) = doomed.get_key_value(&dep_key)
                    && let Some(count) = blocking.get_mut(&parent)
                {
                    *count -= 1;
                    if *count == 0 {
                        ready.insert(parent);
                    }
                }
            }
        }
        actions
    }

    /// Diff one instance's evaluated attributes against its state record.
    fn diff(
        &self,
        addr: &Address,
        desired: &BTreeMap<String, Value>,
        recorded: &BTreeMap<String, Value>,
    ) -> Result<(ActionKind, Vec<AttrChange>)> {
        let kind_name = &addr.id.kind;
        let mut names: BTreeSet<&String> = desired.keys().collect();
        for name in recorded.keys() {
            // Computed attributes belong to the provider; they never diff.
            if !self.registry.is_computed(kind_name, name) {
                names.insert(name);
            }
        }

        let mut changes = Vec::new();
        let mut kind = ActionKind::NoOp;
        for name in names {
            let before = recorded.get(name);
            let after = desired.get(name);
            // An unknown can never be proven equal to the recorded value.
            let changed = after.is_some_and(Value::contains_unknown) || after != before;
            if !changed {
                continue;
            }
            match self.registry.on_change(kind_name, name) {
                OnChange::Update => {}
                OnChange::Replace => kind = ActionKind::Replace,
                OnChange::Deny => {
                    return Err(PlanError::ChangeDenied {
                        address: addr.to_string(),
                        attr: name.clone(),
                        before: render(before),
                        after: render(after),
                    }
                    .into());
                }
            }
            if kind == ActionKind::NoOp {
                kind = ActionKind::Update;
            }
            changes.push(AttrChange {
                attr: name.clone(),
                before: before.cloned(),
                after: after.cloned(),
            });
        }
        Ok((kind, changes))
    }
}

fn render(value: Option<&Value>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "(absent)".to_string(),
    }
}

/// Lookup over recorded state, for output evaluation and apply-time
/// re-evaluation: every instance resolves to its state record's attributes.
pub fn values_from_state(
    shapes: &BTreeMap<crate::addr::ResourceId, Shape>,
    state: &StateDocument,
) -> ResourceValues {
    let mut values = ResourceValues::new();
    for (id, shape) in shapes {
        values.declare(id.clone(), shape.clone());
        for addr in shape.addresses(id) {
            if let Some(record) = state.get(&addr) {
                values.set(&addr, Value::Map(record.attrs.clone()));
            }
        }
    }
    values
}

/// Evaluate `[output.*]` projections against applied values.
pub fn evaluate_outputs(
    manifest: &Manifest,
    vars: &BTreeMap<String, Value>,
    resources: &dyn ResourceLookup,
) -> Result<BTreeMap<String, Value>> {
    let ctx = EvalContext::new(vars, resources);
    let mut outputs = BTreeMap::new();
    for output in &manifest.outputs {
        let value = output
            .value
            .evaluate(&ctx)
            .map_err(|e| Error::Eval(e.at(format!("output.{}", output.name))))?;
        outputs.insert(output.name.clone(), value);
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ResourceRecord;
    use chrono::Utc;

    const SCHEMAS: &str = r#"
        [schema.net.attr.cidr]
        type = "string"
        required = true
        on_change = "replace"

        [schema.net.attr.id]
        type = "string"
        computed = true

        [schema.svc.attr.name]
        type = "string"
        required = true
        on_change = "deny"

        [schema.svc.attr.replicas]
        type = "int"
        default = 1

        [schema.svc.attr.network]
        type = "string"

        [schema.svc.attr.id]
        type = "string"
        computed = true
    "#;

    fn setup(src: &str) -> (Manifest, Registry) {
        let manifest = Manifest::parse_str(&format!("{SCHEMAS}\n{src}")).unwrap();
        let mut registry = Registry::new();
        for schema in manifest.schemas.clone() {
            registry.register(schema).unwrap();
        }
        (manifest, registry)
    }

    fn empty_state() -> StateDocument {
        StateDocument {
            version: 1,
            serial: 0,
            last_updated: Utc::now(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
        }
    }

    fn record(
        id: &str,
        attrs: &[(&str, Value)],
        dependencies: &[&str],
    ) -> ResourceRecord {
        ResourceRecord {
            id: id.to_string(),
            attrs: attrs
                .iter()
                .map(|(name, value)| ((*name).to_string(), value.clone()))
                .collect(),
            dependencies: dependencies
                .iter()
                .map(|s| Address::parse(s).unwrap())
                .collect(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn plan_for(src: &str, state: &StateDocument) -> Result<Plan> {
        let (manifest, registry) = setup(src);
        let vars = BTreeMap::new();
        let graph = Graph::build(&manifest, &registry, &vars)?;
        Planner::new(&graph, &registry, &vars, state).plan()
    }

    #[test]
    fn test_empty_state_plans_creates() {
        let plan = plan_for(
            r#"
            [resource.net.main]
            cidr = "10.0.0.0/16"

            [resource.svc.web]
            name = "web"
            network = "${net.main.id}"
            "#,
            &empty_state(),
        )
        .unwrap();
        let kinds: Vec<_> = plan
            .actions
            .iter()
            .map(|a| (a.addr.to_string(), a.kind))
            .collect();
        assert_eq!(
            kinds,
            [
                ("net.main".to_string(), ActionKind::Create),
                ("svc.web".to_string(), ActionKind::Create)
            ]
        );
        // the computed upstream reference is unknown until apply
        assert!(plan.get(&Address::parse("svc.web").unwrap()).unwrap().desired["network"]
            .is_unknown());
        assert_eq!(plan.summary().create, 2);
        assert!(plan.has_changes());
    }

    #[test]
    fn test_matching_state_is_noop() {
        let mut state = empty_state();
        state.resources.insert(
            "svc.web".to_string(),
            record(
                "r-1",
                &[
                    ("name", Value::from("web")),
                    ("replicas", Value::Int(1)),
                    ("id", Value::from("r-1")),
                ],
                &[],
            ),
        );
        let plan = plan_for(
            r#"
            [resource.svc.web]
            name = "web"
            "#,
            &state,
        )
        .unwrap();
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].kind, ActionKind::NoOp);
        assert!(!plan.has_changes());
    }

    #[test]
    fn test_changed_attr_plans_update() {
        let mut state = empty_state();
        state.resources.insert(
            "svc.web".to_string(),
            record(
                "r-1",
                &[("name", Value::from("web")), ("replicas", Value::Int(1))],
                &[],
            ),
        );
        let plan = plan_for(
            r#"
            [resource.svc.web]
            name = "web"
            replicas = 3
            "#,
            &state,
        )
        .unwrap();
        let action = &plan.actions[0];
        assert_eq!(action.kind, ActionKind::Update);
        assert_eq!(action.changes.len(), 1);
        assert_eq!(action.changes[0].attr, "replicas");
        assert_eq!(action.changes[0].before, Some(Value::Int(1)));
        assert_eq!(action.changes[0].after, Some(Value::Int(3)));
    }

    #[test]
    fn test_replace_policy_and_destroy_before_create() {
        let mut state = empty_state();
        state.resources.insert(
            "net.main".to_string(),
            record("r-1", &[("cidr", Value::from("10.0.0.0/16"))], &[]),
        );
        let plan = plan_for(
            r#"
            [resource.net.main]
            cidr = "10.1.0.0/16"
            "#,
            &state,
        )
        .unwrap();
        let action = &plan.actions[0];
        assert_eq!(action.kind, ActionKind::Replace);
        assert!(!action.destroy_before_create);

        let plan = plan_for(
            r#"
            [schema.vol.attr.zone]
            type = "string"
            on_change = "replace"

            [schema.vol]
            destroy_before_create = true

            [resource.vol.data]
            zone = "b"
            "#,
            &{
                let mut state = empty_state();
                state.resources.insert(
                    "vol.data".to_string(),
                    record("r-2", &[("zone", Value::from("a"))], &[]),
                );
                state
            },
        )
        .unwrap();
        let action = plan.get(&Address::parse("vol.data").unwrap()).unwrap();
        assert_eq!(action.kind, ActionKind::Replace);
        assert!(action.destroy_before_create);
    }

    #[test]
    fn test_denied_change_is_fatal() {
        let mut state = empty_state();
        state.resources.insert(
            "svc.web".to_string(),
            record("r-1", &[("name", Value::from("web")), ("replicas", Value::Int(1))], &[]),
        );
        let err = plan_for(
            r#"
            [resource.svc.web]
            name = "api"
            "#,
            &state,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Plan(PlanError::ChangeDenied { ref attr, .. }) if attr == "name"
        ));
    }

    #[test]
    fn test_removed_resources_destroy_children_first() {
        let mut state = empty_state();
        state.resources.insert(
            "net.main".to_string(),
            record("r-1", &[("cidr", Value::from("10.0.0.0/16"))], &[]),
        );
        state.resources.insert(
            "svc.web".to_string(),
            record("r-2", &[("name", Value::from("web"))], &["net.main"]),
        );
        let plan = plan_for("", &state).unwrap();
        let order: Vec<_> = plan.actions.iter().map(|a| a.addr.to_string()).collect();
        assert_eq!(order, ["svc.web", "net.main"]);
        assert!(plan.actions.iter().all(|a| a.kind == ActionKind::Destroy));
        // the parent must wait for its dependent child
        assert_eq!(
            plan.actions[1].waits_on,
            vec![Address::parse("svc.web").unwrap()]
        );
        assert!(plan.actions[0].waits_on.is_empty());
    }

    #[test]
    fn test_destroys_precede_creates() {
        let mut state = empty_state();
        state.resources.insert(
            "svc.old".to_string(),
            record("r-1", &[("name", Value::from("old"))], &[]),
        );
        let plan = plan_for(
            r#"
            [resource.svc.web]
            name = "web"
            "#,
            &state,
        )
        .unwrap();
        assert_eq!(plan.actions[0].kind, ActionKind::Destroy);
        assert_eq!(plan.actions[0].addr.to_string(), "svc.old");
        assert_eq!(plan.actions[1].kind, ActionKind::Create);
    }

    #[test]
    fn test_unknown_upstream_forces_update() {
        // net.main will be replaced, so its computed id is unknown; svc.web
        // consumes it and cannot be proven unchanged.
        let mut state = empty_state();
        state.resources.insert(
            "net.main".to_string(),
            record("r-1", &[("cidr", Value::from("10.0.0.0/16")), ("id", Value::from("n-1"))], &[]),
        );
        state.resources.insert(
            "svc.web".to_string(),
            record(
                "r-2",
                &[
                    ("name", Value::from("web")),
                    ("replicas", Value::Int(1)),
                    ("network", Value::from("n-1")),
                ],
                &["net.main"],
            ),
        );
        let plan = plan_for(
            r#"
            [resource.net.main]
            cidr = "10.9.0.0/16"

            [resource.svc.web]
            name = "web"
            network = "${net.main.id}"
            "#,
            &state,
        )
        .unwrap();
        let web = plan.get(&Address::parse("svc.web").unwrap()).unwrap();
        assert_eq!(web.kind, ActionKind::Update);
        assert!(web.desired["network"].is_unknown());
    }

    #[test]
    fn test_upstream_noop_resolves_computed_from_state() {
        let mut state = empty_state();
        state.resources.insert(
            "net.main".to_string(),
            record("r-1", &[("cidr", Value::from("10.0.0.0/16")), ("id", Value::from("n-1"))], &[]),
        );
        let plan = plan_for(
            r#"
            [resource.net.main]
            cidr = "10.0.0.0/16"

            [resource.svc.web]
            name = "web"
            network = "${net.main.id}"
            "#,
            &state,
        )
        .unwrap();
        let web = plan.get(&Address::parse("svc.web").unwrap()).unwrap();
        assert_eq!(web.kind, ActionKind::Create);
        assert_eq!(web.desired["network"], Value::from("n-1"));
    }

    #[test]
    fn test_plan_destroy_empties_state() {
        let mut state = empty_state();
        state.resources.insert(
            "net.main".to_string(),
            record("r-1", &[("cidr", Value::from("10.0.0.0/16"))], &[]),
        );
        state.resources.insert(
            "svc.web".to_string(),
            record("r-2", &[("name", Value::from("web"))], &["net.main"]),
        );
        let (manifest, registry) = setup(
            r#"
            [resource.net.main]
            cidr = "10.0.0.0/16"
            "#,
        );
        let vars = BTreeMap::new();
        let graph = Graph::build(&manifest, &registry, &vars).unwrap();
        let plan = Planner::new(&graph, &registry, &vars, &state)
            .plan_destroy()
            .unwrap();
        assert_eq!(plan.actions.len(), 2);
        assert!(plan.actions.iter().all(|a| a.kind == ActionKind::Destroy));
        assert_eq!(plan.actions[0].addr.to_string(), "svc.web");
    }

    #[test]
    fn test_evaluate_outputs_against_state() {
        let mut state = empty_state();
        state.resources.insert(
            "svc.web".to_string(),
            record("r-1", &[("name", Value::from("web")), ("id", Value::from("r-1"))], &[]),
        );
        let (manifest, registry) = setup(
            r#"
            [resource.svc.web]
            name = "web"

            [output.web_id]
            value = "${svc.web.id}"
            "#,
        );
        let vars = BTreeMap::new();
        let graph = Graph::build(&manifest, &registry, &vars).unwrap();
        let values = values_from_state(graph.shapes(), &state);
        let outputs = evaluate_outputs(&manifest, &vars, &values).unwrap();
        assert_eq!(outputs["web_id"], Value::from("r-1"));
    }
}
