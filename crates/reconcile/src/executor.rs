//! Wave execution of a plan against the provider.
//!
//! Actions run in waves: every pass collects the pending actions whose
//! dependencies have all succeeded and runs them on a bounded rayon pool.
//! A failure marks its transitive dependents skipped (with the causing
//! address) while independent branches keep going. Each action's attribute
//! expressions are re-evaluated against real upstream values just before
//! the provider call, so unknowns planned for computed upstream attributes
//! are resolved by then; one that is not is an internal error, never a
//! remote call with a placeholder.
//!
//! State is the shared resource: all mutations go through one
//! `Mutex<StateStore>` and the document is saved after every action, so an
//! interrupted run loses at most the in-flight calls.

use crate::addr::Address;
use crate::error::{Error, EvalError, ExecError, PlanError, ProviderError, Result};
use crate::expr::{EvalContext, ResourceValues};
use crate::graph::Graph;
use crate::plan::{self, Action, ActionKind, Plan};
use crate::provider::Provider;
use crate::retry::{self, RetryConfig};
use crate::schema::Registry;
use crate::state::StateStore;
use crate::value::Value;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Tuning for one apply run.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Worker pool size
    pub jobs: usize,
    pub retry: RetryConfig,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            retry: RetryConfig::default(),
        }
    }
}

/// Cooperative cancellation flag. Checked before each action starts; work
/// already in flight finishes and stays persisted.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives execution events; implementations must tolerate calls from
/// multiple workers at once.
pub trait ProgressSink: Send + Sync {
    fn started(&self, addr: &Address, kind: ActionKind);
    fn succeeded(&self, addr: &Address, kind: ActionKind);
    fn failed(&self, addr: &Address, kind: ActionKind, message: &str);
    fn skipped(&self, addr: &Address, cause: &Address);
}

/// Sink that ignores everything.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn started(&self, _addr: &Address, _kind: ActionKind) {}
    fn succeeded(&self, _addr: &Address, _kind: ActionKind) {}
    fn failed(&self, _addr: &Address, _kind: ActionKind, _message: &str) {}
    fn skipped(&self, _addr: &Address, _cause: &Address) {}
}

/// What happened to each attempted action.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub succeeded: Vec<(Address, ActionKind)>,
    pub failed: Vec<(Address, String)>,
    /// Skipped address paired with the failing address that caused it
    pub skipped: Vec<(Address, Address)>,
    pub cancelled: bool,
}

impl ExecutionReport {
    /// Whether every planned action ran and succeeded.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && !self.cancelled
    }
}

#[derive(Debug, Clone)]
enum Status {
    Done,
    Failed,
    /// Carries the root failing address
    Skipped(Address),
}

enum Outcome {
    Done,
    Failed(String),
    Cancelled,
}

/// Applies a plan: schedules waves, drives providers, persists state.
pub struct Executor<'a> {
    graph: &'a Graph<'a>,
    registry: &'a Registry,
    vars: &'a BTreeMap<String, Value>,
    provider: Arc<dyn Provider>,
    options: ExecuteOptions,
    cancel: CancelToken,
}

impl<'a> Executor<'a> {
    pub fn new(
        graph: &'a Graph<'a>,
        registry: &'a Registry,
        vars: &'a BTreeMap<String, Value>,
        provider: Arc<dyn Provider>,
        options: ExecuteOptions,
    ) -> Self {
        Self {
            graph,
            registry,
            vars,
            provider,
            options,
            cancel: CancelToken::new(),
        }
    }

    /// Token for cancelling this executor from another thread (signal
    /// handlers, timeouts).
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run every non-no-op action in the plan. Per-action failures land in
    /// the report; only setup problems and scheduling bugs are `Err`.
    pub fn apply(
        &self,
        plan: &Plan,
        store: &Mutex<StateStore>,
        progress: &dyn ProgressSink,
    ) -> Result<ExecutionReport> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.jobs.max(1))
            .build()
            .map_err(|e| ExecError::Pool {
                message: e.to_string(),
            })?;

        let mut pending: BTreeMap<Address, &Action> = plan
            .actions
            .iter()
            .filter(|action| !action.kind.is_noop())
            .map(|action| (action.addr.clone(), action))
            .collect();
        let mut status: BTreeMap<Address, Status> = BTreeMap::new();
        let mut report = ExecutionReport::default();

        while !pending.is_empty() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            // Propagate failure downstream before picking the next wave.
            loop {
                let mut doomed: Vec<(Address, Address)> = Vec::new();
                for (addr, action) in &pending {
                    for dep in &action.waits_on {
                        match status.get(dep) {
                            Some(Status::Failed) => {
                                doomed.push((addr.clone(), dep.clone()));
                                break;
                            }
                            Some(Status::Skipped(cause)) => {
                                doomed.push((addr.clone(), cause.clone()));
                                break;
                            }
                            _ => {}
                        }
                    }
                }
                if doomed.is_empty() {
                    break;
                }
                for (addr, cause) in doomed {
                    pending.remove(&addr);
                    status.insert(addr.clone(), Status::Skipped(cause.clone()));
                    log::warn!("skipping {addr}: dependency {cause} failed");
                    progress.skipped(&addr, &cause);
                    report.skipped.push((addr, cause));
                }
            }
            if pending.is_empty() {
                break;
            }

            let wave: Vec<&Action> = pending
                .values()
                .filter(|action| {
                    action.waits_on.iter().all(|dep| match status.get(dep) {
                        Some(Status::Done) => true,
                        Some(_) => false,
                        // no-op dependencies never enter the pending set
                        None => !pending.contains_key(dep),
                    })
                })
                .copied()
                .collect();
            if wave.is_empty() {
                return Err(PlanError::Stalled.into());
            }
            log::debug!("wave of {} action(s)", wave.len());

            // Consistent snapshot for the whole wave: every dependency of a
            // wave member has already been persisted.
            let snapshot = store.lock().expect("state lock").document().clone();
            let values = plan::values_from_state(self.graph.shapes(), &snapshot);

            let outcomes: Vec<(Address, ActionKind, Outcome)> = pool.install(|| {
                wave.par_iter()
                    .map(|action| {
                        if self.cancel.is_cancelled() {
                            return (action.addr.clone(), action.kind, Outcome::Cancelled);
                        }
                        progress.started(&action.addr, action.kind);
                        let outcome = match self.run_action(action, &values, store) {
                            Ok(()) => Outcome::Done,
                            Err(e) => Outcome::Failed(e.to_string()),
                        };
                        (action.addr.clone(), action.kind, outcome)
                    })
                    .collect()
            });

            for (addr, kind, outcome) in outcomes {
                match outcome {
                    Outcome::Done => {
                        pending.remove(&addr);
                        status.insert(addr.clone(), Status::Done);
                        progress.succeeded(&addr, kind);
                        report.succeeded.push((addr, kind));
                    }
                    Outcome::Failed(message) => {
                        pending.remove(&addr);
                        status.insert(addr.clone(), Status::Failed);
                        log::error!("{addr}: {kind} failed: {message}");
                        progress.failed(&addr, kind, &message);
                        report.failed.push((addr, message));
                    }
                    Outcome::Cancelled => {
                        report.cancelled = true;
                    }
                }
            }
        }

        log::info!(
            "apply finished: {} succeeded, {} failed, {} skipped",
            report.succeeded.len(),
            report.failed.len(),
            report.skipped.len()
        );
        Ok(report)
    }

    /// Read every state record back through the provider, adopting drifted
    /// attributes and dropping records whose remote object vanished.
    pub fn refresh(&self, store: &mut StateStore) -> Result<()> {
        let records: Vec<(String, String)> = store
            .document()
            .resources
            .iter()
            .map(|(address, record)| (address.clone(), record.id.clone()))
            .collect();

        for (address, id) in records {
            let addr = Address::parse(&address).expect("state addresses are valid");
            let kind = addr.id.kind.clone();
            match retry::with_retry(&self.options.retry, || self.provider.read(&kind, &id)) {
                Ok(object) => {
                    let stale = store
                        .document()
                        .get(&addr)
                        .is_some_and(|record| record.attrs != object.attrs);
                    if stale {
                        log::info!("{addr}: remote attributes drifted, adopting");
                        store.record_refreshed(&addr, object.attrs);
                    }
                }
                Err(ProviderError::NotFound { .. }) => {
                    log::warn!("{addr}: remote object vanished, dropping from state");
                    store.record_destroyed(&addr);
                }
                Err(e) => return Err(e.into()),
            }
        }
        store.save()
    }

    fn run_action(
        &self,
        action: &Action,
        values: &ResourceValues,
        store: &Mutex<StateStore>,
    ) -> Result<()> {
        let addr = &action.addr;
        let kind = addr.id.kind.as_str();

        match action.kind {
            ActionKind::NoOp => Ok(()),
            ActionKind::Destroy => {
                let Some(id) = self.record_id(store, addr) else {
                    log::warn!("{addr}: no state record, nothing to destroy");
                    return Ok(());
                };
                self.delete_remote(kind, &id)?;
                let mut store = store.lock().expect("state lock");
                store.record_destroyed(addr);
                store.save()
            }
            ActionKind::Create => {
                let attrs = self.concrete_attrs(action, values)?;
                let object =
                    retry::with_retry(&self.options.retry, || self.provider.create(kind, &attrs))?;
                self.persist(store, action, object)
            }
            ActionKind::Update => {
                let attrs = self.concrete_attrs(action, values)?;
                let id = self.record_id(store, addr).ok_or_else(|| ExecError::MissingRecord {
                    address: addr.to_string(),
                    kind: action.kind.to_string(),
                })?;
                let object = retry::with_retry(&self.options.retry, || {
                    self.provider.update(kind, &id, &attrs)
                })?;
                self.persist(store, action, object)
            }
            ActionKind::Replace => {
                let attrs = self.concrete_attrs(action, values)?;
                let id = self.record_id(store, addr).ok_or_else(|| ExecError::MissingRecord {
                    address: addr.to_string(),
                    kind: action.kind.to_string(),
                })?;
                if action.destroy_before_create {
                    self.delete_remote(kind, &id)?;
                    {
                        let mut store = store.lock().expect("state lock");
                        store.record_destroyed(addr);
                        store.save()?;
                    }
                    let object = retry::with_retry(&self.options.retry, || {
                        self.provider.create(kind, &attrs)
                    })?;
                    self.persist(store, action, object)
                } else {
                    let object = retry::with_retry(&self.options.retry, || {
                        self.provider.create(kind, &attrs)
                    })?;
                    self.persist(store, action, object)?;
                    self.delete_remote(kind, &id)
                }
            }
        }
    }

    /// Re-evaluate the action's attributes against applied upstream values.
    fn concrete_attrs(
        &self,
        action: &Action,
        values: &ResourceValues,
    ) -> Result<BTreeMap<String, Value>> {
        let index = self
            .graph
            .find(&action.addr)
            .ok_or(PlanError::Stalled)?;
        let instance = &self.graph.instances()[index];
        let decl = self.graph.declaration(instance);
        let ctx = EvalContext::new(self.vars, values)
            .for_key(&action.addr.key, instance.each_value.as_ref());

        let mut attrs = BTreeMap::new();
        for (name, expr) in &decl.attrs {
            let location = format!("{}.{name}", action.addr);
            let value = expr
                .evaluate(&ctx)
                .map_err(|e| Error::Eval(e.at(location.clone())))?;
            if value.contains_unknown() {
                return Err(EvalError::ResidualUnknown { location }.into());
            }
            attrs.insert(name.clone(), value);
        }
        self.registry.apply_defaults(&action.addr.id.kind, &mut attrs);
        Ok(attrs)
    }

    fn record_id(&self, store: &Mutex<StateStore>, addr: &Address) -> Option<String> {
        store
            .lock()
            .expect("state lock")
            .document()
            .get(addr)
            .map(|record| record.id.clone())
    }

    /// Delete the remote object; a missing one is already the goal state.
    fn delete_remote(&self, kind: &str, id: &str) -> Result<()> {
        match retry::with_retry(&self.options.retry, || self.provider.delete(kind, id)) {
            Ok(()) => Ok(()),
            Err(ProviderError::NotFound { .. }) => {
                log::warn!("{kind} object {id} already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn persist(
        &self,
        store: &Mutex<StateStore>,
        action: &Action,
        object: crate::provider::RemoteObject,
    ) -> Result<()> {
        let dependencies = self
            .graph
            .find(&action.addr)
            .map(|index| self.graph.dependency_addresses(index))
            .unwrap_or_default();
        let mut store = store.lock().expect("state lock");
        store.record_applied(&action.addr, object.id, object.attrs, dependencies);
        store.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use crate::plan::Planner;
    use crate::provider::MemoryProvider;
    use std::path::Path;
    use std::time::Duration;

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

        [schema.svc.attr.network]
        type = "string"

        [schema.svc.attr.id]
        type = "string"
        computed = true
    "#;

    struct Fixture {
        manifest: Manifest,
        registry: Registry,
        vars: BTreeMap<String, Value>,
    }

    fn fixture(src: &str) -> Fixture {
        let manifest = Manifest::parse_str(&format!("{SCHEMAS}\n{src}")).unwrap();
        let mut registry = Registry::new();
        for schema in manifest.schemas.clone() {
            registry.register(schema).unwrap();
        }
        Fixture {
            manifest,
            registry,
            vars: BTreeMap::new(),
        }
    }

    fn options(jobs: usize) -> ExecuteOptions {
        ExecuteOptions {
            jobs,
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                backoff_factor: 2.0,
                max_delay: Duration::from_millis(4),
            },
        }
    }

    fn run(
        fixture: &Fixture,
        provider: &Arc<MemoryProvider>,
        state_path: &Path,
        jobs: usize,
    ) -> (ExecutionReport, StateStore) {
        let graph = Graph::build(&fixture.manifest, &fixture.registry, &fixture.vars).unwrap();
        let store = Mutex::new(StateStore::open(state_path).unwrap());
        let plan = {
            let store = store.lock().unwrap();
            Planner::new(&graph, &fixture.registry, &fixture.vars, store.document())
                .plan()
                .unwrap()
        };
        let executor = Executor::new(
            &graph,
            &fixture.registry,
            &fixture.vars,
            provider.clone() as Arc<dyn Provider>,
            options(jobs),
        );
        let report = executor.apply(&plan, &store, &NoProgress).unwrap();
        (report, store.into_inner().unwrap())
    }

    #[test]
    fn test_apply_creates_and_resolves_computed_refs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let provider = Arc::new(MemoryProvider::new());
        let fx = fixture(
            r#"
            [resource.net.main]
            cidr = "10.0.0.0/16"

            [resource.svc.web]
            name = "web"
            network = "${net.main.id}"
            "#,
        );

        let (report, store) = run(&fx, &provider, &path, 2);
        assert!(report.is_clean());
        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(provider.len(), 2);

        // the placeholder resolved to the real upstream id before the call
        let net = store
            .document()
            .get(&Address::parse("net.main").unwrap())
            .unwrap();
        let web = store
            .document()
            .get(&Address::parse("svc.web").unwrap())
            .unwrap();
        assert_eq!(web.attrs["network"], Value::from(net.id.as_str()));
        assert_eq!(
            web.dependencies,
            vec![Address::parse("net.main").unwrap()]
        );
    }

    #[test]
    fn test_second_apply_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let provider = Arc::new(MemoryProvider::new());
        let fx = fixture(
            r#"
            [resource.svc.web]
            name = "web"
            "#,
        );

        run(&fx, &provider, &path, 1);
        let (report, store) = run(&fx, &provider, &path, 1);
        assert!(report.is_clean());
        assert!(report.succeeded.is_empty());
        assert_eq!(store.document().serial, 1);
    }

    #[test]
    fn test_failure_skips_dependents_with_cause() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let provider = Arc::new(MemoryProvider::new());
        provider.inject_failure(ProviderError::Invalid {
            message: "rejected".to_string(),
        });
        let fx = fixture(
            r#"
            [resource.net.main]
            cidr = "10.0.0.0/16"

            [resource.svc.web]
            name = "web"
            network = "${net.main.id}"

            [resource.svc.other]
            name = "other"
            "#,
        );

        let (report, _) = run(&fx, &provider, &path, 1);
        assert!(!report.is_clean());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.to_string(), "net.main");
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].0.to_string(), "svc.web");
        assert_eq!(report.skipped[0].1.to_string(), "net.main");
        // the independent branch still applied
        assert_eq!(
            report.succeeded,
            vec![(Address::parse("svc.other").unwrap(), ActionKind::Create)]
        );
    }

    #[test]
    fn test_transient_failure_retries_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let provider = Arc::new(MemoryProvider::new());
        provider.inject_failure(ProviderError::RateLimited {
            message: "429".to_string(),
        });
        provider.inject_failure(ProviderError::Timeout {
            message: "slow".to_string(),
        });
        let fx = fixture(
            r#"
            [resource.svc.web]
            name = "web"
            "#,
        );

        let (report, _) = run(&fx, &provider, &path, 1);
        assert!(report.is_clean());
        assert_eq!(provider.len(), 1);
    }

    #[test]
    fn test_replace_create_first() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let provider = Arc::new(MemoryProvider::new());
        run(
            &fixture("[resource.net.main]\ncidr = \"10.0.0.0/16\""),
            &provider,
            &path,
            1,
        );

        let (report, store) = run(
            &fixture("[resource.net.main]\ncidr = \"10.9.0.0/16\""),
            &provider,
            &path,
            1,
        );
        assert!(report.is_clean());
        assert_eq!(report.succeeded[0].1, ActionKind::Replace);
        assert_eq!(provider.len(), 1);
        let record = store
            .document()
            .get(&Address::parse("net.main").unwrap())
            .unwrap();
        // a fresh identity proves the old object was not updated in place
        assert_eq!(record.id, "net-2");
        assert_eq!(record.attrs["cidr"], Value::from("10.9.0.0/16"));
    }

    #[test]
    fn test_destroy_tolerates_vanished_remote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let provider = Arc::new(MemoryProvider::new());
        let fx = fixture(
            r#"
            [resource.svc.web]
            name = "web"
            "#,
        );
        run(&fx, &provider, &path, 1);
        provider.vanish("svc", "svc-1");

        // empty desired set destroys the record even though the object is gone
        let fx = fixture("");
        let graph = Graph::build(&fx.manifest, &fx.registry, &fx.vars).unwrap();
        let store = Mutex::new(StateStore::open(&path).unwrap());
        let plan = {
            let store = store.lock().unwrap();
            Planner::new(&graph, &fx.registry, &fx.vars, store.document())
                .plan_destroy()
                .unwrap()
        };
        let executor = Executor::new(
            &graph,
            &fx.registry,
            &fx.vars,
            provider.clone() as Arc<dyn Provider>,
            options(1),
        );
        let report = executor.apply(&plan, &store, &NoProgress).unwrap();
        assert!(report.is_clean());
        assert!(store.into_inner().unwrap().document().resources.is_empty());
    }

    #[test]
    fn test_cancelled_before_start_runs_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let provider = Arc::new(MemoryProvider::new());
        let fx = fixture(
            r#"
            [resource.svc.web]
            name = "web"
            "#,
        );
        let graph = Graph::build(&fx.manifest, &fx.registry, &fx.vars).unwrap();
        let store = Mutex::new(StateStore::open(&path).unwrap());
        let plan = {
            let store = store.lock().unwrap();
            Planner::new(&graph, &fx.registry, &fx.vars, store.document())
                .plan()
                .unwrap()
        };
        let executor = Executor::new(
            &graph,
            &fx.registry,
            &fx.vars,
            provider.clone() as Arc<dyn Provider>,
            options(1),
        );
        executor.cancel_token().cancel();
        let report = executor.apply(&plan, &store, &NoProgress).unwrap();
        assert!(report.cancelled);
        assert!(report.succeeded.is_empty());
        assert_eq!(provider.len(), 0);
    }

    #[test]
    fn test_refresh_adopts_drift_and_drops_vanished() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let provider = Arc::new(MemoryProvider::new());
        let fx = fixture(
            r#"
            [resource.svc.web]
            name = "web"

            [resource.svc.api]
            name = "api"
            "#,
        );
        run(&fx, &provider, &path, 1);

        provider.drift(
            "svc",
            "svc-1",
            [
                ("name".to_string(), Value::from("renamed")),
                ("id".to_string(), Value::from("svc-1")),
            ]
            .into(),
        );
        provider.vanish("svc", "svc-2");

        let graph = Graph::build(&fx.manifest, &fx.registry, &fx.vars).unwrap();
        let executor = Executor::new(
            &graph,
            &fx.registry,
            &fx.vars,
            provider.clone() as Arc<dyn Provider>,
            options(1),
        );
        let mut store = StateStore::open(&path).unwrap();
        executor.refresh(&mut store).unwrap();

        let record = store
            .document()
            .get(&Address::parse("svc.web").unwrap())
            .unwrap();
        assert_eq!(record.attrs["name"], Value::from("renamed"));
        assert!(store
            .document()
            .get(&Address::parse("svc.api").unwrap())
            .is_none());
    }
}
