//! # Reconcile
//!
//! A declarative resource reconciliation engine: declare desired resources
//! in TOML manifests, diff them against last-known state, and apply the
//! resulting actions through a provider in dependency order.
//!
//! ## Core Concepts
//!
//! - **Manifest**: merged TOML declarations: schemas, variables, resources,
//!   outputs, and the provider block
//! - **Graph**: resource instances after `count`/`for_each` expansion, with
//!   dependency edges and a deterministic topological order
//! - **Plan**: ordered create/update/replace/destroy/no-op actions produced
//!   by diffing evaluated attributes against state
//! - **Executor**: applies a plan in parallel waves, persisting state after
//!   every action
//! - **Provider**: opaque CRUD against the remote store (`memory` or `http`)
//!
//! ## Example
//!
//! ```ignore
//! use reconcile::{
//!     ExecuteOptions, Executor, Graph, Manifest, NoProgress, Planner,
//!     Registry, Session, StateStore, VarSources,
//! };
//! use std::sync::Mutex;
//!
//! let manifest = Manifest::load(&manifest_paths)?;
//! let mut registry = Registry::new();
//! for schema in manifest.schemas.clone() {
//!     registry.register(schema)?;
//! }
//! let vars = reconcile::vars::bind(&manifest.variables, &VarSources::from_env(vec![], vec![]))?;
//!
//! let graph = Graph::build(&manifest, &registry, &vars)?;
//! let store = Mutex::new(StateStore::open("strata.state.json")?);
//! let plan = {
//!     let store = store.lock().unwrap();
//!     Planner::new(&graph, &registry, &vars, store.document()).plan()?
//! };
//!
//! let provider = reconcile::provider::build(&manifest.provider, &Session::default());
//! let executor = Executor::new(&graph, &registry, &vars, provider, ExecuteOptions::default());
//! let report = executor.apply(&plan, &store, &NoProgress)?;
//! ```
//!
//! ## Seams
//!
//! The engine is UI-free and store-agnostic:
//!
//! - [`Provider`]: remote CRUD, injected at construction
//! - [`ProgressSink`]: execution events for whatever frontend is attached
//! - [`expr::ResourceLookup`]: where expressions find resource values, so
//!   the same evaluator serves expansion, planning, and apply

pub mod addr;
pub mod error;
pub mod executor;
pub mod expr;
pub mod graph;
pub mod manifest;
pub mod plan;
pub mod provider;
pub mod retry;
pub mod schema;
pub mod state;
pub mod value;
pub mod vars;

// Re-export main types at crate root
pub use addr::{Address, InstanceKey, ResourceId};
pub use error::{
    CycleError, Error, EvalError, ExecError, ManifestError, PlanError, ProviderError, Result,
    SchemaError, StateError, VarError, VariableErrors,
};
pub use executor::{
    CancelToken, ExecuteOptions, ExecutionReport, Executor, NoProgress, ProgressSink,
};
pub use expr::{EvalContext, Expr, ResourceLookup, ResourceValues, Shape};
pub use graph::{Graph, Instance};
pub use manifest::{Declaration, Manifest, OutputDecl, ProviderConfig, VariableDecl};
pub use plan::{
    Action, ActionKind, AttrChange, Plan, PlanSummary, Planner, evaluate_outputs,
    values_from_state,
};
pub use provider::{HttpProvider, MemoryProvider, Provider, RemoteObject, Session};
pub use retry::{RetryConfig, with_retry};
pub use schema::{AttrSchema, OnChange, Registry, ResourceSchema};
pub use state::{ResourceRecord, STATE_VERSION, StateDocument, StateStore};
pub use value::{Value, ValueType};
pub use vars::{ENV_PREFIX, VarSources, bind};
