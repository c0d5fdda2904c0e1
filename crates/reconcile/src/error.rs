//! Error types for the reconciliation engine.
//!
//! Each phase of a run reports through its own error type so callers can
//! tell a configuration problem (fatal before any mutation) from a remote
//! failure (scoped to one resource and its dependents). Provider errors
//! carry a transient/permanent classification that drives retry logic.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading and merging manifest files.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Manifest file could not be read
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        /// Path of the unreadable file
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest file is not valid TOML or has an invalid shape
    #[error("{}: {source}", .path.display())]
    Parse {
        /// Path of the offending file
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// No `*.toml` manifest files in the project directory
    #[error("no manifest files found in {}", .path.display())]
    Empty { path: PathBuf },

    /// Manifest parsed as TOML but a block has the wrong structure
    #[error("{}: {message}", .path.display())]
    Invalid { path: PathBuf, message: String },

    /// Same `type.name` declared more than once across all files
    #[error("duplicate resource declaration: {address}")]
    DuplicateResource { address: String },

    /// Same variable declared more than once
    #[error("duplicate variable declaration: {name}")]
    DuplicateVariable { name: String },

    /// Same resource type schema declared more than once
    #[error("duplicate schema declaration: {kind}")]
    DuplicateSchema { kind: String },

    /// Same output declared more than once
    #[error("duplicate output declaration: {name}")]
    DuplicateOutput { name: String },

    /// More than one `[provider]` block across all files
    #[error("duplicate provider block in {}", .path.display())]
    DuplicateProvider { path: PathBuf },

    /// A declaration sets both `count` and `for_each`
    #[error("{address}: count and for_each are mutually exclusive")]
    CountAndForEach { address: String },

    /// A `depends_on` entry is not a `type.name` string
    #[error("{address}: invalid depends_on entry {entry:?} (expected \"type.name\")")]
    BadDependsOn { address: String, entry: String },
}

/// A single variable binding or validation failure.
#[derive(Debug, Error)]
pub enum VarError {
    /// A value was supplied for a variable that is not declared
    #[error("undeclared variable: {name}")]
    Undeclared { name: String },

    /// A declared variable has no default and no supplied value
    #[error("variable {name:?} is required but no value was provided")]
    Missing { name: String },

    /// The supplied value does not match the declared type
    #[error("variable {name:?} expects {expected}, got {actual}")]
    WrongType {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A value failed one of the variable's validation rules
    #[error("variable {name:?}: {message}")]
    Validation { name: String, message: String },

    /// A `--var` flag is not of the form `name=value`
    #[error("invalid variable flag {flag:?} (expected name=value)")]
    BadFlag { flag: String },

    /// A raw value could not be parsed as the declared type
    #[error("variable {name:?}: cannot parse {raw:?} as {expected}")]
    BadValue {
        name: String,
        raw: String,
        expected: &'static str,
    },

    /// A variable file could not be read or parsed
    #[error("variable file {}: {message}", .path.display())]
    File { path: PathBuf, message: String },

    /// A validation rule's regex pattern does not compile
    #[error("variable {name:?}: invalid validation pattern: {source}")]
    BadPattern {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// Every variable failure from one run, reported together.
#[derive(Debug, Error)]
#[error("invalid variable input:\n{}", .errors.iter().map(|e| format!("  {e}")).collect::<Vec<_>>().join("\n"))]
pub struct VariableErrors {
    pub errors: Vec<VarError>,
}

/// A declaration or evaluated value violates a resource type schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    /// Resource type has no registered schema
    #[error("unknown resource type: {kind}")]
    UnknownType { kind: String },

    /// Attribute is not part of the type's schema
    #[error("{address}: unknown attribute {attr:?} for type {kind:?}")]
    UnknownAttr {
        address: String,
        kind: String,
        attr: String,
    },

    /// Required attribute is absent and has no default
    #[error("{address}: missing required attribute {attr:?}")]
    MissingRequired { address: String, attr: String },

    /// Attribute value has the wrong type
    #[error("{address}: attribute {attr:?} expects {expected}, got {actual}")]
    WrongType {
        address: String,
        attr: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// Attribute is provider-assigned and cannot be set in configuration
    #[error("{address}: attribute {attr:?} is computed and cannot be set")]
    ComputedAttr { address: String, attr: String },

    /// Same type registered twice
    #[error("duplicate schema for type: {kind}")]
    DuplicateType { kind: String },
}

/// Expression parsing or evaluation failure.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The expression source does not parse
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Reference to a variable that is not bound
    #[error("unknown variable: var.{name}")]
    UnknownVariable { name: String },

    /// Reference to a resource that is not declared anywhere
    #[error("reference to undeclared resource: {reference}")]
    UnknownResource { reference: String },

    /// Reference to a declared resource whose value is not available at
    /// this point in the run (declared later, or not yet evaluated)
    #[error("value of {address} is not available here")]
    NotReady { address: String },

    /// Attribute or map key lookup failed
    #[error("no such attribute or key: {name}")]
    MissingAttr { name: String },

    /// List index out of range (including indexing an empty expansion)
    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds { index: i64, len: usize },

    /// Operand or argument has the wrong type
    #[error("type error: {message}")]
    Type { message: String },

    /// Call to a function that does not exist
    #[error("unknown function: {name}")]
    UnknownFunction { name: String },

    /// Function called with the wrong number of arguments
    #[error("{name} expects {expected} argument(s), got {actual}")]
    Arity {
        name: &'static str,
        expected: &'static str,
        actual: usize,
    },

    /// A function rejected its arguments at runtime
    #[error("{name}: {message}")]
    Function { name: &'static str, message: String },

    /// Integer division or modulo by zero
    #[error("division by zero")]
    DivisionByZero,

    /// `count.index`, `each.key`, or `each.value` used outside a
    /// counted / for_each declaration
    #[error("{name} is not meaningful in this context")]
    NoInstanceContext { name: &'static str },

    /// A count/for_each expression produced a value only known after apply
    #[error("cardinality of {address} depends on a value known only after apply")]
    UnknownCardinality { address: String },

    /// A value that must be concrete at apply time is still unknown
    #[error("value for {location} is still unknown at apply time")]
    ResidualUnknown { location: String },

    /// Reference cycle hit while resolving values during expansion
    #[error("reference cycle: {}", format_cycle(.path))]
    Cycle { path: Vec<String> },

    /// Wraps an error with the address/attribute it originated from
    #[error("{location}: {source}")]
    At {
        location: String,
        #[source]
        source: Box<EvalError>,
    },
}

impl EvalError {
    /// Attach the originating location (address, attribute, ...) to an error.
    pub fn at(self, location: impl Into<String>) -> Self {
        EvalError::At {
            location: location.into(),
            source: Box::new(self),
        }
    }
}

/// A reference cycle between resources. Fatal; nothing is applied.
#[derive(Debug, Error)]
#[error("dependency cycle: {}", format_cycle(.path))]
pub struct CycleError {
    /// Addresses on the cycle, in reference order
    pub path: Vec<String>,
}

fn format_cycle(path: &[String]) -> String {
    match path.first() {
        Some(first) => format!("{} -> {}", path.join(" -> "), first),
        None => String::new(),
    }
}

/// Desired configuration cannot be turned into a valid action.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A changed attribute has `on_change = "deny"`
    #[error("{address}: attribute {attr:?} cannot be changed ({before} -> {after}); its change policy is deny")]
    ChangeDenied {
        address: String,
        attr: String,
        before: String,
        after: String,
    },

    /// Wave scheduling could not make progress (plan ordering bug)
    #[error("plan contains unsatisfiable action ordering")]
    Stalled,
}

/// Executor setup failure.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The bounded worker pool could not be built
    #[error("failed to build worker pool: {message}")]
    Pool { message: String },

    /// An action needs a state record that is not there (state edited or
    /// deleted between plan and apply)
    #[error("{address}: no state record for planned {kind} action")]
    MissingRecord { address: String, kind: String },
}

/// Structured failure from a provider call.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Remote store is rate limiting (transient)
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    /// Request timed out (transient)
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Remote store unavailable or unreachable (transient)
    #[error("unavailable: {message}")]
    Unavailable { message: String },

    /// Object does not exist remotely
    #[error("not found: {id}")]
    NotFound { id: String },

    /// Request conflicts with remote state
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Request rejected as invalid
    #[error("invalid request: {message}")]
    Invalid { message: String },

    /// Credentials missing or rejected
    #[error("authentication failed: {message}")]
    Auth { message: String },

    /// Any other remote failure
    #[error("provider error: {message}")]
    Api { message: String },
}

impl ProviderError {
    /// Whether this failure is typically transient and worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::Unavailable { .. }
        )
    }

    /// Classify an HTTP status code from a remote store.
    pub fn from_status(status: u16) -> Self {
        let message = format!("HTTP {status}");
        match status {
            429 => Self::RateLimited { message },
            408 | 504 => Self::Timeout { message },
            502 | 503 => Self::Unavailable { message },
            404 | 410 => Self::NotFound { id: message },
            409 => Self::Conflict { message },
            400 | 422 => Self::Invalid { message },
            401 | 403 => Self::Auth { message },
            _ => Self::Api { message },
        }
    }
}

/// State document load/save failure.
#[derive(Debug, Error)]
pub enum StateError {
    /// State file exists but could not be read
    #[error("failed to read state file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// State file or its temp sibling could not be written
    #[error("failed to write state file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// State file is not a valid state document
    #[error("state file {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// State file contains a resource key that is not a valid address
    #[error("state file contains an invalid resource address: {address:?}")]
    BadAddress { address: String },

    /// State document was written by a newer build
    #[error("state file {} has version {found}, this build supports up to {supported}", .path.display())]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    /// State document cannot be serialized (an unknown value leaked in)
    #[error("cannot serialize state: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Top-level error for every engine operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Variables(#[from] VariableErrors),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Cycle(#[from] CycleError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
