//! Resource type schemas and the registry that validates declarations
//! against them.
//!
//! Schemas are configuration, declared in manifests under `[schema.<type>]`;
//! the provider stays an opaque CRUD endpoint that is trusted to accept what
//! the schema allows. Validation is pure and runs before planning, so every
//! schema violation is reported before anything is mutated.

use crate::addr::{Address, ResourceId};
use crate::error::SchemaError;
use crate::manifest::Declaration;
use crate::value::{Value, ValueType};
use serde::Deserialize;
use std::collections::BTreeMap;

/// What the planner does when a settable attribute's desired value differs
/// from state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnChange {
    /// Update the remote object in place
    #[default]
    Update,
    /// The attribute is immutable; destroy and recreate the object
    Replace,
    /// The change is not allowed at all; planning fails
    Deny,
}

/// Schema of a single attribute.
#[derive(Debug, Clone, Deserialize)]
pub struct AttrSchema {
    #[serde(rename = "type")]
    pub value_type: ValueType,

    /// Must be set in the declaration (or have a default)
    #[serde(default)]
    pub required: bool,

    /// Provider-assigned; cannot be set in configuration
    #[serde(default)]
    pub computed: bool,

    /// Injected when the declaration does not set the attribute
    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub on_change: OnChange,
}

/// Schema of one resource type.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceSchema {
    /// Resource type name; filled in from the `[schema.<type>]` block key
    #[serde(skip)]
    pub kind: String,

    /// Replace pairs delete the old object before creating the new one
    /// (for uniquely-named resources that would collide)
    #[serde(default)]
    pub destroy_before_create: bool,

    /// Per-attribute schemas
    #[serde(default)]
    pub attr: BTreeMap<String, AttrSchema>,
}

/// Lookup and validation over every registered resource type.
#[derive(Debug, Default)]
pub struct Registry {
    schemas: BTreeMap<String, ResourceSchema>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one type's schema. Registering a type twice is an error.
    pub fn register(&mut self, schema: ResourceSchema) -> Result<(), SchemaError> {
        if self.schemas.contains_key(&schema.kind) {
            return Err(SchemaError::DuplicateType {
                kind: schema.kind.clone(),
            });
        }
        self.schemas.insert(schema.kind.clone(), schema);
        Ok(())
    }

    pub fn get(&self, kind: &str) -> Option<&ResourceSchema> {
        self.schemas.get(kind)
    }

    fn lookup(&self, kind: &str) -> Result<&ResourceSchema, SchemaError> {
        self.schemas.get(kind).ok_or_else(|| SchemaError::UnknownType {
            kind: kind.to_string(),
        })
    }

    /// Validate a declaration's shape before any expression is evaluated:
    /// the type must be registered, every attribute must exist in the
    /// schema and not be computed, and every required attribute must be
    /// set or have a default.
    pub fn validate_declaration(&self, decl: &Declaration) -> Result<(), SchemaError> {
        let schema = self.lookup(&decl.id.kind)?;
        let address = decl.id.to_string();

        for (name, _) in &decl.attrs {
            let Some(attr) = schema.attr.get(name) else {
                return Err(SchemaError::UnknownAttr {
                    address: address.clone(),
                    kind: decl.id.kind.clone(),
                    attr: name.clone(),
                });
            };
            if attr.computed {
                return Err(SchemaError::ComputedAttr {
                    address: address.clone(),
                    attr: name.clone(),
                });
            }
        }

        for (name, attr) in &schema.attr {
            if attr.required
                && attr.default.is_none()
                && !decl.attrs.iter().any(|(n, _)| n == name)
            {
                return Err(SchemaError::MissingRequired {
                    address: address.clone(),
                    attr: name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Validate evaluated attribute values against declared types. Unknown
    /// values pass here and are checked again at apply time.
    pub fn validate_values(
        &self,
        address: &Address,
        attrs: &BTreeMap<String, Value>,
    ) -> Result<(), SchemaError> {
        let schema = self.lookup(&address.id.kind)?;
        for (name, value) in attrs {
            if let Some(attr) = schema.attr.get(name) {
                if !attr.value_type.matches(value) {
                    return Err(SchemaError::WrongType {
                        address: address.to_string(),
                        attr: name.clone(),
                        expected: attr.value_type.name(),
                        actual: value.type_name(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Inject schema defaults for attributes the declaration left unset.
    /// Computed attributes never get defaults; the provider assigns them.
    pub fn apply_defaults(&self, kind: &str, attrs: &mut BTreeMap<String, Value>) {
        let Some(schema) = self.schemas.get(kind) else {
            return;
        };
        for (name, attr) in &schema.attr {
            if attr.computed {
                continue;
            }
            if let Some(default) = &attr.default {
                attrs
                    .entry(name.clone())
                    .or_insert_with(|| default.clone());
            }
        }
    }

    /// Change policy for one attribute. Attributes outside the schema never
    /// get here (validation rejects them first).
    pub fn on_change(&self, kind: &str, attr: &str) -> OnChange {
        self.schemas
            .get(kind)
            .and_then(|schema| schema.attr.get(attr))
            .map_or(OnChange::default(), |attr| attr.on_change)
    }

    pub fn is_computed(&self, kind: &str, attr: &str) -> bool {
        self.schemas
            .get(kind)
            .and_then(|schema| schema.attr.get(attr))
            .is_some_and(|attr| attr.computed)
    }

    pub fn destroy_before_create(&self, kind: &str) -> bool {
        self.schemas
            .get(kind)
            .is_some_and(|schema| schema.destroy_before_create)
    }

    /// Check that only registered types are referenced; used by `validate`
    /// before expansion.
    pub fn require_type(&self, id: &ResourceId) -> Result<(), SchemaError> {
        self.lookup(&id.kind).map(|_| ())
    }
}
