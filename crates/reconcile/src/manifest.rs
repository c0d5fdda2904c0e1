//! Manifest loading and the declaration model.
//!
//! A project is a set of TOML manifest files merged into one [`Manifest`]:
//! a `[provider]` block, `[variable.<name>]` declarations, `[schema.<type>]`
//! resource type schemas, `[resource.<type>.<name>]` declarations, and
//! `[output.<name>]` projections. Declaration order is preserved (file order
//! across files, source order within a file) because it is the tie-break for
//! topological ordering; the same input always produces the same plan.

use crate::addr::ResourceId;
use crate::error::{Error, EvalError, ManifestError, Result};
use crate::expr::Expr;
use crate::schema::ResourceSchema;
use crate::value::{Value, ValueType};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Which provider backend a project talks to.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// In-process object store; the default when no `[provider]` block exists
    #[default]
    Memory,
    /// Generic HTTP/JSON resource store
    Http {
        endpoint: String,
        /// Environment variable holding the bearer token
        #[serde(default)]
        token_env: Option<String>,
    },
}

/// One `[[variable.<name>.validation]]` rule. Rules see only their own
/// variable's value; cross-variable references are not permitted.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationRule {
    /// Regex the string value must match
    #[serde(default)]
    pub pattern: Option<String>,

    /// Allowed values
    #[serde(default)]
    pub one_of: Option<Vec<Value>>,

    /// Inclusive numeric lower bound
    #[serde(default)]
    pub min: Option<f64>,

    /// Inclusive numeric upper bound
    #[serde(default)]
    pub max: Option<f64>,

    /// The string value must be a valid IPv4 CIDR prefix
    #[serde(default)]
    pub cidr: bool,

    /// Reported when the rule fails
    pub message: String,
}

/// A `[variable.<name>]` declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct VariableDecl {
    #[serde(skip)]
    pub name: String,

    #[serde(rename = "type")]
    pub value_type: ValueType,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub validation: Vec<ValidationRule>,
}

/// A `[resource.<type>.<name>]` declaration: reserved cardinality and
/// dependency keys plus attribute expressions in source order.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub id: ResourceId,
    pub count: Option<Expr>,
    pub for_each: Option<Expr>,
    pub depends_on: Vec<ResourceId>,
    pub attrs: Vec<(String, Expr)>,
}

/// An `[output.<name>]` projection, evaluated after a successful apply.
#[derive(Debug, Clone)]
pub struct OutputDecl {
    pub name: String,
    pub value: Expr,
    pub description: Option<String>,
}

/// Every block from every manifest file of one project, merged.
#[derive(Debug, Default)]
pub struct Manifest {
    pub provider: ProviderConfig,
    pub variables: Vec<VariableDecl>,
    pub schemas: Vec<ResourceSchema>,
    pub resources: Vec<Declaration>,
    pub outputs: Vec<OutputDecl>,
}

impl Manifest {
    /// Load and merge manifest files, in the given order.
    pub fn load(paths: &[PathBuf]) -> Result<Self> {
        let mut manifest = Self::default();
        let mut provider_seen = false;
        for path in paths {
            let content = fs::read_to_string(path).map_err(|source| ManifestError::Io {
                path: path.clone(),
                source,
            })?;
            manifest.merge_source(path, &content, &mut provider_seen)?;
        }
        log::debug!(
            "loaded {} file(s): {} variable(s), {} schema(s), {} resource(s), {} output(s)",
            paths.len(),
            manifest.variables.len(),
            manifest.schemas.len(),
            manifest.resources.len(),
            manifest.outputs.len()
        );
        Ok(manifest)
    }

    /// Parse a single manifest from a string (tests, stdin).
    pub fn parse_str(src: &str) -> Result<Self> {
        let mut manifest = Self::default();
        let mut provider_seen = false;
        manifest.merge_source(Path::new("<inline>"), src, &mut provider_seen)?;
        Ok(manifest)
    }

    pub fn declaration(&self, id: &ResourceId) -> Option<&Declaration> {
        self.resources.iter().find(|decl| &decl.id == id)
    }

    pub fn variable(&self, name: &str) -> Option<&VariableDecl> {
        self.variables.iter().find(|var| var.name == name)
    }

    fn merge_source(&mut self, path: &Path, src: &str, provider_seen: &mut bool) -> Result<()> {
        let table: toml::Table = toml::from_str(src).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        for (key, block) in &table {
            match key.as_str() {
                "provider" => {
                    if *provider_seen {
                        return Err(ManifestError::DuplicateProvider {
                            path: path.to_path_buf(),
                        }
                        .into());
                    }
                    *provider_seen = true;
                    self.provider = block.clone().try_into().map_err(|source| {
                        ManifestError::Parse {
                            path: path.to_path_buf(),
                            source,
                        }
                    })?;
                }
                "variable" => self.merge_variables(path, block)?,
                "schema" => self.merge_schemas(path, block)?,
                "resource" => self.merge_resources(path, block)?,
                "output" => self.merge_outputs(path, block)?,
                other => {
                    return Err(invalid(path, format!("unknown block [{other}]")).into());
                }
            }
        }
        Ok(())
    }

    fn merge_variables(&mut self, path: &Path, block: &toml::Value) -> Result<()> {
        for (name, body) in block_entries(path, block, "variable")? {
            if self.variable(name).is_some() {
                return Err(ManifestError::DuplicateVariable {
                    name: name.to_string(),
                }
                .into());
            }
            check_ident(path, name, "variable")?;
            let mut decl: VariableDecl =
                body.clone().try_into().map_err(|source| ManifestError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            decl.name = name.to_string();
            self.variables.push(decl);
        }
        Ok(())
    }

    fn merge_schemas(&mut self, path: &Path, block: &toml::Value) -> Result<()> {
        for (kind, body) in block_entries(path, block, "schema")? {
            if self.schemas.iter().any(|schema| &schema.kind == kind) {
                return Err(ManifestError::DuplicateSchema {
                    kind: kind.to_string(),
                }
                .into());
            }
            check_ident(path, kind, "schema type")?;
            let mut schema: ResourceSchema =
                body.clone().try_into().map_err(|source| ManifestError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?;
            schema.kind = kind.to_string();
            self.schemas.push(schema);
        }
        Ok(())
    }

    fn merge_resources(&mut self, path: &Path, block: &toml::Value) -> Result<()> {
        for (kind, names) in block_entries(path, block, "resource")? {
            check_ident(path, kind, "resource type")?;
            for (name, body) in block_entries(path, names, "resource")? {
                check_ident(path, name, "resource name")?;
                let id = ResourceId::new(kind, name);
                if self.declaration(&id).is_some() {
                    return Err(ManifestError::DuplicateResource {
                        address: id.to_string(),
                    }
                    .into());
                }
                let decl = parse_declaration(path, id, body)?;
                self.resources.push(decl);
            }
        }
        Ok(())
    }

    fn merge_outputs(&mut self, path: &Path, block: &toml::Value) -> Result<()> {
        for (name, body) in block_entries(path, block, "output")? {
            if self.outputs.iter().any(|output| &output.name == name) {
                return Err(ManifestError::DuplicateOutput {
                    name: name.to_string(),
                }
                .into());
            }
            check_ident(path, name, "output")?;
            let table = body.as_table().ok_or_else(|| {
                invalid(path, format!("[output.{name}] must be a table"))
            })?;
            let value = table.get("value").ok_or_else(|| {
                invalid(path, format!("[output.{name}] is missing 'value'"))
            })?;
            let value = Expr::from_toml(value)
                .map_err(|e| Error::Eval(e.at(format!("output.{name}"))))?;
            let description = table
                .get("description")
                .and_then(toml::Value::as_str)
                .map(str::to_string);
            self.outputs.push(OutputDecl {
                name: name.to_string(),
                value,
                description,
            });
        }
        Ok(())
    }
}

fn parse_declaration(path: &Path, id: ResourceId, body: &toml::Value) -> Result<Declaration> {
    let table = body.as_table().ok_or_else(|| {
        invalid(path, format!("[resource.{id}] must be a table"))
    })?;

    let mut decl = Declaration {
        id: id.clone(),
        count: None,
        for_each: None,
        depends_on: Vec::new(),
        attrs: Vec::new(),
    };

    for (key, value) in table {
        match key.as_str() {
            "count" => {
                decl.count = Some(attr_expr(&id, key, value)?);
            }
            "for_each" => {
                decl.for_each = Some(attr_expr(&id, key, value)?);
            }
            "depends_on" => {
                let entries = value.as_array().ok_or_else(|| {
                    invalid(path, format!("[resource.{id}] depends_on must be a list"))
                })?;
                for entry in entries {
                    let text = entry.as_str().unwrap_or_default();
                    let dep = ResourceId::parse(text).ok_or_else(|| ManifestError::BadDependsOn {
                        address: id.to_string(),
                        entry: entry.to_string(),
                    })?;
                    decl.depends_on.push(dep);
                }
            }
            attr => {
                decl.attrs.push((attr.to_string(), attr_expr(&id, attr, value)?));
            }
        }
    }

    if decl.count.is_some() && decl.for_each.is_some() {
        return Err(ManifestError::CountAndForEach {
            address: id.to_string(),
        }
        .into());
    }
    Ok(decl)
}

fn attr_expr(id: &ResourceId, attr: &str, value: &toml::Value) -> Result<Expr> {
    Expr::from_toml(value).map_err(|e: EvalError| Error::Eval(e.at(format!("{id}.{attr}"))))
}

fn block_entries<'a>(
    path: &Path,
    block: &'a toml::Value,
    what: &str,
) -> Result<&'a toml::Table> {
    block
        .as_table()
        .ok_or_else(|| invalid(path, format!("[{what}] entries must be tables")).into())
}

fn check_ident(path: &Path, name: &str, what: &str) -> Result<()> {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(invalid(path, format!("invalid {what} name {name:?}")).into())
    }
}

fn invalid(path: &Path, message: String) -> ManifestError {
    ManifestError::Invalid {
        path: path.to_path_buf(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_manifest() {
        let manifest = Manifest::parse_str(
            r#"
            [provider]
            kind = "http"
            endpoint = "https://store.example/v1"
            token_env = "STORE_TOKEN"

            [variable.env]
            type = "string"
            default = "dev"

            [[variable.env.validation]]
            one_of = ["dev", "prod"]
            message = "env must be dev or prod"

            [schema.net.attr.cidr]
            type = "string"
            required = true

            [resource.net.main]
            cidr = "10.0.0.0/16"

            [resource.svc.web]
            count = "${var.replicas}"
            network = "${net.main.id}"
            depends_on = ["net.main"]

            [output.network_id]
            value = "${net.main.id}"
            "#,
        )
        .unwrap();

        assert_eq!(
            manifest.provider,
            ProviderConfig::Http {
                endpoint: "https://store.example/v1".to_string(),
                token_env: Some("STORE_TOKEN".to_string()),
            }
        );
        assert_eq!(manifest.variables.len(), 1);
        assert_eq!(manifest.variables[0].validation.len(), 1);
        assert_eq!(manifest.schemas[0].kind, "net");
        assert_eq!(manifest.resources.len(), 2);
        let svc = manifest.declaration(&ResourceId::new("svc", "web")).unwrap();
        assert!(svc.count.is_some());
        assert_eq!(svc.depends_on, vec![ResourceId::new("net", "main")]);
        assert_eq!(manifest.outputs[0].name, "network_id");
    }

    #[test]
    fn test_declaration_order_preserved() {
        let manifest = Manifest::parse_str(
            r#"
            [resource.net.zeta]
            a = 1
            [resource.net.alpha]
            a = 2
            [resource.svc.mid]
            a = 3
            "#,
        )
        .unwrap();
        let order: Vec<String> = manifest
            .resources
            .iter()
            .map(|decl| decl.id.to_string())
            .collect();
        assert_eq!(order, ["net.zeta", "net.alpha", "svc.mid"]);
    }

    #[test]
    fn test_default_provider_is_memory() {
        let manifest = Manifest::parse_str("[resource.net.main]\na = 1\n").unwrap();
        assert_eq!(manifest.provider, ProviderConfig::Memory);
    }

    #[test]
    fn test_duplicates_rejected() {
        let dup_resource = r#"
            [resource.net.main]
            a = 1
            [resource.net.other]
            a = 1
        "#;
        let mut manifest = Manifest::parse_str(dup_resource).unwrap();
        let err = manifest
            .merge_source(Path::new("b.toml"), "[resource.net.main]\na = 2\n", &mut true)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Manifest(ManifestError::DuplicateResource { .. })
        ));

        assert!(Manifest::parse_str(
            "[variable.x]\ntype = \"string\"\n[variable.x]\ntype = \"int\"\n"
        )
        .is_err());
    }

    #[test]
    fn test_count_and_for_each_exclusive() {
        let err = Manifest::parse_str(
            r#"
            [resource.svc.web]
            count = 2
            for_each = "${var.zones}"
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Manifest(ManifestError::CountAndForEach { .. })
        ));
    }

    #[test]
    fn test_bad_depends_on() {
        let err = Manifest::parse_str(
            r#"
            [resource.svc.web]
            depends_on = ["not an address"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Manifest(ManifestError::BadDependsOn { .. })
        ));
    }

    #[test]
    fn test_unknown_block_rejected() {
        assert!(Manifest::parse_str("[unknown_thing]\na = 1\n").is_err());
    }

    #[test]
    fn test_bad_expression_carries_location() {
        let err = Manifest::parse_str(
            r#"
            [resource.net.main]
            cidr = "${var.x"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("net.main.cidr"));
    }
}
