//! Variable binding and validation.
//!
//! Variables bind once per run, before any resource evaluation, from
//! sources in increasing precedence: declared defaults, variable files (in
//! the order given), `STRATA_VAR_<name>` environment entries, then `--var`
//! flags. Every failure across all variables is collected and reported
//! together; any single failure rejects the whole run.

use crate::error::{VarError, VariableErrors};
use crate::expr::funcs;
use crate::manifest::{ValidationRule, VariableDecl};
use crate::value::{Value, ValueType};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// Prefix for environment-sourced variable values.
pub const ENV_PREFIX: &str = "STRATA_VAR_";

/// Raw variable inputs for one run.
#[derive(Debug, Default)]
pub struct VarSources {
    /// Variable files, lowest to highest precedence
    pub files: Vec<PathBuf>,
    /// Environment snapshot (only `STRATA_VAR_*` entries are considered)
    pub env: Vec<(String, String)>,
    /// `--var name=value` flags, in flag order
    pub flags: Vec<String>,
}

impl VarSources {
    /// Capture the current process environment.
    pub fn from_env(files: Vec<PathBuf>, flags: Vec<String>) -> Self {
        Self {
            files,
            env: std::env::vars().collect(),
            flags,
        }
    }
}

/// Bind and validate every declared variable.
pub fn bind(
    decls: &[VariableDecl],
    sources: &VarSources,
) -> Result<BTreeMap<String, Value>, VariableErrors> {
    let mut errors = Vec::new();
    let mut values: BTreeMap<String, Value> = BTreeMap::new();

    for decl in decls {
        if let Some(default) = &decl.default {
            values.insert(decl.name.clone(), default.clone());
        }
    }

    for path in &sources.files {
        match read_var_file(path) {
            Ok(table) => {
                for (name, raw) in table {
                    match decls.iter().find(|decl| decl.name == name) {
                        Some(_) => {
                            values.insert(name, Value::from_toml(&raw));
                        }
                        None => errors.push(VarError::Undeclared { name }),
                    }
                }
            }
            Err(e) => errors.push(e),
        }
    }

    for (key, raw) in &sources.env {
        let Some(name) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };
        match decls.iter().find(|decl| decl.name == name) {
            Some(decl) => match parse_raw(decl, raw) {
                Ok(value) => {
                    values.insert(name.to_string(), value);
                }
                Err(e) => errors.push(e),
            },
            None => errors.push(VarError::Undeclared {
                name: name.to_string(),
            }),
        }
    }

    for flag in &sources.flags {
        let Some((name, raw)) = flag.split_once('=') else {
            errors.push(VarError::BadFlag { flag: flag.clone() });
            continue;
        };
        match decls.iter().find(|decl| decl.name == name) {
            Some(decl) => match parse_raw(decl, raw) {
                Ok(value) => {
                    values.insert(name.to_string(), value);
                }
                Err(e) => errors.push(e),
            },
            None => errors.push(VarError::Undeclared {
                name: name.to_string(),
            }),
        }
    }

    for decl in decls {
        let Some(value) = values.get(&decl.name) else {
            errors.push(VarError::Missing {
                name: decl.name.clone(),
            });
            continue;
        };
        if !decl.value_type.matches(value) {
            errors.push(VarError::WrongType {
                name: decl.name.clone(),
                expected: decl.value_type.name(),
                actual: value.type_name(),
            });
            continue;
        }
        for rule in &decl.validation {
            if let Err(e) = check_rule(decl, rule, value) {
                errors.push(e);
            }
        }
    }

    if errors.is_empty() {
        Ok(values)
    } else {
        Err(VariableErrors { errors })
    }
}

fn read_var_file(path: &PathBuf) -> Result<toml::Table, VarError> {
    let content = fs::read_to_string(path).map_err(|e| VarError::File {
        path: path.clone(),
        message: e.to_string(),
    })?;
    toml::from_str(&content).map_err(|e| VarError::File {
        path: path.clone(),
        message: e.to_string(),
    })
}

/// Parse a raw string from the environment or a `--var` flag. Strings are
/// taken verbatim; everything else parses as a TOML value.
fn parse_raw(decl: &VariableDecl, raw: &str) -> Result<Value, VarError> {
    let bad = || VarError::BadValue {
        name: decl.name.clone(),
        raw: raw.to_string(),
        expected: decl.value_type.name(),
    };
    match decl.value_type {
        ValueType::String => Ok(Value::from(raw)),
        ValueType::Int => raw.trim().parse::<i64>().map(Value::Int).map_err(|_| bad()),
        ValueType::Float => raw
            .trim()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| bad()),
        ValueType::Bool => match raw.trim() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(bad()),
        },
        ValueType::List | ValueType::Map => {
            let table: toml::Table =
                toml::from_str(&format!("value = {raw}")).map_err(|_| bad())?;
            let value = table.get("value").ok_or_else(bad)?;
            Ok(Value::from_toml(value))
        }
    }
}

/// Apply one validation rule to one value. Rules see only their own
/// variable's value by construction.
fn check_rule(decl: &VariableDecl, rule: &ValidationRule, value: &Value) -> Result<(), VarError> {
    let fail = || VarError::Validation {
        name: decl.name.clone(),
        message: rule.message.clone(),
    };

    if let Some(pattern) = &rule.pattern {
        let regex = Regex::new(pattern).map_err(|source| VarError::BadPattern {
            name: decl.name.clone(),
            source,
        })?;
        match value.as_str() {
            Some(s) if regex.is_match(s) => {}
            _ => return Err(fail()),
        }
    }

    if let Some(allowed) = &rule.one_of {
        if !allowed.contains(value) {
            return Err(fail());
        }
    }

    if let Some(min) = rule.min {
        match value.as_float() {
            Some(x) if x >= min => {}
            _ => return Err(fail()),
        }
    }

    if let Some(max) = rule.max {
        match value.as_float() {
            Some(x) if x <= max => {}
            _ => return Err(fail()),
        }
    }

    if rule.cidr {
        let valid = funcs::call("cidrvalid", std::slice::from_ref(value))
            .ok()
            .and_then(|v| v.as_bool());
        if valid != Some(true) {
            return Err(fail());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use std::io::Write as _;

    fn decls(src: &str) -> Vec<VariableDecl> {
        Manifest::parse_str(src).unwrap().variables
    }

    const DECLS: &str = r#"
        [variable.env]
        type = "string"
        default = "dev"

        [variable.replicas]
        type = "int"
        default = 1

        [variable.cidr]
        type = "string"
        default = "10.0.0.0/16"
    "#;

    #[test]
    fn test_defaults_bind() {
        let values = bind(&decls(DECLS), &VarSources::default()).unwrap();
        assert_eq!(values["env"], Value::from("dev"));
        assert_eq!(values["replicas"], Value::Int(1));
    }

    #[test]
    fn test_precedence_file_env_flag() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("test.vars.toml");
        let mut f = fs::File::create(&file).unwrap();
        writeln!(f, "env = \"from-file\"\nreplicas = 2").unwrap();

        let sources = VarSources {
            files: vec![file],
            env: vec![(format!("{ENV_PREFIX}replicas"), "3".to_string())],
            flags: vec!["replicas=4".to_string()],
        };
        let values = bind(&decls(DECLS), &sources).unwrap();
        assert_eq!(values["env"], Value::from("from-file"));
        // flag beats env beats file
        assert_eq!(values["replicas"], Value::Int(4));
    }

    #[test]
    fn test_missing_required_variable() {
        let decls = decls("[variable.region]\ntype = \"string\"\n");
        let err = bind(&decls, &VarSources::default()).unwrap_err();
        assert!(matches!(err.errors[0], VarError::Missing { .. }));
    }

    #[test]
    fn test_all_errors_reported_together() {
        let decls = decls(
            r#"
            [variable.region]
            type = "string"

            [variable.replicas]
            type = "int"
            "#,
        );
        let sources = VarSources {
            flags: vec!["replicas=lots".to_string(), "regoin=x".to_string()],
            ..Default::default()
        };
        let err = bind(&decls, &sources).unwrap_err();
        // bad int, undeclared flag, and both declared variables end up unbound
        assert_eq!(err.errors.len(), 4);
    }

    #[test]
    fn test_typed_parsing_from_flags() {
        let decls = decls(
            r#"
            [variable.on]
            type = "bool"

            [variable.zones]
            type = "list"
            "#,
        );
        let sources = VarSources {
            flags: vec!["on=true".to_string(), r#"zones=["a", "b"]"#.to_string()],
            ..Default::default()
        };
        let values = bind(&decls, &sources).unwrap();
        assert_eq!(values["on"], Value::Bool(true));
        assert_eq!(
            values["zones"],
            Value::List(vec![Value::from("a"), Value::from("b")])
        );
    }

    #[test]
    fn test_validation_rules() {
        let decls = decls(
            r#"
            [variable.env]
            type = "string"

            [[variable.env.validation]]
            one_of = ["dev", "prod"]
            message = "env must be dev or prod"

            [variable.cidr]
            type = "string"
            default = "10.0.0.0/16"

            [[variable.cidr.validation]]
            cidr = true
            message = "cidr must be a valid IPv4 prefix"

            [variable.replicas]
            type = "int"
            default = 1

            [[variable.replicas.validation]]
            min = 1
            max = 5
            message = "replicas must be between 1 and 5"
            "#,
        );

        let sources = VarSources {
            flags: vec!["env=prod".to_string()],
            ..Default::default()
        };
        bind(&decls, &sources).unwrap();

        let sources = VarSources {
            flags: vec![
                "env=staging".to_string(),
                "cidr=not-a-cidr".to_string(),
                "replicas=9".to_string(),
            ],
            ..Default::default()
        };
        let err = bind(&decls, &sources).unwrap_err();
        assert_eq!(err.errors.len(), 3);
        let text = err.to_string();
        assert!(text.contains("env must be dev or prod"));
        assert!(text.contains("valid IPv4 prefix"));
        assert!(text.contains("between 1 and 5"));
    }

    #[test]
    fn test_wrong_type_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("test.vars.toml");
        fs::write(&file, "replicas = \"three\"\n").unwrap();
        let sources = VarSources {
            files: vec![file],
            ..Default::default()
        };
        let err = bind(&decls(DECLS), &sources).unwrap_err();
        assert!(matches!(err.errors[0], VarError::WrongType { .. }));
    }

    #[test]
    fn test_bad_flag_shape() {
        let sources = VarSources {
            flags: vec!["no-equals-sign".to_string()],
            ..Default::default()
        };
        let err = bind(&decls(DECLS), &sources).unwrap_err();
        assert!(matches!(err.errors[0], VarError::BadFlag { .. }));
    }
}
