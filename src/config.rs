//! Project discovery: manifest files, variable sources, credentials.

use anyhow::{Context, Result};
use reconcile::{Manifest, ManifestError, ProviderConfig, Registry, Session, Value, VarSources};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_STATE_FILE: &str = "strata.state.json";
const VARS_SUFFIX: &str = ".vars.toml";

/// Everything a command needs about the project, loaded and validated.
#[derive(Debug)]
pub struct Project {
    pub dir: PathBuf,
    pub manifest: Manifest,
    pub registry: Registry,
    pub vars: BTreeMap<String, Value>,
    pub state_path: PathBuf,
}

impl Project {
    /// Load manifests from `dir`, bind variables, and register schemas.
    pub fn load(
        dir: Option<&str>,
        state: Option<&Path>,
        var_files: &[PathBuf],
        var_flags: &[String],
    ) -> Result<Self> {
        let dir = resolve_dir(dir)?;

        let (manifest_paths, auto_var_files) = discover(&dir)?;
        if manifest_paths.is_empty() {
            return Err(ManifestError::Empty { path: dir }.into());
        }
        let manifest = Manifest::load(&manifest_paths)?;

        let mut registry = Registry::new();
        for schema in manifest.schemas.clone() {
            registry.register(schema)?;
        }
        for decl in &manifest.resources {
            registry.validate_declaration(decl)?;
        }

        // project var files first, explicit --var-file after (higher precedence)
        let mut files = auto_var_files;
        files.extend(var_files.iter().cloned());
        let sources = VarSources::from_env(files, var_flags.to_vec());
        let vars = reconcile::vars::bind(&manifest.variables, &sources)?;

        let state_path = match state {
            Some(path) => path.to_path_buf(),
            None => dir.join(DEFAULT_STATE_FILE),
        };

        Ok(Self {
            dir,
            manifest,
            registry,
            vars,
            state_path,
        })
    }

    /// Credentials for the configured provider: the `token_env` variable
    /// first, then the user credentials file.
    pub fn session(&self) -> Session {
        let ProviderConfig::Http { token_env, .. } = &self.manifest.provider else {
            return Session::default();
        };
        if let Some(name) = token_env
            && let Ok(token) = std::env::var(name)
        {
            return Session::with_token(token);
        }
        match load_credentials() {
            Some(credentials) => Session {
                token: credentials.token,
            },
            None => Session::default(),
        }
    }
}

fn resolve_dir(dir: Option<&str>) -> Result<PathBuf> {
    let dir = match dir {
        Some(raw) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
        None => std::env::current_dir().context("cannot determine current directory")?,
    };
    anyhow::ensure!(dir.is_dir(), "{} is not a directory", dir.display());
    Ok(dir)
}

/// All top-level `*.toml` files in name order; `*.vars.toml` files are
/// variable sources, not manifests.
fn discover(dir: &Path) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
    let mut manifests = Vec::new();
    let mut var_files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("cannot read {}", dir.display()))? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(VARS_SUFFIX) {
            var_files.push(path);
        } else if name.ends_with(".toml") {
            manifests.push(path);
        }
    }
    manifests.sort();
    var_files.sort();
    Ok((manifests, var_files))
}

#[derive(Debug, Default, Deserialize)]
struct Credentials {
    #[serde(default)]
    token: Option<String>,
}

/// `~/.config/strata/credentials.toml`, if present and well formed.
fn load_credentials() -> Option<Credentials> {
    let path = dirs::config_dir()?.join("strata").join("credentials.toml");
    let content = fs::read_to_string(&path).ok()?;
    match toml::from_str(&content) {
        Ok(credentials) => Some(credentials),
        Err(e) => {
            log::warn!("ignoring malformed {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write(dir: &Path, name: &str, content: &str) {
        let mut file = fs::File::create(dir.join(name)).unwrap();
        writeln!(file, "{content}").unwrap();
    }

    #[test]
    fn test_discover_separates_var_files() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.toml", "[resource.svc.web]");
        write(
            dir.path(),
            "schemas.toml",
            "[schema.svc.attr.name]\ntype = \"string\"",
        );
        write(dir.path(), "prod.vars.toml", "region = \"us\"");
        write(dir.path(), "notes.txt", "not a manifest");

        let (manifests, var_files) = discover(dir.path()).unwrap();
        let names: Vec<_> = manifests
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["main.toml", "schemas.toml"]);
        assert_eq!(var_files.len(), 1);
    }

    #[test]
    fn test_load_binds_vars_and_registers_schemas() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.toml",
            r#"
            [variable.region]
            type = "string"

            [schema.svc.attr.name]
            type = "string"

            [resource.svc.web]
            name = "web-${var.region}"
            "#,
        );
        write(dir.path(), "default.vars.toml", "region = \"eu\"");

        let project = Project::load(dir.path().to_str(), None, &[], &[]).unwrap();
        assert_eq!(project.vars["region"], Value::from("eu"));
        assert_eq!(project.state_path, dir.path().join(DEFAULT_STATE_FILE));
        assert!(project.registry.get("svc").is_some());
    }

    #[test]
    fn test_empty_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Project::load(dir.path().to_str(), None, &[], &[]).unwrap_err();
        assert!(err.to_string().contains("no manifest files"));
    }

    #[test]
    fn test_var_flag_beats_var_file() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "main.toml",
            r#"
            [variable.region]
            type = "string"
            "#,
        );
        write(dir.path(), "default.vars.toml", "region = \"eu\"");

        let project =
            Project::load(dir.path().to_str(), None, &[], &["region=ap".to_string()]).unwrap();
        assert_eq!(project.vars["region"], Value::from("ap"));
    }
}
