use anyhow::Result;
use std::process::ExitCode;

use crate::config::Project;
use crate::ui;

/// Checks manifests, schemas, and variables without touching state or the
/// provider. Graph expansion runs too so cardinality and cycle errors
/// surface here instead of at plan time.
pub fn run(project: &Project) -> Result<ExitCode> {
    let graph = super::build_graph(project)?;

    ui::success(&format!(
        "Configuration is valid ({} resources, {} instances)",
        project.manifest.resources.len(),
        graph.instances().len()
    ));
    Ok(ExitCode::SUCCESS)
}
