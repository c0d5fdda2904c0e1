use anyhow::Result;
use reconcile::executor::{ExecuteOptions, Executor};
use reconcile::plan::Planner;
use reconcile::state::StateStore;
use std::process::ExitCode;

use crate::cli::PlanArgs;
use crate::config::Project;
use crate::ui;

/// Dry run: show what apply would change without calling create/update/delete.
pub fn run(project: &Project, args: &PlanArgs) -> Result<ExitCode> {
    let graph = super::build_graph(project)?;
    let mut store = StateStore::open(&project.state_path)?;

    if args.refresh {
        let provider = super::connect(project);
        let executor = Executor::new(
            &graph,
            &project.registry,
            &project.vars,
            provider,
            ExecuteOptions::default(),
        );
        executor.refresh(&mut store)?;
    }

    let planner = Planner::new(&graph, &project.registry, &project.vars, store.document());
    let plan = planner.plan()?;
    ui::print_plan(&plan);
    Ok(ExitCode::SUCCESS)
}
