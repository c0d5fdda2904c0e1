use anyhow::Result;
use dialoguer::Confirm;
use reconcile::executor::{ExecuteOptions, Executor};
use reconcile::plan::Planner;
use reconcile::state::StateStore;
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use super::Watchdog;
use crate::cli::DestroyArgs;
use crate::config::Project;
use crate::ui::{self, BarProgress};

/// Tears down everything tracked in state, children before parents.
pub fn run(project: &Project, args: &DestroyArgs) -> Result<ExitCode> {
    let graph = super::build_graph(project)?;
    let store = StateStore::open(&project.state_path)?;

    let planner = Planner::new(&graph, &project.registry, &project.vars, store.document());
    let plan = planner.plan_destroy()?;
    if !plan.has_changes() {
        ui::success("Nothing to destroy");
        return Ok(ExitCode::SUCCESS);
    }
    ui::print_plan(&plan);

    if !args.auto_approve
        && !Confirm::new()
            .with_prompt(format!(
                "Destroy {} resources? This cannot be undone",
                plan.actions.len()
            ))
            .default(false)
            .interact()?
    {
        ui::info("Destroy cancelled");
        return Ok(ExitCode::SUCCESS);
    }

    let provider = super::connect(project);
    let options = ExecuteOptions {
        jobs: args.jobs,
        ..ExecuteOptions::default()
    };
    let executor = Executor::new(&graph, &project.registry, &project.vars, provider, options);

    let watchdog = args
        .timeout
        .map(|secs| Watchdog::arm(Duration::from_secs(secs), executor.cancel_token()));

    let progress = BarProgress::new(plan.actions.len() as u64);
    let store = Mutex::new(store);
    let report = executor.apply(&plan, &store, &progress)?;
    if let Some(watchdog) = &watchdog {
        watchdog.disarm();
    }
    progress.finish();
    ui::print_report(&report);

    let mut store = store.into_inner().expect("state lock");
    if !report.is_clean() {
        return Ok(ExitCode::from(2));
    }
    if !store.document().outputs.is_empty() {
        store.set_outputs(BTreeMap::new());
        store.save()?;
    }
    Ok(ExitCode::SUCCESS)
}
