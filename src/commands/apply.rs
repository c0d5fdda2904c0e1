use anyhow::Result;
use dialoguer::Confirm;
use reconcile::executor::{ExecuteOptions, Executor};
use reconcile::plan::{self, Planner};
use reconcile::state::StateStore;
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use super::Watchdog;
use crate::cli::ApplyArgs;
use crate::config::Project;
use crate::ui::{self, BarProgress};

pub fn run(project: &Project, args: &ApplyArgs) -> Result<ExitCode> {
    let graph = super::build_graph(project)?;
    let provider = super::connect(project);
    let mut store = StateStore::open(&project.state_path)?;

    let options = ExecuteOptions {
        jobs: args.jobs,
        ..ExecuteOptions::default()
    };
    let executor = Executor::new(&graph, &project.registry, &project.vars, provider, options);

    if args.refresh {
        executor.refresh(&mut store)?;
    }

    let planner = Planner::new(&graph, &project.registry, &project.vars, store.document());
    let plan = planner.plan()?;
    ui::print_plan(&plan);

    if !plan.has_changes() {
        return Ok(ExitCode::SUCCESS);
    }

    if !args.auto_approve
        && !Confirm::new()
            .with_prompt("Apply these changes?")
            .default(true)
            .interact()?
    {
        ui::info("Apply cancelled");
        return Ok(ExitCode::SUCCESS);
    }

    let watchdog = args
        .timeout
        .map(|secs| Watchdog::arm(Duration::from_secs(secs), executor.cancel_token()));

    let total = plan.actions.iter().filter(|a| !a.kind.is_noop()).count() as u64;
    let progress = BarProgress::new(total);
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

    let values = plan::values_from_state(graph.shapes(), store.document());
    let outputs = plan::evaluate_outputs(&project.manifest, &project.vars, &values)?;
    if !outputs.is_empty() {
        store.set_outputs(outputs.clone());
        store.save()?;
        ui::print_outputs(&outputs);
    }
    Ok(ExitCode::SUCCESS)
}
