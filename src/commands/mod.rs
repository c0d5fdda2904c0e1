pub mod apply;
pub mod destroy;
pub mod plan;
pub mod validate;

use anyhow::Result;
use reconcile::executor::CancelToken;
use reconcile::graph::Graph;
use reconcile::provider::{self, Provider};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::Project;

/// Expands and validates the dependency graph for a loaded project.
pub(crate) fn build_graph(project: &Project) -> Result<Graph<'_>> {
    let graph = Graph::build(&project.manifest, &project.registry, &project.vars)?;
    Ok(graph)
}

pub(crate) fn connect(project: &Project) -> Arc<dyn Provider> {
    provider::build(&project.manifest.provider, &project.session())
}

/// Fires the executor's cancel token after `timeout` unless the run has
/// been disarmed first, so a run that finishes in time never logs a
/// spurious cancellation.
pub(crate) struct Watchdog {
    finished: Arc<AtomicBool>,
}

impl Watchdog {
    pub(crate) fn arm(timeout: Duration, token: CancelToken) -> Self {
        let finished = Arc::new(AtomicBool::new(false));
        let guard = finished.clone();
        thread::spawn(move || {
            thread::sleep(timeout);
            if guard.load(Ordering::SeqCst) {
                return;
            }
            log::warn!(
                "timeout after {}s, cancelling remaining actions",
                timeout.as_secs()
            );
            token.cancel();
        });
        Self { finished }
    }

    pub(crate) fn disarm(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}
