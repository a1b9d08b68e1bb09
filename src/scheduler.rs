//! The Scheduler Pass: matches `needs_build` deb builds against available
//! build nodes and promotes eligible ones to `scheduled`.

use crate::backend::BuildBackend;
use crate::build::state::BuildStore;
use crate::build::BuildState;
use crate::error::SchedulerError;

/// Invoked on demand by the `schedule` task. Opportunistic and idempotent:
/// running the pass with nothing to do is a no-op.
pub struct Scheduler<'a> {
    store: &'a dyn BuildStore,
    backend: &'a dyn BuildBackend,
}

impl<'a> Scheduler<'a> {
    pub fn new(store: &'a dyn BuildStore, backend: &'a dyn BuildBackend) -> Self {
        Self { store, backend }
    }

    /// Scans `needs_build` deb builds in build-id order and transitions
    /// each one whose architecture a node serves to `scheduled`. No
    /// fairness guarantee beyond that ordering; a build with no matching
    /// node is left for the next pass.
    pub async fn run_pass(&self) -> Result<usize, SchedulerError> {
        let nodes = self.backend.get_nodes_info().await;
        let mut candidates = self.store.needs_build_debs().await?;
        candidates.sort_by_key(|b| b.id);

        let mut scheduled = 0;
        for mut build in candidates {
            let Some(arch) = &build.architecture else {
                continue;
            };
            let has_capable_node = nodes.iter().any(|n| n.architectures.iter().any(|a| a == arch));
            if !has_capable_node {
                continue;
            }
            build.buildstate = BuildState::Scheduled;
            self.store.save(&build).await?;
            scheduled += 1;
        }
        Ok(scheduled)
    }
}
