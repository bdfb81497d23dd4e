//! Render sinks for task convergence.
//!
//! Three targets share one lifecycle: per-task renders happen during the
//! run (dispatched by target kind from the delta runner), and `finish`
//! flushes whatever the target accumulated once the run is over. The API
//! target mutates the cloud directly and has nothing to flush; the
//! Terraform target emits an infrastructure-as-code document; the dry-run
//! target prints the planned changes.

pub mod api;
pub mod dryrun;
pub mod terraform;

pub use api::ApiTarget;
pub use dryrun::DryRunTarget;
pub use terraform::{TerraformTarget, TfLiteral};

use crate::error::Result;
use crate::task::TaskMap;

/// The sink a run renders into.
pub enum Target {
    Api(ApiTarget),
    Terraform(TerraformTarget),
    DryRun(DryRunTarget),
}

impl Target {
    /// Target kind as used in CLI flags and dispatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Api(_) => "direct",
            Target::Terraform(_) => "terraform",
            Target::DryRun(_) => "dryrun",
        }
    }

    /// True when renders must not honor discovered state.
    pub fn forces_fresh_state(&self) -> bool {
        matches!(self, Target::Terraform(_))
    }

    /// Flush accumulated output at the end of a run.
    pub fn finish(&mut self, tasks: &TaskMap) -> Result<()> {
        match self {
            Target::Api(t) => t.finish(tasks),
            Target::Terraform(t) => t.finish(tasks),
            Target::DryRun(t) => t.finish(tasks),
        }
    }
}
