//! Run lifecycle: one context per convergence run.
//!
//! The context owns the target, the cloud handle, both stores and the
//! `check_existing` flag (forced off for Terraform emission, which must
//! never read the cloud). `run_tasks` drives the whole map in dependency
//! order; `finish` consumes the context and flushes the target.

use tracing::{debug, info};

use crate::cloud::Cloud;
use crate::delta;
use crate::error::Result;
use crate::scheduler;
use crate::store::ca::CaStore;
use crate::store::secrets::SecretStore;
use crate::target::Target;
use crate::task::TaskMap;

pub struct Context {
    pub target: Target,
    pub cloud: Cloud,
    pub ca: CaStore,
    pub secrets: SecretStore,
    pub check_existing: bool,
}

impl Context {
    pub fn new(
        target: Target,
        cloud: Cloud,
        ca: CaStore,
        secrets: SecretStore,
        check_existing: bool,
    ) -> Self {
        let check_existing = if target.forces_fresh_state() {
            false
        } else {
            check_existing
        };
        Context {
            target,
            cloud,
            ca,
            secrets,
            check_existing,
        }
    }

    /// Execute every task once, in dependency order. The first failure
    /// aborts the run; no task executes after it.
    pub fn run_tasks(&mut self, tasks: &mut TaskMap) -> Result<()> {
        let order = scheduler::run_order(tasks)?;
        info!(tasks = order.len(), "executing task graph");

        for key in &order {
            debug!(key = %key, "running task");
            delta::run_task(
                key,
                &self.cloud,
                &self.ca,
                &self.secrets,
                self.check_existing,
                &mut self.target,
                tasks,
            )?;
        }
        Ok(())
    }

    /// Flush the target's accumulated output and end the run.
    pub fn finish(mut self, tasks: &TaskMap) -> Result<()> {
        self.target.finish(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::mock::MockCloud;
    use crate::cloud::CloudProvider;
    use crate::target::TerraformTarget;

    #[test]
    fn terraform_forces_check_existing_off() {
        let mock = MockCloud::new();
        let cloud = mock.cloud(CloudProvider::Aws, "us-east-1", "k.example.com");
        let dir = tempfile::tempdir().unwrap();
        let ca = CaStore::open(&dir.path().join("pki")).unwrap();
        let secrets = SecretStore::open(&dir.path().join("secrets")).unwrap();

        let target = Target::Terraform(TerraformTarget::new(
            "aws",
            "us-east-1",
            Box::new(std::io::sink()),
        ));
        let ctx = Context::new(target, cloud, ca, secrets, true);
        assert!(!ctx.check_existing);
    }
}
