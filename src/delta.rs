//! The per-task convergence algorithm.
//!
//! For one task: discover the actual state (honored only when the run
//! checks existing resources), compute the structural diff, short-circuit
//! when nothing changed, validate the transition, then dispatch to the
//! active target. Identity discovered or created along the way lands back
//! in the shared task map so dependents can resolve it.

use tracing::debug;

use crate::cloud::Cloud;
use crate::error::{Error, Result};
use crate::store::ca::CaStore;
use crate::store::secrets::SecretStore;
use crate::target::Target;
use crate::task::{RunEnv, Task, TaskMap};

/// Run one task against the target. The task is removed from the map for
/// the duration and re-inserted (with any adopted identity) afterwards,
/// whether or not it succeeded.
#[allow(clippy::too_many_arguments)]
pub fn run_task(
    key: &str,
    cloud: &Cloud,
    ca: &CaStore,
    secrets: &SecretStore,
    check_existing: bool,
    target: &mut Target,
    tasks: &mut TaskMap,
) -> Result<()> {
    let mut e = tasks
        .take(key)
        .ok_or_else(|| Error::other(format!("task {key:?} not in map")))?;

    let result = converge(key, &mut e, cloud, ca, secrets, check_existing, target, tasks);
    tasks.put(key, e);
    result.map_err(|err| err.for_task(key))
}

#[allow(clippy::too_many_arguments)]
fn converge(
    key: &str,
    e: &mut Task,
    cloud: &Cloud,
    ca: &CaStore,
    secrets: &SecretStore,
    check_existing: bool,
    target: &mut Target,
    tasks: &TaskMap,
) -> Result<()> {
    // A cloud-specific task cannot render against a different provider.
    if !matches!(target, Target::DryRun(_)) {
        if let Some(provider) = e.provider() {
            if provider != cloud.provider() {
                return Err(Error::RendererUnsupported {
                    kind: e.kind(),
                    target: target.kind(),
                    cloud: cloud.provider().to_string(),
                });
            }
        }
    }

    let actual = if check_existing {
        let env = RunEnv {
            cloud,
            ca,
            secrets,
            tasks,
        };
        e.find(&env)?
    } else {
        // Force the create path (Terraform emission never reads).
        None
    };

    // Materialize expected-side resources so the diff compares content.
    for resource in e.resources() {
        resource.as_bytes()?;
    }

    let changes = e.build_changes(actual.as_ref())?;
    if actual.is_some() && changes.is_empty() {
        debug!(key, "no changes");
        return Ok(());
    }

    e.check_changes(actual.as_ref(), &changes)?;

    let env = RunEnv {
        cloud,
        ca,
        secrets,
        tasks,
    };
    match target {
        Target::DryRun(t) => t.render(key, actual.as_ref(), e, &changes),
        Target::Api(t) => e.render_api(t, actual.as_ref(), &changes, &env),
        Target::Terraform(t) => e.render_terraform(t, actual.as_ref(), &changes, &env),
    }
}
