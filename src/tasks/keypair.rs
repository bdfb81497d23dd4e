//! Store-backed certificate pair.
//!
//! Provider-neutral: the artifact lives in the CA store under the state
//! directory, not in any cloud. Issuance is idempotent by name, so a
//! keypair that already exists is a no-op for every target, and the
//! Terraform path issues too (node bootstrap content needs the material
//! regardless of how the cloud side is applied).

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cloud::CloudProvider;
use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::target::{ApiTarget, TerraformTarget};
use crate::task::{RunEnv, TaskSpec};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Keypair {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Subject alternative names for the issued certificate.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alt_names: Vec<String>,
}

impl Keypair {
    fn issue(&self, env: &RunEnv) -> Result<()> {
        let name = self
            .name
            .as_ref()
            .ok_or_else(|| Error::required_field("keypair", "name"))?;
        info!(name = %name, "ensuring keypair is issued");
        env.ca.issue(name, &self.alt_names)?;
        Ok(())
    }
}

impl TaskSpec for Keypair {
    const KIND: &'static str = "keypair";
    const PROVIDER: Option<CloudProvider> = None;

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let Some(name) = &self.name else {
            return Ok(None);
        };
        // An issued pair is stable: report it as exactly the desired
        // state so re-runs are no-ops.
        match env.ca.get(name)? {
            Some(_) => Ok(Some(self.clone())),
            None => Ok(None),
        }
    }

    fn check_changes(a: Option<&Self>, e: &Self, _changes: &Changes) -> Result<()> {
        if a.is_none() && e.name.is_none() {
            return Err(Error::required_field("keypair", "name"));
        }
        Ok(())
    }

    fn render_api(
        &mut self,
        _target: &ApiTarget,
        _a: Option<&Self>,
        _changes: &Changes,
        env: &RunEnv,
    ) -> Result<()> {
        self.issue(env)
    }

    fn render_terraform(
        &mut self,
        _target: &mut TerraformTarget,
        _a: Option<&Self>,
        _changes: &Changes,
        env: &RunEnv,
    ) -> Result<()> {
        self.issue(env)
    }
}
