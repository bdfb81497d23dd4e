//! Imported SSH public key for node access.
//!
//! The key material comes from a resource (typically the loader-owned
//! `ssh-public-key`). The cloud cannot report the material back, so a
//! discovered key adopts the expected resource to avoid spurious drift;
//! key material is effectively immutable by name.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::cloud::new_filter;
use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::resource::ResourceHolder;
use crate::target::{ApiTarget, TerraformTarget, TfLiteral};
use crate::task::{adopt_id, RunEnv, TaskSpec};
use crate::tasks::compact;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshKey {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<ResourceHolder>,
}

impl TaskSpec for SshKey {
    const KIND: &'static str = "ssh_key";

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn resources(&self) -> Vec<&ResourceHolder> {
        self.public_key.iter().collect()
    }

    fn resources_mut(&mut self) -> Vec<&mut ResourceHolder> {
        self.public_key.iter_mut().collect()
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let Some(name) = &self.name else {
            return Ok(None);
        };
        let found = env.cloud.find_one("ssh_key", &[new_filter("name", name)])?;
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching ssh key");
        let actual = SshKey {
            name: resource.attr_str("name").map(str::to_string),
            id: Some(resource.id.clone()),
            // The material cannot be read back; adopt the expected value.
            public_key: self.public_key.clone(),
        };
        adopt_id("ssh_key", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() {
            if e.name.is_none() {
                return Err(Error::required_field("ssh_key", "name"));
            }
            if e.public_key.is_none() {
                return Err(Error::required_field("ssh_key", "public_key"));
            }
        }
        if a.is_some() && changes.contains("name") {
            return Err(Error::cannot_change_field("ssh_key", "name"));
        }
        Ok(())
    }

    fn render_api(
        &mut self,
        t: &ApiTarget,
        a: Option<&Self>,
        _changes: &Changes,
        _env: &RunEnv,
    ) -> Result<()> {
        if a.is_some() {
            return Ok(());
        }
        let material = self
            .public_key
            .as_ref()
            .ok_or_else(|| Error::required_field("ssh_key", "public_key"))?
            .as_string()?;

        info!(name = ?self.name, "importing ssh key");
        let created = t.cloud.create(
            "ssh_key",
            json!({"name": self.name, "public_key": material}),
        )?;
        adopt_id("ssh_key", &mut self.id, &created.id)?;
        Ok(())
    }

    fn render_terraform(
        &mut self,
        t: &mut TerraformTarget,
        _a: Option<&Self>,
        _changes: &Changes,
        _env: &RunEnv,
    ) -> Result<()> {
        let name = self
            .name
            .clone()
            .ok_or_else(|| Error::required_field("ssh_key", "name"))?;
        let material = self
            .public_key
            .as_ref()
            .ok_or_else(|| Error::required_field("ssh_key", "public_key"))?
            .as_string()?
            .to_string();

        t.render_resource(
            "aws_key_pair",
            &name,
            compact(json!({"key_name": self.name, "public_key": material})),
        )
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_key_pair", n, "key_name"))
    }
}
