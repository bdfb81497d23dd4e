//! Per-zone subnet inside the cluster VPC.

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use crate::cloud::new_filter;
use crate::diff::Changes;
use crate::error::{Error, Result};
use crate::target::{ApiTarget, TerraformTarget, TfLiteral};
use crate::task::{adopt_id, RunEnv, TaskRef, TaskSpec};
use crate::tasks::compact;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Subnet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc: Option<TaskRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
}

impl TaskSpec for Subnet {
    const KIND: &'static str = "subnet";

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn set_name(&mut self, name: &str) {
        self.name = Some(name.to_string());
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn dependencies(&self) -> Vec<String> {
        self.vpc.iter().map(|r| r.key("vpc")).collect()
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let found = if let Some(id) = &self.id {
            env.cloud.find_one("subnet", &[new_filter("resource-id", id)])?
        } else {
            env.cloud
                .find_one("subnet", &env.cloud.build_filters(self.name.as_deref()))?
        };
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching subnet");
        let actual = Subnet {
            name: resource.tags.get("Name").cloned(),
            id: Some(resource.id.clone()),
            vpc: env
                .tasks
                .actual_ref("vpc", self.vpc.as_ref(), resource.attr_str("vpc_id")),
            cidr: resource.attr_str("cidr").map(str::to_string),
            availability_zone: resource.attr_str("availability_zone").map(str::to_string),
        };
        adopt_id("subnet", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() {
            if e.cidr.is_none() {
                return Err(Error::required_field("subnet", "cidr"));
            }
            if e.vpc.is_none() {
                return Err(Error::required_field("subnet", "vpc"));
            }
        }
        if a.is_some() {
            if changes.contains("cidr") {
                return Err(Error::cannot_change_field("subnet", "cidr"));
            }
            if changes.contains("vpc") {
                return Err(Error::cannot_change_field("subnet", "vpc"));
            }
            if changes.contains("availability_zone") {
                return Err(Error::cannot_change_field("subnet", "availability_zone"));
            }
        }
        Ok(())
    }

    fn render_api(
        &mut self,
        t: &ApiTarget,
        a: Option<&Self>,
        _changes: &Changes,
        env: &RunEnv,
    ) -> Result<()> {
        if a.is_none() {
            let vpc_ref = self
                .vpc
                .as_ref()
                .ok_or_else(|| Error::required_field("subnet", "vpc"))?;
            let vpc_id = env.tasks.resolve_id("vpc", vpc_ref)?;

            info!(cidr = ?self.cidr, vpc = %vpc_id, "creating subnet");
            let created = t.cloud.create(
                "subnet",
                json!({
                    "vpc_id": vpc_id,
                    "cidr": self.cidr,
                    "availability_zone": self.availability_zone,
                }),
            )?;
            adopt_id("subnet", &mut self.id, &created.id)?;
        }

        let id = self
            .id
            .clone()
            .ok_or_else(|| Error::other("subnet id not set after create"))?;
        t.add_tags(&id, &t.cloud.build_tags(self.name.as_deref(), None))
    }

    fn render_terraform(
        &mut self,
        t: &mut TerraformTarget,
        _a: Option<&Self>,
        _changes: &Changes,
        env: &RunEnv,
    ) -> Result<()> {
        let name = self
            .name
            .clone()
            .ok_or_else(|| Error::required_field("subnet", "name"))?;
        let vpc_ref = self
            .vpc
            .as_ref()
            .ok_or_else(|| Error::required_field("subnet", "vpc"))?;
        t.render_resource(
            "aws_subnet",
            &name,
            compact(json!({
                "vpc_id": env.tasks.terraform_link_for("vpc", vpc_ref)?,
                "cidr_block": self.cidr,
                "availability_zone": self.availability_zone,
                "tags": env.cloud.build_tags(self.name.as_deref(), None),
            })),
        )
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_subnet", n, "id"))
    }
}
