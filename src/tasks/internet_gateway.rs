//! Internet gateway, attached to the cluster VPC on creation.

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
pub struct InternetGateway {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc: Option<TaskRef>,
}

impl TaskSpec for InternetGateway {
    const KIND: &'static str = "internet_gateway";

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
            env.cloud
                .find_one("internet_gateway", &[new_filter("resource-id", id)])?
        } else {
            env.cloud.find_one(
                "internet_gateway",
                &env.cloud.build_filters(self.name.as_deref()),
            )?
        };
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching internet gateway");
        let actual = InternetGateway {
            name: resource.tags.get("Name").cloned(),
            id: Some(resource.id.clone()),
            vpc: env
                .tasks
                .actual_ref("vpc", self.vpc.as_ref(), resource.attr_str("vpc_id")),
        };
        adopt_id("internet_gateway", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() && e.vpc.is_none() {
            return Err(Error::required_field("internet_gateway", "vpc"));
        }
        if a.is_some() && changes.contains("vpc") {
            return Err(Error::cannot_change_field("internet_gateway", "vpc"));
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
                .ok_or_else(|| Error::required_field("internet_gateway", "vpc"))?;
            let vpc_id = env.tasks.resolve_id("vpc", vpc_ref)?;

            info!(vpc = %vpc_id, "creating internet gateway");
            let created = t
                .cloud
                .create("internet_gateway", json!({"vpc_id": vpc_id}))?;
            adopt_id("internet_gateway", &mut self.id, &created.id)?;
        }

        let id = self
            .id
            .clone()
            .ok_or_else(|| Error::other("internet gateway id not set after create"))?;
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
            .ok_or_else(|| Error::required_field("internet_gateway", "name"))?;
        let vpc_ref = self
            .vpc
            .as_ref()
            .ok_or_else(|| Error::required_field("internet_gateway", "vpc"))?;
        t.render_resource(
            "aws_internet_gateway",
            &name,
            compact(json!({
                "vpc_id": env.tasks.terraform_link_for("vpc", vpc_ref)?,
                "tags": env.cloud.build_tags(self.name.as_deref(), None),
            })),
        )
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_internet_gateway", n, "id"))
    }
}
