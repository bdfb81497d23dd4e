//! Route table with its subnet associations.
//!
//! Associations are part of the table's desired state: the `subnets` list
//! compares as a set, and reconciling it re-associates through a single
//! modify call.

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
pub struct RouteTable {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vpc: Option<TaskRef>,

    /// Subnets associated with this table; compared as a set.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub subnets: Vec<TaskRef>,
}

impl RouteTable {
    fn resolved_subnet_ids(&self, env: &RunEnv) -> Result<Vec<String>> {
        self.subnets
            .iter()
            .map(|r| env.tasks.resolve_id("subnet", r))
            .collect()
    }
}

impl TaskSpec for RouteTable {
    const KIND: &'static str = "route_table";

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
        let mut deps: Vec<String> = self.vpc.iter().map(|r| r.key("vpc")).collect();
        deps.extend(self.subnets.iter().map(|r| r.key("subnet")));
        deps
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let found = if let Some(id) = &self.id {
            env.cloud
                .find_one("route_table", &[new_filter("resource-id", id)])?
        } else {
            env.cloud.find_one(
                "route_table",
                &env.cloud.build_filters(self.name.as_deref()),
            )?
        };
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching route table");
        let actual_subnet_ids: Vec<String> = resource
            .attrs
            .get("subnet_ids")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();

        let actual = RouteTable {
            name: resource.tags.get("Name").cloned(),
            id: Some(resource.id.clone()),
            vpc: env
                .tasks
                .actual_ref("vpc", self.vpc.as_ref(), resource.attr_str("vpc_id")),
            subnets: env
                .tasks
                .actual_ref_list("subnet", &self.subnets, &actual_subnet_ids),
        };
        adopt_id("route_table", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() && e.vpc.is_none() {
            return Err(Error::required_field("route_table", "vpc"));
        }
        if a.is_some() && changes.contains("vpc") {
            return Err(Error::cannot_change_field("route_table", "vpc"));
        }
        Ok(())
    }

    fn render_api(
        &mut self,
        t: &ApiTarget,
        a: Option<&Self>,
        changes: &Changes,
        env: &RunEnv,
    ) -> Result<()> {
        let subnet_ids = self.resolved_subnet_ids(env)?;

        if a.is_none() {
            let vpc_ref = self
                .vpc
                .as_ref()
                .ok_or_else(|| Error::required_field("route_table", "vpc"))?;
            let vpc_id = env.tasks.resolve_id("vpc", vpc_ref)?;

            info!(vpc = %vpc_id, "creating route table");
            let created = t.cloud.create(
                "route_table",
                json!({"vpc_id": vpc_id, "subnet_ids": subnet_ids}),
            )?;
            adopt_id("route_table", &mut self.id, &created.id)?;
        } else if changes.contains("subnets") {
            let id = self
                .id
                .clone()
                .ok_or_else(|| Error::other("route table id not known"))?;
            debug!(id = %id, "reconciling route table associations");
            t.cloud
                .modify("route_table", &id, json!({"subnet_ids": subnet_ids}))?;
        }

        let id = self
            .id
            .clone()
            .ok_or_else(|| Error::other("route table id not set after create"))?;
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
            .ok_or_else(|| Error::required_field("route_table", "name"))?;
        let vpc_ref = self
            .vpc
            .as_ref()
            .ok_or_else(|| Error::required_field("route_table", "vpc"))?;

        t.render_resource(
            "aws_route_table",
            &name,
            compact(json!({
                "vpc_id": env.tasks.terraform_link_for("vpc", vpc_ref)?,
                "tags": env.cloud.build_tags(self.name.as_deref(), None),
            })),
        )?;

        // One association resource per attached subnet.
        for subnet in &self.subnets {
            t.render_resource(
                "aws_route_table_association",
                subnet.name(),
                json!({
                    "subnet_id": env.tasks.terraform_link_for("subnet", subnet)?,
                    "route_table_id": TfLiteral::property("aws_route_table", &name, "id"),
                }),
            )?;
        }
        Ok(())
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_route_table", n, "id"))
    }
}
