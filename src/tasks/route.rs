//! A single route in a route table.
//!
//! Routes carry no tags in the cloud; discovery matches on the owning
//! table and the destination CIDR.

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
pub struct Route {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_table: Option<TaskRef>,
    /// Destination CIDR block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cidr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internet_gateway: Option<TaskRef>,
}

impl TaskSpec for Route {
    const KIND: &'static str = "route";

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
        let mut deps: Vec<String> = self
            .route_table
            .iter()
            .map(|r| r.key("route_table"))
            .collect();
        deps.extend(self.internet_gateway.iter().map(|r| r.key("internet_gateway")));
        deps
    }

    fn find(&mut self, env: &RunEnv) -> Result<Option<Self>> {
        let (Some(table_ref), Some(cidr)) = (&self.route_table, &self.cidr) else {
            return Ok(None);
        };
        // The table may not exist yet on a fresh run.
        let Ok(table_id) = env.tasks.resolve_id("route_table", table_ref) else {
            return Ok(None);
        };

        let found = env.cloud.find_one(
            "route",
            &[
                new_filter("route_table_id", &table_id),
                new_filter("cidr", cidr),
            ],
        )?;
        let Some(resource) = found else {
            return Ok(None);
        };

        debug!(id = %resource.id, "found matching route");
        let actual = Route {
            name: self.name.clone(),
            id: Some(resource.id.clone()),
            route_table: env.tasks.actual_ref(
                "route_table",
                self.route_table.as_ref(),
                resource.attr_str("route_table_id"),
            ),
            cidr: resource.attr_str("cidr").map(str::to_string),
            internet_gateway: env.tasks.actual_ref(
                "internet_gateway",
                self.internet_gateway.as_ref(),
                resource.attr_str("gateway_id"),
            ),
        };
        adopt_id("route", &mut self.id, &resource.id)?;
        Ok(Some(actual))
    }

    fn check_changes(a: Option<&Self>, e: &Self, changes: &Changes) -> Result<()> {
        if a.is_none() {
            if e.route_table.is_none() {
                return Err(Error::required_field("route", "route_table"));
            }
            if e.cidr.is_none() {
                return Err(Error::required_field("route", "cidr"));
            }
            if e.internet_gateway.is_none() {
                return Err(Error::required_field("route", "internet_gateway"));
            }
        }
        if a.is_some() {
            if changes.contains("route_table") {
                return Err(Error::cannot_change_field("route", "route_table"));
            }
            if changes.contains("cidr") {
                return Err(Error::cannot_change_field("route", "cidr"));
            }
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
        let gateway_ref = self
            .internet_gateway
            .as_ref()
            .ok_or_else(|| Error::required_field("route", "internet_gateway"))?;
        let gateway_id = env.tasks.resolve_id("internet_gateway", gateway_ref)?;

        if a.is_none() {
            let table_ref = self
                .route_table
                .as_ref()
                .ok_or_else(|| Error::required_field("route", "route_table"))?;
            let table_id = env.tasks.resolve_id("route_table", table_ref)?;

            info!(cidr = ?self.cidr, table = %table_id, "creating route");
            let created = t.cloud.create(
                "route",
                json!({
                    "route_table_id": table_id,
                    "cidr": self.cidr,
                    "gateway_id": gateway_id,
                }),
            )?;
            adopt_id("route", &mut self.id, &created.id)?;
        } else if changes.contains("internet_gateway") {
            let id = self
                .id
                .clone()
                .ok_or_else(|| Error::other("route id not known"))?;
            debug!(id = %id, "replacing route target");
            t.cloud
                .modify("route", &id, json!({"gateway_id": gateway_id}))?;
        }

        Ok(())
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
            .ok_or_else(|| Error::required_field("route", "name"))?;
        let table_ref = self
            .route_table
            .as_ref()
            .ok_or_else(|| Error::required_field("route", "route_table"))?;
        let gateway_ref = self
            .internet_gateway
            .as_ref()
            .ok_or_else(|| Error::required_field("route", "internet_gateway"))?;

        t.render_resource(
            "aws_route",
            &name,
            compact(json!({
                "route_table_id": env.tasks.terraform_link_for("route_table", table_ref)?,
                "destination_cidr_block": self.cidr,
                "gateway_id": env.tasks.terraform_link_for("internet_gateway", gateway_ref)?,
            })),
        )
    }

    fn terraform_link(&self) -> Option<TfLiteral> {
        self.name
            .as_deref()
            .map(|n| TfLiteral::property("aws_route", n, "id"))
    }
}
